//! Human-readable procedure dumps (spec supplemental feature "`debug` dump
//! facility"), grounded on the original's `debug.cpp` pretty-printer:
//! one line per phi and per op, block by block, in creation order.
//!
//! This is a diagnostic aid, not a parser target -- there is no matching
//! `from_str`. Tests use it to produce readable failure output; nothing in
//! the compile pipeline depends on its exact formatting.

use core::fmt;

use crate::ir::{Op, Procedure};

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in self.block_keys() {
            writeln!(f, "block{}:", block)?;
            for phi in &self.block(block).phis {
                write!(f, "    {} = phi", phi.dest)?;
                for alt in &phi.alternatives {
                    write!(f, " [block{}: {}]", alt.source_block, alt.source_value)?;
                }
                writeln!(f)?;
            }
            for &op in &self.block(block).ops {
                write_op(self, f, op)?;
            }
        }
        Ok(())
    }
}

fn write_op(proc: &Procedure, f: &mut fmt::Formatter<'_>, op: Op) -> fmt::Result {
    let rec = proc.op(op);
    if rec.is_nop() {
        return Ok(());
    }
    write!(f, "    {} = {}", op, rec.opcode)?;
    let mut inputs = smallvec::SmallVec::<[Op; 4]>::new();
    rec.for_each_input(|input| inputs.push(input));
    for input in inputs {
        write!(f, " {}", input)?;
    }
    if let Some(reg) = rec.reg {
        write!(f, " -> r{}", reg)?;
    }
    if rec.ty != crate::ir::Type::None && rec.reg.is_none() {
        write!(f, " : {}", rec.ty)?;
    }
    writeln!(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpData, Opcode, Type};

    #[test]
    fn dump_lists_one_line_per_op() {
        let mut proc = Procedure::new(vec![Type::Int]);
        let arg = proc
            .push_current(Opcode::Iarg, OpData::Arg { type_index: 0, type_total: 1, global_pos: 0 }, Type::Int)
            .unwrap();
        proc.push_current(Opcode::Iret, OpData::Return { arg: Some(arg) }, Type::None)
            .unwrap();
        let text = proc.to_string();
        assert!(text.contains("Iarg"));
        assert!(text.contains("Iret"));
    }
}
