//! Deduplicated constant pools for the emitter (spec §4.6, §6 "Wire formats").
//!
//! Three pools — 128-, 64- and 32-bit — are built up while a procedure's
//! code is emitted and then laid out once, most-aligned first, padded to a
//! 16-byte boundary. Each insertion is deduplicated against earlier
//! insertions of the same width so repeated constants share one slot.

use std::collections::HashMap;

/// A handle into one of the three constant pools, returned by insertion and
/// later resolved to a byte offset by `ConstantPool::layout`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConstantHandle {
    /// Index into the 128-bit pool.
    Pool128(u32),
    /// Index into the 64-bit pool.
    Pool64(u32),
    /// Index into the 32-bit pool.
    Pool32(u32),
}

/// The byte layout computed by `ConstantPool::layout`: an offset (from the
/// start of the pool region) for every handle, plus the region's total
/// size.
#[derive(Clone, Debug, Default)]
pub struct PoolLayout {
    offset128: Vec<u32>,
    offset64: Vec<u32>,
    offset32: Vec<u32>,
    /// Total byte size of the laid-out pool region, including trailing
    /// padding to the next 16-byte boundary.
    pub total_size: u32,
}

impl PoolLayout {
    /// Resolve a handle to its byte offset within the pool region.
    pub fn offset_of(&self, handle: ConstantHandle) -> u32 {
        match handle {
            ConstantHandle::Pool128(i) => self.offset128[i as usize],
            ConstantHandle::Pool64(i) => self.offset64[i as usize],
            ConstantHandle::Pool32(i) => self.offset32[i as usize],
        }
    }
}

/// Builder for a module's (or procedure's) constant pools.
#[derive(Clone, Debug, Default)]
pub struct ConstantPool {
    pool128: Vec<u128>,
    pool64: Vec<u64>,
    pool32: Vec<u32>,
    index128: HashMap<u128, u32>,
    index64: HashMap<u64, u32>,
    index32: HashMap<u32, u32>,
}

impl ConstantPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a 128-bit constant, returning its (deduplicated) handle.
    pub fn insert_128(&mut self, bits: u128) -> ConstantHandle {
        let pool = &mut self.pool128;
        let idx = *self.index128.entry(bits).or_insert_with(|| {
            let idx = pool.len() as u32;
            pool.push(bits);
            idx
        });
        ConstantHandle::Pool128(idx)
    }

    /// Intern a 64-bit constant (`lci`'s i64, `lcd`'s f64 bit pattern).
    pub fn insert_64(&mut self, bits: u64) -> ConstantHandle {
        let pool = &mut self.pool64;
        let idx = *self.index64.entry(bits).or_insert_with(|| {
            let idx = pool.len() as u32;
            pool.push(bits);
            idx
        });
        ConstantHandle::Pool64(idx)
    }

    /// Intern a 32-bit constant (`lcf`'s f32 bit pattern, or any value that
    /// didn't fit a signed-32 immediate and needs pool backing).
    ///
    /// The source this spec was distilled from has its 32-bit dedup loop
    /// iterate over the *64-bit* pool's length — almost certainly a
    /// copy-paste bug, since a 32-bit constant can never collide with an
    /// entry in `pool64`. This implementation dedups against `pool32` (the
    /// evidently-intended behavior) and records the discrepancy here rather
    /// than silently reproducing it (spec §9 open question).
    pub fn insert_32(&mut self, bits: u32) -> ConstantHandle {
        let pool = &mut self.pool32;
        let idx = *self.index32.entry(bits).or_insert_with(|| {
            let idx = pool.len() as u32;
            pool.push(bits);
            idx
        });
        ConstantHandle::Pool32(idx)
    }

    /// Is this pool entirely empty?
    pub fn is_empty(&self) -> bool {
        self.pool128.is_empty() && self.pool64.is_empty() && self.pool32.is_empty()
    }

    /// Lay the pools out into a single byte buffer: 128-bit entries first,
    /// then 64-bit, then 32-bit (most-aligned first per spec §6), padded
    /// to a 16-byte boundary. Returns the bytes and the offset table used
    /// to resolve `ConstantHandle`s against the start of this region.
    pub fn layout(&self) -> (Vec<u8>, PoolLayout) {
        let mut bytes = Vec::new();
        let mut layout = PoolLayout::default();

        for &v in &self.pool128 {
            layout.offset128.push(bytes.len() as u32);
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        for &v in &self.pool64 {
            layout.offset64.push(bytes.len() as u32);
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        for &v in &self.pool32 {
            layout.offset32.push(bytes.len() as u32);
            bytes.extend_from_slice(&v.to_ne_bytes());
        }

        let padded = (bytes.len() + 15) & !15;
        bytes.resize(padded, 0);
        layout.total_size = padded as u32;
        (bytes, layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_inserts_share_a_handle() {
        let mut pool = ConstantPool::new();
        let a = pool.insert_64(0x1122_3344_5566_7788);
        let b = pool.insert_64(0x1122_3344_5566_7788);
        assert_eq!(a, b);
        assert_eq!(pool.pool64.len(), 1);
    }

    #[test]
    fn distinct_widths_never_collide() {
        let mut pool = ConstantPool::new();
        let a = pool.insert_32(0x1234_5678);
        let b = pool.insert_64(0x1234_5678);
        assert_ne!(a, b);
    }

    #[test]
    fn layout_orders_most_aligned_first_and_pads_to_16() {
        let mut pool = ConstantPool::new();
        pool.insert_32(1);
        pool.insert_64(2);
        pool.insert_128(3);
        let (bytes, layout) = pool.layout();
        assert_eq!(bytes.len() % 16, 0);
        // 128-bit entry must land before the 64-bit entry, which must land
        // before the 32-bit entry.
        let off128 = layout.offset_of(ConstantHandle::Pool128(0));
        let off64 = layout.offset_of(ConstantHandle::Pool64(0));
        let off32 = layout.offset_of(ConstantHandle::Pool32(0));
        assert!(off128 < off64);
        assert!(off64 < off32);
    }
}
