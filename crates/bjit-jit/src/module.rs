//! `Module`: the growing code buffer, its relocations, and the executable
//! memory it is eventually loaded into (spec §3 "Module", §4.7).
//!
//! Procedures are compiled one at a time, in any order, into a single
//! monotonically growing byte buffer (spec §5 "Multiple procedures may be
//! compiled sequentially into the same module"). Near-call/tail-call sites
//! and `lnp` address materializations record a *module-relative*
//! relocation (target procedure index, not yet an offset, since the
//! target may not have been compiled yet -- this is what lets a procedure
//! reference itself, another not-yet-compiled procedure, or a stub).
//! Those relocations are resolved into concrete displacement bytes lazily,
//! the first time the module is loaded or patched, once every procedure's
//! final offset is known.

use crate::loader::{self, Allocation, LoaderError};
use bjit_codegen::binemit::{CodeSink, RodataRefKind};
use bjit_codegen::ir::{ConstantPool, Procedure};
use bjit_codegen::isa::TargetIsa;
use bjit_codegen::opt;
use bjit_codegen::regalloc;
use bjit_codegen::result::BjitResult;
use bjit_codegen::Flags;
use std::convert::TryInto;

/// The index of a compiled procedure or stub within a `Module`, assigned
/// sequentially by `compile`/`compile_stub` (spec §6 "Stub... this counts
/// as a procedure in terms of near-indexes").
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcIndex(u32);

impl ProcIndex {
    fn idx(self) -> usize {
        self.0 as usize
    }

    /// The raw module index, as consumed by
    /// `bjit_frontend::Builder::call_near`/`tail_call_near`/`proc_addr`
    /// (spec §4.1 "near call emitters"; the builder records these as a
    /// bare `i32` since it has no dependency on `bjit-jit`).
    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }

    /// Wrap a module index a caller already knows, e.g. one predicted via
    /// `Module::proc_count` before compiling a self- or mutually-recursive
    /// procedure that calls it by that index.
    pub fn from_raw(index: i32) -> Self {
        Self(index as u32)
    }
}

#[derive(Clone, Copy, Debug)]
struct NearCallReloc {
    /// Absolute byte offset, within `Module::bytes`, of the field to patch.
    code_offset: u32,
    target: ProcIndex,
}

#[derive(Clone, Copy, Debug)]
enum ProcKind {
    Compiled,
    /// A stub's patchable 8-byte absolute-address field, at this absolute
    /// offset within `Module::bytes` (spec §6 "Stub").
    Stub { addr_field_offset: u32 },
}

/// A growable module of compiled procedures, their cross-procedure
/// relocations, and (once `load`ed) the executable memory they were copied
/// into (spec §3 "Module").
pub struct Module {
    isa: Box<dyn TargetIsa>,
    bytes: Vec<u8>,
    offsets: Vec<u32>,
    kinds: Vec<ProcKind>,
    relocs: Vec<NearCallReloc>,
    exec: Option<Allocation>,
    /// Length of `bytes` as of the last successful `load`/`patch`; used to
    /// detect growth that no longer fits the live allocation.
    loaded_len: usize,
}

impl Module {
    /// A fresh, empty module targeting `isa`.
    pub fn new(isa: Box<dyn TargetIsa>) -> Self {
        Self {
            isa,
            bytes: Vec::new(),
            offsets: Vec::new(),
            kinds: Vec::new(),
            relocs: Vec::new(),
            exec: None,
            loaded_len: 0,
        }
    }

    /// A fresh module targeting the default back-end for `triple` (spec
    /// Ambient stack "Target selection").
    pub fn host(triple: &target_lexicon::Triple) -> Self {
        Self::new(bjit_codegen::isa::default_isa(triple))
    }

    /// The architecture back-end this module compiles for.
    pub fn isa(&self) -> &dyn TargetIsa {
        &*self.isa
    }

    /// The module's code bytes emitted so far (code and constant pools
    /// interleaved per procedure, relocations unresolved until `load`).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of procedures (including stubs) compiled so far.
    pub fn proc_count(&self) -> usize {
        self.offsets.len()
    }

    /// Byte offset, local to `bytes`, of procedure `index`'s first
    /// instruction.
    pub fn proc_offset(&self, index: ProcIndex) -> u32 {
        self.offsets[index.idx()]
    }

    /// Is a module currently loaded into executable memory?
    pub fn is_loaded(&self) -> bool {
        self.exec.is_some()
    }

    /// Run the full compile pipeline (spec §2 "Data flow") over `proc` --
    /// optimize, register-allocate, a final DCE, then lower and encode --
    /// and append the result to the module's byte buffer.
    ///
    /// `proc` is left in its post-register-allocation state; `compile` is
    /// the atomic unit spec §7 describes ("a failure discards any partial
    /// emission"): on `Err`, nothing is appended to the module.
    pub fn compile(&mut self, proc: &mut Procedure, flags: &Flags) -> BjitResult<ProcIndex> {
        opt::optimize(proc, flags);
        regalloc::allocate(proc, &*self.isa)?;
        opt::dce::run(proc);

        #[cfg(debug_assertions)]
        bjit_codegen::sanity::check_post_ra(proc)?;

        let mut pool = ConstantPool::new();
        let mut sink = CodeSink::new();
        self.isa.emit(proc, &mut pool, &mut sink)?;

        let index = ProcIndex(self.offsets.len() as u32);
        let proc_start = self.bytes.len() as u32;
        self.offsets.push(proc_start);
        self.kinds.push(ProcKind::Compiled);

        self.bytes.extend_from_slice(&sink.bytes);

        let pool_start = self.bytes.len() as u32;
        let (pool_bytes, layout) = pool.layout();
        self.bytes.extend_from_slice(&pool_bytes);

        for r in &sink.rodata_refs {
            let at = (proc_start + r.at) as usize;
            let pool_addr = pool_start + layout.offset_of(r.handle);
            match r.kind {
                RodataRefKind::Rip32 { insn_end } => {
                    let insn_end_abs = proc_start + insn_end;
                    let disp = pool_addr as i64 - insn_end_abs as i64;
                    self.bytes[at..at + 4].copy_from_slice(&(disp as i32 as u32).to_le_bytes());
                }
                RodataRefKind::Literal19 => {
                    let word = u32::from_le_bytes(self.bytes[at..at + 4].try_into().unwrap());
                    let disp_words = (pool_addr as i64 - (proc_start + r.at) as i64) / 4;
                    let imm19 = (disp_words as u32) & 0x7_ffff;
                    let new = (word & !(0x7_ffff << 5)) | (imm19 << 5);
                    self.bytes[at..at + 4].copy_from_slice(&new.to_le_bytes());
                }
            }
        }

        for nc in &sink.near_calls {
            self.relocs.push(NearCallReloc {
                code_offset: proc_start + nc.at,
                target: ProcIndex(nc.target_module_index as u32),
            });
        }

        log::debug!(
            "compiled proc {} ({} bytes code, {} bytes pool, {} near-call sites)",
            index.0,
            sink.bytes.len(),
            pool_bytes.len(),
            sink.near_calls.len(),
        );

        Ok(index)
    }

    /// Compile a stub: a fixed-size indirection to `initial_address` (spec
    /// §6 "Stub"). Counts as a procedure for near-call indexing purposes,
    /// so callers may reference it (and later retarget it with
    /// `patch_stub`) before its real implementation exists.
    pub fn compile_stub(&mut self, initial_address: usize) -> ProcIndex {
        let mut sink = CodeSink::new();
        let local_at = self.isa.emit_stub(&mut sink);

        let index = ProcIndex(self.offsets.len() as u32);
        let proc_start = self.bytes.len() as u32;
        self.offsets.push(proc_start);

        let addr_field_offset = proc_start + local_at;
        self.kinds.push(ProcKind::Stub { addr_field_offset });

        self.bytes.extend_from_slice(&sink.bytes);
        self.write_stub_address(addr_field_offset, initial_address);

        index
    }

    /// Retarget a stub's jump address in `bytes` (spec §6 "Stub"). The
    /// caller still needs `patch()` or `unload()`+`load()` for the change
    /// to take effect in already-loaded executable memory (spec §4.7).
    pub fn patch_stub(&mut self, index: ProcIndex, address: usize) {
        let addr_field_offset = match self.kinds[index.idx()] {
            ProcKind::Stub { addr_field_offset } => addr_field_offset,
            ProcKind::Compiled => panic!("bjit-jit: patch_stub called on a non-stub procedure"),
        };
        self.write_stub_address(addr_field_offset, address);
    }

    fn write_stub_address(&mut self, addr_field_offset: u32, address: usize) {
        let at = addr_field_offset as usize;
        self.bytes[at..at + 8].copy_from_slice(&(address as u64).to_le_bytes());
    }

    /// Retarget every near-call/tail-call/`lnp` relocation across the whole
    /// module from `old` to `new` (spec header comment "patch all calls to
    /// oldTarget to call newTarget instead"). Takes effect on the next
    /// `load`/`patch`.
    pub fn patch_calls(&mut self, old: ProcIndex, new: ProcIndex) {
        for r in &mut self.relocs {
            if r.target == old {
                r.target = new;
            }
        }
    }

    /// Same as `patch_calls`, restricted to relocation sites within
    /// procedure `in_proc`'s own emitted byte range.
    pub fn patch_calls_in(&mut self, in_proc: ProcIndex, old: ProcIndex, new: ProcIndex) {
        let start = self.offsets[in_proc.idx()];
        let end = self
            .offsets
            .get(in_proc.idx() + 1)
            .copied()
            .unwrap_or(self.bytes.len() as u32);
        for r in &mut self.relocs {
            if r.code_offset < start || r.code_offset >= end {
                continue;
            }
            if r.target == old {
                r.target = new;
            }
        }
    }

    /// Resolve every pending near-call relocation into concrete
    /// displacement bytes using each target's current offset. Idempotent:
    /// safe to call repeatedly (every `load`/`patch` call does).
    fn resolve_relocs(&mut self) {
        let isa = &*self.isa;
        let offsets = &self.offsets;
        let patches: Vec<(u32, u32)> = self
            .relocs
            .iter()
            .map(|r| (r.code_offset, offsets[r.target.idx()]))
            .collect();
        for (at, target_offset) in patches {
            isa.patch_near_call(&mut self.bytes, at, target_offset);
        }
    }

    /// Load the module into fresh read-execute memory (spec §4.7), always
    /// allocating at least `max(bytes.len(), mmap_size_min)` so a later
    /// `patch` has room to grow into (spec header comment "load() always
    /// allocates enough executable memory to load the module, but always
    /// at least mmapSizeMin bytes").
    ///
    /// Replaces any previously loaded allocation; call `unload` first if
    /// one exists and you want its memory released before this runs (this
    /// method does not do that for you, matching the original's assertion
    /// that `load` is never called while already loaded).
    pub fn load(&mut self, mmap_size_min: usize) -> Result<(), LoaderError> {
        debug_assert!(self.exec.is_none(), "bjit-jit: Module::load called while already loaded");

        self.resolve_relocs();

        let want = self.bytes.len().max(mmap_size_min);
        let alloc = loader::alloc_rw(want)?;

        // SAFETY: `alloc` was just allocated with write access and is at
        // least `self.bytes.len()` bytes long.
        unsafe {
            std::ptr::copy_nonoverlapping(self.bytes.as_ptr(), alloc.ptr, self.bytes.len());
        }
        loader::protect_rx(&alloc)?;

        self.loaded_len = self.bytes.len();
        self.exec = Some(alloc);
        Ok(())
    }

    /// Release the executable memory region (spec §4.7).
    pub fn unload(&mut self) -> Result<(), LoaderError> {
        let alloc = self.exec.take().ok_or(LoaderError::NotLoaded)?;
        loader::free(alloc)
    }

    /// Apply pending stub/near-call retargets (and any code appended since
    /// the last `load`) directly to the already-loaded executable memory,
    /// without moving it (spec §4.7 "Patching"). Fails with
    /// `LoaderError::CodeGrew` if the module has grown past its current
    /// allocation -- the caller must `unload` and `load` again in that
    /// case, and (per spec) no bytes of the live allocation are touched
    /// when that happens.
    pub fn patch(&mut self) -> Result<(), LoaderError> {
        let alloc = self.exec.as_ref().ok_or(LoaderError::NotLoaded)?;
        if self.bytes.len() > alloc.len {
            return Err(LoaderError::CodeGrew {
                needed: self.bytes.len(),
                have: alloc.len,
            });
        }

        self.resolve_relocs();

        let alloc = self.exec.as_ref().expect("checked above");
        loader::protect_rw(alloc)?;
        // SAFETY: just made writable; `self.bytes.len() <= alloc.len`
        // checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.bytes.as_ptr(), alloc.ptr, self.bytes.len());
        }
        loader::protect_rx(alloc)?;

        self.loaded_len = self.bytes.len();
        Ok(())
    }

    /// The address of procedure `index` within the loaded module (spec
    /// §4.7 "Exposes `getProcPtr(index)`").
    pub fn get_proc_ptr(&self, index: ProcIndex) -> Result<*const u8, LoaderError> {
        let alloc = self.exec.as_ref().ok_or(LoaderError::NotLoaded)?;
        let off = self.offsets[index.idx()] as usize;
        debug_assert!(off < self.loaded_len);
        // SAFETY: `off` is within the bytes copied into `alloc` by the
        // last `load`/`patch`.
        Ok(unsafe { alloc.ptr.add(off) })
    }

    /// Convenience wrapper around `get_proc_ptr` for callers that already
    /// know the target's function-pointer type (mirrors the original's
    /// `template <typename T> T* getPointer(unsigned index)`).
    ///
    /// # Safety
    /// `T` must accurately describe the calling convention and signature
    /// of the procedure compiled at `index`; calling through a mismatched
    /// `T` is undefined behavior, as is calling before the module (or
    /// after the module has been unloaded without a subsequent reload).
    pub unsafe fn get_proc<T: Copy>(&self, index: ProcIndex) -> Result<T, LoaderError> {
        let ptr = self.get_proc_ptr(index)?;
        Ok(std::mem::transmute_copy(&ptr))
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if let Some(alloc) = self.exec.take() {
            if let Err(e) = loader::free(alloc) {
                log::warn!("bjit-jit: failed to unmap module on drop: {}", e);
            }
        }
    }
}
