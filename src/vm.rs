//! Interfaces the profiled VM exposes to the profiler
//!
//! The profiler never reaches into VM internals. Everything it needs to know
//! (what the VM is doing right now, which function owns the current frame,
//! which trace is running, what lives on the heap, which allocator is active)
//! goes through the traits in this module. All methods take `&self`: the VM
//! is single-threaded at the allocation boundary and is expected to use
//! interior mutability for its allocator slot.

use std::rc::Rc;

/// Stable correlation key of a function prototype (its address in the VM).
/// Consumers only compare it, they never dereference it.
pub type ProtoId = u64;

/// Source line as reported by the VM's debug info. Negative values mean the
/// line is not available for the current bytecode position.
pub type BcLine = i32;

/// Raw execution-state tags as the VM reports them. Any value at or past
/// [`vm_state::TRACE`] means a compiled trace is executing.
pub mod vm_state {
    pub const INTERP: u32 = 0;
    pub const NATIVE_CALL: u32 = 1;
    pub const JIT_RECORD: u32 = 2;
    pub const JIT_OPT: u32 = 3;
    pub const JIT_ASM: u32 = 4;
    pub const GC: u32 = 5;
    pub const EXIT: u32 = 6;
    pub const TRACE: u32 = 7;
}

/// Realloc-style allocator entry point, the single pluggable function the
/// VM routes every heap operation through.
///
/// `new_size == 0` frees `ptr`, a null `ptr` allocates, anything else
/// resizes. The returned pointer is the new block (null after a free).
pub trait Allocator {
    /// # Safety
    ///
    /// `ptr` must be null or a live block of `old_size` bytes previously
    /// returned by this allocator.
    unsafe fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8;

    /// True only for the profiler's own hook. A VM whose active allocator
    /// answers true is already being profiled.
    fn is_memprof_hook(&self) -> bool {
        false
    }
}

/// Shared handle to an installed allocator. The function and its context
/// travel together, so restoring the handle restores both.
pub type AllocatorRef = Rc<dyn Allocator>;

/// Identity comparison of two allocator handles.
pub fn same_allocator(a: &AllocatorRef, b: &AllocatorRef) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

/// Identity comparison of two VM handles.
pub fn same_vm(a: &Rc<dyn ProfiledVm>, b: &Rc<dyn ProfiledVm>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

/// The function owning a call frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFunction {
    /// Interpreted function: its prototype and the line the frame is at.
    Lua { proto: ProtoId, line: BcLine },
    /// Built-in ("fast") function implemented inside the VM.
    Builtin { addr: u64 },
    /// Plain native function registered by the embedder.
    Native { addr: u64 },
}

/// The compiled trace currently executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRef {
    pub trace_no: u32,
    pub mcode_addr: u64,
}

/// Read-only view of a function prototype
pub trait PrototypeView {
    fn identity(&self) -> ProtoId;
    fn chunk_name(&self) -> &[u8];
    fn first_line(&self) -> u64;
    /// Number of bytecode instructions.
    fn bytecode_len(&self) -> usize;
    /// Line table lookup for the instruction at `pc`.
    fn line_at(&self, pc: usize) -> BcLine;
}

/// Read-only view of a compiled trace
pub trait TraceView {
    fn trace_no(&self) -> u32;
    fn mcode_addr(&self) -> u64;
    /// Prototype the trace starts in. It is kept alive by the trace.
    fn start_proto(&self) -> &dyn PrototypeView;
    /// Bytecode offset of the trace's first instruction inside
    /// [`start_proto`](Self::start_proto).
    fn start_pc(&self) -> usize;
}

/// One entry of the live-object enumeration
pub enum GcObject<'a> {
    Proto(&'a dyn PrototypeView),
    Trace(&'a dyn TraceView),
    /// Any object the profiler has no symbol for.
    Other,
}

/// Everything the profiler asks of the VM it instruments
pub trait ProfiledVm {
    /// Current raw execution state, see [`vm_state`].
    fn vm_state(&self) -> u32;

    /// Function of the frame `level` steps up the stack (0 is the running
    /// frame, 1 its caller). For level 1 an interpreted function reports the
    /// line of its call site.
    fn frame_function(&self, level: usize) -> Option<FrameFunction>;

    /// Trace being executed, meaningful while the state is a trace state.
    fn current_trace(&self) -> Option<TraceRef>;

    /// Walk all live objects once, in registry order. Owning prototypes are
    /// enumerated before the traces that start in them.
    fn for_each_object(&self, f: &mut dyn FnMut(GcObject<'_>));

    /// Active allocator.
    fn allocator(&self) -> AllocatorRef;

    /// Replace the active allocator.
    ///
    /// The profiler may call this from inside a call to the active
    /// allocator, so the VM must hold its own clone of the handle for the
    /// duration of every allocator call.
    fn set_allocator(&self, allocator: AllocatorRef);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Allocator for Nop {
        unsafe fn realloc(&self, _ptr: *mut u8, _old: usize, _new: usize) -> *mut u8 {
            std::ptr::null_mut()
        }
    }

    #[test]
    fn test_same_allocator_is_identity() {
        let a: AllocatorRef = Rc::new(Nop);
        let b: AllocatorRef = Rc::new(Nop);
        let a2 = a.clone();

        assert!(same_allocator(&a, &a2));
        assert!(!same_allocator(&a, &b));
    }
}
