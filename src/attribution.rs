//! Attribution of allocation events to their source
//!
//! Each event is charged to whatever the VM is doing when the allocator is
//! called: the interpreted function and line on top of the stack, a native
//! function, a compiled trace, or the VM itself (GC, JIT compiler, trace
//! exits) when there is no user frame to blame.

use crate::format::{event_tag, EventKind, SourceKind};
use crate::vm::{vm_state, FrameFunction, ProfiledVm, ProtoId};
use crate::wbuf::WireBuffer;
use serde::Serialize;

/// Execution state buckets the raw VM state is folded into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmStateBucket {
    Interp,
    NativeCall,
    JitRecord,
    JitOpt,
    JitAsm,
    Gc,
    Exit,
    TraceExec,
}

impl VmStateBucket {
    /// Fold a raw state tag. Everything at or beyond the trace state is a
    /// running trace; this clamp also keeps garbage values in bounds.
    pub fn from_raw(raw: u32) -> Self {
        match raw.min(vm_state::TRACE) {
            vm_state::INTERP => Self::Interp,
            vm_state::NATIVE_CALL => Self::NativeCall,
            vm_state::JIT_RECORD => Self::JitRecord,
            vm_state::JIT_OPT => Self::JitOpt,
            vm_state::JIT_ASM => Self::JitAsm,
            vm_state::GC => Self::Gc,
            vm_state::EXIT => Self::Exit,
            _ => Self::TraceExec,
        }
    }
}

/// Source an event is charged to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AllocSource {
    Internal,
    Lfunc { proto: ProtoId, line: u64 },
    Cfunc { addr: u64 },
    Trace { trace_no: u64, mcode_addr: u64 },
}

impl AllocSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            AllocSource::Internal => SourceKind::Internal,
            AllocSource::Lfunc { .. } => SourceKind::Lfunc,
            AllocSource::Cfunc { .. } => SourceKind::Cfunc,
            AllocSource::Trace { .. } => SourceKind::Trace,
        }
    }
}

/// A single allocator call, classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AllocEvent {
    Alloc { new_ptr: u64, new_size: u64 },
    Free { old_ptr: u64, old_size: u64 },
    Realloc {
        old_ptr: u64,
        old_size: u64,
        new_ptr: u64,
        new_size: u64,
    },
}

impl AllocEvent {
    /// Classify a realloc-style call by its arguments and result.
    pub fn classify(ptr: *mut u8, old_size: usize, new_size: usize, result: *mut u8) -> Self {
        if new_size == 0 {
            AllocEvent::Free {
                old_ptr: ptr as u64,
                old_size: old_size as u64,
            }
        } else if ptr.is_null() {
            AllocEvent::Alloc {
                new_ptr: result as u64,
                new_size: new_size as u64,
            }
        } else {
            AllocEvent::Realloc {
                old_ptr: ptr as u64,
                old_size: old_size as u64,
                new_ptr: result as u64,
                new_size: new_size as u64,
            }
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            AllocEvent::Alloc { .. } => EventKind::Alloc,
            AllocEvent::Free { .. } => EventKind::Free,
            AllocEvent::Realloc { .. } => EventKind::Realloc,
        }
    }
}

/// Interpreted frame at `line`; an unavailable line (seen when the JIT
/// recorder allocates on behalf of the function it records) is reported as
/// internal rather than with a bogus line.
fn lua_source(proto: ProtoId, line: i32) -> AllocSource {
    match u64::try_from(line) {
        Ok(line) => AllocSource::Lfunc { proto, line },
        Err(_) => AllocSource::Internal,
    }
}

fn frame_source(vm: &dyn ProfiledVm) -> AllocSource {
    match vm.frame_function(0) {
        Some(FrameFunction::Lua { proto, line }) => lua_source(proto, line),
        // A built-in called from Lua code is charged to the calling line,
        // which says more than the built-in's address.
        Some(FrameFunction::Builtin { addr }) => match vm.frame_function(1) {
            Some(FrameFunction::Lua { proto, line }) => lua_source(proto, line),
            _ => AllocSource::Cfunc { addr },
        },
        Some(FrameFunction::Native { addr }) => AllocSource::Cfunc { addr },
        None => {
            debug_assert!(false, "function state without a frame");
            AllocSource::Internal
        }
    }
}

fn trace_source(vm: &dyn ProfiledVm) -> AllocSource {
    match vm.current_trace() {
        Some(trace) => AllocSource::Trace {
            trace_no: u64::from(trace.trace_no),
            mcode_addr: trace.mcode_addr,
        },
        None => {
            debug_assert!(false, "trace state without a current trace");
            AllocSource::Internal
        }
    }
}

/// Work out the source of an allocation happening right now.
pub fn attribute(vm: &dyn ProfiledVm) -> AllocSource {
    match VmStateBucket::from_raw(vm.vm_state()) {
        VmStateBucket::Interp | VmStateBucket::NativeCall => frame_source(vm),
        VmStateBucket::JitRecord
        | VmStateBucket::JitOpt
        | VmStateBucket::JitAsm
        | VmStateBucket::Gc
        | VmStateBucket::Exit => AllocSource::Internal,
        VmStateBucket::TraceExec => trace_source(vm),
    }
}

/// Encode one event record: tag, source payload, event payload.
pub fn write_event(out: &mut WireBuffer, event: &AllocEvent, source: &AllocSource) {
    out.add_u8(event_tag(event.kind(), source.kind()));

    match *source {
        AllocSource::Internal => {}
        AllocSource::Lfunc { proto, line } => {
            out.add_u64(proto);
            out.add_u64(line);
        }
        AllocSource::Cfunc { addr } => out.add_u64(addr),
        AllocSource::Trace {
            trace_no,
            mcode_addr,
        } => {
            out.add_u64(trace_no);
            out.add_u64(mcode_addr);
        }
    }

    match *event {
        AllocEvent::Alloc { new_ptr, new_size } => {
            out.add_u64(new_ptr);
            out.add_u64(new_size);
        }
        AllocEvent::Free { old_ptr, old_size } => {
            out.add_u64(old_ptr);
            out.add_u64(old_size);
        }
        AllocEvent::Realloc {
            old_ptr,
            old_size,
            new_ptr,
            new_size,
        } => {
            out.add_u64(old_ptr);
            out.add_u64(old_size);
            out.add_u64(new_ptr);
            out.add_u64(new_size);
        }
    }
}

/// Attribute `event` against the current VM state and write it.
pub fn record(out: &mut WireBuffer, event: &AllocEvent, vm: &dyn ProfiledVm) {
    let source = attribute(vm);
    write_event(out, event, &source);
}
