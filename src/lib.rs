//! memprof - allocation profiler for a tracing-JIT Lua VM
//!
//! While a session is running every allocator call of the profiled VM is
//! recorded, attributed to the code that caused it (interpreted function and
//! line, native function, compiled trace or VM internals) and streamed in a
//! compact binary format to a caller-supplied sink. The `decode` and
//! `report` modules read such streams back.

pub mod attribution;
pub mod cli;
pub mod decode;
pub mod error;
pub mod format;
pub mod interceptor;
pub mod report;
pub mod session;
pub mod sink;
pub mod symtab;
pub mod vm;
pub mod wbuf;

pub use error::{ProfileError, Result, Status};
pub use interceptor::MemprofAllocator;
pub use session::{Memprof, SessionState};
pub use sink::{ProfileOptions, ProfileSink, WriteSink, DEFAULT_BUFFER_SIZE};
pub use vm::{
    Allocator, AllocatorRef, FrameFunction, GcObject, ProfiledVm, PrototypeView, TraceRef,
    TraceView,
};
