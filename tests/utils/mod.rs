// Shared fixtures for the profiler integration tests
//
// A scripted VM whose state, call stack and heap registry are set directly by
// the test, plus a sink that collects everything written to it.

#![allow(dead_code)]

use memprof::vm::{BcLine, ProtoId};
use memprof::{
    Allocator, AllocatorRef, FrameFunction, GcObject, ProfileOptions, ProfileSink, ProfiledVm,
    PrototypeView, TraceRef, TraceView,
};
use std::cell::{Cell, RefCell};
use std::io;
use std::ops::ControlFlow;
use std::rc::Rc;

pub struct MockProto {
    pub id: ProtoId,
    pub chunk: Vec<u8>,
    pub first_line: u64,
    /// Line of each bytecode instruction.
    pub lines: Vec<BcLine>,
}

impl MockProto {
    pub fn new(id: ProtoId, chunk: &str, first_line: u64) -> Self {
        Self {
            id,
            chunk: chunk.as_bytes().to_vec(),
            first_line,
            lines: (0..8).map(|pc| first_line as BcLine + pc).collect(),
        }
    }
}

impl PrototypeView for MockProto {
    fn identity(&self) -> ProtoId {
        self.id
    }
    fn chunk_name(&self) -> &[u8] {
        &self.chunk
    }
    fn first_line(&self) -> u64 {
        self.first_line
    }
    fn bytecode_len(&self) -> usize {
        self.lines.len()
    }
    fn line_at(&self, pc: usize) -> BcLine {
        self.lines.get(pc).copied().unwrap_or(-1)
    }
}

pub struct MockTrace {
    pub trace_no: u32,
    pub mcode_addr: u64,
    pub proto: Rc<MockProto>,
    pub start_pc: usize,
}

impl TraceView for MockTrace {
    fn trace_no(&self) -> u32 {
        self.trace_no
    }
    fn mcode_addr(&self) -> u64 {
        self.mcode_addr
    }
    fn start_proto(&self) -> &dyn PrototypeView {
        self.proto.as_ref()
    }
    fn start_pc(&self) -> usize {
        self.start_pc
    }
}

/// Bump allocator handing out fake, never dereferenced addresses.
pub struct BumpAllocator {
    next: Cell<u64>,
    pub calls: Cell<usize>,
}

impl BumpAllocator {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            next: Cell::new(0x1000),
            calls: Cell::new(0),
        })
    }
}

impl Allocator for BumpAllocator {
    unsafe fn realloc(&self, _ptr: *mut u8, _old_size: usize, new_size: usize) -> *mut u8 {
        self.calls.set(self.calls.get() + 1);
        if new_size == 0 {
            return std::ptr::null_mut();
        }
        let addr = self.next.get();
        self.next.set(addr + (new_size as u64 + 15) / 16 * 16);
        addr as *mut u8
    }
}

pub struct MockVm {
    state: Cell<u32>,
    /// Index 0 is the running frame.
    frames: RefCell<Vec<FrameFunction>>,
    trace: Cell<Option<TraceRef>>,
    protos: RefCell<Vec<Rc<MockProto>>>,
    traces: RefCell<Vec<MockTrace>>,
    alloc: RefCell<AllocatorRef>,
}

impl MockVm {
    pub fn new(allocator: AllocatorRef) -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(memprof::vm::vm_state::INTERP),
            frames: RefCell::new(Vec::new()),
            trace: Cell::new(None),
            protos: RefCell::new(Vec::new()),
            traces: RefCell::new(Vec::new()),
            alloc: RefCell::new(allocator),
        })
    }

    pub fn add_proto(&self, proto: MockProto) -> Rc<MockProto> {
        let proto = Rc::new(proto);
        self.protos.borrow_mut().push(proto.clone());
        proto
    }

    pub fn add_trace(&self, trace: MockTrace) {
        self.traces.borrow_mut().push(trace);
    }

    pub fn set_state(&self, state: u32) {
        self.state.set(state);
    }

    pub fn set_frames(&self, frames: Vec<FrameFunction>) {
        *self.frames.borrow_mut() = frames;
    }

    pub fn set_trace(&self, trace: Option<TraceRef>) {
        self.trace.set(trace);
    }

    /// Run `frame` as the only frame on the stack.
    pub fn enter(&self, frame: FrameFunction) {
        self.set_frames(vec![frame]);
    }

    /// Allocator currently installed.
    pub fn allocator_handle(&self) -> AllocatorRef {
        self.alloc.borrow().clone()
    }

    fn call_allocator(&self, ptr: u64, old_size: usize, new_size: usize) -> u64 {
        // The profiler may swap the allocator from inside this call.
        let allocator = self.alloc.borrow().clone();
        unsafe { allocator.realloc(ptr as *mut u8, old_size, new_size) as u64 }
    }

    pub fn alloc(&self, size: usize) -> u64 {
        self.call_allocator(0, 0, size)
    }

    pub fn realloc(&self, ptr: u64, old_size: usize, new_size: usize) -> u64 {
        self.call_allocator(ptr, old_size, new_size)
    }

    pub fn free(&self, ptr: u64, size: usize) {
        self.call_allocator(ptr, size, 0);
    }
}

impl ProfiledVm for MockVm {
    fn vm_state(&self) -> u32 {
        self.state.get()
    }

    fn frame_function(&self, level: usize) -> Option<FrameFunction> {
        self.frames.borrow().get(level).copied()
    }

    fn current_trace(&self) -> Option<TraceRef> {
        self.trace.get()
    }

    fn for_each_object(&self, f: &mut dyn FnMut(GcObject<'_>)) {
        for proto in self.protos.borrow().iter() {
            f(GcObject::Proto(proto.as_ref()));
        }
        f(GcObject::Other);
        for trace in self.traces.borrow().iter() {
            f(GcObject::Trace(trace));
        }
    }

    fn allocator(&self) -> AllocatorRef {
        self.alloc.borrow().clone()
    }

    fn set_allocator(&self, allocator: AllocatorRef) {
        *self.alloc.borrow_mut() = allocator;
    }
}

/// What a [`CollectingSink`] saw, shared with the test.
#[derive(Debug, Default)]
pub struct SinkLog {
    pub data: Vec<u8>,
    pub writes: usize,
    pub stops: usize,
    pub returned_len: Option<usize>,
    /// Fail every write once this many writes have succeeded.
    pub fail_after: Option<usize>,
    /// Accept the write after this many writes, then ask to stop.
    pub stop_after: Option<usize>,
    pub fail_on_stop: bool,
}

pub struct CollectingSink(pub Rc<RefCell<SinkLog>>);

impl ProfileSink for CollectingSink {
    fn write(&mut self, data: &[u8]) -> io::Result<ControlFlow<()>> {
        let mut log = self.0.borrow_mut();
        if log.fail_after.is_some_and(|n| log.writes >= n) {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        log.data.extend_from_slice(data);
        log.writes += 1;
        if log.stop_after.is_some_and(|n| log.writes > n) {
            return Ok(ControlFlow::Break(()));
        }
        Ok(ControlFlow::Continue(()))
    }

    fn on_stop(&mut self, buffer: Box<[u8]>) -> io::Result<()> {
        let mut log = self.0.borrow_mut();
        log.stops += 1;
        log.returned_len = Some(buffer.len());
        if log.fail_on_stop {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(())
    }
}

/// Options streaming into a fresh log through a region of `capacity` bytes.
pub fn collecting(capacity: usize) -> (ProfileOptions, Rc<RefCell<SinkLog>>) {
    collecting_with(capacity, SinkLog::default())
}

pub fn collecting_with(capacity: usize, log: SinkLog) -> (ProfileOptions, Rc<RefCell<SinkLog>>) {
    let log = Rc::new(RefCell::new(log));
    let options = ProfileOptions::with_capacity(Box::new(CollectingSink(log.clone())), capacity);
    (options, log)
}

/// A VM with one function F defined at `m.lua:1`, currently at line 10.
pub fn scenario_vm() -> (Rc<MockVm>, Rc<BumpAllocator>) {
    let heap = BumpAllocator::new();
    let vm = MockVm::new(heap.clone());
    vm.add_proto(MockProto::new(0xf00, "m.lua", 1));
    vm.enter(FrameFunction::Lua {
        proto: 0xf00,
        line: 10,
    });
    (vm, heap)
}

pub fn as_dyn(vm: &Rc<MockVm>) -> Rc<dyn ProfiledVm> {
    vm.clone()
}
