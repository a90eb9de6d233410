//! Profiling session state machine
//!
//! ```text
//!   Idle ──start──▶ Profiling ──stop──▶ Idle
//!                       │
//!                       └── stream failure ──▶ Halted ──stop──▶ Idle
//! ```
//!
//! `start` seeds the symbol table, writes the event header and swaps the
//! VM's allocator for a [`MemprofAllocator`]. From then on every allocator
//! call lands in the stream. `stop` puts the original allocator back, writes
//! the epilogue and returns the output region to the sink.
//!
//! A session only reaches `Halted` when the stream dies without the
//! controlling code asking for it: the allocator hook noticed a failed or
//! stopped sink and deinstrumented on its own, or a prototype notification
//! hit a dead sink. The next `stop` reports the preserved errno and brings
//! the session back to `Idle`.

use crate::attribution::{self, AllocEvent};
use crate::error::{errno_of, ProfileError, Result};
use crate::format::{EPILOGUE_TAG, EVENTS_HEADER};
use crate::interceptor::MemprofAllocator;
use crate::sink::{ProfileOptions, ProfileSink};
use crate::symtab;
use crate::vm::{same_allocator, same_vm, AllocatorRef, ProfiledVm, PrototypeView};
use crate::wbuf::{StreamFlags, WireBuffer};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Externally visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Profiling,
    Halted,
}

/// Resources owned by a running session
struct Active {
    vm: Rc<dyn ProfiledVm>,
    out: WireBuffer,
    orig_alloc: AllocatorRef,
    hook: Rc<MemprofAllocator>,
}

enum Phase {
    Idle,
    Profiling(Active),
    Halted {
        errno: i32,
        /// Set when the stream died outside an allocator call: the sink's
        /// `on_stop` still has to run at the next `stop`.
        deferred: Option<Active>,
    },
}

pub(crate) struct SessionInner {
    phase: Phase,
    /// Mirror of `phase`, readable while the session is borrowed.
    state: Rc<Cell<SessionState>>,
}

/// Hand the region back through `on_stop`, ignoring callback errors.
fn release(out: WireBuffer) {
    let (mut sink, region) = out.terminate();
    if let Err(err) = sink.on_stop(region) {
        tracing::warn!(error = %err, "memprof on_stop failed during cleanup");
    }
}

/// Refuse a start: hand the caller's region back, ignoring the result.
fn reject(mut sink: Box<dyn ProfileSink>, buffer: Box<[u8]>, reason: &str) -> Result<()> {
    tracing::warn!("{}", reason);
    let _ = sink.on_stop(buffer);
    Err(ProfileError::Running)
}

impl Active {
    fn restore_allocator(&self) {
        let current = self.vm.allocator();
        let hook: AllocatorRef = self.hook.clone();
        if !same_allocator(&current, &hook) {
            tracing::warn!("memprof hook was replaced while profiling, restoring original allocator anyway");
        }
        self.vm.set_allocator(self.orig_alloc.clone());
    }

    /// Restore the allocator, close the stream and release the region.
    fn deinstrument(self) -> Result<()> {
        self.restore_allocator();
        let mut out = self.out;

        if out.test_flag(StreamFlags::STOP_REQUESTED) {
            let errno = out.errno();
            release(out);
            return Err(ProfileError::Io { errno });
        }

        out.add_u8(EPILOGUE_TAG);
        out.flush();

        let flagged = out.test_flag(StreamFlags::ANY);
        let errno = out.errno();
        let (mut sink, region) = out.terminate();
        let on_stop = sink.on_stop(region);

        match (flagged, on_stop) {
            (false, Ok(())) => Ok(()),
            (true, _) => Err(ProfileError::Io { errno }),
            (false, Err(err)) => {
                tracing::warn!(error = %err, "memprof on_stop failed");
                Err(ProfileError::Io {
                    errno: errno_of(&err),
                })
            }
        }
    }
}

impl SessionInner {
    fn set_phase(&mut self, phase: Phase) {
        self.state.set(match phase {
            Phase::Idle => SessionState::Idle,
            Phase::Profiling(_) => SessionState::Profiling,
            Phase::Halted { .. } => SessionState::Halted,
        });
        self.phase = phase;
    }

    /// Move the current phase out, leaving the session `Idle`.
    fn take_phase(&mut self) -> Phase {
        self.state.set(SessionState::Idle);
        std::mem::replace(&mut self.phase, Phase::Idle)
    }

    /// Entry point of the allocator hook.
    pub(crate) fn on_alloc(&mut self, hook: &MemprofAllocator, event: &AllocEvent) {
        let stream_dead = {
            let Phase::Profiling(active) = &mut self.phase else {
                return;
            };
            // A hook left over from an earlier session of this profiler.
            if !std::ptr::addr_eq(Rc::as_ptr(&active.hook), hook as *const MemprofAllocator) {
                return;
            }
            attribution::record(&mut active.out, event, active.vm.as_ref());
            active.out.test_flag(StreamFlags::ANY)
        };

        if stream_dead {
            self.self_stop();
        }
    }

    /// Deinstrument from inside the allocator hook. The allocator is
    /// restored before anything else runs, so this cannot recurse.
    fn self_stop(&mut self) {
        let Phase::Profiling(active) = self.take_phase() else {
            return;
        };
        tracing::debug!("memprof stream closed by the sink, deinstrumenting");
        if let Err(err) = active.deinstrument() {
            self.set_phase(Phase::Halted {
                errno: err.errno().unwrap_or(0),
                deferred: None,
            });
        }
    }

    fn on_proto(&mut self, proto: &dyn PrototypeView) {
        let stream_dead = {
            let Phase::Profiling(active) = &mut self.phase else {
                return;
            };
            symtab::add_symbol(&mut active.out, proto);
            active.out.test_flag(StreamFlags::ANY)
        };

        if stream_dead {
            // Not inside an allocator call: only swap the allocator back and
            // leave the sink callbacks to the next explicit stop.
            let Phase::Profiling(active) = self.take_phase() else {
                return;
            };
            active.restore_allocator();
            let errno = active.out.errno();
            tracing::warn!(errno, "memprof stream died on symbol insertion, session halted");
            self.set_phase(Phase::Halted {
                errno,
                deferred: Some(active),
            });
        }
    }

    fn stop(&mut self, vm: &Rc<dyn ProfiledVm>) -> Result<()> {
        match &self.phase {
            Phase::Idle => return Err(ProfileError::Running),
            Phase::Profiling(active) if !same_vm(&active.vm, vm) => {
                tracing::warn!("memprof stop requested for a VM that is not being profiled");
                return Err(ProfileError::Use);
            }
            _ => {}
        }

        match self.take_phase() {
            Phase::Halted { errno, deferred } => {
                if let Some(active) = deferred {
                    release(active.out);
                }
                Err(ProfileError::Io { errno })
            }
            Phase::Profiling(active) => {
                let result = active.deinstrument();
                tracing::debug!(?result, "memprof stopped");
                result
            }
            Phase::Idle => Err(ProfileError::Running),
        }
    }
}

/// Allocation profiler session
///
/// One session profiles at most one VM at a time; a second `start` while it
/// is running is rejected.
pub struct Memprof {
    inner: Rc<RefCell<SessionInner>>,
    state: Rc<Cell<SessionState>>,
}

impl Default for Memprof {
    fn default() -> Self {
        Self::new()
    }
}

impl Memprof {
    pub fn new() -> Self {
        let state = Rc::new(Cell::new(SessionState::Idle));
        Self {
            inner: Rc::new(RefCell::new(SessionInner {
                phase: Phase::Idle,
                state: state.clone(),
            })),
            state,
        }
    }

    /// Current session state. Sink callbacks running during teardown
    /// already see `Idle`.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_profiling(&self) -> bool {
        self.state() == SessionState::Profiling
    }

    /// Start profiling `vm`, streaming into `options.sink`.
    ///
    /// Returns `Err(Running)` when this session is not idle or when `vm`
    /// already runs another session's hook. On every error path the sink's
    /// `on_stop` has been called with the region from `options` before this
    /// returns.
    ///
    /// # Panics
    ///
    /// Panics if `options.buffer` is empty.
    pub fn start(&self, vm: Rc<dyn ProfiledVm>, options: ProfileOptions) -> Result<()> {
        let ProfileOptions { sink, buffer } = options;
        assert!(!buffer.is_empty(), "memprof output buffer must not be empty");

        let mut inner = match self.inner.try_borrow_mut() {
            Ok(inner) if matches!(inner.phase, Phase::Idle) => inner,
            _ => return reject(sink, buffer, "memprof start rejected, session is not idle"),
        };
        if vm.allocator().is_memprof_hook() {
            return reject(
                sink,
                buffer,
                "memprof start rejected, VM is already profiled by another session",
            );
        }

        let mut out = WireBuffer::new(sink, buffer);
        symtab::dump_symtab(&mut out, vm.as_ref());
        out.add_bytes(&EVENTS_HEADER);

        if out.test_flag(StreamFlags::ANY) {
            let errno = out.errno();
            tracing::warn!(errno, "memprof stream failed before profiling started");
            release(out);
            return Err(ProfileError::Io { errno });
        }

        let orig_alloc = vm.allocator();
        let hook = Rc::new(MemprofAllocator::new(
            Rc::downgrade(&self.inner),
            orig_alloc.clone(),
        ));
        vm.set_allocator(hook.clone());

        tracing::debug!(capacity = out.capacity(), "memprof started");
        inner.set_phase(Phase::Profiling(Active {
            vm,
            out,
            orig_alloc,
            hook,
        }));
        Ok(())
    }

    /// Stop profiling `vm`.
    ///
    /// - `Err(Running)` when nothing is being profiled.
    /// - `Err(Use)` when `vm` is not the profiled VM; the session keeps
    ///   running.
    /// - `Err(Io { errno })` when the stream failed at any point, including
    ///   an earlier self-stop that left the session `Halted`.
    pub fn stop(&self, vm: &Rc<dyn ProfiledVm>) -> Result<()> {
        let mut inner = self.inner.try_borrow_mut().map_err(|_| ProfileError::Use)?;
        inner.stop(vm)
    }

    /// Record a prototype created while profiling. No-op otherwise.
    pub fn notify_prototype_created(&self, proto: &dyn PrototypeView) {
        match self.inner.try_borrow_mut() {
            Ok(mut inner) => inner.on_proto(proto),
            Err(_) => tracing::warn!("memprof prototype notification from inside the profiler dropped"),
        }
    }
}

impl Drop for Memprof {
    fn drop(&mut self) {
        let Ok(mut inner) = self.inner.try_borrow_mut() else {
            return;
        };
        match inner.take_phase() {
            Phase::Profiling(active) => {
                tracing::warn!("memprof session dropped while profiling, stopping");
                let _ = active.deinstrument();
            }
            Phase::Halted {
                deferred: Some(active),
                ..
            } => release(active.out),
            _ => {}
        }
    }
}

impl std::fmt::Debug for Memprof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memprof")
            .field("state", &self.state())
            .finish()
    }
}
