//! Allocator hook installed into the profiled VM

use crate::attribution::AllocEvent;
use crate::session::SessionInner;
use crate::vm::{Allocator, AllocatorRef};
use std::cell::RefCell;
use std::rc::Weak;

/// Wraps the VM's original allocator and records one event per call.
pub struct MemprofAllocator {
    session: Weak<RefCell<SessionInner>>,
    orig: AllocatorRef,
}

impl MemprofAllocator {
    /// # Panics
    ///
    /// Panics if `orig` is itself a memprof hook.
    pub(crate) fn new(session: Weak<RefCell<SessionInner>>, orig: AllocatorRef) -> Self {
        assert!(
            !orig.is_memprof_hook(),
            "memprof allocator is instrumented twice"
        );
        Self { session, orig }
    }
}

impl Allocator for MemprofAllocator {
    unsafe fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        // SAFETY: arguments are forwarded unchanged from our own caller.
        let nptr = unsafe { self.orig.realloc(ptr, old_size, new_size) };

        let Some(session) = self.session.upgrade() else {
            return nptr;
        };
        // Already borrowed means the call comes from inside a profiler
        // operation (e.g. a sink callback allocating through the VM); it is
        // passed through unrecorded.
        if let Ok(mut inner) = session.try_borrow_mut() {
            let event = AllocEvent::classify(ptr, old_size, new_size, nptr);
            inner.on_alloc(self, &event);
        }

        nptr
    }

    fn is_memprof_hook(&self) -> bool {
        true
    }
}
