//! Bounded output accumulator for the memprof stream
//!
//! The buffer writes into the caller's fixed region and hands the filled
//! prefix to the sink whenever the next write would not fit. A sink failure
//! or stop request sets a sticky flag; from then on every write is dropped
//! silently, so the allocator hook can keep calling into the buffer without
//! checking for errors after each field.

use crate::error::errno_of;
use crate::sink::ProfileSink;
use std::ops::{BitOr, ControlFlow};

/// Stream state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags(u8);

impl StreamFlags {
    pub const NONE: Self = Self(0);
    /// The sink failed to accept data.
    pub const IO_ERROR: Self = Self(1 << 0);
    /// The sink asked to stop.
    pub const STOP_REQUESTED: Self = Self(1 << 1);
    pub const ANY: Self = Self(Self::IO_ERROR.0 | Self::STOP_REQUESTED.0);

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for StreamFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

pub struct WireBuffer {
    sink: Box<dyn ProfileSink>,
    buf: Box<[u8]>,
    pos: usize,
    flags: StreamFlags,
    saved_errno: i32,
}

impl WireBuffer {
    /// Wrap the caller's region.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is empty.
    pub fn new(sink: Box<dyn ProfileSink>, buf: Box<[u8]>) -> Self {
        assert!(!buf.is_empty(), "memprof output buffer must not be empty");
        Self {
            sink,
            buf,
            pos: 0,
            flags: StreamFlags::NONE,
            saved_errno: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes written but not flushed yet.
    pub fn pending(&self) -> usize {
        self.pos
    }

    pub fn test_flag(&self, flags: StreamFlags) -> bool {
        self.flags.intersects(flags)
    }

    /// OS error code preserved from the failing sink write, 0 otherwise.
    pub fn errno(&self) -> i32 {
        self.saved_errno
    }

    #[inline]
    fn free(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn add_u8(&mut self, byte: u8) {
        self.add_bytes(&[byte]);
    }

    pub fn add_u64(&mut self, value: u64) {
        self.add_bytes(&value.to_le_bytes());
    }

    /// Length-prefixed byte string.
    pub fn add_string(&mut self, s: &[u8]) {
        self.add_u64(s.len() as u64);
        self.add_bytes(s);
    }

    pub fn add_bytes(&mut self, mut data: &[u8]) {
        if self.test_flag(StreamFlags::ANY) {
            return;
        }

        // Larger than the whole region: stream it through in full chunks.
        while data.len() > self.buf.len() {
            let left = self.free();
            self.buf[self.pos..].copy_from_slice(&data[..left]);
            self.pos += left;
            data = &data[left..];
            self.flush();
            if self.test_flag(StreamFlags::ANY) {
                return;
            }
        }

        if data.len() > self.free() {
            self.flush();
            if self.test_flag(StreamFlags::ANY) {
                return;
            }
        }

        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    /// Hand the filled prefix to the sink and rewind.
    pub fn flush(&mut self) {
        if self.test_flag(StreamFlags::ANY) || self.pos == 0 {
            return;
        }

        let len = std::mem::take(&mut self.pos);
        tracing::trace!(len, "memprof flush");

        match self.sink.write(&self.buf[..len]) {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => {
                tracing::debug!("memprof sink requested stop");
                self.flags = self.flags | StreamFlags::STOP_REQUESTED;
            }
            Err(err) => {
                tracing::warn!(error = %err, "memprof sink failed, dropping further output");
                self.saved_errno = errno_of(&err);
                self.flags = self.flags | StreamFlags::IO_ERROR;
            }
        }
    }

    /// Release the region back to its owner, together with the sink.
    /// Unflushed bytes are discarded.
    pub fn terminate(self) -> (Box<dyn ProfileSink>, Box<[u8]>) {
        (self.sink, self.buf)
    }
}

impl std::fmt::Debug for WireBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireBuffer")
            .field("capacity", &self.buf.len())
            .field("pos", &self.pos)
            .field("flags", &self.flags)
            .field("saved_errno", &self.saved_errno)
            .finish_non_exhaustive()
    }
}
