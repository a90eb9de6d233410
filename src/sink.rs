//! Output sinks and session options
//!
//! A sink is where the profiler's byte stream ends up. The profiler never
//! allocates its own output memory: the caller hands over a fixed region in
//! [`ProfileOptions`], the profiler fills it, passes full chunks to
//! [`ProfileSink::write`], and returns the region through
//! [`ProfileSink::on_stop`] when the session is over.

use std::io::{self, Write};
use std::ops::ControlFlow;

/// Default size of the output region.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Consumer of a memprof stream
pub trait ProfileSink {
    /// Accept a chunk of the stream. Return `ControlFlow::Break(())` to ask
    /// the profiler to stop; the allocator is restored as soon as the
    /// profiler sees it. An error is sticky: nothing else is written for the
    /// rest of the session.
    fn write(&mut self, data: &[u8]) -> io::Result<ControlFlow<()>>;

    /// Called exactly once per `start` attempt, with the region the caller
    /// supplied, when the session ends or is rejected.
    fn on_stop(&mut self, buffer: Box<[u8]>) -> io::Result<()>;
}

/// Options for [`Memprof::start`](crate::session::Memprof::start)
pub struct ProfileOptions {
    pub sink: Box<dyn ProfileSink>,
    /// Output region. Must not be empty.
    pub buffer: Box<[u8]>,
}

impl ProfileOptions {
    pub fn new(sink: Box<dyn ProfileSink>, buffer: Box<[u8]>) -> Self {
        Self { sink, buffer }
    }

    /// Options with a freshly zeroed region of `len` bytes.
    pub fn with_capacity(sink: Box<dyn ProfileSink>, len: usize) -> Self {
        Self::new(sink, vec![0u8; len].into_boxed_slice())
    }
}

impl std::fmt::Debug for ProfileOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileOptions")
            .field("buffer_len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

/// Sink streaming into any [`io::Write`], e.g. a file.
///
/// Short writes are retried by `write_all`; the writer is flushed when the
/// session stops.
pub struct WriteSink<W: Write> {
    writer: W,
    bytes_written: u64,
}

impl<W: Write> WriteSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ProfileSink for WriteSink<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<ControlFlow<()>> {
        self.writer.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(ControlFlow::Continue(()))
    }

    fn on_stop(&mut self, _buffer: Box<[u8]>) -> io::Result<()> {
        tracing::debug!(bytes = self.bytes_written, "memprof stream closed");
        self.writer.flush()
    }
}
