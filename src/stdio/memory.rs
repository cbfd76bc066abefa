use super::StdioBackend;
use crate::line_buffer::StreamKind;
use crate::virtual_stream::VirtualStream;
use parking_lot::{Mutex, MutexGuard};
use std::io::{self, Write};
use std::sync::Arc;

/// In-process stand-in for stdout and stderr.
///
/// The "real" destinations are byte buffers. Producers write through
/// [MemoryStdio::print], which lands in the capturing [VirtualStream] while a
/// channel is redirected and in the real buffer otherwise. Clones share state,
/// so a handle kept aside can inspect a backend owned by a [crate::VirTerm].
#[derive(Debug, Clone, Default)]
pub struct MemoryStdio {
    inner: Arc<Mutex<Channels>>,
}

#[derive(Debug, Default)]
struct Channels {
    real: [Vec<u8>; 2],
    grabbed: [Option<VirtualStream>; 2],
}

/// Appends to the real buffer of one channel.
struct RealWriter {
    inner: Arc<Mutex<Channels>>,
    index: usize,
}

impl Write for RealWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        lock(&self.inner).real[self.index].extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MemoryStdio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `text` to `kind` as a producer would.
    pub fn print(&self, kind: StreamKind, text: &str) {
        let sink = lock(&self.inner).grabbed[kind.index()].clone();
        // The lock is released first: a tee writes back into `real`.
        match sink {
            Some(sink) => {
                sink.write_chunk(text.as_bytes());
            }
            None => lock(&self.inner).real[kind.index()].extend_from_slice(text.as_bytes()),
        }
    }

    /// Everything that reached the real destination of `kind` so far.
    pub fn output(&self, kind: StreamKind) -> String {
        String::from_utf8_lossy(&lock(&self.inner).real[kind.index()]).into_owned()
    }

    pub fn is_redirected(&self, kind: StreamKind) -> bool {
        lock(&self.inner).grabbed[kind.index()].is_some()
    }

    fn writer(&self, kind: StreamKind) -> RealWriter {
        RealWriter {
            inner: Arc::clone(&self.inner),
            index: kind.index(),
        }
    }
}

impl StdioBackend for MemoryStdio {
    fn redirect(
        &mut self,
        kind: StreamKind,
        sink: VirtualStream,
    ) -> io::Result<Box<dyn Write + Send>> {
        let mut channels = lock(&self.inner);
        let slot = &mut channels.grabbed[kind.index()];
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{kind} is already redirected"),
            ));
        }
        *slot = Some(sink);
        drop(channels);
        Ok(Box::new(self.writer(kind)))
    }

    fn restore(&mut self, kind: StreamKind) -> io::Result<()> {
        lock(&self.inner).grabbed[kind.index()] = None;
        Ok(())
    }

    fn real_writer(&self, kind: StreamKind) -> Box<dyn Write + Send> {
        Box::new(self.writer(kind))
    }
}

fn lock(inner: &Mutex<Channels>) -> MutexGuard<'_, Channels> {
    inner.lock()
}
