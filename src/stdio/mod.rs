//! Access to the process-wide output channels a [crate::VirTerm] captures.
//!
//! A [StdioBackend] knows how to route one channel into a [VirtualStream]
//! and how to put the original destination back. [FdStdio] does this with
//! file descriptors for the real process; [MemoryStdio] keeps everything in
//! memory for tests and embedders that own their output.

mod fd;
mod memory;

use crate::line_buffer::StreamKind;
use crate::virtual_stream::VirtualStream;
use std::io::{self, Write};

pub use fd::FdStdio;
pub use memory::MemoryStdio;

pub trait StdioBackend: Send {
    /// Routes everything written to `kind` into `sink`, returning a writer to
    /// the destination that was in place before.
    fn redirect(&mut self, kind: StreamKind, sink: VirtualStream)
        -> io::Result<Box<dyn Write + Send>>;

    /// Puts the destination saved by [StdioBackend::redirect] back.
    fn restore(&mut self, kind: StreamKind) -> io::Result<()>;

    /// The destination `kind` writes to when it is not captured.
    fn real_writer(&self, kind: StreamKind) -> Box<dyn Write + Send>;
}
