use crate::error::{Result, VirTermError};
use crate::feeder::Feeder;
use crate::flag::Flag;
use crate::line_buffer::{Line, LineBuffer, StreamKind};
use crate::sequencer::Sequencer;
use crate::stdio::{FdStdio, StdioBackend};
use crate::stream_buf::DEFAULT_HISTORY_BYTES;
use crate::virtual_stream::VirtualStream;
use log::{debug, warn};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone)]
pub struct VirTermConfig {
    /// Bytes of raw history each stream keeps.
    pub history_bytes: usize,
    /// Whether [VirTerm::grab_stdio] mirrors captured output to the original
    /// destination.
    pub tee: bool,
    /// Upper bound on how long a [Feeder] takes to notice it was stopped.
    pub feeder_poll: Duration,
}

impl Default for VirTermConfig {
    fn default() -> Self {
        Self {
            history_bytes: DEFAULT_HISTORY_BYTES,
            tee: true,
            feeder_poll: Duration::from_millis(50),
        }
    }
}

impl VirTermConfig {
    pub fn with_history_bytes(mut self, history_bytes: usize) -> Self {
        self.history_bytes = history_bytes;
        self
    }

    pub fn with_tee(mut self, tee: bool) -> Self {
        self.tee = tee;
        self
    }

    pub fn with_feeder_poll(mut self, feeder_poll: Duration) -> Self {
        self.feeder_poll = feeder_poll;
        self
    }
}

/// Per-channel attachment to the process output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Attachment {
    #[default]
    Released,
    Grabbed {
        tee: bool,
    },
}

/// A capture session: a normal and an error [VirtualStream] merged into one
/// [LineBuffer], plus the bookkeeping to route the process's stdout and
/// stderr into them and back out again.
///
/// Dropping a `VirTerm` releases any channel it still holds.
pub struct VirTerm {
    config: VirTermConfig,
    sequencer: Arc<Sequencer>,
    streams: [VirtualStream; 2],
    lines: Arc<LineBuffer>,
    backend: Box<dyn StdioBackend>,
    attachments: [Attachment; 2],
}

impl VirTerm {
    /// A session over the real process descriptors with the default config.
    ///
    /// Output that reaches the descriptors is tagged when [FdStdio] reads it,
    /// so the order of normal and error lines only approximates the order
    /// they were printed in. Writing through [VirTerm::out] and
    /// [VirTerm::err] keeps the exact order.
    pub fn new() -> Self {
        Self::with_config(VirTermConfig::default())
    }

    pub fn with_config(config: VirTermConfig) -> Self {
        Self::with_backend(config, FdStdio::new())
    }

    pub fn with_backend(config: VirTermConfig, backend: impl StdioBackend + 'static) -> Self {
        let sequencer = Arc::new(Sequencer::new());
        let lines = Arc::new(LineBuffer::new());
        let streams = StreamKind::ALL.map(|kind| {
            let stream =
                VirtualStream::new(kind.as_str(), Arc::clone(&sequencer), config.history_bytes);
            stream.add_handler(lines.handler(kind));
            stream
        });
        Self {
            config,
            sequencer,
            streams,
            lines,
            backend: Box::new(backend),
            attachments: [Attachment::Released; 2],
        }
    }

    pub fn config(&self) -> &VirTermConfig {
        &self.config
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    /// The stream capturing `kind`. Producers may also write to it directly.
    pub fn stream(&self, kind: StreamKind) -> &VirtualStream {
        &self.streams[kind.index()]
    }

    pub fn out(&self) -> &VirtualStream {
        self.stream(StreamKind::Normal)
    }

    pub fn err(&self) -> &VirtualStream {
        self.stream(StreamKind::Error)
    }

    pub fn lines(&self) -> &Arc<LineBuffer> {
        &self.lines
    }

    /// Up while completed lines are waiting to be popped.
    pub fn has_data(&self) -> &Flag {
        self.lines.has_data()
    }

    pub fn is_grabbed(&self, kind: StreamKind) -> bool {
        self.attachments[kind.index()] != Attachment::Released
    }

    pub fn is_teeing(&self, kind: StreamKind) -> bool {
        self.attachments[kind.index()] == Attachment::Grabbed { tee: true }
    }

    /// Routes `kind` into its stream. With `tee`, everything captured is
    /// still written to the original destination as well.
    ///
    /// Grabbing a channel that is already grabbed fails and leaves the
    /// existing capture untouched.
    pub fn grab(&mut self, kind: StreamKind, tee: bool) -> Result<()> {
        if self.is_grabbed(kind) {
            return Err(VirTermError::AlreadyGrabbed(kind));
        }
        let stream = &self.streams[kind.index()];
        let original = self
            .backend
            .redirect(kind, stream.clone())
            .map_err(|source| VirTermError::Redirect { kind, source })?;
        if tee {
            stream.set_tee(original);
        }
        self.attachments[kind.index()] = Attachment::Grabbed { tee };
        debug!("grabbed {} (tee: {})", kind, tee);
        Ok(())
    }

    /// Puts the original destination of `kind` back. Does nothing if the
    /// channel is not grabbed.
    pub fn release(&mut self, kind: StreamKind) -> Result<()> {
        if !self.is_grabbed(kind) {
            return Ok(());
        }
        self.backend
            .restore(kind)
            .map_err(|source| VirTermError::Restore { kind, source })?;
        self.streams[kind.index()].clear_tee();
        self.attachments[kind.index()] = Attachment::Released;
        debug!("released {}", kind);
        Ok(())
    }

    pub fn grab_stdout(&mut self, tee: bool) -> Result<()> {
        self.grab(StreamKind::Normal, tee)
    }

    pub fn grab_stderr(&mut self, tee: bool) -> Result<()> {
        self.grab(StreamKind::Error, tee)
    }

    pub fn release_stdout(&mut self) -> Result<()> {
        self.release(StreamKind::Normal)
    }

    pub fn release_stderr(&mut self) -> Result<()> {
        self.release(StreamKind::Error)
    }

    /// Grabs both channels, or neither: if either is already grabbed, or the
    /// second grab fails, nothing is left grabbed by this call.
    pub fn grab_stdio(&mut self, tee: bool) -> Result<()> {
        if let Some(kind) = StreamKind::ALL.into_iter().find(|&kind| self.is_grabbed(kind)) {
            return Err(VirTermError::AlreadyGrabbed(kind));
        }
        self.grab(StreamKind::Normal, tee)?;
        if let Err(err) = self.grab(StreamKind::Error, tee) {
            if let Err(undo) = self.release(StreamKind::Normal) {
                warn!("{}", undo);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Grabs both channels using the configured tee setting.
    pub fn grab_stdio_default(&mut self) -> Result<()> {
        self.grab_stdio(self.config.tee)
    }

    /// Releases both channels. Both are attempted; the first error is returned.
    pub fn release_stdio(&mut self) -> Result<()> {
        let out = self.release(StreamKind::Normal);
        let err = self.release(StreamKind::Error);
        out.and(err)
    }

    pub fn pop_first_line(&self) -> Option<Line> {
        self.lines.pop_first_line()
    }

    pub fn pop_line_timeout(&self, timeout: Option<Duration>) -> Option<Line> {
        self.lines.pop_line_timeout(timeout)
    }

    /// Queues whatever unterminated text the streams hold as final lines.
    /// Never done implicitly.
    pub fn flush_partials(&self) -> usize {
        self.lines.flush_partials(self.sequencer.next())
    }

    /// Starts a [Feeder] draining this session's lines into a tokio channel.
    pub fn feeder(&self) -> io::Result<(Feeder, UnboundedReceiver<Line>)> {
        Feeder::spawn(Arc::clone(&self.lines), self.config.feeder_poll)
    }

    /// Recovery path for when captured output can no longer be shown:
    /// releases both channels, then writes every queued line to the real
    /// stdout or stderr it came from. Returns the number of lines written.
    pub fn dump_all(&mut self) -> Result<usize> {
        self.release_stdio()?;
        let lines = self.lines.drain();
        let mut writers = StreamKind::ALL.map(|kind| self.backend.real_writer(kind));
        for line in &lines {
            writers[line.kind().index()]
                .write_all(line.text.as_bytes())
                .map_err(VirTermError::Dump)?;
        }
        for writer in &mut writers {
            writer.flush().map_err(VirTermError::Dump)?;
        }
        debug!("dumped {} lines", lines.len());
        Ok(lines.len())
    }
}

impl Default for VirTerm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VirTerm {
    fn drop(&mut self) {
        if let Err(err) = self.release_stdio() {
            warn!("{}", err);
        }
    }
}
