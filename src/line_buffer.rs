//! Merges the chunks of two streams into one queue of complete lines.
//!
//! Each stream gets its own partial-line accumulator, since a line is only
//! known to be complete once its `\n` arrives. A completed line takes the
//! sequence number of the chunk that completed it and is inserted into a
//! single queue kept sorted by that number, so the consumer sees normal and
//! error output in the order it was written.
//!
//! Text that never receives a trailing newline stays in its accumulator
//! until [LineBuffer::flush_partials] is called explicitly.

use crate::flag::Flag;
use crate::sequencer::SeqNo;
use crate::stream_buf::{BufItem, Handler};
use crate::vte_actions::plain_text;
use log::trace;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which of the two merged streams a chunk or line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Normal,
    Error,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Normal, StreamKind::Error];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Normal => "stdout",
            StreamKind::Error => "stderr",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            StreamKind::Normal => 0,
            StreamKind::Error => 1,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One complete line, including its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    /// Sequence number of the chunk that completed the line.
    pub seqno: SeqNo,
    pub is_err: bool,
}

impl Line {
    pub fn kind(&self) -> StreamKind {
        if self.is_err {
            StreamKind::Error
        } else {
            StreamKind::Normal
        }
    }

    /// The printable text of the line, without escape sequences or the
    /// line terminator.
    pub fn plain_text(&self) -> String {
        plain_text(self.text.as_bytes())
    }
}

#[derive(Default)]
struct State {
    partial: [Vec<u8>; 2],
    lines: VecDeque<Line>,
}

#[derive(Default)]
pub struct LineBuffer {
    state: Mutex<State>,
    has_data: Flag,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler feeding every chunk of a stream into this buffer as `kind`.
    pub fn handler(self: &Arc<Self>, kind: StreamKind) -> Arc<dyn Handler> {
        let lines = Arc::clone(self);
        Arc::new(move |item: &BufItem| -> anyhow::Result<()> {
            lines.add_chunk(kind, item);
            Ok(())
        })
    }

    /// Appends a chunk to the partial line of `kind`, queueing every line it
    /// completes.
    pub fn add_chunk(&self, kind: StreamKind, item: &BufItem) {
        trace!("{}: chunk #{} ({} bytes)", kind, item.seqno, item.size());
        let mut state = self.lock();
        let mut rest = item.data.as_slice();
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos + 1);
            let partial = &mut state.partial[kind.index()];
            partial.extend_from_slice(head);
            let text = decode(std::mem::take(partial));
            self.insert_locked(
                &mut state,
                Line {
                    text,
                    seqno: item.seqno,
                    is_err: kind == StreamKind::Error,
                },
            );
            rest = tail;
        }
        state.partial[kind.index()].extend_from_slice(rest);
    }

    /// Queues `line` at the position its sequence number dictates.
    pub fn insert_line(&self, line: Line) {
        let mut state = self.lock();
        self.insert_locked(&mut state, line);
    }

    /// Removes and returns the line with the lowest sequence number.
    pub fn pop_first_line(&self) -> Option<Line> {
        let mut state = self.lock();
        let line = state.lines.pop_front()?;
        if state.lines.is_empty() {
            self.has_data.lower();
        }
        Some(line)
    }

    /// Like [LineBuffer::pop_first_line], but waits up to `timeout` (forever
    /// if `None`) for a line to arrive.
    pub fn pop_line_timeout(&self, timeout: Option<Duration>) -> Option<Line> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        loop {
            if let Some(line) = self.pop_first_line() {
                return Some(line);
            }
            let remaining = match deadline {
                Some(deadline) => Some(deadline.checked_duration_since(Instant::now())?),
                None => None,
            };
            if !self.has_data.wait_up(remaining).is_satisfied() {
                return None;
            }
        }
    }

    /// Pops every queued line, lowest sequence number first.
    pub fn drain(&self) -> Vec<Line> {
        let mut state = self.lock();
        let lines = state.lines.drain(..).collect();
        self.has_data.lower();
        lines
    }

    /// Turns any unterminated text into lines tagged with `seqno`, normal
    /// stream first. Returns how many lines were produced.
    pub fn flush_partials(&self, seqno: SeqNo) -> usize {
        let mut state = self.lock();
        let mut flushed = 0;
        for kind in StreamKind::ALL {
            let partial = std::mem::take(&mut state.partial[kind.index()]);
            if partial.is_empty() {
                continue;
            }
            self.insert_locked(
                &mut state,
                Line {
                    text: decode(partial),
                    seqno,
                    is_err: kind == StreamKind::Error,
                },
            );
            flushed += 1;
        }
        flushed
    }

    /// Bytes of `kind` still waiting for a newline.
    pub fn pending(&self, kind: StreamKind) -> Vec<u8> {
        self.lock().partial[kind.index()].clone()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    /// Up while at least one complete line is queued.
    pub fn has_data(&self) -> &Flag {
        &self.has_data
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    fn insert_locked(&self, state: &mut State, line: Line) {
        // Equal sequence numbers come from one chunk; keep them in order.
        let at = state.lines.partition_point(|queued| queued.seqno <= line.seqno);
        state.lines.insert(at, line);
        // Waves when already up, so waiters for a touch still hear about it.
        self.has_data.raise();
    }
}

impl fmt::Debug for LineBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("LineBuffer")
            .field("lines", &state.lines.len())
            .field("pending_normal", &state.partial[0].len())
            .field("pending_error", &state.partial[1].len())
            .finish()
    }
}

fn decode(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes)
        .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}
