/*
Capture stdout and stderr, merge them back into one ordered stream of lines.

Write path:
    producer -> VirtualStream (tag with seqno + time, keep bounded history)
        -> handlers, on the writer's thread
            -> LineBuffer: per-stream partial line, completed lines sorted by seqno
            -> optional tee to wherever the channel pointed before

Read path:
    consumer waits on LineBuffer::has_data, pops lowest seqno first
    or a Feeder thread does that and forwards into a tokio channel

Writers never block on a full buffer, old history is simply dropped.
Partial lines are only emitted by an explicit flush.
*/
mod error;
mod feeder;
mod flag;
mod line_buffer;
mod sequencer;
pub mod stdio;
mod stream_buf;
mod virterm;
mod virtual_stream;
mod vte_actions;

pub use error::{Result, VirTermError};
pub use feeder::Feeder;
pub use flag::{Flag, WaitOutcome};
pub use line_buffer::{Line, LineBuffer, StreamKind};
pub use sequencer::{SeqNo, Sequencer};
pub use stdio::{FdStdio, MemoryStdio, StdioBackend};
pub use stream_buf::{BufItem, Handler, HandlerId, StreamBuf, DEFAULT_HISTORY_BYTES};
pub use virterm::{VirTerm, VirTermConfig};
pub use virtual_stream::VirtualStream;
pub use vte_actions::{plain_text, VteAction, VteActionParser};
