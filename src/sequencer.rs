use std::sync::atomic::{AtomicU64, Ordering};

/// Position of a chunk in the total write order shared by every stream
/// attached to the same [Sequencer].
pub type SeqNo = u64;

/// Hands out strictly increasing sequence numbers to concurrent writers.
///
/// One sequencer is shared (behind an `Arc`) by all the streams whose
/// output has to be merged, so that chunks from different streams can be
/// ordered against each other.
#[derive(Debug, Default)]
pub struct Sequencer {
    last: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a number larger than any previously returned by this sequencer.
    /// The first call returns 1.
    pub fn next(&self) -> SeqNo {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently issued number, or 0 if none has been issued yet.
    pub fn last(&self) -> SeqNo {
        self.last.load(Ordering::SeqCst)
    }
}
