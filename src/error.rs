//! Errors raised while attaching to or detaching from the process channels.

use crate::line_buffer::StreamKind;

#[derive(Debug, thiserror::Error)]
pub enum VirTermError {
    #[error("{0} is already grabbed")]
    AlreadyGrabbed(StreamKind),

    #[error("failed to redirect {kind}: {source}")]
    Redirect {
        kind: StreamKind,
        source: std::io::Error,
    },

    #[error("failed to restore {kind}: {source}")]
    Restore {
        kind: StreamKind,
        source: std::io::Error,
    },

    #[error("failed to write captured output: {0}")]
    Dump(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VirTermError>;
