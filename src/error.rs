// src/error.rs

//! Error types for the replication pipeline.
//!
//! | Variant | Raised by | Handling |
//! |---------|-----------|----------|
//! | `EmptyPath` | event construction, path resolution | event rejected |
//! | `InvalidEvent` | event construction, wire decode | event rejected |
//! | `PathEscape` | apply engine, CRUD layer | event rejected, never touches disk |
//! | `BusClosed` | `EventBus::subscribe` after shutdown | caller stops |
//! | `FrameTooLarge` | wire codec | event skipped on write, connection closed on read |
//! | `UnexpectedFrame` | wire codec | frame skipped |
//! | `Codec` | wire codec | frame skipped |
//! | `Io` | apply engine, producers | logged, event dropped |
//! | `Transport` | wire codec | connection closed |

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for the replication domain layer.
pub type Result<T> = std::result::Result<T, MirrorError>;

#[derive(Error, Debug)]
pub enum MirrorError {
    /// A change event path was empty, or resolved to the replicated root itself.
    #[error("Path is empty or refers to the replicated root")]
    EmptyPath,

    /// A change event broke one of the model invariants.
    #[error("Invalid change event: {0}")]
    InvalidEvent(String),

    /// A relative path resolved outside the configured root.
    #[error("Path escapes the replicated root: {path}")]
    PathEscape { path: String },

    /// The event bus has been shut down.
    #[error("Event bus is shut down")]
    BusClosed,

    /// A wire frame exceeded the maximum frame size.
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// A wire frame was well-formed JSON but not a valid frame.
    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// JSON encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A filesystem operation failed on a specific path.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A socket read or write failed.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl MirrorError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MirrorError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for errors that only affect a single frame, leaving the
    /// stream positioned at the next frame boundary.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            MirrorError::Codec(_)
                | MirrorError::UnexpectedFrame(_)
                | MirrorError::InvalidEvent(_)
                | MirrorError::EmptyPath
        )
    }
}
