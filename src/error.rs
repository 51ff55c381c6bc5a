//! Error taxonomy for the recording core
//!
//! Capture and encode failures are recoverable and absorbed by the recorder.
//! Storage failures end the session.

use std::path::PathBuf;

/// Errors surfaced by the capture, storage and encoding components
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// The platform capture primitive failed for this tick
    #[error("screen capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// Every codec candidate failed to open a writer
    #[error("no video encoder available (tried: {})", .attempts.join(", "))]
    NoEncoderAvailable { attempts: Vec<String> },

    /// The writer reported success but produced no usable file
    #[error("encoded output failed verification: {} ({reason})", .path.display())]
    EncodeVerificationFailed { path: PathBuf, reason: String },

    /// Scratch or output storage is not writable
    #[error("storage failure: {context}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A frame could not be encoded to or decoded from scratch storage
    #[error("frame image error: {0}")]
    Image(#[from] image::ImageError),

    /// The sampling thread could not be started
    #[error("failed to spawn sampling thread")]
    Spawn(#[source] std::io::Error),
}

impl RecorderError {
    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }

    /// Whether this error should end the recording session
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

pub type Result<T, E = RecorderError> = std::result::Result<T, E>;
