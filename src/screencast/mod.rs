//! Segmented screen recording
//!
//! The controller samples the screen on its own thread, buffers frames in
//! scratch storage and closes a segment every `fps * segment_duration`
//! frames. Segments are encoded through GStreamer, trying each codec
//! candidate in turn, and are exported as raw frames when nothing works.

mod state;
pub mod encoder;
mod fallback;
mod pipeline;
mod recorder;
mod store;

pub use encoder::{Codec, CodecCandidate, DEFAULT_CANDIDATES, EncodeOutcome, prioritize};
pub use fallback::FallbackExport;
pub use pipeline::GstBackend;
pub use recorder::{RecordingController, SourceFactory};
pub use state::{Progress, RecorderEvent, RecordingState, SharedProgress};

/// Codec candidates the local GStreamer installation can actually open
///
/// Ordered as they would be tried for `preferred`.
pub fn available_candidates(
    preferred: crate::config::Container,
) -> anyhow::Result<Vec<CodecCandidate>> {
    GstBackend::available(&prioritize(DEFAULT_CANDIDATES.to_vec(), preferred))
}
