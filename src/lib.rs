//! segcast: periodic screen capture, written out as fixed-length video segments

pub mod capture;
pub mod config;
pub mod domain;
pub mod error;
pub mod screencast;

pub use config::{RecordingConfig, Settings};
pub use error::RecorderError;
pub use screencast::{Progress, RecorderEvent, RecordingController, RecordingState};
