//! Recording state shared between the sampling thread and observers

use crossbeam_channel::{Receiver, Sender};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Whether a recording session is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
}

/// Read-only view of the current session, safe to poll from any thread
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Progress {
    pub state: RecordingState,
    /// Seconds since `start()`, or the length of the last session once idle
    pub elapsed_seconds: f64,
    /// Frames captured since `start()`
    pub frame_index: u64,
    /// Segments finalized since `start()` (video or fallback export)
    pub segment_index: u64,
    /// Segments that ended up as raw-frame exports
    pub fallback_segments: u64,
    /// Ticks skipped because capture failed
    pub capture_failures: u64,
    pub last_capture_error: Option<String>,
    pub last_output: Option<PathBuf>,
    /// Set when the session ended on a storage failure
    pub fatal_error: Option<String>,
}

/// Status updates published by the recorder
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Started,
    CaptureFailed { error: String },
    SegmentFinished {
        index: u64,
        output: PathBuf,
        fallback: bool,
    },
    /// The session settled into Idle; `error` is set on the fatal path
    Stopped { error: Option<String> },
}

/// Fan-out of recorder events to every live subscriber
#[derive(Debug, Clone, Default)]
pub(crate) struct Subscribers(Arc<Mutex<Vec<Sender<RecorderEvent>>>>);

impl Subscribers {
    fn lock(&self) -> MutexGuard<'_, Vec<Sender<RecorderEvent>>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Receiver<RecorderEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.lock().push(tx);
        rx
    }

    /// Send to everyone, forgetting receivers that have been dropped
    pub fn publish(&self, event: RecorderEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Progress snapshot plus the instant the session began
#[derive(Debug, Default)]
pub(crate) struct Shared {
    progress: Progress,
    started: Option<Instant>,
}

/// Handle to the shared snapshot; every read and write goes through one mutex
#[derive(Debug, Clone, Default)]
pub struct SharedProgress(Arc<Mutex<Shared>>);

impl SharedProgress {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        // a panicked sampler must not wedge observers
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy out a consistent snapshot
    pub fn snapshot(&self) -> Progress {
        let shared = self.lock();
        let mut progress = shared.progress.clone();
        if let (RecordingState::Recording, Some(started)) = (progress.state, shared.started) {
            progress.elapsed_seconds = started.elapsed().as_secs_f64();
        }
        progress
    }

    pub fn state(&self) -> RecordingState {
        self.lock().progress.state
    }

    /// Reset counters and enter Recording
    pub(crate) fn begin(&self) {
        let mut shared = self.lock();
        shared.progress = Progress {
            state: RecordingState::Recording,
            ..Progress::default()
        };
        shared.started = Some(Instant::now());
    }

    /// Apply `f` to the progress under the lock
    pub(crate) fn update(&self, f: impl FnOnce(&mut Progress)) {
        f(&mut self.lock().progress);
    }

    /// Enter Idle, freezing the elapsed time
    pub(crate) fn finish(&self, fatal_error: Option<String>) {
        let mut shared = self.lock();
        if let Some(started) = shared.started.take() {
            shared.progress.elapsed_seconds = started.elapsed().as_secs_f64();
        }
        shared.progress.state = RecordingState::Idle;
        shared.progress.fatal_error = fatal_error;
    }
}
