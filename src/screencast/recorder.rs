//! Main recording loop
//!
//! A [`RecordingSession`] owns everything one recording needs and does the
//! work of a single tick. The [`RecordingController`] runs a session on a
//! dedicated sampling thread at the configured cadence and handles Start/Stop.

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::encoder::{DEFAULT_CANDIDATES, SegmentEncoder, VideoBackend, prioritize};
use super::pipeline::GstBackend;
use super::state::{Progress, RecorderEvent, RecordingState, SharedProgress, Subscribers};
use super::store::TempStore;
use crate::capture::{self, FrameSource, ScreenSource};
use crate::config::RecordingConfig;
use crate::error::{RecorderError, Result};

/// Log every Nth consecutive capture failure after the first
const CAPTURE_FAILURE_LOG_INTERVAL: u64 = 30;

/// State of one recording, from Start to Stop
pub struct RecordingSession {
    config: RecordingConfig,
    source: Box<dyn FrameSource>,
    store: TempStore,
    encoder: SegmentEncoder,
    progress: SharedProgress,
    subscribers: Subscribers,
    frames_per_segment: usize,
    segment_started_at: DateTime<Local>,
    frame_index: u64,
    segment_index: u64,
    consecutive_failures: u64,
}

impl RecordingSession {
    pub(crate) fn new(
        config: RecordingConfig,
        source: Box<dyn FrameSource>,
        backend: Arc<dyn VideoBackend>,
        progress: SharedProgress,
        subscribers: Subscribers,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.output_directory).map_err(|e| {
            RecorderError::storage(
                format!("create output dir {}", config.output_directory.display()),
                e,
            )
        })?;
        let store = TempStore::create(&config.scratch_directory, config.image_format)?;
        let candidates = prioritize(DEFAULT_CANDIDATES.to_vec(), config.preferred_container);
        let encoder = SegmentEncoder::new(
            backend,
            candidates,
            config.output_directory.clone(),
            config.frames_per_second,
        );

        Ok(Self {
            frames_per_segment: config.frames_per_segment().max(1),
            config,
            source,
            store,
            encoder,
            progress,
            subscribers,
            segment_started_at: Local::now(),
            frame_index: 0,
            segment_index: 0,
            consecutive_failures: 0,
        })
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    #[cfg(test)]
    pub fn segment_index(&self) -> u64 {
        self.segment_index
    }

    /// Frames waiting in the current segment
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.store.len()
    }

    /// Capture one frame, buffer it, and close the segment if it is full
    ///
    /// Capture failures skip the tick. Only storage failures are returned.
    pub fn tick(&mut self) -> Result<()> {
        let captured = match capture::capture(
            self.source.as_mut(),
            self.config.region,
            self.config.resolution,
        ) {
            Ok(captured) => captured,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.record_capture_failure(e);
                return Ok(());
            }
        };

        if self.consecutive_failures > 0 {
            log::info!(
                "Capture recovered after {} failed ticks",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
        }
        if self.store.is_empty() {
            self.segment_started_at = captured.captured_at;
        }
        self.store.append(captured)?;
        self.frame_index += 1;

        let frame_index = self.frame_index;
        self.progress.update(|p| p.frame_index = frame_index);

        let log_every = u64::from(self.config.frames_per_second.max(1)) * 5;
        if frame_index % log_every == 0 {
            log::info!(
                "Recording: {} frames captured, {} segments finalized",
                frame_index,
                self.segment_index
            );
        }

        if self.store.len() >= self.frames_per_segment {
            self.finalize_segment()?;
        }
        Ok(())
    }

    fn record_capture_failure(&mut self, error: RecorderError) {
        self.consecutive_failures += 1;
        let message = error.to_string();
        let report = self.consecutive_failures == 1
            || self.consecutive_failures % CAPTURE_FAILURE_LOG_INTERVAL == 0;
        if report {
            log::warn!(
                "Skipping tick, {} ({} consecutive)",
                message,
                self.consecutive_failures
            );
            self.subscribers.publish(RecorderEvent::CaptureFailed {
                error: message.clone(),
            });
        }
        self.progress.update(|p| {
            p.capture_failures += 1;
            p.last_capture_error = Some(message);
        });
    }

    /// Encode the buffered frames, then delete them from scratch storage
    fn finalize_segment(&mut self) -> Result<()> {
        let segment = self.store.segment(self.segment_started_at);
        let outcome = self.encoder.encode(&segment)?;
        self.store.clear()?;

        self.segment_index += 1;
        self.segment_started_at = Local::now();

        let index = self.segment_index;
        let output = outcome.output().to_path_buf();
        let fallback = outcome.is_fallback();
        self.progress.update(|p| {
            p.segment_index = index;
            if fallback {
                p.fallback_segments += 1;
            }
            p.last_output = Some(output.clone());
        });
        self.subscribers.publish(RecorderEvent::SegmentFinished {
            index,
            output,
            fallback,
        });
        Ok(())
    }

    /// Encode whatever is left in the buffer and release scratch storage
    ///
    /// If the remaining frames cannot be finalized the scratch directory is
    /// left on disk so they can be recovered by hand.
    pub fn finish(mut self) -> Result<()> {
        if self.store.is_empty() {
            return Ok(());
        }
        log::info!("Finalizing partial segment of {} frames", self.store.len());
        match self.finalize_segment() {
            Ok(()) => Ok(()),
            Err(e) => {
                let kept = self.store.keep();
                log::error!(
                    "Could not finalize last segment ({}); frames kept in {}",
                    e,
                    kept.display()
                );
                Err(e)
            }
        }
    }
}

/// Creates a fresh frame source for each session
pub type SourceFactory = Box<dyn FnMut() -> Box<dyn FrameSource> + Send>;

/// Owns the recording state machine (Idle / Recording)
pub struct RecordingController {
    make_source: SourceFactory,
    backend: Arc<dyn VideoBackend>,
    progress: SharedProgress,
    subscribers: Subscribers,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl RecordingController {
    pub fn new(make_source: SourceFactory, backend: Arc<dyn VideoBackend>) -> Self {
        Self {
            make_source,
            backend,
            progress: SharedProgress::default(),
            subscribers: Subscribers::default(),
            stop_tx: None,
            worker: None,
        }
    }

    /// Controller that records the real screen through GStreamer
    pub fn for_screen() -> Self {
        Self::new(
            Box::new(|| Box::new(ScreenSource::new()) as Box<dyn FrameSource>),
            Arc::new(GstBackend::new()),
        )
    }

    pub fn state(&self) -> RecordingState {
        self.progress.state()
    }

    pub fn progress(&self) -> Progress {
        self.progress.snapshot()
    }

    /// Handle for polling progress from another thread
    pub fn progress_handle(&self) -> SharedProgress {
        self.progress.clone()
    }

    /// Receive status events for this and later sessions
    pub fn subscribe(&self) -> Receiver<RecorderEvent> {
        self.subscribers.subscribe()
    }

    /// Begin recording with `config`
    ///
    /// A no-op while already recording. Fails, staying Idle, if scratch or
    /// output storage cannot be prepared.
    pub fn start(&mut self, config: RecordingConfig) -> Result<()> {
        if self.state() == RecordingState::Recording {
            log::debug!("start() ignored, already recording");
            return Ok(());
        }
        // a session that died on its own still has a thread to reap
        self.reap_worker();

        log::info!(
            "Starting recording: {} @ {} fps, {} s segments, region={:?}, output={}",
            config.resolution,
            config.frames_per_second,
            config.segment_duration_seconds,
            config.region,
            config.output_directory.display()
        );

        let session = RecordingSession::new(
            config.clone(),
            (self.make_source)(),
            self.backend.clone(),
            self.progress.clone(),
            self.subscribers.clone(),
        )?;

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        self.progress.begin();
        self.subscribers.publish(RecorderEvent::Started);

        let progress = self.progress.clone();
        let subscribers = self.subscribers.clone();
        let interval = Duration::from_secs_f64(1.0 / f64::from(config.frames_per_second.max(1)));
        let worker = std::thread::Builder::new()
            .name("segcast-sampler".into())
            .spawn(move || run_loop(session, interval, stop_rx, progress, subscribers));

        match worker {
            Ok(handle) => {
                self.stop_tx = Some(stop_tx);
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                let error = RecorderError::Spawn(e);
                self.progress.finish(Some(error.to_string()));
                Err(error)
            }
        }
    }

    /// Stop recording, encoding any partially filled segment
    ///
    /// Blocks until the sampling thread has finished, including an encode
    /// that is already running. A no-op when idle.
    pub fn stop(&mut self) -> Progress {
        match self.stop_tx.take() {
            Some(stop_tx) if self.state() == RecordingState::Recording => {
                log::info!("Stopping recording...");
                // the loop may have exited on its own already
                let _ = stop_tx.send(());
            }
            _ => log::debug!("stop() ignored, not recording"),
        }
        self.reap_worker();
        self.progress.snapshot()
    }

    fn reap_worker(&mut self) {
        self.stop_tx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Sampling thread panicked");
                self.progress.finish(Some("sampling thread panicked".into()));
            }
        }
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sampling loop: one tick per interval until stopped or a storage failure
fn run_loop(
    mut session: RecordingSession,
    interval: Duration,
    stop_rx: Receiver<()>,
    progress: SharedProgress,
    subscribers: Subscribers,
) {
    let mut fatal = None;

    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let tick_start = Instant::now();
        if let Err(e) = session.tick() {
            log::error!("Recording stopped by storage failure: {}", e);
            fatal = Some(e);
            break;
        }

        // no catch-up: an overlong tick is followed immediately by the next
        let remaining = interval.saturating_sub(tick_start.elapsed());
        match stop_rx.recv_timeout(remaining) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    let frames = session.frame_index();
    let finished = session.finish();
    let error = match (fatal, finished) {
        (Some(e), _) => Some(e.to_string()),
        (None, Err(e)) => Some(e.to_string()),
        (None, Ok(())) => None,
    };

    let snapshot = progress.snapshot();
    progress.finish(error.clone());
    log::info!(
        "Recording finished: {} frames, {} segments",
        frames,
        snapshot.segment_index
    );
    subscribers.publish(RecorderEvent::Stopped { error });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::ScriptedSource;
    use crate::config::{Container, ImageFormat};
    use crate::domain::Resolution;
    use crate::screencast::encoder::testing::{FakeCodecs, SharedFake};
    use std::path::Path;

    fn config(dir: &Path, fps: u32, seconds: u32) -> RecordingConfig {
        RecordingConfig {
            resolution: Resolution::new(16, 8).unwrap(),
            frames_per_second: fps,
            segment_duration_seconds: seconds,
            output_directory: dir.join("out"),
            scratch_directory: dir.join("scratch"),
            image_format: ImageFormat::Png,
            preferred_container: Container::Mp4,
            region: None,
        }
    }

    fn session(
        config: RecordingConfig,
        source: ScriptedSource,
        backend: Arc<SharedFake>,
    ) -> RecordingSession {
        RecordingSession::new(
            config,
            Box::new(source),
            backend,
            SharedProgress::default(),
            Subscribers::default(),
        )
        .unwrap()
    }

    fn fake_backend() -> Arc<SharedFake> {
        Arc::new(SharedFake::new(FakeCodecs::default()))
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn scratch_dirs(dir: &Path) -> usize {
        std::fs::read_dir(dir.join("scratch"))
            .map(|entries| {
                entries
                    .filter(|e| {
                        e.as_ref()
                            .unwrap()
                            .file_name()
                            .to_string_lossy()
                            .starts_with("segcast-scratch-")
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn test_full_segment_is_encoded_on_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend();
        let mut session = session(
            config(dir.path(), 24, 10),
            ScriptedSource::always_ok(240),
            backend.clone(),
        );

        for _ in 0..239 {
            session.tick().unwrap();
        }
        assert_eq!(session.segment_index(), 0);
        assert_eq!(session.buffered(), 239);

        session.tick().unwrap();
        assert_eq!(session.frame_index(), 240);
        assert_eq!(session.segment_index(), 1);
        assert_eq!(session.buffered(), 0);
        assert_eq!(backend.finished(), vec![240]);

        // nothing left over, so stopping adds no segment
        session.finish().unwrap();
        assert_eq!(backend.finished(), vec![240]);
        assert_eq!(scratch_dirs(dir.path()), 0);
    }

    #[test]
    fn test_partial_segment_is_encoded_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend();
        let mut session = session(
            config(dir.path(), 10, 1),
            ScriptedSource::always_ok(25),
            backend.clone(),
        );

        for _ in 0..25 {
            session.tick().unwrap();
        }
        assert_eq!(session.segment_index(), 2);
        assert_eq!(session.buffered(), 5);

        session.finish().unwrap();
        assert_eq!(backend.finished(), vec![10, 10, 5]);
        let outputs = std::fs::read_dir(dir.path().join("out")).unwrap().count();
        assert_eq!(outputs, 3);
    }

    #[test]
    fn test_capture_failures_skip_ticks_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let subscribers = Subscribers::default();
        let events = subscribers.subscribe();
        let progress = SharedProgress::default();
        let mut session = RecordingSession::new(
            config(dir.path(), 10, 1),
            Box::new(ScriptedSource::new([true, false, true, false, false, true])),
            fake_backend(),
            progress.clone(),
            subscribers,
        )
        .unwrap();

        for _ in 0..6 {
            session.tick().unwrap();
        }

        assert_eq!(session.frame_index(), 3);
        let sequences: Vec<usize> = session.store.frames().iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.frame_index, 3);
        assert_eq!(snapshot.capture_failures, 3);
        assert!(snapshot.last_capture_error.is_some());

        // one report per run of consecutive failures
        let failures = events
            .try_iter()
            .filter(|e| matches!(e, RecorderEvent::CaptureFailed { .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_storage_failure_is_fatal_and_keeps_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(
            config(dir.path(), 2, 1),
            ScriptedSource::always_ok(10),
            fake_backend(),
        );
        session.tick().unwrap();

        let out = dir.path().join("out");
        std::fs::remove_dir(&out).unwrap();
        std::fs::write(&out, b"not a directory").unwrap();

        let err = session.tick().unwrap_err();
        assert!(err.is_fatal());
        assert!(session.finish().unwrap_err().is_fatal());
        assert_eq!(scratch_dirs(dir.path()), 1);
    }

    #[test]
    fn test_controller_records_segments_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_backend();
        let mut controller = RecordingController::new(
            Box::new(|| Box::new(ScriptedSource::always_ok(250)) as Box<dyn FrameSource>),
            backend.clone(),
        );
        let events = controller.subscribe();

        controller.start(config(dir.path(), 100, 1)).unwrap();
        assert_eq!(controller.state(), RecordingState::Recording);
        let progress = controller.progress_handle();
        wait_until(|| progress.snapshot().frame_index >= 250);

        let last = controller.stop();
        assert_eq!(last.state, RecordingState::Idle);
        assert_eq!(last.frame_index, 250);
        assert_eq!(last.segment_index, 3);
        assert_eq!(last.fatal_error, None);
        assert_eq!(backend.finished(), vec![100, 100, 50]);

        let events: Vec<RecorderEvent> = events.try_iter().collect();
        assert_eq!(events.first(), Some(&RecorderEvent::Started));
        assert_eq!(events.last(), Some(&RecorderEvent::Stopped { error: None }));
        let finished = events
            .iter()
            .filter(|e| matches!(e, RecorderEvent::SegmentFinished { fallback: false, .. }))
            .count();
        assert_eq!(finished, 3);
    }

    #[test]
    fn test_stop_during_encode_finishes_segment() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(SharedFake::new(FakeCodecs {
            frame_delay: Duration::from_millis(20),
            ..Default::default()
        }));
        let mut controller = RecordingController::new(
            Box::new(|| Box::new(ScriptedSource::always_ok(100)) as Box<dyn FrameSource>),
            backend.clone(),
        );

        controller.start(config(dir.path(), 100, 1)).unwrap();
        // a writer is opened only once the segment boundary is reached
        wait_until(|| !backend.inner.opened.lock().unwrap().is_empty());
        assert!(backend.finished().is_empty());

        let last = controller.stop();
        assert_eq!(backend.finished(), vec![100]);
        assert_eq!(last.state, RecordingState::Idle);
        assert_eq!(last.frame_index, 100);
        assert_eq!(last.segment_index, 1);
        assert_eq!(last.fatal_error, None);
        assert_eq!(scratch_dirs(dir.path()), 0);
    }

    #[test]
    fn test_start_while_recording_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = RecordingController::new(
            Box::new(|| Box::new(ScriptedSource::always_ok(1000)) as Box<dyn FrameSource>),
            fake_backend(),
        );
        let events = controller.subscribe();

        controller.start(config(dir.path(), 20, 60)).unwrap();
        controller.start(config(dir.path(), 20, 60)).unwrap();
        assert_eq!(controller.state(), RecordingState::Recording);
        controller.stop();

        let started = events
            .try_iter()
            .filter(|e| *e == RecorderEvent::Started)
            .count();
        assert_eq!(started, 1);
        assert_eq!(scratch_dirs(dir.path()), 0);
    }

    #[test]
    fn test_stop_while_idle_is_a_no_op() {
        let mut controller = RecordingController::new(
            Box::new(|| Box::new(ScriptedSource::always_ok(0)) as Box<dyn FrameSource>),
            fake_backend(),
        );
        let events = controller.subscribe();

        let progress = controller.stop();
        assert_eq!(progress, Progress::default());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_start_fails_when_output_is_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out"), b"a file").unwrap();
        let mut controller = RecordingController::new(
            Box::new(|| Box::new(ScriptedSource::always_ok(10)) as Box<dyn FrameSource>),
            fake_backend(),
        );
        let events = controller.subscribe();

        let err = controller.start(config(dir.path(), 10, 1)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(controller.state(), RecordingState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_storage_failure_mid_session_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = RecordingController::new(
            Box::new(|| Box::new(ScriptedSource::always_ok(1000)) as Box<dyn FrameSource>),
            fake_backend(),
        );
        let events = controller.subscribe();

        controller.start(config(dir.path(), 50, 1)).unwrap();
        let progress = controller.progress_handle();
        wait_until(|| progress.snapshot().frame_index >= 1);

        let out = dir.path().join("out");
        std::fs::remove_dir(&out).unwrap();
        std::fs::write(&out, b"not a directory").unwrap();

        let stopped = loop {
            match events.recv_timeout(Duration::from_secs(20)).unwrap() {
                RecorderEvent::Stopped { error } => break error,
                _ => continue,
            }
        };
        assert!(stopped.is_some());
        wait_until(|| controller.state() == RecordingState::Idle);
        assert!(controller.progress().fatal_error.is_some());

        // stop after the loop died on its own only reaps the thread
        assert_eq!(controller.stop().state, RecordingState::Idle);
        assert_eq!(scratch_dirs(dir.path()), 1);
    }
}
