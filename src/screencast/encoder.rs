//! Segment encoding with an ordered codec fallback chain
//!
//! Candidates are tried in order until one opens a writer. If none does, or
//! the written file fails verification, the segment is exported as raw
//! frames plus a manifest instead.

use anyhow::Result as AnyResult;
use chrono::{DateTime, Local};
use image::RgbaImage;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::fallback::{self, FallbackExport};
use super::store::{Segment, load_frame};
use crate::config::Container;
use crate::error::{RecorderError, Result};

/// Codec type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Mpeg4,
    Mjpeg,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "H.264",
            Codec::Mpeg4 => "MPEG-4 Part 2",
            Codec::Mjpeg => "Motion JPEG",
        }
    }
}

/// One (codec, container) combination to try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecCandidate {
    pub codec: Codec,
    /// GStreamer element name (e.g., "x264enc")
    pub gst_element: &'static str,
    pub container: Container,
}

impl CodecCandidate {
    pub const fn new(codec: Codec, gst_element: &'static str, container: Container) -> Self {
        Self {
            codec,
            gst_element,
            container,
        }
    }
}

impl fmt::Display for CodecCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.gst_element, self.container.extension())
    }
}

/// Default try-order
pub const DEFAULT_CANDIDATES: [CodecCandidate; 4] = [
    CodecCandidate::new(Codec::H264, "x264enc", Container::Mp4),
    CodecCandidate::new(Codec::Mpeg4, "avenc_mpeg4", Container::Avi),
    CodecCandidate::new(Codec::Mjpeg, "jpegenc", Container::Avi),
    CodecCandidate::new(Codec::Mpeg4, "avenc_mpeg4", Container::Mp4),
];

/// Move candidates using `preferred` to the front, keeping relative order
pub fn prioritize(
    mut candidates: Vec<CodecCandidate>,
    preferred: Container,
) -> Vec<CodecCandidate> {
    candidates.sort_by_key(|c| c.container != preferred);
    candidates
}

/// An open video file accepting frames
pub trait VideoWriter {
    /// Append the next frame in playback order
    fn write_frame(&mut self, image: &RgbaImage) -> AnyResult<()>;

    /// Flush and close the file
    fn finish(self: Box<Self>) -> AnyResult<()>;
}

/// Opens writers for codec candidates
pub trait VideoBackend: Send + Sync {
    /// Open a writer at `path`; an error means this candidate is unusable
    fn open(
        &self,
        candidate: &CodecCandidate,
        path: &Path,
        width: u32,
        height: u32,
        framerate: u32,
    ) -> AnyResult<Box<dyn VideoWriter>>;
}

/// What became of a segment
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOutcome {
    Video {
        path: PathBuf,
        candidate: CodecCandidate,
    },
    Fallback(FallbackExport),
}

impl EncodeOutcome {
    /// File or directory a human should look at
    pub fn output(&self) -> &Path {
        match self {
            EncodeOutcome::Video { path, .. } => path,
            EncodeOutcome::Fallback(export) => &export.directory,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, EncodeOutcome::Fallback(_))
    }
}

/// Turns buffered segments into video files
pub struct SegmentEncoder {
    backend: Arc<dyn VideoBackend>,
    candidates: Vec<CodecCandidate>,
    output_directory: PathBuf,
    framerate: u32,
}

impl SegmentEncoder {
    pub fn new(
        backend: Arc<dyn VideoBackend>,
        candidates: Vec<CodecCandidate>,
        output_directory: PathBuf,
        framerate: u32,
    ) -> Self {
        Self {
            backend,
            candidates,
            output_directory,
            framerate: framerate.max(1),
        }
    }

    /// Output path without extension for a segment starting at `started_at`
    pub fn target_stem(&self, started_at: DateTime<Local>) -> PathBuf {
        let name = started_at
            .format("Recording_%Y-%m-%d_%H-%M-%S-%3f")
            .to_string();
        self.output_directory.join(name)
    }

    /// Encode a segment, falling back to a raw-frame export on codec failure
    ///
    /// Only storage failures are returned as errors.
    pub fn encode(&self, segment: &Segment<'_>) -> Result<EncodeOutcome> {
        std::fs::create_dir_all(&self.output_directory).map_err(|e| {
            RecorderError::storage(
                format!("create output dir {}", self.output_directory.display()),
                e,
            )
        })?;
        let stem = self.target_stem(segment.started_at);

        match self.encode_video(segment, &stem) {
            Ok((path, candidate)) => {
                log::info!(
                    "Segment encoded: {} ({} frames, {} via {})",
                    path.display(),
                    segment.frames.len(),
                    candidate.codec.name(),
                    candidate
                );
                Ok(EncodeOutcome::Video { path, candidate })
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                log::warn!("Encoding failed ({}), exporting raw frames", e);
                let export = fallback::export(segment, &stem, self.framerate, &e.to_string())?;
                Ok(EncodeOutcome::Fallback(export))
            }
        }
    }

    fn encode_video(
        &self,
        segment: &Segment<'_>,
        stem: &Path,
    ) -> Result<(PathBuf, CodecCandidate)> {
        let Some(first) = segment.frames.first() else {
            return Err(RecorderError::EncodeVerificationFailed {
                path: stem.to_path_buf(),
                reason: "segment has no frames".to_string(),
            });
        };
        let first_image = load_frame(first)?;
        let (width, height) = first_image.dimensions();

        let (writer, path, candidate) = self.open_writer(stem, width, height)?;

        let written =
            write_frames(writer, first_image, segment, &path).and_then(|_| verify_output(&path));
        if let Err(e) = written {
            // leave no half-written file next to the fallback export
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        Ok((path, candidate))
    }

    fn open_writer(
        &self,
        stem: &Path,
        width: u32,
        height: u32,
    ) -> Result<(Box<dyn VideoWriter>, PathBuf, CodecCandidate)> {
        let mut attempts = Vec::with_capacity(self.candidates.len());
        for candidate in &self.candidates {
            let path = stem.with_extension(candidate.container.extension());
            match self
                .backend
                .open(candidate, &path, width, height, self.framerate)
            {
                Ok(writer) => return Ok((writer, path, *candidate)),
                Err(e) => {
                    log::warn!("Encoder candidate {} unavailable: {:#}", candidate, e);
                    let _ = std::fs::remove_file(&path);
                    attempts.push(candidate.to_string());
                }
            }
        }
        Err(RecorderError::NoEncoderAvailable { attempts })
    }
}

/// Feed every frame to `writer` in sequence order and close it
fn write_frames(
    mut writer: Box<dyn VideoWriter>,
    first_image: RgbaImage,
    segment: &Segment<'_>,
    path: &Path,
) -> Result<()> {
    let failed = |reason: String| RecorderError::EncodeVerificationFailed {
        path: path.to_path_buf(),
        reason,
    };

    writer
        .write_frame(&first_image)
        .map_err(|e| failed(format!("frame 0: {:#}", e)))?;
    drop(first_image);
    for frame in &segment.frames[1..] {
        let image = load_frame(frame)?;
        writer
            .write_frame(&image)
            .map_err(|e| failed(format!("frame {}: {:#}", frame.sequence, e)))?;
    }
    writer
        .finish()
        .map_err(|e| failed(format!("finalize: {:#}", e)))
}

/// Verify that the output file exists and has data
fn verify_output(path: &Path) -> Result<()> {
    let failed = |reason: &str| RecorderError::EncodeVerificationFailed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let metadata = std::fs::metadata(path).map_err(|_| failed("output file was not created"))?;
    if metadata.len() == 0 {
        return Err(failed("output file is empty"));
    }

    log::debug!(
        "Output file verified: {} ({} bytes)",
        path.display(),
        metadata.len()
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::{Context, bail};
    use std::fs::File;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Backend whose every candidate fails to open
    pub struct NoCodecs;

    impl VideoBackend for NoCodecs {
        fn open(
            &self,
            candidate: &CodecCandidate,
            _path: &Path,
            _width: u32,
            _height: u32,
            _framerate: u32,
        ) -> AnyResult<Box<dyn VideoWriter>> {
            bail!("no element {}", candidate.gst_element)
        }
    }

    /// Backend that writes a byte per frame, recording what it was asked
    #[derive(Default)]
    pub struct FakeCodecs {
        /// Number of candidates to reject before accepting one
        pub reject_first: usize,
        /// Produce zero-byte files
        pub empty_output: bool,
        /// Time spent on every written frame
        pub frame_delay: Duration,
        pub opened: Mutex<Vec<String>>,
    }

    struct FakeWriter {
        file: File,
        frames: usize,
        empty_output: bool,
        frame_delay: Duration,
        sink: Arc<Mutex<Vec<usize>>>,
    }

    impl VideoWriter for FakeWriter {
        fn write_frame(&mut self, image: &RgbaImage) -> AnyResult<()> {
            std::thread::sleep(self.frame_delay);
            if !self.empty_output {
                self.file.write_all(&image.as_raw()[..1])?;
            }
            self.frames += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> AnyResult<()> {
            self.sink.lock().unwrap().push(self.frames);
            Ok(())
        }
    }

    /// Shared handle so tests can inspect a backend handed to a recorder
    pub struct SharedFake {
        pub inner: Arc<FakeCodecs>,
        sink: Arc<Mutex<Vec<usize>>>,
    }

    impl SharedFake {
        pub fn new(inner: FakeCodecs) -> Self {
            Self {
                inner: Arc::new(inner),
                sink: Arc::default(),
            }
        }

        /// Frame counts of every finished file, in order
        pub fn finished(&self) -> Vec<usize> {
            self.sink.lock().unwrap().clone()
        }
    }

    impl VideoBackend for SharedFake {
        fn open(
            &self,
            candidate: &CodecCandidate,
            path: &Path,
            _width: u32,
            _height: u32,
            _framerate: u32,
        ) -> AnyResult<Box<dyn VideoWriter>> {
            let mut opened = self.inner.opened.lock().unwrap();
            opened.push(candidate.to_string());
            if opened.len() <= self.inner.reject_first {
                bail!("rejected {}", candidate);
            }
            let file = File::create(path).context("create fake output")?;
            Ok(Box::new(FakeWriter {
                file,
                frames: 0,
                empty_output: self.inner.empty_output,
                frame_delay: self.inner.frame_delay,
                sink: self.sink.clone(),
            }))
        }
    }
}
