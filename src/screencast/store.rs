//! Scratch storage for frames that have not been encoded yet
//!
//! Every frame is written to disk as soon as it is buffered, named by its
//! capture time, so a crashed session leaves inspectable frames behind. Each
//! segment gets its own subdirectory; the whole scratch area is removed when
//! the store is dropped.

use chrono::{DateTime, Local};
use image::{DynamicImage, ImageFormat as ImageCodec, RgbaImage};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::capture::CapturedImage;
use crate::config::ImageFormat;
use crate::error::{RecorderError, Result};

/// One buffered frame; never mutated after creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Position within the current segment, contiguous from 0
    pub sequence: usize,
    pub captured_at: DateTime<Local>,
    /// Pixel data on scratch storage
    pub path: PathBuf,
}

/// An ordered run of frames destined for one output file
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// Playback order
    pub frames: &'a [Frame],
    /// Start of the segment, used to name the output
    pub started_at: DateTime<Local>,
}

/// Buffer of frames for the current segment, backed by a scratch directory
pub struct TempStore {
    scratch: TempDir,
    format: ImageFormat,
    segment_serial: u64,
    segment_dir: PathBuf,
    frames: Vec<Frame>,
}

impl TempStore {
    /// Create a fresh scratch directory under `parent`
    pub fn create(parent: &Path, format: ImageFormat) -> Result<Self> {
        std::fs::create_dir_all(parent).map_err(|e| {
            RecorderError::storage(format!("create scratch parent {}", parent.display()), e)
        })?;
        let scratch = tempfile::Builder::new()
            .prefix("segcast-scratch-")
            .tempdir_in(parent)
            .map_err(|e| {
                RecorderError::storage(format!("create scratch dir in {}", parent.display()), e)
            })?;

        let mut store = Self {
            segment_dir: scratch.path().to_path_buf(),
            scratch,
            format,
            segment_serial: 0,
            frames: Vec::new(),
        };
        store.open_segment_dir()?;
        log::debug!("Scratch storage at {}", store.scratch.path().display());
        Ok(store)
    }

    fn open_segment_dir(&mut self) -> Result<()> {
        self.segment_dir = self
            .scratch
            .path()
            .join(format!("segment-{:06}", self.segment_serial));
        std::fs::create_dir_all(&self.segment_dir).map_err(|e| {
            RecorderError::storage(format!("create {}", self.segment_dir.display()), e)
        })
    }

    /// Root of the scratch area
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    /// Directory holding the current segment's frames
    #[cfg(test)]
    pub fn segment_dir(&self) -> &Path {
        &self.segment_dir
    }

    /// Persist a captured image as the next frame of the current segment
    pub fn append(&mut self, captured: CapturedImage) -> Result<&Frame> {
        let sequence = self.frames.len();
        let name = format!(
            "{:013}-{:06}.{}",
            captured.captured_at.timestamp_millis(),
            sequence,
            self.format.extension()
        );
        let path = self.segment_dir.join(name);
        write_frame(&path, captured.image, self.format)?;

        self.frames.push(Frame {
            sequence,
            captured_at: captured.captured_at,
            path,
        });
        Ok(&self.frames[sequence])
    }

    /// Buffered frames in sequence order
    #[cfg(test)]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// View the buffered frames as a segment starting at `started_at`
    pub fn segment(&self, started_at: DateTime<Local>) -> Segment<'_> {
        Segment {
            frames: &self.frames,
            started_at,
        }
    }

    /// Frame files currently on disk for this segment, in capture order
    #[cfg(test)]
    pub fn persisted(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.segment_dir).map_err(|e| {
            RecorderError::storage(format!("list {}", self.segment_dir.display()), e)
        })?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                RecorderError::storage(format!("list {}", self.segment_dir.display()), e)
            })?;
            paths.push(entry.path());
        }
        paths.sort();
        Ok(paths)
    }

    /// Delete every frame of the current segment and start a new one
    pub fn clear(&mut self) -> Result<()> {
        std::fs::remove_dir_all(&self.segment_dir).map_err(|e| {
            RecorderError::storage(format!("remove {}", self.segment_dir.display()), e)
        })?;
        self.frames.clear();
        self.segment_serial += 1;
        self.open_segment_dir()
    }

    /// Leave the scratch area on disk for manual recovery
    pub fn keep(self) -> PathBuf {
        self.scratch.keep()
    }
}

/// Read a frame's pixels back from scratch storage
pub fn load_frame(frame: &Frame) -> Result<RgbaImage> {
    Ok(image::open(&frame.path)?.to_rgba8())
}

fn write_frame(path: &Path, image: RgbaImage, format: ImageFormat) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| RecorderError::storage(format!("create {}", path.display()), e))?;
    let mut writer = BufWriter::new(file);

    let written = match format {
        ImageFormat::Png => write_png(&mut writer, &image).map_err(io::Error::other),
        // JPEG has no alpha channel
        ImageFormat::Jpg => DynamicImage::ImageRgba8(image)
            .to_rgb8()
            .write_to(&mut writer, ImageCodec::Jpeg)
            .map_err(io::Error::other),
    };
    written
        .and_then(|_| writer.flush())
        .map_err(|e| RecorderError::storage(format!("write {}", path.display()), e))
}

fn write_png<W: io::Write>(w: W, image: &RgbaImage) -> Result<(), png::EncodingError> {
    let mut encoder = png::Encoder::new(w, image.width(), image.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(image.as_raw())
}
