//! Raw-frame export used when no encoder can produce a video
//!
//! Frames are copied into a directory named after the segment and numbered
//! `frame_000000`, `frame_000001`, ... A plain-text manifest records the
//! segment timing and the ffmpeg command that assembles the frames offline.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::store::Segment;
use crate::error::{RecorderError, Result};

/// Width of the zero-padded frame index
const INDEX_WIDTH: usize = 6;

pub const MANIFEST_NAME: &str = "manifest.txt";

/// Result of a raw-frame export
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackExport {
    pub directory: PathBuf,
    pub manifest: PathBuf,
    pub frame_count: usize,
    pub duration_seconds: f64,
}

/// Directory that receives the frames for a segment whose output stem is `stem`
pub fn export_directory(stem: &Path) -> PathBuf {
    let mut name = stem.file_name().unwrap_or_default().to_os_string();
    name.push("_frames");
    stem.with_file_name(name)
}

/// Copy the segment's frames out of scratch storage and write the manifest
///
/// Only storage failures are reported; there is no further fallback.
pub fn export(
    segment: &Segment<'_>,
    stem: &Path,
    framerate: u32,
    reason: &str,
) -> Result<FallbackExport> {
    let directory = export_directory(stem);
    std::fs::create_dir_all(&directory)
        .map_err(|e| RecorderError::storage(format!("create {}", directory.display()), e))?;

    let extension = segment
        .frames
        .first()
        .and_then(|f| f.path.extension())
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_string();

    for (index, frame) in segment.frames.iter().enumerate() {
        let target = directory.join(frame_file_name(index, &extension));
        std::fs::copy(&frame.path, &target).map_err(|e| {
            RecorderError::storage(
                format!("copy {} to {}", frame.path.display(), target.display()),
                e,
            )
        })?;
    }

    let framerate = framerate.max(1);
    let frame_count = segment.frames.len();
    let duration_seconds = frame_count as f64 / framerate as f64;
    let video_path = stem.with_extension("mp4");
    let manifest = directory.join(MANIFEST_NAME);

    let mut contents = String::new();
    let _ = writeln!(contents, "segcast raw frame export");
    let _ = writeln!(contents, "segment_start: {}", segment.started_at.to_rfc3339());
    let _ = writeln!(contents, "frame_count: {}", frame_count);
    let _ = writeln!(contents, "frame_rate: {}", framerate);
    let _ = writeln!(contents, "duration_seconds: {:.3}", duration_seconds);
    let _ = writeln!(contents, "reason: {}", reason);
    let _ = writeln!(contents);
    let _ = writeln!(contents, "No video encoder was usable. Assemble the frames with:");
    let _ = writeln!(
        contents,
        "{}",
        assemble_command(&directory, &extension, framerate, &video_path)
    );
    std::fs::write(&manifest, contents)
        .map_err(|e| RecorderError::storage(format!("write {}", manifest.display()), e))?;

    log::warn!(
        "Exported {} raw frames to {} (see {})",
        frame_count,
        directory.display(),
        MANIFEST_NAME
    );

    Ok(FallbackExport {
        directory,
        manifest,
        frame_count,
        duration_seconds,
    })
}

fn frame_file_name(index: usize, extension: &str) -> String {
    format!("frame_{:0width$}.{}", index, extension, width = INDEX_WIDTH)
}

/// ffmpeg invocation that turns the exported frames into an H.264 MP4
pub fn assemble_command(
    directory: &Path,
    extension: &str,
    framerate: u32,
    output: &Path,
) -> String {
    let pattern = directory.join(format!("frame_%0{}d.{}", INDEX_WIDTH, extension));
    format!(
        "ffmpeg -framerate {} -start_number 0 -i \"{}\" -c:v libx264 -pix_fmt yuv420p \"{}\"",
        framerate,
        pattern.display(),
        output.display()
    )
}
