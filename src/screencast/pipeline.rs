//! GStreamer pipeline construction and management

use anyhow::{Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbaImage;
use std::path::{Path, PathBuf};

use super::encoder::{CodecCandidate, VideoBackend, VideoWriter};

/// Frames appsrc may hold before `push_frame` waits for the encoder
const MAX_QUEUED_FRAMES: u64 = 4;

/// Bus poll interval while waiting for queue space
const QUEUE_POLL_MS: u64 = 10;

/// GStreamer pipeline encoding raw RGBA frames to a video file
pub struct Pipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    bus: gst::Bus,
    output_path: PathBuf,
    framerate: u32,
    frames_pushed: u64,
}

impl Pipeline {
    /// Create a new encoding pipeline
    ///
    /// # Arguments
    /// * `candidate` - Encoder element and container to use
    /// * `output_path` - Output file path
    /// * `width` - Video width
    /// * `height` - Video height
    /// * `framerate` - Frames per second
    pub fn new(
        candidate: &CodecCandidate,
        output_path: &Path,
        width: u32,
        height: u32,
        framerate: u32,
    ) -> Result<Self> {
        gst::init().context("Failed to initialize GStreamer")?;

        let location = output_path
            .to_str()
            .with_context(|| format!("Output path is not valid UTF-8: {}", output_path.display()))?;

        let pipeline = gst::Pipeline::new();

        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgba, width, height)
            .fps(gst::Fraction::new(framerate as i32, 1))
            .build()
            .context("Failed to describe raw video format")?;
        let caps = info.to_caps().context("Failed to build raw video caps")?;

        // Not blocking: push_frame polls the queue level itself so a dead
        // streaming thread surfaces as a bus error instead of a hang
        let appsrc = gst_app::AppSrc::builder()
            .name("segment-source")
            .caps(&caps)
            .is_live(false)
            .max_bytes(info.size() as u64 * MAX_QUEUED_FRAMES)
            .format(gst::Format::Time)
            .build();

        let videoconvert = gst::ElementFactory::make("videoconvert")
            .build()
            .context("Failed to create videoconvert element")?;

        let encoder_elem = gst::ElementFactory::make(candidate.gst_element)
            .build()
            .with_context(|| format!("Failed to create encoder: {}", candidate.gst_element))?;

        let muxer_name = candidate.container.muxer_element();
        let muxer = gst::ElementFactory::make(muxer_name)
            .build()
            .with_context(|| format!("Failed to create muxer: {}", muxer_name))?;

        let filesink = gst::ElementFactory::make("filesink")
            .property("location", location)
            .build()
            .context("Failed to create filesink element")?;

        pipeline.add_many([
            appsrc.upcast_ref(),
            &videoconvert,
            &encoder_elem,
            &muxer,
            &filesink,
        ])?;

        gst::Element::link_many([
            appsrc.upcast_ref(),
            &videoconvert,
            &encoder_elem,
            &muxer,
            &filesink,
        ])
        .with_context(|| format!("Failed to link pipeline for {}", candidate))?;

        let bus = pipeline.bus().context("Pipeline has no bus")?;

        Ok(Self {
            pipeline,
            appsrc,
            bus,
            output_path: output_path.to_path_buf(),
            framerate: framerate.max(1),
            frames_pushed: 0,
        })
    }

    /// Start the pipeline
    pub fn start(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .context("Failed to start pipeline")?;
        Ok(())
    }

    /// Push the next video frame, stamped from its position in the segment
    pub fn push_frame(&mut self, data: &[u8]) -> Result<()> {
        self.wait_for_queue_space()?;

        let nanos_per_frame = 1_000_000_000 / self.framerate as u64;
        let timestamp = self.frames_pushed * nanos_per_frame;

        let mut buffer = gst::Buffer::with_size(data.len())
            .context("Failed to allocate GStreamer buffer")?;

        {
            let buffer_mut = buffer
                .get_mut()
                .context("GStreamer buffer is not writable")?;
            buffer_mut.set_pts(gst::ClockTime::from_nseconds(timestamp));
            buffer_mut.set_duration(gst::ClockTime::from_nseconds(nanos_per_frame));
            let mut map = buffer_mut
                .map_writable()
                .context("Failed to map buffer for writing")?;
            map.copy_from_slice(data);
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| anyhow::anyhow!("Failed to push buffer to pipeline: {:?}", e))?;
        self.frames_pushed += 1;

        Ok(())
    }

    /// Wait until appsrc drops below its byte limit, failing on a bus error
    fn wait_for_queue_space(&self) -> Result<()> {
        loop {
            if let Some(msg) = self.bus.pop_filtered(&[gst::MessageType::Error]) {
                return Err(bus_error(&msg));
            }
            if self.appsrc.current_level_bytes() < self.appsrc.max_bytes() {
                return Ok(());
            }
            let poll = gst::ClockTime::from_mseconds(QUEUE_POLL_MS);
            if let Some(msg) = self.bus.timed_pop_filtered(poll, &[gst::MessageType::Error]) {
                return Err(bus_error(&msg));
            }
        }
    }

    /// Signal end of stream and wait for the file to be finalized
    pub fn finish(&self) -> Result<()> {
        log::debug!("Sending EOS to pipeline for {}", self.output_path.display());
        self.appsrc
            .end_of_stream()
            .map_err(|e| anyhow::anyhow!("Failed to send EOS: {:?}", e))?;

        // No timeout: a slow encoder only delays the next capture tick
        for msg in self.bus.iter_timed(gst::ClockTime::NONE) {
            use gst::MessageView;
            match msg.view() {
                MessageView::Eos(..) => {
                    log::debug!("EOS received, finalizing {}", self.output_path.display());
                    break;
                }
                MessageView::Error(..) => return Err(bus_error(&msg)),
                _ => {}
            }
        }

        self.pipeline
            .set_state(gst::State::Null)
            .context("Failed to stop pipeline")?;
        Ok(())
    }
}

fn bus_error(msg: &gst::Message) -> anyhow::Error {
    match msg.view() {
        gst::MessageView::Error(err) => anyhow::anyhow!(
            "Pipeline error: {} ({})",
            err.error(),
            err.debug().unwrap_or_default()
        ),
        _ => anyhow::anyhow!("Pipeline error"),
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl VideoWriter for Pipeline {
    fn write_frame(&mut self, image: &RgbaImage) -> Result<()> {
        self.push_frame(image.as_raw())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Pipeline::finish(&self)
    }
}

/// Encodes segments through GStreamer
#[derive(Debug, Default, Clone, Copy)]
pub struct GstBackend;

impl GstBackend {
    pub fn new() -> Self {
        Self
    }

    /// Candidates whose encoder and muxer elements are installed
    pub fn available(candidates: &[CodecCandidate]) -> Result<Vec<CodecCandidate>> {
        gst::init().context("Failed to initialize GStreamer")?;
        Ok(candidates
            .iter()
            .filter(|c| {
                element_available(c.gst_element) && element_available(c.container.muxer_element())
            })
            .copied()
            .collect())
    }
}

/// Check if a GStreamer element is available
fn element_available(element_name: &str) -> bool {
    gst::ElementFactory::find(element_name).is_some()
}

impl VideoBackend for GstBackend {
    fn open(
        &self,
        candidate: &CodecCandidate,
        path: &Path,
        width: u32,
        height: u32,
        framerate: u32,
    ) -> Result<Box<dyn VideoWriter>> {
        let pipeline = Pipeline::new(candidate, path, width, height, framerate)?;
        pipeline.start()?;
        log::debug!(
            "Opened {} writer for {} ({}x{} @ {} fps)",
            candidate,
            path.display(),
            width,
            height,
            framerate
        );
        Ok(Box::new(pipeline))
    }
}
