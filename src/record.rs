//! Annotated video recording.
//!
//! One optional sink per live source, created at pipeline start. The sink
//! writes an MJPEG stream (concatenated JPEG frames), which the `image`
//! crate can produce without a codec stack; players and transcoders accept
//! the `.mjpeg` extension directly.

use anyhow::{Context, Result};
use chrono::Local;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::frame::Frame;

const JPEG_QUALITY: u8 = 85;

pub struct RecordingSink {
    path: PathBuf,
    writer: BufWriter<File>,
    fps: u32,
    width: u32,
    height: u32,
    frames_written: u64,
}

impl RecordingSink {
    /// Open a recording file named after the source id and start time.
    ///
    /// `fps` should be the source's negotiated rate; callers fall back to 30
    /// when the source could not report one.
    pub fn create(dir: &Path, source_id: u32, fps: u32, width: u32, height: u32) -> Result<Self> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("camera_{}_{}.mjpeg", source_id, stamp));
        let file = File::create(&path)
            .with_context(|| format!("open recording file {}", path.display()))?;
        log::info!("recording source {} to {} at {} fps", source_id, path.display(), fps);
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            fps,
            width,
            height,
            frames_written: 0,
        })
    }

    /// Append one annotated frame.
    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            anyhow::bail!(
                "frame size {}x{} does not match recording {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            );
        }
        JpegEncoder::new_with_quality(&mut self.writer, JPEG_QUALITY)
            .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)
            .with_context(|| format!("encode frame into {}", self.path.display()))?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::warn!("failed to flush recording {}: {}", self.path.display(), e);
        }
    }
}
