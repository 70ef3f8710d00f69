//! Frame type shared by every pipeline stage.
//!
//! A `Frame` is transient: produced once per cycle per source, handed to the
//! annotator, the track ledger and (optionally) the recording sink, then
//! discarded. Stages receive either the original or a copy; there is no
//! shared mutable ownership of pixel data anywhere in the pipeline.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use image::RgbImage;

/// One captured frame in packed RGB24 (row-major, no padding).
#[derive(Clone, Debug)]
pub struct Frame {
    /// Ordinal of the source that produced this frame.
    pub source_id: u32,
    /// Packed RGB pixel data, `width * height * 3` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time.
    pub timestamp: DateTime<Local>,
}

impl Frame {
    pub fn new(source_id: u32, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            source_id,
            data,
            width,
            height,
            timestamp: Local::now(),
        }
    }

    /// Expected byte length for the frame dimensions.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// View the pixel data as an owned `RgbImage` (copies the buffer).
    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(|| {
            anyhow!(
                "frame buffer of {} bytes does not match {}x{} RGB24",
                self.data.len(),
                self.width,
                self.height
            )
        })
    }

    /// Rebuild a frame from an image, keeping id and capture time.
    pub fn with_image(&self, image: RgbImage) -> Self {
        Self {
            source_id: self.source_id,
            width: image.width(),
            height: image.height(),
            data: image.into_raw(),
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_image() {
        let frame = Frame::new(0, vec![7u8; 4 * 2 * 3], 4, 2);
        let img = frame.to_image().unwrap();
        assert_eq!(img.dimensions(), (4, 2));

        let back = frame.with_image(img);
        assert_eq!(back.data, frame.data);
        assert_eq!(back.source_id, 0);
    }

    #[test]
    fn frame_rejects_mismatched_buffer() {
        let frame = Frame::new(0, vec![0u8; 10], 4, 2);
        assert!(frame.to_image().is_err());
    }
}
