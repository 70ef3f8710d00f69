#![cfg(feature = "ingest-file-ffmpeg")]

//! FFmpeg-backed video file decoding.
//!
//! Frames are decoded in-memory and converted to packed RGB24. End of file
//! is reported as a clean end-of-stream, not an error, so the pipeline can
//! keep servicing the remaining sources.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::Path;

use super::{CaptureTarget, Negotiated};

pub(crate) struct FfmpegFileSource {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    negotiated: Negotiated,
    drained: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &Path, target: CaptureTarget) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("open video file {}", path.display()))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("{} has no video track", path.display()))?;
        let stream_index = stream.index();

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 {
            let value = rate.numerator() as f64 / rate.denominator() as f64;
            value.round().max(1.0) as u32
        } else {
            target.fps
        };

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        // Decode at the file's native resolution; the target is a request,
        // not a mandate.
        let negotiated = Negotiated {
            width: decoder.width(),
            height: decoder.height(),
            fps,
        };

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            negotiated,
            drained: false,
        })
    }

    pub(crate) fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    /// Decode the next frame, `None` at end of file.
    pub(crate) fn read_pixels(&mut self) -> Result<Option<(Vec<u8>, u32, u32)>> {
        let mut decoded = ffmpeg::frame::Video::empty();

        loop {
            if let Ok(()) = self.decoder.receive_frame(&mut decoded) {
                return Ok(Some(self.convert(&decoded)?));
            }
            if self.drained {
                return Ok(None);
            }

            let mut sent = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                sent = true;
                break;
            }
            if !sent {
                // Flush the decoder once, then drain buffered frames.
                self.decoder.send_eof().context("flush ffmpeg decoder")?;
                self.drained = true;
            }
        }
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
        let mut rgb = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb)
            .context("convert frame to RGB24")?;

        let width = rgb.width();
        let height = rgb.height();
        let row_bytes = width as usize * 3;
        let stride = rgb.stride(0);
        let data = rgb.data(0);

        if stride == row_bytes {
            return Ok((data.to_vec(), width, height));
        }

        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            pixels.extend_from_slice(
                data.get(start..end)
                    .context("ffmpeg frame row is out of bounds")?,
            );
        }
        Ok((pixels, width, height))
    }
}
