#![cfg(feature = "capture-v4l2")]

//! V4L2 camera capture.
//!
//! Opens `/dev/video{index}` and requests the target format best-effort:
//! when the device refuses a parameter the negotiated values are accepted
//! without error and reported upward.

use anyhow::{Context, Result};
use ouroboros::self_referencing;

use super::{CaptureTarget, Negotiated};

pub(crate) struct V4l2Device {
    state: V4l2State,
    negotiated: Negotiated,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this>,
}

impl V4l2Device {
    pub(crate) fn open(index: u32, target: CaptureTarget) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let path = format!("/dev/video{}", index);
        let mut device =
            v4l::Device::with_path(&path).with_context(|| format!("open v4l2 device {}", path))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = target.width;
        format.height = target.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        // Downstream stages assume packed RGB24; a device stuck on another
        // fourcc must fail here, not emit garbage frames.
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(anyhow::anyhow!(
                "{} negotiated fourcc {} instead of RGB3",
                path,
                format.fourcc
            ));
        }

        let mut fps = target.fps;
        if target.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(target.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("failed to set fps on {}: {}", path, err);
            }
        }
        if let Ok(params) = device.params() {
            let interval = params.interval;
            if interval.numerator > 0 {
                fps = (interval.denominator / interval.numerator).max(1);
            }
        }

        let negotiated = Negotiated {
            width: format.width,
            height: format.height,
            fps,
        };

        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        Ok(Self { state, negotiated })
    }

    pub(crate) fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    pub(crate) fn read_pixels(&mut self) -> Result<(Vec<u8>, u32, u32)> {
        use v4l::io::traits::CaptureStream;

        let negotiated = self.negotiated;
        let pixels = self.state.with_stream_mut(|stream| -> Result<Vec<u8>> {
            let (buf, _meta) = stream.next().context("capture v4l2 frame")?;
            Ok(buf.to_vec())
        })?;

        let expected = negotiated.width as usize * negotiated.height as usize * 3;
        if pixels.len() < expected {
            return Err(anyhow::anyhow!(
                "v4l2 buffer of {} bytes is short of {}x{} RGB24",
                pixels.len(),
                negotiated.width,
                negotiated.height
            ));
        }
        let mut pixels = pixels;
        pixels.truncate(expected);
        Ok((pixels, negotiated.width, negotiated.height))
    }
}
