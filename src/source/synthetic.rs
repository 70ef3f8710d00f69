//! Synthetic capture backends for `stub://` sources and tests.

use anyhow::{anyhow, Result};

use super::{CaptureTarget, Negotiated};

/// Pixel generator shared by the synthetic backends.
///
/// Fills each frame with a pattern that mixes the pixel position, frame
/// count and a slowly changing scene state, so consecutive frames differ
/// and neighbouring bytes are never equal (useful for overlay tests).
struct PatternGenerator {
    width: u32,
    height: u32,
    frame_count: u64,
    scene_state: u8,
}

impl PatternGenerator {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn next_pixels(&mut self) -> (Vec<u8>, u32, u32) {
        self.frame_count += 1;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        (pixels, self.width, self.height)
    }
}

/// Synthetic file-backed clip, selected by `stub://` file paths.
///
/// URL query parameters:
/// - `frames`: clip length; 0 means endless (default 0)
/// - `width` / `height`: frame dimensions (default: requested target)
pub struct SyntheticClip {
    generator: PatternGenerator,
    frames: u64,
    fps: u32,
}

impl SyntheticClip {
    pub fn from_url(url: &str, target: CaptureTarget) -> Result<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic clip url must start with stub://"))?;
        let query = rest.split_once('?').map(|(_, q)| q).unwrap_or("");

        let mut frames = 0u64;
        let mut width = target.width;
        let mut height = target.height;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub source parameter '{}'", pair))?;
            let parsed: u64 = value
                .parse()
                .map_err(|_| anyhow!("stub source parameter '{}' must be an integer", key))?;
            match key {
                "frames" => frames = parsed,
                "width" => width = parsed as u32,
                "height" => height = parsed as u32,
                other => return Err(anyhow!("unknown stub source parameter '{}'", other)),
            }
        }

        log::info!("synthetic clip opened: {}", url);
        Ok(Self {
            generator: PatternGenerator::new(width, height),
            frames,
            fps: target.fps,
        })
    }

    pub fn negotiated(&self) -> Negotiated {
        Negotiated {
            width: self.generator.width,
            height: self.generator.height,
            fps: self.fps,
        }
    }

    /// `None` once the clip is exhausted.
    pub fn next_pixels(&mut self) -> Option<(Vec<u8>, u32, u32)> {
        if self.frames != 0 && self.generator.frame_count >= self.frames {
            return None;
        }
        Some(self.generator.next_pixels())
    }
}

/// Synthetic camera used when real device capture is not compiled in.
pub struct SyntheticCamera {
    generator: PatternGenerator,
    fps: u32,
}

impl SyntheticCamera {
    pub fn new(target: CaptureTarget) -> Self {
        Self {
            generator: PatternGenerator::new(target.width, target.height),
            fps: target.fps,
        }
    }

    pub fn negotiated(&self) -> Negotiated {
        Negotiated {
            width: self.generator.width,
            height: self.generator.height,
            fps: self.fps,
        }
    }

    pub fn next_pixels(&mut self) -> (Vec<u8>, u32, u32) {
        self.generator.next_pixels()
    }
}
