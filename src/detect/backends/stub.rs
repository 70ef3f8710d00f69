//! Synthetic detection engine for tests and stub deployments.

use anyhow::{anyhow, Result};
use std::collections::HashMap;

use crate::detect::engine::DetectionEngine;
use crate::detect::result::{BBox, Detection};
use crate::frame::Frame;

/// Deterministic engine selected by `stub://` model paths.
///
/// Emits one detection every `interval` frames per source, each with a fresh
/// track id. `stub://quiet` never detects. URL query parameters:
///
/// - `interval`: frames between detections per source (default 30, 0 = never)
/// - `class`: class id of emitted detections (default 0)
/// - `conf`: confidence of emitted detections (default 0.9)
pub struct StubEngine {
    interval: u64,
    class_id: u32,
    confidence: f32,
    frames_seen: HashMap<u32, u64>,
    next_track_id: i64,
}

impl StubEngine {
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("stub engine url must start with stub://"))?;
        let (host, query) = match rest.split_once('?') {
            Some((host, query)) => (host, query),
            None => (rest, ""),
        };

        let mut interval: u64 = if host == "quiet" { 0 } else { 30 };
        let mut class_id: u32 = 0;
        let mut confidence: f32 = 0.9;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub engine parameter '{}'", pair))?;
            match key {
                "interval" => {
                    interval = value
                        .parse()
                        .map_err(|_| anyhow!("stub engine interval must be an integer"))?
                }
                "class" => {
                    class_id = value
                        .parse()
                        .map_err(|_| anyhow!("stub engine class must be an integer"))?
                }
                "conf" => {
                    confidence = value
                        .parse()
                        .map_err(|_| anyhow!("stub engine conf must be a float"))?
                }
                other => return Err(anyhow!("unknown stub engine parameter '{}'", other)),
            }
        }

        Ok(Self {
            interval,
            class_id,
            confidence,
            frames_seen: HashMap::new(),
            next_track_id: 1,
        })
    }
}

impl DetectionEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn track(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>> {
        let seen = self.frames_seen.entry(frame.source_id).or_insert(0);
        *seen += 1;

        if self.interval == 0 || *seen % self.interval != 0 {
            return Ok(vec![]);
        }
        if self.confidence < confidence_threshold {
            return Ok(vec![]);
        }

        // A box in the middle third of the frame, as a tracker would report
        // for an object passing the camera.
        let w = frame.width as f32;
        let h = frame.height as f32;
        let det = Detection {
            bbox: BBox::new(w / 3.0, h / 3.0, w * 2.0 / 3.0, h * 2.0 / 3.0),
            confidence: self.confidence,
            class_id: self.class_id,
            track_id: Some(self.next_track_id),
        };
        self.next_track_id += 1;
        Ok(vec![det])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(source_id: u32) -> Frame {
        Frame::new(source_id, vec![0u8; 64 * 48 * 3], 64, 48)
    }

    #[test]
    fn quiet_engine_never_detects() {
        let mut engine = StubEngine::from_url("stub://quiet").unwrap();
        for _ in 0..100 {
            assert!(engine.track(&frame(0), 0.0).unwrap().is_empty());
        }
    }

    #[test]
    fn engine_emits_on_interval_with_fresh_track_ids() {
        let mut engine = StubEngine::from_url("stub://cam?interval=5").unwrap();
        let mut tracks = vec![];
        for _ in 0..15 {
            for det in engine.track(&frame(0), 0.5).unwrap() {
                tracks.push(det.track_id.unwrap());
            }
        }
        assert_eq!(tracks, vec![1, 2, 3]);
    }

    #[test]
    fn engine_respects_confidence_threshold() {
        let mut engine = StubEngine::from_url("stub://cam?interval=1&conf=0.4").unwrap();
        assert!(engine.track(&frame(0), 0.5).unwrap().is_empty());
        assert_eq!(engine.track(&frame(0), 0.3).unwrap().len(), 1);
    }

    #[test]
    fn per_source_counters_are_independent() {
        let mut engine = StubEngine::from_url("stub://cam?interval=2").unwrap();
        assert!(engine.track(&frame(0), 0.0).unwrap().is_empty());
        assert!(engine.track(&frame(1), 0.0).unwrap().is_empty());
        assert_eq!(engine.track(&frame(0), 0.0).unwrap().len(), 1);
        assert_eq!(engine.track(&frame(1), 0.0).unwrap().len(), 1);
    }

    #[test]
    fn malformed_parameters_are_rejected() {
        assert!(StubEngine::from_url("stub://cam?interval=abc").is_err());
        assert!(StubEngine::from_url("stub://cam?bogus=1").is_err());
    }
}
