//! Per-track crop persistence with at-most-once deduplication.
//!
//! The ledger remembers which `(source_id, track_id)` pairs have already
//! produced a saved crop. The first flagged detection of a track yields a
//! crop job; every later detection of the same pair is a no-op regardless
//! of confidence or bbox drift. Records are never mutated or deleted during
//! a run.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::detect::Detection;
use crate::frame::Frame;

/// Padding added on every side of a flagged bounding box before cropping.
const CROP_PADDING: i32 = 20;

/// A crop region that still has to be extracted and written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropJob {
    pub source_id: u32,
    pub track_id: i64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One persisted crop. Never mutated after creation.
#[derive(Clone, Debug)]
pub struct TrackRecord {
    pub source_id: u32,
    pub track_id: i64,
    pub first_seen: DateTime<Local>,
    pub crop_path: PathBuf,
}

pub struct TrackLedger {
    crop_dir: PathBuf,
    flagged_class: u32,
    records: HashMap<(u32, i64), TrackRecord>,
}

impl TrackLedger {
    pub fn new(crop_dir: &Path, flagged_class: u32) -> Result<Self> {
        std::fs::create_dir_all(crop_dir)
            .with_context(|| format!("create crop directory {}", crop_dir.display()))?;
        Ok(Self {
            crop_dir: crop_dir.to_path_buf(),
            flagged_class,
            records: HashMap::new(),
        })
    }

    /// Decide whether a detection should produce a crop.
    ///
    /// Returns a job when the detection is of the flagged class, carries a
    /// track id, no record exists yet for `(source_id, track_id)`, and the
    /// padded region clamped to the frame has nonzero area. A degenerate
    /// region yields `None` without creating a record, so a later
    /// non-degenerate detection of the same track can still succeed.
    pub fn observe(
        &self,
        source_id: u32,
        detection: &Detection,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<CropJob> {
        if detection.class_id != self.flagged_class {
            return None;
        }
        let track_id = detection.track_id?;
        if self.records.contains_key(&(source_id, track_id)) {
            return None;
        }

        let x1 = (detection.bbox.x1 as i32 - CROP_PADDING).max(0) as u32;
        let y1 = (detection.bbox.y1 as i32 - CROP_PADDING).max(0) as u32;
        let x2 = ((detection.bbox.x2 as i32 + CROP_PADDING).max(0) as u32).min(frame_width);
        let y2 = ((detection.bbox.y2 as i32 + CROP_PADDING).max(0) as u32).min(frame_height);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(CropJob {
            source_id,
            track_id,
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }

    /// Extract the crop region from the frame and write it to disk.
    ///
    /// The record is created only on a successful write, so a failed write
    /// leaves the track eligible for a retry on its next detection.
    pub fn persist(&mut self, job: CropJob, frame: &Frame) -> Result<&TrackRecord> {
        let img = frame.to_image()?;
        let crop = image::imageops::crop_imm(&img, job.x, job.y, job.width, job.height).to_image();

        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        let filename = format!(
            "damaged_bolt_src{}_id{}_{}.jpg",
            job.source_id, job.track_id, stamp
        );
        let crop_path = self.crop_dir.join(filename);
        crop.save_with_format(&crop_path, image::ImageFormat::Jpeg)
            .with_context(|| format!("write crop {}", crop_path.display()))?;

        let key = (job.source_id, job.track_id);
        let record = TrackRecord {
            source_id: job.source_id,
            track_id: job.track_id,
            first_seen: Local::now(),
            crop_path,
        };
        Ok(self.records.entry(key).or_insert(record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, source_id: u32, track_id: i64) -> bool {
        self.records.contains_key(&(source_id, track_id))
    }

    pub fn records(&self) -> impl Iterator<Item = &TrackRecord> {
        self.records.values()
    }

    /// Clear all records. Only called on a full pipeline reset.
    pub fn reset(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;

    fn flagged(track_id: Option<i64>, bbox: BBox) -> Detection {
        Detection {
            bbox,
            confidence: 0.9,
            class_id: 0,
            track_id,
        }
    }

    fn ledger(dir: &Path) -> TrackLedger {
        TrackLedger::new(dir, 0).unwrap()
    }

    fn frame() -> Frame {
        Frame::new(0, vec![128u8; 640 * 480 * 3], 640, 480)
    }

    #[test]
    fn first_observation_produces_padded_clamped_job() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ledger(tmp.path());

        let job = ledger
            .observe(0, &flagged(Some(7), BBox::new(10.0, 10.0, 100.0, 100.0)), 640, 480)
            .unwrap();
        // 20px padding, clamped to the frame on the top-left.
        assert_eq!((job.x, job.y), (0, 0));
        assert_eq!((job.width, job.height), (120, 120));
    }

    #[test]
    fn persist_is_at_most_once_per_track() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = ledger(tmp.path());
        let det = flagged(Some(7), BBox::new(100.0, 100.0, 200.0, 200.0));

        let job = ledger.observe(0, &det, 640, 480).unwrap();
        ledger.persist(job, &frame()).unwrap();

        // Same track again, even with a drifted box: no job.
        let drifted = flagged(Some(7), BBox::new(150.0, 150.0, 260.0, 260.0));
        assert!(ledger.observe(0, &drifted, 640, 480).is_none());
        assert_eq!(ledger.len(), 1);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[test]
    fn same_track_on_other_source_is_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = ledger(tmp.path());
        let det = flagged(Some(7), BBox::new(100.0, 100.0, 200.0, 200.0));

        let job = ledger.observe(0, &det, 640, 480).unwrap();
        ledger.persist(job, &frame()).unwrap();
        assert!(ledger.observe(1, &det, 640, 480).is_some());
    }

    #[test]
    fn unflagged_or_untracked_detections_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ledger(tmp.path());

        let untracked = flagged(None, BBox::new(100.0, 100.0, 200.0, 200.0));
        assert!(ledger.observe(0, &untracked, 640, 480).is_none());

        let other_class = Detection {
            class_id: 1,
            ..flagged(Some(9), BBox::new(100.0, 100.0, 200.0, 200.0))
        };
        assert!(ledger.observe(0, &other_class, 640, 480).is_none());
    }

    #[test]
    fn zero_area_region_leaves_track_eligible() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = ledger(tmp.path());

        // Entirely right of the frame: clamps to zero width.
        let degenerate = flagged(Some(7), BBox::new(700.0, 100.0, 720.0, 200.0));
        assert!(ledger.observe(0, &degenerate, 640, 480).is_none());
        assert!(ledger.is_empty());

        // The same track later, in frame: exactly one crop.
        let ok = flagged(Some(7), BBox::new(100.0, 100.0, 200.0, 200.0));
        let job = ledger.observe(0, &ok, 640, 480).unwrap();
        ledger.persist(job, &frame()).unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn crop_filename_encodes_source_track_and_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = ledger(tmp.path());

        let det = flagged(Some(42), BBox::new(100.0, 100.0, 200.0, 200.0));
        let job = ledger.observe(3, &det, 640, 480).unwrap();
        let record = ledger.persist(job, &frame()).unwrap();

        let name = record.crop_path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("damaged_bolt_src3_id42_"));
        assert!(name.ends_with(".jpg"));
        assert!(record.crop_path.is_file());
    }

    #[test]
    fn reset_clears_records() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = ledger(tmp.path());
        let det = flagged(Some(7), BBox::new(100.0, 100.0, 200.0, 200.0));
        let job = ledger.observe(0, &det, 640, 480).unwrap();
        ledger.persist(job, &frame()).unwrap();

        ledger.reset();
        assert!(ledger.is_empty());
        assert!(ledger.observe(0, &det, 640, 480).is_some());
    }
}
