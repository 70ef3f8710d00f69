//! Run-wide statistics.
//!
//! The aggregator is owned by the pipeline worker and updated on every
//! processed frame; a snapshot is pushed to the presentation boundary after
//! each one. Counters reset only on an explicit pipeline reset, never
//! between cycles.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

/// How `fps_estimate` is produced.
///
/// The original system reported a constant; `Measured` replaces that with a
/// rolling measurement over recent cycles and is the default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FpsMode {
    /// Report the nominal target rate (30).
    Nominal,
    /// Report a rolling measurement of the worker's cycle rate.
    #[default]
    Measured,
}

const NOMINAL_FPS: f32 = 30.0;
const FPS_WINDOW: usize = 60;

/// Snapshot pushed to the presentation boundary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunStatistics {
    /// Detections across all frames and sources since the last reset.
    pub total_detections: u64,
    /// Unique damaged instances persisted by the ledger, not raw flagged
    /// detections.
    pub damaged_count: u64,
    /// Flagged detections in the most recent processed frame.
    pub current_damaged: u32,
    pub fps_estimate: f32,
    /// Configured confidence threshold, in percent.
    pub confidence_threshold: f32,
}

pub struct StatsAggregator {
    mode: FpsMode,
    confidence_threshold: f32,
    total_detections: u64,
    damaged_count: u64,
    current_damaged: u32,
    cycle_marks: VecDeque<Instant>,
}

impl StatsAggregator {
    pub fn new(mode: FpsMode, confidence_threshold_percent: f32) -> Self {
        Self {
            mode,
            confidence_threshold: confidence_threshold_percent,
            total_detections: 0,
            damaged_count: 0,
            current_damaged: 0,
            cycle_marks: VecDeque::with_capacity(FPS_WINDOW),
        }
    }

    /// Account for one processed frame.
    pub fn record_frame(&mut self, detection_count: usize, flagged_in_frame: u32) {
        self.total_detections += detection_count as u64;
        self.current_damaged = flagged_in_frame;
    }

    /// Account for one persisted crop (a new unique damaged instance).
    pub fn record_crop(&mut self) {
        self.damaged_count += 1;
    }

    /// Mark the start of a worker cycle for the fps window.
    pub fn mark_cycle(&mut self) {
        if self.cycle_marks.len() == FPS_WINDOW {
            self.cycle_marks.pop_front();
        }
        self.cycle_marks.push_back(Instant::now());
    }

    pub fn snapshot(&self) -> RunStatistics {
        RunStatistics {
            total_detections: self.total_detections,
            damaged_count: self.damaged_count,
            current_damaged: self.current_damaged,
            fps_estimate: self.fps_estimate(),
            confidence_threshold: self.confidence_threshold,
        }
    }

    /// Zero all counters. Only called on a full pipeline reset.
    pub fn reset(&mut self) {
        self.total_detections = 0;
        self.damaged_count = 0;
        self.current_damaged = 0;
        self.cycle_marks.clear();
    }

    fn fps_estimate(&self) -> f32 {
        match self.mode {
            FpsMode::Nominal => NOMINAL_FPS,
            FpsMode::Measured => {
                let (Some(first), Some(last)) =
                    (self.cycle_marks.front(), self.cycle_marks.back())
                else {
                    return 0.0;
                };
                let span = last.duration_since(*first).as_secs_f32();
                if self.cycle_marks.len() < 2 || span <= f32::EPSILON {
                    return 0.0;
                }
                (self.cycle_marks.len() - 1) as f32 / span
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn damaged_count_tracks_persisted_crops_not_flagged_detections() {
        let mut stats = StatsAggregator::new(FpsMode::Nominal, 50.0);

        // Five frames each containing three flagged detections of the same
        // track: only one crop persists.
        for _ in 0..5 {
            stats.record_frame(3, 3);
        }
        stats.record_crop();

        let snap = stats.snapshot();
        assert_eq!(snap.total_detections, 15);
        assert_eq!(snap.damaged_count, 1);
        assert_eq!(snap.current_damaged, 3);
    }

    #[test]
    fn current_damaged_reflects_latest_frame_only() {
        let mut stats = StatsAggregator::new(FpsMode::Nominal, 50.0);
        stats.record_frame(4, 4);
        stats.record_frame(1, 0);
        assert_eq!(stats.snapshot().current_damaged, 0);
    }

    #[test]
    fn nominal_mode_reports_constant_rate() {
        let stats = StatsAggregator::new(FpsMode::Nominal, 50.0);
        assert_eq!(stats.snapshot().fps_estimate, 30.0);
    }

    #[test]
    fn measured_mode_needs_at_least_two_cycles() {
        let mut stats = StatsAggregator::new(FpsMode::Measured, 50.0);
        assert_eq!(stats.snapshot().fps_estimate, 0.0);
        stats.mark_cycle();
        assert_eq!(stats.snapshot().fps_estimate, 0.0);
    }

    #[test]
    fn measured_mode_approximates_cycle_rate() {
        let mut stats = StatsAggregator::new(FpsMode::Measured, 50.0);
        for _ in 0..5 {
            stats.mark_cycle();
            std::thread::sleep(Duration::from_millis(10));
        }
        let fps = stats.snapshot().fps_estimate;
        assert!(fps > 20.0 && fps < 200.0, "unexpected fps estimate {}", fps);
    }

    #[test]
    fn reset_zeroes_everything() {
        let mut stats = StatsAggregator::new(FpsMode::Nominal, 50.0);
        stats.record_frame(3, 2);
        stats.record_crop();
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.total_detections, 0);
        assert_eq!(snap.damaged_count, 0);
        assert_eq!(snap.current_damaged, 0);
    }

    #[test]
    fn snapshot_carries_configured_threshold() {
        let stats = StatsAggregator::new(FpsMode::Nominal, 65.0);
        assert_eq!(stats.snapshot().confidence_threshold, 65.0);
    }
}
