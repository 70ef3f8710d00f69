//! End-to-end pipeline runs over synthetic sources with scripted engines.

use anyhow::{anyhow, Result};
use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use boltwatch::config::OriginSpec;
use boltwatch::detect::{BBox, Detection};
use boltwatch::{
    DetectionEngine, EngineFactory, Frame, PipelineConfig, PipelineController, PipelineEvent,
    PipelineState,
};

// ----------------------------------------------------------------------------
// Scripted engine: detections as a function of (source_id, frame number)
// ----------------------------------------------------------------------------

struct ScriptedEngine<F> {
    seen: HashMap<u32, u64>,
    script: F,
}

impl<F> DetectionEngine for ScriptedEngine<F>
where
    F: FnMut(u32, u64) -> Result<Vec<Detection>> + Send,
{
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn track(&mut self, frame: &Frame, _confidence_threshold: f32) -> Result<Vec<Detection>> {
        let n = self
            .seen
            .entry(frame.source_id)
            .and_modify(|n| *n += 1)
            .or_insert(1);
        (self.script)(frame.source_id, *n)
    }
}

struct ScriptedFactory(Mutex<Option<Box<dyn DetectionEngine>>>);

impl EngineFactory for ScriptedFactory {
    fn load(&self, _model_path: &str, _iou_threshold: f32) -> Result<Box<dyn DetectionEngine>> {
        self.0
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("scripted engine already taken"))
    }
}

fn scripted<F>(script: F) -> Box<ScriptedFactory>
where
    F: FnMut(u32, u64) -> Result<Vec<Detection>> + Send + 'static,
{
    Box::new(ScriptedFactory(Mutex::new(Some(Box::new(ScriptedEngine {
        seen: HashMap::new(),
        script,
    })))))
}

fn flagged(track_id: i64) -> Detection {
    Detection {
        bbox: BBox::new(200.0, 150.0, 400.0, 350.0),
        confidence: 0.9,
        class_id: 0,
        track_id: Some(track_id),
    }
}

// ----------------------------------------------------------------------------
// Harness helpers
// ----------------------------------------------------------------------------

fn test_config(tmp: &Path, sources: &[(u32, &str)], source_count: usize) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.source_count = source_count;
    cfg.sources = sources
        .iter()
        .map(|(ordinal, spec)| (*ordinal, OriginSpec::Path(spec.to_string())))
        .collect();
    cfg.crop_dir = tmp.join("crops");
    cfg.work_dir = tmp.join("work");
    cfg
}

/// Receive events until `want_frames` FrameReady events arrived or the
/// timeout expires.
fn collect_run(
    events: &Receiver<PipelineEvent>,
    want_frames: usize,
    timeout: Duration,
) -> Vec<PipelineEvent> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut frames = 0;
    while frames < want_frames {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) => {
                if matches!(event, PipelineEvent::FrameReady { .. }) {
                    frames += 1;
                }
                out.push(event);
            }
            Err(_) => break,
        }
    }
    // Stats snapshots trail their FrameReady; give the last one a moment.
    std::thread::sleep(Duration::from_millis(100));
    out.extend(events.try_iter());
    out
}

fn frame_events(events: &[PipelineEvent]) -> Vec<&Frame> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::FrameReady { frame, .. } => Some(frame),
            _ => None,
        })
        .collect()
}

fn last_stats(events: &[PipelineEvent]) -> Option<&boltwatch::RunStatistics> {
    events.iter().rev().find_map(|e| match e {
        PipelineEvent::Stats(stats) => Some(stats),
        _ => None,
    })
}

fn has_pixel(frame: &Frame, rgb: [u8; 3]) -> bool {
    frame.data.chunks_exact(3).any(|p| p == rgb)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[test]
fn flagged_track_across_two_sources_persists_exactly_one_crop() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(
        tmp.path(),
        &[(0, "stub://clip?frames=10"), (1, "stub://clip?frames=10")],
        2,
    );
    let crop_dir = cfg.crop_dir.clone();

    // Source 0 reports the same damaged track on every frame from the third
    // on; source 1 stays clear.
    let factory = scripted(|source_id, n| {
        if source_id == 0 && n >= 3 {
            Ok(vec![flagged(7)])
        } else {
            Ok(Vec::new())
        }
    });

    let (mut controller, events) = PipelineController::new(cfg, factory);
    controller.start().unwrap();
    let events = collect_run(&events, 20, Duration::from_secs(10));
    controller.stop().unwrap();

    assert_eq!(frame_events(&events).len(), 20);

    // Eight sightings of track 7, one crop.
    let crops: Vec<_> = std::fs::read_dir(&crop_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(crops.len(), 1, "crops: {:?}", crops);
    assert!(crops[0].starts_with("damaged_bolt_src0_id7_"));

    let stats = last_stats(&events).expect("stats events");
    assert_eq!(stats.damaged_count, 1);
    assert!(stats.total_detections >= 8);
}

#[test]
fn unmapped_source_ordinal_aborts_start() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path(), &[(0, "stub://clip?frames=5")], 2);

    let (mut controller, events) = PipelineController::new(cfg, scripted(|_, _| Ok(Vec::new())));
    let err = controller.start().unwrap_err();
    assert!(err.to_string().contains("not mapped"), "{}", err);
    assert_eq!(controller.state(), PipelineState::Idle);

    // The failure also reaches the presentation boundary.
    assert!(events
        .try_iter()
        .any(|e| matches!(e, PipelineEvent::Error(_))));
}

#[test]
fn inference_failure_skips_one_frame_and_keeps_running() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path(), &[(0, "stub://clip?frames=10")], 1);

    // Unflagged detections draw a green box on every frame except the
    // fifth, where inference fails and the frame passes through bare.
    let factory = scripted(|_, n| {
        if n == 5 {
            Err(anyhow!("transient backend failure"))
        } else {
            Ok(vec![Detection {
                class_id: 1,
                ..flagged(1)
            }])
        }
    });

    let (mut controller, events) = PipelineController::new(cfg, factory);
    controller.start().unwrap();
    let events = collect_run(&events, 10, Duration::from_secs(10));
    controller.stop().unwrap();

    let frames = frame_events(&events);
    assert_eq!(frames.len(), 10);

    // The synthetic pattern never produces pure green, so its presence
    // proves annotation and its absence proves the bare pass-through.
    for (i, frame) in frames.iter().enumerate() {
        let annotated = has_pixel(frame, [0, 255, 0]);
        if i == 4 {
            assert!(!annotated, "failed frame must pass through unannotated");
        } else {
            assert!(annotated, "frame {} should carry a box overlay", i);
        }
    }

    let warnings = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::Log(msg) if msg.contains("inference failed")))
        .count();
    assert_eq!(warnings, 1);

    // The failed frame contributes nothing to the counters.
    assert_eq!(last_stats(&events).unwrap().total_detections, 9);
}

#[test]
fn pause_suspends_frame_flow_and_resume_restores_it() {
    let tmp = tempfile::tempdir().unwrap();
    // frames=0 keeps the clip endless.
    let cfg = test_config(tmp.path(), &[(0, "stub://clip?frames=0")], 1);

    let (mut controller, events) = PipelineController::new(cfg, scripted(|_, _| Ok(Vec::new())));
    controller.start().unwrap();

    // Let some frames flow first.
    assert!(!collect_run(&events, 3, Duration::from_secs(5)).is_empty());

    assert!(controller.toggle_pause().unwrap());
    // Drain frames that were in flight when the pause landed.
    std::thread::sleep(Duration::from_millis(200));
    for _ in events.try_iter() {}
    assert!(
        events.recv_timeout(Duration::from_millis(300)).is_err(),
        "no events may be produced while paused"
    );

    assert!(!controller.toggle_pause().unwrap());
    let resumed = collect_run(&events, 1, Duration::from_secs(5));
    assert!(!frame_events(&resumed).is_empty());

    controller.stop().unwrap();
    assert_eq!(controller.state(), PipelineState::Idle);
}

#[test]
fn live_source_crops_exclude_clock_overlay() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = PipelineConfig::default();
    cfg.source_count = 1;
    // A device origin runs the synthetic camera and gets the clock stamp.
    cfg.sources = [(0, OriginSpec::Device(0))].into_iter().collect();
    cfg.crop_dir = tmp.path().join("crops");
    cfg.work_dir = tmp.path().join("work");
    cfg.record = false;
    let crop_dir = cfg.crop_dir.clone();

    // A flagged box near the top-left corner: the padded crop region
    // overlaps where the clock backing is painted.
    let factory = scripted(|_, n| {
        if n == 1 {
            Ok(vec![Detection {
                bbox: BBox::new(10.0, 10.0, 60.0, 40.0),
                confidence: 0.9,
                class_id: 0,
                track_id: Some(1),
            }])
        } else {
            Ok(Vec::new())
        }
    });

    let (mut controller, events) = PipelineController::new(cfg, factory);
    controller.start().unwrap();
    let _ = collect_run(&events, 3, Duration::from_secs(5));
    controller.stop().unwrap();

    let crop_path = std::fs::read_dir(&crop_dir)
        .unwrap()
        .next()
        .expect("one crop file")
        .unwrap()
        .path();
    let crop = image::open(&crop_path).unwrap().to_rgb8();
    assert_eq!(crop.dimensions(), (80, 60));

    // The synthetic pattern never renders solid black; a dark block here
    // means the clock backing leaked into the saved crop.
    let near_black = crop
        .pixels()
        .filter(|p| p.0.iter().all(|&c| c < 6))
        .count();
    assert!(
        near_black < 200,
        "crop contains {} near-black pixels",
        near_black
    );
}

#[test]
fn pause_resume_preserves_round_robin_order() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(
        tmp.path(),
        &[(0, "stub://clip?frames=0"), (1, "stub://clip?frames=0")],
        2,
    );

    let (mut controller, events) = PipelineController::new(cfg, scripted(|_, _| Ok(Vec::new())));
    controller.start().unwrap();

    let mut all = collect_run(&events, 4, Duration::from_secs(5));

    controller.toggle_pause().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    all.extend(events.try_iter());

    controller.toggle_pause().unwrap();
    all.extend(collect_run(&events, 4, Duration::from_secs(5)));
    controller.stop().unwrap();

    // Sources alternate strictly, including across the pause boundary.
    let order: Vec<u32> = all
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::FrameReady { source_id, .. } => Some(*source_id),
            _ => None,
        })
        .collect();
    assert!(order.len() >= 8, "too few frames: {:?}", order);
    for pair in order.windows(2) {
        assert_ne!(pair[0], pair[1], "a source ran twice in a row: {:?}", order);
    }
}

#[test]
fn stop_while_paused_terminates_promptly() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path(), &[(0, "stub://clip?frames=0")], 1);

    let (mut controller, _events) = PipelineController::new(cfg, scripted(|_, _| Ok(Vec::new())));
    controller.start().unwrap();
    controller.toggle_pause().unwrap();

    // stop() joins the worker; a paused worker must still wake and exit.
    controller.stop().unwrap();
    assert_eq!(controller.state(), PipelineState::Idle);
}

#[test]
fn state_machine_rejects_invalid_transitions() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path(), &[(0, "stub://clip?frames=0")], 1);

    let (mut controller, _events) = PipelineController::new(cfg, scripted(|_, _| Ok(Vec::new())));
    assert!(controller.toggle_pause().is_err());
    assert!(controller.stop().is_err());

    controller.start().unwrap();
    assert!(controller.start().is_err(), "start while running");
    controller.stop().unwrap();
    assert_eq!(controller.state(), PipelineState::Idle);
}
