//! Pipeline orchestration.
//!
//! `PipelineController` owns the capture sources, the detection engine, the
//! track ledger, the recording sinks and the statistics aggregator, and
//! runs them from a single dedicated worker thread. External callers only
//! toggle two flags (pause, stop) guarded by one mutex and one condition
//! variable; the worker is the sole owner of frame data and run state, so
//! no locking around image buffers is ever needed.
//!
//! State machine: `Idle → Running ⇄ Paused → Stopping → Idle`.
//!
//! The worker suspends at exactly one point, the top of each cycle, and
//! checks the stop flag before each source within a cycle. A stop request
//! therefore interrupts between sources, never mid-frame, and a blocking
//! capture read bounds stop latency to one source-read timeout. Every
//! handle the worker owns is released by drop on every exit path.

use ab_glyph::FontArc;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::annotate::Annotator;
use crate::config::PipelineConfig;
use crate::detect::{DetectionEngine, EngineFactory};
use crate::ledger::TrackLedger;
use crate::record::RecordingSink;
use crate::source::{CaptureTarget, FrameSource, ReadOutcome, StagingArea};
use crate::stats::{RunStatistics, StatsAggregator};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Paused,
    Stopping,
}

/// Events pushed to the presentation boundary. Sends are fire-and-forget;
/// a vanished consumer never blocks or fails the worker.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    FrameReady {
        source_id: u32,
        frame: crate::frame::Frame,
    },
    Stats(RunStatistics),
    Log(String),
    Error(String),
}

// ----------------------------------------------------------------------------
// ControlGate: pause/stop flags shared with the worker
// ----------------------------------------------------------------------------

#[derive(Default)]
struct ControlFlags {
    paused: bool,
    stop: bool,
}

struct ControlGate {
    flags: Mutex<ControlFlags>,
    wakeup: Condvar,
}

impl ControlGate {
    fn new() -> Self {
        Self {
            flags: Mutex::new(ControlFlags::default()),
            wakeup: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlFlags> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cycle-top suspension point: blocks while paused, returns true when a
    /// stop was requested.
    fn pause_point(&self) -> bool {
        let mut flags = self.lock();
        while flags.paused && !flags.stop {
            flags = self
                .wakeup
                .wait(flags)
                .unwrap_or_else(|e| e.into_inner());
        }
        flags.stop
    }

    fn should_stop(&self) -> bool {
        self.lock().stop
    }

    fn set_paused(&self, paused: bool) {
        self.lock().paused = paused;
        self.wakeup.notify_all();
    }

    fn request_stop(&self) {
        self.lock().stop = true;
        self.wakeup.notify_all();
    }

    fn reset(&self) {
        let mut flags = self.lock();
        flags.paused = false;
        flags.stop = false;
    }
}

// ----------------------------------------------------------------------------
// Worker: the processing loop and everything it owns
// ----------------------------------------------------------------------------

struct SourceSlot {
    source: FrameSource,
    sink: Option<RecordingSink>,
    /// Set once a file source reports end of stream, so later cycles skip
    /// it without re-logging.
    exhausted: bool,
}

struct Worker {
    slots: Vec<SourceSlot>,
    engine: Box<dyn DetectionEngine>,
    annotator: Annotator,
    ledger: TrackLedger,
    stats: StatsAggregator,
    events: Sender<PipelineEvent>,
    gate: Arc<ControlGate>,
    confidence: f32,
    flagged_class: u32,
    frame_budget: Duration,
}

impl Worker {
    fn run(mut self) {
        self.emit_log(format!(
            "pipeline worker started: {} sources, {} engine",
            self.slots.len(),
            self.engine.name()
        ));
        if let Err(e) = self.process_loop() {
            log::error!("pipeline worker failed: {:#}", e);
            let _ = self
                .events
                .send(PipelineEvent::Error(format!("pipeline worker failed: {:#}", e)));
        }
        self.emit_log("pipeline worker stopped".to_string());
        // Sources, sinks and the engine are owned by this worker; dropping
        // it releases every handle on every exit path.
    }

    fn process_loop(&mut self) -> Result<()> {
        loop {
            if self.gate.pause_point() {
                return Ok(());
            }
            let cycle_start = Instant::now();
            self.stats.mark_cycle();

            for idx in 0..self.slots.len() {
                if self.gate.should_stop() {
                    return Ok(());
                }
                self.process_source(idx)?;
            }

            // Sleep off the remainder of the frame budget. This bounds the
            // polling rate for faster-than-real-time sources; a slow source
            // already consumed the budget and no sleep happens.
            if let Some(remaining) = self.frame_budget.checked_sub(cycle_start.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
    }

    /// One source, one frame, all stages. Read, inference, crop-write and
    /// recording failures are recoverable: logged, then processing moves
    /// on. Only unexpected failures propagate and end the run.
    fn process_source(&mut self, idx: usize) -> Result<()> {
        let (frame, live) = {
            let slot = &mut self.slots[idx];
            if slot.exhausted {
                return Ok(());
            }
            match slot.source.read() {
                Ok(ReadOutcome::Frame(frame)) => {
                    let live = slot.source.is_live();
                    (frame, live)
                }
                Ok(ReadOutcome::EndOfStream) => {
                    slot.exhausted = true;
                    let msg = format!("source {} reached end of stream", slot.source.id());
                    log::info!("{}", msg);
                    let _ = self.events.send(PipelineEvent::Log(msg));
                    return Ok(());
                }
                Err(e) => {
                    let msg =
                        format!("source {} frame read failed: {:#}", slot.source.id(), e);
                    log::warn!("{}", msg);
                    let _ = self.events.send(PipelineEvent::Log(msg));
                    return Ok(());
                }
            }
        };

        let detections = match self.engine.track(&frame, self.confidence) {
            Ok(detections) => Some(detections),
            Err(e) => {
                self.emit_warn(format!(
                    "inference failed on source {}: {:#}",
                    frame.source_id, e
                ));
                None
            }
        };

        // Failed inference passes the frame through unannotated.
        let mut annotated = match &detections {
            Some(detections) => self.annotator.annotate(&frame, detections),
            None => frame.clone(),
        };

        // Crops persist before the clock stamp: the overlay backing must
        // never appear in saved evidence.
        if let Some(detections) = &detections {
            let mut flagged_in_frame = 0u32;
            for det in detections {
                if det.class_id == self.flagged_class {
                    flagged_in_frame += 1;
                }
                let Some(job) =
                    self.ledger
                        .observe(frame.source_id, det, frame.width, frame.height)
                else {
                    continue;
                };
                match self.ledger.persist(job, &annotated) {
                    Ok(record) => {
                        let path = record.crop_path.clone();
                        self.stats.record_crop();
                        self.emit_log(format!("saved damaged crop {}", path.display()));
                    }
                    Err(e) => {
                        self.emit_warn(format!(
                            "crop write failed for source {} track {}: {:#}",
                            job.source_id, job.track_id, e
                        ));
                    }
                }
            }
            self.stats.record_frame(detections.len(), flagged_in_frame);
        }

        if live {
            self.annotator.stamp_clock(&mut annotated);
        }

        let mut sink_error = None;
        if let Some(sink) = self.slots[idx].sink.as_mut() {
            if let Err(e) = sink.write(&annotated) {
                sink_error = Some(e);
            }
        }
        if let Some(e) = sink_error {
            self.emit_warn(format!(
                "recording write failed on source {}: {:#}",
                frame.source_id, e
            ));
        }

        let source_id = frame.source_id;
        let _ = self.events.send(PipelineEvent::FrameReady {
            source_id,
            frame: annotated,
        });
        if detections.is_some() {
            let _ = self.events.send(PipelineEvent::Stats(self.stats.snapshot()));
        }
        Ok(())
    }

    fn emit_log(&self, msg: String) {
        log::info!("{}", msg);
        let _ = self.events.send(PipelineEvent::Log(msg));
    }

    fn emit_warn(&self, msg: String) {
        log::warn!("{}", msg);
        let _ = self.events.send(PipelineEvent::Log(msg));
    }
}

// ----------------------------------------------------------------------------
// PipelineController
// ----------------------------------------------------------------------------

pub struct PipelineController {
    config: PipelineConfig,
    factory: Box<dyn EngineFactory>,
    events: Sender<PipelineEvent>,
    gate: Arc<ControlGate>,
    worker: Option<JoinHandle<()>>,
    state: PipelineState,
}

impl PipelineController {
    /// Create a controller and the event receiver for the presentation
    /// boundary.
    pub fn new(
        config: PipelineConfig,
        factory: Box<dyn EngineFactory>,
    ) -> (Self, Receiver<PipelineEvent>) {
        let (events, receiver) = unbounded();
        let controller = Self {
            config,
            factory,
            events,
            gate: Arc::new(ControlGate::new()),
            worker: None,
            state: PipelineState::Idle,
        };
        (controller, receiver)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Start the pipeline. Valid only from `Idle`.
    ///
    /// Loads the engine, stages and opens every source, and creates
    /// recording sinks for live sources before spawning the worker. Any
    /// failure here aborts the start: the pipeline stays `Idle`, nothing is
    /// left open, and the error is surfaced to the presentation boundary.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(anyhow!("start is only valid while idle"));
        }

        let worker = match self.build_worker() {
            Ok(worker) => worker,
            Err(e) => {
                let _ = self
                    .events
                    .send(PipelineEvent::Error(format!("pipeline start failed: {:#}", e)));
                return Err(e);
            }
        };

        self.gate.reset();
        let handle = std::thread::Builder::new()
            .name("boltwatch-pipeline".to_string())
            .spawn(move || worker.run())
            .context("spawn pipeline worker")?;
        self.worker = Some(handle);
        self.state = PipelineState::Running;
        Ok(())
    }

    /// Flip between `Running` and `Paused`. Returns the new paused state.
    pub fn toggle_pause(&mut self) -> Result<bool> {
        match self.state {
            PipelineState::Running => {
                self.gate.set_paused(true);
                self.state = PipelineState::Paused;
                self.send_log("pipeline paused");
                Ok(true)
            }
            PipelineState::Paused => {
                self.gate.set_paused(false);
                self.state = PipelineState::Running;
                self.send_log("pipeline resumed");
                Ok(false)
            }
            _ => Err(anyhow!("pause toggle is only valid while running or paused")),
        }
    }

    /// Stop the pipeline. Valid from any non-`Idle` state, including while
    /// paused: the stop request wakes the suspended worker promptly.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == PipelineState::Idle {
            return Err(anyhow!("pipeline is not running"));
        }
        self.state = PipelineState::Stopping;
        self.gate.request_stop();

        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("pipeline worker panicked");
                let _ = self
                    .events
                    .send(PipelineEvent::Error("pipeline worker panicked".to_string()));
            }
        }

        self.gate.reset();
        self.state = PipelineState::Idle;
        self.send_log("pipeline stopped");
        Ok(())
    }

    fn build_worker(&self) -> Result<Worker> {
        // Every ordinal must be mapped before anything is opened.
        let mut origins = Vec::with_capacity(self.config.source_count);
        for ordinal in 0..self.config.source_count as u32 {
            let spec = self
                .config
                .sources
                .get(&ordinal)
                .ok_or_else(|| anyhow!("source ordinal {} is not mapped", ordinal))?;
            origins.push(spec.to_origin());
        }

        let engine = self
            .factory
            .load(&self.config.model_path, self.config.iou_threshold)
            .context("load detection model")?;
        self.send_log(&format!(
            "model loaded: {} ({} engine)",
            self.config.model_path,
            engine.name()
        ));

        let staging = StagingArea::create(&self.config.work_dir)?;
        let target = CaptureTarget::default();
        let mut slots = Vec::with_capacity(origins.len());
        for (ordinal, origin) in origins.into_iter().enumerate() {
            let source = FrameSource::open(ordinal as u32, origin, &staging, target)?;
            let sink = self.open_sink(&source, &staging);
            slots.push(SourceSlot {
                source,
                sink,
                exhausted: false,
            });
        }
        self.send_log(&format!("{} sources opened", slots.len()));

        let ledger = TrackLedger::new(&self.config.crop_dir, self.config.flagged_class)?;
        let annotator = Annotator::new(
            self.load_font(),
            self.config.class_names.clone(),
            self.config.flagged_class,
        );
        let stats = StatsAggregator::new(self.config.fps_mode, self.config.confidence_threshold);

        Ok(Worker {
            slots,
            engine,
            annotator,
            ledger,
            stats,
            events: self.events.clone(),
            gate: Arc::clone(&self.gate),
            confidence: self.config.confidence_fraction(),
            flagged_class: self.config.flagged_class,
            frame_budget: Duration::from_secs(1) / CaptureTarget::default().fps,
        })
    }

    /// Recording is non-fatal: a sink that fails to open disables recording
    /// for that source for the whole run.
    fn open_sink(&self, source: &FrameSource, staging: &StagingArea) -> Option<RecordingSink> {
        if !source.is_live() || !self.config.record {
            return None;
        }
        let negotiated = source.negotiated();
        let fps = if negotiated.fps == 0 { 30 } else { negotiated.fps };
        match RecordingSink::create(
            staging.dir(),
            source.id(),
            fps,
            negotiated.width,
            negotiated.height,
        ) {
            Ok(sink) => Some(sink),
            Err(e) => {
                log::warn!(
                    "recording disabled for source {}: {:#}",
                    source.id(),
                    e
                );
                let _ = self.events.send(PipelineEvent::Log(format!(
                    "recording disabled for source {}",
                    source.id()
                )));
                None
            }
        }
    }

    fn load_font(&self) -> Option<FontArc> {
        let path = self.config.font_path.as_ref()?;
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("overlay font {} unreadable: {}", path.display(), e);
                return None;
            }
        };
        match FontArc::try_from_vec(bytes) {
            Ok(font) => Some(font),
            Err(e) => {
                log::warn!("overlay font {} invalid: {}", path.display(), e);
                None
            }
        }
    }

    fn send_log(&self, msg: &str) {
        log::info!("{}", msg);
        let _ = self.events.send(PipelineEvent::Log(msg.to_string()));
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        // A dropped controller must not leak a running worker.
        if self.worker.is_some() {
            let _ = self.stop();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
