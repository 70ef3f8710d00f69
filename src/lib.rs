//! boltwatch: multi-source damaged-bolt inspection pipeline.
//!
//! Frames from video files and cameras run through a detection-and-tracking
//! engine; flagged detections are overlaid on the frames, the first sight
//! of every damaged track is persisted as a padded crop, and live sources
//! can be recorded with their annotations burned in.
//!
//! Module map:
//! - [`frame`]: the RGB frame type passed between stages
//! - [`source`]: capture sources (files, cameras, synthetic stand-ins) and
//!   the per-run staging area
//! - [`detect`]: engine traits, detection/bbox types, NMS, backends
//! - [`annotate`]: bounding-box and label overlays, live clock stamp
//! - [`ledger`]: at-most-once crop persistence per damaged track
//! - [`record`]: annotated MJPEG recording for live sources
//! - [`stats`]: run-wide counters and fps estimation
//! - [`config`]: TOML + environment configuration
//! - [`pipeline`]: the worker thread and its controller
//!
//! The pipeline runs entirely on one worker thread that owns every capture
//! handle, the engine, the ledger and the sinks; callers interact through
//! [`pipeline::PipelineController`] and consume [`pipeline::PipelineEvent`]s
//! from a channel.

pub mod annotate;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ledger;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod stats;

pub use config::PipelineConfig;
pub use detect::{DefaultEngineFactory, Detection, DetectionEngine, EngineFactory};
pub use frame::Frame;
pub use pipeline::{PipelineController, PipelineEvent, PipelineState};
pub use stats::RunStatistics;
