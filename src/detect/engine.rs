//! Inference collaborator boundary.
//!
//! The pipeline treats detection-and-tracking as an external engine behind
//! two small traits:
//!
//! - `DetectionEngine`: per-frame `track()` calls. A failing call is
//!   recoverable; the frame is passed through unannotated.
//! - `EngineFactory`: loads the engine from a model artifact at pipeline
//!   start. A failing load is fatal to `start()`.
//!
//! The engine handle is owned by the pipeline worker alone, created at
//! `start()` and dropped at `stop()`. There is no shared or global model
//! state.

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::detect::backends::StubEngine;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detection-and-tracking engine.
///
/// Implementations MUST NOT mutate the input frame and MUST return only
/// detections at or above the supplied confidence threshold.
pub trait DetectionEngine: Send {
    /// Engine identifier for logs.
    fn name(&self) -> &'static str;

    /// Run detection and track association on one frame.
    ///
    /// `confidence_threshold` is a fraction in `[0, 1]`. May return an empty
    /// list. A returned error is recoverable at the pipeline level.
    fn track(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>>;
}

impl std::fmt::Debug for dyn DetectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

/// Loads a `DetectionEngine` from a model artifact path.
pub trait EngineFactory: Send {
    fn load(&self, model_path: &str, iou_threshold: f32) -> Result<Box<dyn DetectionEngine>>;
}

/// Default factory used by the daemon.
///
/// - `stub://...` paths load the synthetic `StubEngine` (parameters come
///   from the URL query).
/// - Filesystem paths load the tract ONNX engine when the `backend-tract`
///   feature is enabled; otherwise loading fails.
///
/// A missing model artifact is always a load error.
pub struct DefaultEngineFactory;

impl EngineFactory for DefaultEngineFactory {
    fn load(&self, model_path: &str, iou_threshold: f32) -> Result<Box<dyn DetectionEngine>> {
        if model_path.starts_with("stub://") {
            return Ok(Box::new(StubEngine::from_url(model_path)?));
        }

        let path = Path::new(model_path);
        if !path.is_file() {
            return Err(anyhow!("model artifact not found: {}", path.display()));
        }

        #[cfg(feature = "backend-tract")]
        {
            let engine = crate::detect::backends::TractEngine::load(path, iou_threshold)?;
            Ok(Box::new(engine))
        }
        #[cfg(not(feature = "backend-tract"))]
        {
            let _ = iou_threshold;
            Err(anyhow!(
                "loading {} requires the backend-tract feature",
                path.display()
            ))
        }
    }
}
