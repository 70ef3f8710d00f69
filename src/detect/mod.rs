//! Detection-and-tracking engine boundary.

mod backends;
mod engine;
mod result;

pub use backends::StubEngine;
#[cfg(feature = "backend-tract")]
pub use backends::TractEngine;
pub use engine::{DefaultEngineFactory, DetectionEngine, EngineFactory};
pub use result::{non_max_suppression, BBox, Detection};
