mod stub;
#[cfg(feature = "backend-tract")]
mod tract;

pub use stub::StubEngine;
#[cfg(feature = "backend-tract")]
pub use tract::TractEngine;
