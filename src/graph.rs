mod model;
mod projection;
mod sync;
mod types;

pub use projection::{CanvasProjection, JsonLinesProjection};
#[cfg(test)]
pub use projection::{ProjectionOp, Recorder};
pub use sync::GraphSynchronizer;
pub use types::*;
