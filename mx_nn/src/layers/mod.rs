//! Layer constructors: each returns a composed symbol whose parameters
//! appear as arguments named after the layer.

mod batch_norm;
mod fully_connected;
mod mlp;

pub use batch_norm::{batch_norm, BatchNormParams};
pub use fully_connected::fully_connected;
pub use mlp::mlp;
