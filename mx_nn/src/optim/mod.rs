//! Parameter updaters.

mod sgd;

pub use sgd::Sgd;
