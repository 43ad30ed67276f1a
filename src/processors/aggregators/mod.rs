//! Stateful aggregators: a two-state gate and notifier-released holds

pub mod gated;
pub mod hold;

pub use gated::{ClosedPolicy, FramePredicate, GatedAggregator};
pub use hold::{HoldAggregator, HoldMode};
