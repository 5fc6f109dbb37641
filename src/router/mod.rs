//! Provider registry, routing, and health accounting.

pub mod manager;
pub mod stats;

pub use manager::LlmManager;
pub use stats::{ProviderStats, StatsSnapshot};
