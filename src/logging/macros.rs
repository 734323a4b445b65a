//! Re-exports of the tracing macros used throughout the crate.
//!
//! Modules write `use crate::logging::{debug, trace};` instead of
//! importing `tracing` directly, keeping the logging backend swappable.

pub use tracing::{debug, error, info, trace, warn};
