//! # Trapdoor Utilities
//!
//! Shared helpers for the trapdoor workspace, currently the `tracing`
//! subscriber setup used by tools and integration tests.

pub mod logging;

pub use logging::{init_logging, init_logging_with_level, init_test_logging, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
