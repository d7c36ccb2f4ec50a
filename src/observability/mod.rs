//! Observability infrastructure
//!
//! Structured logging setup; spans for distribution and adapter work are
//! provided as macros so call sites stay terse.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};
