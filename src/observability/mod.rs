//! Observability
//!
//! Structured logging setup and span macros shared by the transport and
//! stream layers.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

pub use logging::{mqtt_span, topic_span};
