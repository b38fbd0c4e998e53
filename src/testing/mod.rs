//! Testing utilities and mock implementations
//!
//! This module provides a scripted [`MockManagedClient`] so the stream adapter
//! can be exercised without an MQTT broker.

pub mod mocks;

pub use mocks::*;
