//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for testing device ingestion
//! without requiring an MQTT broker.

pub mod mocks;

pub use mocks::*;
