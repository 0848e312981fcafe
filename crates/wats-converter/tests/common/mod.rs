//! Shared test utilities for wats-converter integration tests.
//!
//! This module provides:
//! - `TestHarness` with isolated watch/archive/error/queue folders
//! - `MockSubmitter` and `mock_factory` standing in for the server API and
//!   the converter plugins
//! - Builder patterns for converter settings

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::*;
