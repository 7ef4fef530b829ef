//! Shared test utilities for cityweather integration tests.
//!
//! This module provides:
//! - `TestHarness`, a fully wired service over an in-memory database, a
//!   scripted weather provider and a manual clock
//! - `ConfigBuilder` for fast, deterministic pipeline settings

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{ScriptedProvider, TestHarness};
