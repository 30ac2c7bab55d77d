//! Test utilities shared by the unit tests
//!
//! Fixtures for domain entities plus helpers for driving paused tokio time.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
