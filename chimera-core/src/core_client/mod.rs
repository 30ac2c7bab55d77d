//! Application root
//!
//! [`ChimeraClient`] constructs and owns every component of one client
//! instance and exposes the login, logout and navigation entry points.

pub mod client;
pub mod errors;

pub use client::ChimeraClient;
pub use errors::{ClientError, ClientResult};
