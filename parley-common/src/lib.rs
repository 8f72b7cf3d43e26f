//! Shared foundations for the Parley chat backend.
//!
//! This crate holds the pieces every service layer needs: the unified
//! error type with HTTP status mapping, environment-driven configuration,
//! and logging initialization.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{Error, Result};
