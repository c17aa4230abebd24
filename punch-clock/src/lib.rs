//! punch-clock library crate.
//!
//! Schedules the daily clock-in and clock-out punches, retries them behind a
//! circuit breaker and reports every outcome to webhook providers.

pub mod action;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod notification;
pub mod resilience;
pub mod scheduler;
pub mod utils;

pub use error::{Error, Result};
