#![forbid(unsafe_code)]

//! Core: dispatch queue, configuration, errors, and logging setup.

pub mod config;
pub mod dispatch;
pub mod error;
#[cfg(feature = "tracing-json")]
pub mod logging;

pub use error::{Error, Result};
