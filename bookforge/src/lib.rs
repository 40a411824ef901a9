//! bookforge: a priority-driven batch runner for multi-stage audiobook
//! conversion jobs.

pub mod config;
pub mod error;
pub mod logging;
pub mod runner;
pub mod simulate;
pub mod store;

pub use error::{Error, Result};
