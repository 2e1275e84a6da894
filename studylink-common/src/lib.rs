//! # Studylink Common Library
//!
//! Shared code for the studylink crates:
//! - Error type and `Result` alias
//! - Configuration loading (TOML file + environment overrides)
//! - Progress event wire type and SSE framing

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
