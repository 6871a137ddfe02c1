//! Core types and utilities for the chest disease classifier pipeline.
//!
//! This crate provides the error type, configuration records, file helpers,
//! logging setup and backend selection shared by every pipeline stage.

pub mod backend;
pub mod common;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use backend::*;
pub use common::*;
pub use config::*;
pub use error::{Error, Result};
pub use logging::*;
pub use types::*;

