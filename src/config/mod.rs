//! Configuration module
//!
//! Handles loading relay settings from disk.

mod settings;

pub use settings::*;
