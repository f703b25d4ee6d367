//! Configuration module
//!
//! Handles loading gateway configuration from disk.

mod gateway;

pub use gateway::*;
