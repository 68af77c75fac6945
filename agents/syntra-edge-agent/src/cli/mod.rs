//! CLI support
//!
//! Configuration file handling for the agent binary.

pub mod config;

pub use config::Config;
