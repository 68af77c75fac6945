//! Docker Runtime Module
//!
//! Provides the Docker implementation of the RuntimeInfoProvider and
//! LogsProvider traits.

pub mod adapter;

pub use adapter::DockerRuntime;
