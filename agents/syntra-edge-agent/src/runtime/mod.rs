//! Runtime module
//!
//! This module provides abstraction over the module runtime through the
//! RuntimeInfoProvider trait, with a Docker implementation.

pub mod adapter;
pub mod docker;
