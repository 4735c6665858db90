//! Shared building blocks for the FalconDB distributed insert queue:
//! identifiers, row values, configuration and the error taxonomy.

pub mod config;
pub mod datum;
pub mod error;
pub mod types;
