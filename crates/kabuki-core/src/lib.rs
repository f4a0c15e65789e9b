//! kabuki-core: Core types for the kabuki batch scheduler
//!
//! This crate provides the fundamental types used throughout kabuki:
//! - Machine records and their lookup
//! - Scheduler and logging configuration
//! - Resource readings produced by the host probe
//! - Jobs, requirements and batch parsing
//! - Error handling

pub mod config;
pub mod error;
pub mod job;
pub mod resources;

pub use config::*;
pub use error::*;
pub use job::*;
pub use resources::*;
