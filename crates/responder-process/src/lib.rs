//! # Responder Process
//!
//! Low-level process operations for the responder.
//!
//! This crate provides Unix primitives for:
//! - Process spawning with argv, environment and working directory
//! - Forced termination (SIGKILL)
//! - Non-blocking reaping with exit classification

pub mod execute;
pub mod terminate;
pub mod wait;

// Re-export main types
pub use execute::*;
pub use terminate::*;
pub use wait::*;
