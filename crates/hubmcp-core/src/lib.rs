//! HubMCP Core - Platform-independent abstractions and configurations
//!
//! This crate provides the service descriptors, configuration, error types,
//! process traits and push-stream event framing that are shared by the
//! supervisor, the platform-specific process managers and the service hosts.

pub mod config;
pub mod error;
pub mod event;
pub mod process;
pub mod stdio;

pub use config::*;
pub use error::*;
pub use event::*;
pub use process::*;
pub use stdio::*;
