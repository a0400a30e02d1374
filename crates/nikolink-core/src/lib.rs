//! nikolink-core: Core traits, types, and error definitions for nikolink.
//!
//! This crate defines the transport-agnostic abstractions the protocol
//! engine is built on. Host adapters depend on these types without pulling
//! in the PC-Link engine or any concrete transport.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel to the bus interface
//! - [`BusEvent`] -- asynchronous bus activity notifications
//! - [`BusConfig`] -- structured module / button / scene configuration
//! - [`Error`] / [`Result`] -- error handling

pub mod config;
pub mod error;
pub mod events;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use nikolink_core::*`.
pub use config::{
    BusConfig, ButtonConfig, ChannelConfig, ImpactedModule, ModuleConfig, ModuleRegistry,
    SceneChannel, SceneConfig,
};
pub use error::{Error, FrameRejectReason, Result};
pub use events::{BusEvent, ButtonEvent, ButtonOperation, PressState};
pub use transport::Transport;
pub use types::*;
