//! nikolink-pclink: the Nikobus PC-Link protocol engine.
//!
//! This crate turns a byte-level [`Transport`](nikolink_core::Transport)
//! into a live gateway onto a Nikobus installation:
//!
//! - [`protocol`] -- the `$` frame codec (two CRCs, builder, validator)
//!   and the `#N` button frames;
//! - [`commands`] -- module command construction and ACK/answer signals;
//! - [`handshake`] -- the fixed wake / echo-mode sequence;
//! - a link IO task owning the transport, with reconnect + backoff;
//! - a listener routing traffic into button, response, feedback, and
//!   inventory lanes;
//! - a paced command scheduler with three-strike retry;
//! - [`state`] -- the in-memory output-state mirror;
//! - [`cover`] -- time-based position estimation for roller shutters;
//! - [`button`] -- the press / hold / release lifecycle machine;
//! - [`discovery`] -- the optional inventory message catalog;
//! - [`Gateway`] / [`GatewayBuilder`] -- the facade the host calls.
//!
//! # Quick start
//!
//! ```no_run
//! use nikolink_pclink::GatewayBuilder;
//! use nikolink_core::BusConfig;
//!
//! # async fn example(config: BusConfig) -> nikolink_core::Result<()> {
//! let gateway = GatewayBuilder::new(config)
//!     .connection_string("/dev/ttyUSB0")
//!     .build()
//!     .await?;
//!
//! let module = "4707".parse().unwrap();
//! gateway.turn_on_switch(module, 1).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod button;
pub mod commands;
pub mod cover;
pub mod discovery;
pub mod gateway;
pub mod handshake;
pub mod protocol;
pub mod state;

mod io;
mod listener;
mod scheduler;

pub use builder::GatewayBuilder;
pub use button::ButtonSettings;
pub use cover::PositionEstimator;
pub use discovery::{DeviceCategory, DeviceType, DiscoveredDevice, SweepKind};
pub use gateway::Gateway;
pub use scheduler::SchedulerSettings;
pub use state::StateCache;
