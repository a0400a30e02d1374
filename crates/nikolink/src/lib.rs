//! # nikolink -- Async Nikobus Gateway
//!
//! `nikolink` is an asynchronous Rust library for talking to a **Nikobus**
//! domotic bus through a PC-Link interface, either over a directly
//! attached serial port or a transparent serial-over-TCP bridge. It is
//! designed as the protocol engine under a home-automation host: it keeps
//! the link alive, translates switch / dimmer / shutter verbs into framed
//! bus commands, observes wall-button activity, and maintains an
//! in-memory mirror of every module's output state for synchronous reads.
//!
//! ## Quick Start
//!
//! Add `nikolink` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! nikolink = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Connect and flip a relay:
//!
//! ```no_run
//! use nikolink::{BusConfig, GatewayBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config: BusConfig = serde_json::from_str(&std::fs::read_to_string(
//!         "nikobus_config.json",
//!     )?)?;
//!
//!     let gateway = GatewayBuilder::new(config)
//!         .connection_string("/dev/ttyUSB0")
//!         .build()
//!         .await?;
//!
//!     let module = "4707".parse()?;
//!     gateway.turn_on_switch(module, 1).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized as a workspace of focused crates:
//!
//! | Crate                   | Purpose                                         |
//! |-------------------------|-------------------------------------------------|
//! | `nikolink-core`         | Transport trait, types, config, events, errors  |
//! | `nikolink-transport`    | Serial and TCP transport implementations        |
//! | `nikolink-pclink`       | The PC-Link protocol engine                     |
//! | `nikolink-test-harness` | Mock transports for deterministic tests         |
//! | **`nikolink`**          | This facade crate -- re-exports everything      |
//!
//! ## Event Subscription
//!
//! The engine emits [`BusEvent`]s through a broadcast channel: button
//! lifecycle events (pressed, hold milestones, released, short/long
//! classification), state refreshes, and connection changes.
//!
//! ```no_run
//! use nikolink::{BusEvent, Gateway};
//! # async fn example(gateway: &Gateway) {
//! let mut events = gateway.subscribe();
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         BusEvent::ButtonPressed(ev) => println!("pressed: {}", ev.address),
//!         BusEvent::Refreshed { module } => println!("refreshed: {module}"),
//!         other => println!("{other:?}"),
//!     }
//! }
//! # }
//! ```
//!
//! ## Testing without hardware
//!
//! The `nikolink-test-harness` crate provides a `MockLink` transport with
//! scripted responses and unsolicited frame injection; build against it
//! with [`GatewayBuilder::build_with_link`].

pub use nikolink_core::*;

pub use nikolink_pclink::{
    Gateway, GatewayBuilder, PositionEstimator, SchedulerSettings, StateCache,
};

/// The PC-Link protocol engine: codec, commands, handshake, discovery.
pub mod pclink {
    pub use nikolink_pclink::*;
}

/// Serial and TCP transports, and connection-string dispatch.
pub mod transport {
    pub use nikolink_transport::*;
}
