//! nikolink-test-harness: Mock transports for deterministic testing of
//! the protocol engine.
//!
//! This crate provides [`MockLink`] for unit testing the PC-Link engine
//! without real hardware: scripted request/response pairs, unsolicited
//! frame injection (button presses, feedback answers), and full capture
//! of everything the engine transmits.

pub mod mock_link;

pub use mock_link::{MockBus, MockLink};
