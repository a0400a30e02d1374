//! Transport trait for bus communication.
//!
//! The [`Transport`] trait abstracts over the physical link to a Nikobus
//! PC-Link interface. Implementations exist for serial ports (direct
//! PC-Link connection) and TCP sockets (transparent serial-over-TCP
//! bridges), plus mock transports for testing.
//!
//! The protocol engine in `nikolink-pclink` operates on a `Transport`
//! rather than directly on a serial port, enabling both real hardware
//! control and deterministic unit testing with `MockLink` from the
//! `nikolink-test-harness` crate.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to the bus interface.
///
/// Implementations handle buffering and error recovery at the physical
/// layer. Protocol-level concerns (CR framing, CRC validation, command
/// pacing) are handled by the engine that consumes this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the bus interface.
    ///
    /// Implementations should block until all bytes have been written to
    /// the underlying transport (serial TX buffer, TCP socket, etc.).
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the bus interface into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if no data is received within the deadline, and
    /// [`Error::TransportLost`](crate::error::Error::TransportLost) when the
    /// peer has gone away.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
