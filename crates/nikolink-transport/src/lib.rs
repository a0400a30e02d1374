//! nikolink-transport: Serial and TCP transport implementations.
//!
//! A Nikobus PC-Link interface is reached either directly over a serial
//! port (9600 baud) or through a transparent serial-over-TCP bridge. Both
//! paths implement the [`Transport`](nikolink_core::Transport) trait from
//! `nikolink-core`.
//!
//! [`open_link`] picks the right transport from a connection string:
//! device paths (`/dev/ttyUSB0`, `COM3`) open a serial port, `host:port`
//! strings open a TCP connection.

pub mod serial;
pub mod tcp;

pub use serial::{SerialConfig, SerialLink};
pub use tcp::TcpLink;

use nikolink_core::error::{Error, Result};
use nikolink_core::transport::Transport;

/// Baud rate of the PC-Link serial interface.
pub const PCLINK_BAUD_RATE: u32 = 9600;

/// Open a transport from a connection string.
///
/// - `/dev/ttyUSB0`, `/dev/serial/by-id/...`, `COM3` -- serial at 9600 8N1
/// - `192.168.1.50:9999`, `bridge.local:9999` -- TCP
///
/// # Example
///
/// ```no_run
/// # async fn example() -> nikolink_core::Result<()> {
/// let link = nikolink_transport::open_link("/dev/ttyUSB0").await?;
/// # Ok(())
/// # }
/// ```
pub async fn open_link(connection_string: &str) -> Result<Box<dyn Transport>> {
    if looks_like_serial(connection_string) {
        let link = SerialLink::open(connection_string, PCLINK_BAUD_RATE).await?;
        Ok(Box::new(link))
    } else if connection_string.contains(':') {
        let link = TcpLink::connect(connection_string).await?;
        Ok(Box::new(link))
    } else {
        Err(Error::TransportUnavailable(format!(
            "unrecognized connection string: {connection_string}"
        )))
    }
}

/// Heuristic matching the device-path shapes a PC-Link shows up as.
fn looks_like_serial(s: &str) -> bool {
    s.starts_with("/dev/") || (s.starts_with("COM") && s[3..].chars().all(|c| c.is_ascii_digit()))
}
