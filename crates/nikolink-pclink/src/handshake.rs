//! Link handshake: wake the interface and enter echo mode.
//!
//! After the physical link is up, four fixed frames are sent in order:
//!
//! ```text
//! ++++\r              wake / attention
//! ATH0\r              modem-style hang-up neutraliser for bridges
//! ATZ\r               modem-style reset neutraliser
//! $10110000B8CF9D\r   put the bus into echo mode
//! ```
//!
//! No correlated response is required; the bus just needs a moment to
//! settle after each frame. Echo mode is what makes ACK correlation
//! possible: once entered, the interface echoes accepted commands back.
//!
//! The handshake is replayed on every reconnect.

use std::time::Duration;

use nikolink_core::error::Result;
use nikolink_core::transport::Transport;

/// The fixed handshake sequence, in transmit order (CRs appended on send).
pub const HANDSHAKE_FRAMES: [&str; 4] = ["++++", "ATH0", "ATZ", "$10110000B8CF9D"];

/// Default settle delay after each handshake frame.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

/// Run the handshake on an open transport.
pub async fn perform(transport: &mut dyn Transport, settle: Duration) -> Result<()> {
    for frame in HANDSHAKE_FRAMES {
        tracing::debug!(frame, "Handshake");
        let mut line = frame.as_bytes().to_vec();
        line.push(b'\r');
        transport.send(&line).await?;
        tokio::time::sleep(settle).await;
    }
    tracing::info!("Handshake complete, bus in echo mode");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::validate_frame;

    #[test]
    fn echo_mode_frame_is_valid() {
        let valid = validate_frame(HANDSHAKE_FRAMES[3]).unwrap();
        assert_eq!(valid.func_code(), 0x11);
    }

    #[test]
    fn frame_order_is_fixed() {
        assert_eq!(
            HANDSHAKE_FRAMES,
            ["++++", "ATH0", "ATZ", "$10110000B8CF9D"]
        );
    }
}
