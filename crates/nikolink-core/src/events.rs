//! Asynchronous bus event types.
//!
//! Events are emitted by the protocol engine through a
//! [`tokio::sync::broadcast`] channel whenever bus activity is observed:
//! button presses, feedback answers, connection state changes. Host
//! adapters subscribe to these events instead of polling.

use chrono::{DateTime, Utc};

use crate::types::{ButtonAddress, Group, ModuleAddress};

/// Phase of a button press cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressState {
    Pressed,
    Released,
    Timer,
}

/// Observation data attached to every button lifecycle event.
///
/// `duration_s`, `bucket`, and `threshold_s` are populated only for the
/// event kinds they apply to; an initial `pressed` carries none of them.
#[derive(Debug, Clone)]
pub struct ButtonEvent {
    /// The 6-hex-character button address.
    pub address: ButtonAddress,
    /// The module this button impacts, when the configuration maps the
    /// button to exactly one module.
    pub module_address: Option<ModuleAddress>,
    /// The channel driven by this button, when configured.
    pub channel: Option<u8>,
    /// Wall-clock time the event was emitted.
    pub ts: DateTime<Utc>,
    /// Identifier shared by every event of one press cycle.
    pub press_id: u64,
    /// Which phase of the cycle this event belongs to.
    pub state: PressState,
    /// Press duration in seconds; set on release-derived events.
    pub duration_s: Option<f64>,
    /// Whole-second duration bucket, clamped to 0..=3.
    pub bucket: Option<u8>,
    /// Hold-timer milestone in seconds (1..=3) for timer events.
    pub threshold_s: Option<u8>,
}

/// Follow-up data emitted once a button's post-release module refresh has
/// completed.
#[derive(Debug, Clone)]
pub struct ButtonOperation {
    pub button: ButtonAddress,
    pub module: ModuleAddress,
    pub group: Group,
    /// The button's own shutter travel override, if configured.
    pub operation_time_s: Option<f64>,
    pub press_id: u64,
    pub ts: DateTime<Utc>,
}

/// An event emitted by the protocol engine when bus activity is observed.
///
/// Subscribe via the gateway's `subscribe()`. Events are delivered on a
/// best-effort basis through a bounded broadcast channel; slow consumers
/// may miss events under heavy load (e.g. a held button repeating on the
/// bus).
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A button press cycle started.
    ButtonPressed(ButtonEvent),

    /// A button press cycle ended (release detected).
    ButtonReleased(ButtonEvent),

    /// The release was shorter than the long-press threshold.
    ShortButtonPressed(ButtonEvent),

    /// The release was at or beyond the long-press threshold.
    LongButtonPressed(ButtonEvent),

    /// Whole-second duration classification (`bucket` is 0..=3).
    ButtonPressedBucket(ButtonEvent),

    /// A hold-timer milestone fired while the button was still held
    /// (`threshold_s` is 1..=3).
    ButtonTimer(ButtonEvent),

    /// The post-release refresh of an impacted module completed.
    ButtonOperation(ButtonOperation),

    /// A button not present in the configuration was observed. The host
    /// may want to append it to its button config file; the engine itself
    /// persists nothing.
    ButtonDiscovered { address: ButtonAddress },

    /// A module's cached output state was updated from an answer frame.
    Refreshed { module: ModuleAddress },

    /// The link (re)connected and the handshake completed.
    Connected,

    /// The link to the bus was lost.
    Disconnected,

    /// Attempting to reconnect after a connection loss.
    Reconnecting {
        /// The reconnection attempt number (1-based).
        attempt: u32,
    },
}
