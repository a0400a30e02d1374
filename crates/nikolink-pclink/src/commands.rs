//! Module command construction and ACK/answer correlation signals.
//!
//! A PC-Link command addressed to a module is answered twice on the
//! half-duplex bus: first the interface acknowledges the command
//! (`$05` + function code), then the module's state answer follows as a
//! separate frame. Which answer prefix to expect depends on the command
//! family:
//!
//! | Command frame | ACK      | Answer prefix            |
//! |---------------|----------|--------------------------|
//! | `$1E…` write  | `$05` + func | `$0EFF` + swapped address |
//! | `$10…` read   | `$05` + func | `$1C` + swapped address   |
//!
//! The answer carries the 6 state bytes of the addressed group as 12 hex
//! chars, two chars after the matched signal.

use nikolink_core::types::{Group, ModuleAddress};

use crate::protocol::{self, ValidFrame};

/// Function codes of the PC-Link command set.
pub mod func {
    /// Read output state, group 1.
    pub const READ_GROUP1: u8 = 0x12;
    /// Read output state, group 2.
    pub const READ_GROUP2: u8 = 0x17;
    /// Write output state, group 1.
    pub const WRITE_GROUP1: u8 = 0x15;
    /// Write output state, group 2.
    pub const WRITE_GROUP2: u8 = 0x16;
    /// Handshake: put the bus interface into echo mode.
    pub const SET_ECHO_MODE: u8 = 0x10;
    /// Feedback-module refresh / discovery variants.
    pub const FEEDBACK: u8 = 0x05;
}

/// Prefix of acknowledgement tokens emitted by the interface.
pub const ACK_PREFIX: &str = "$05";

/// ACK tokens of the two manual refresh (read) commands; observing one
/// also tells the listener which group the next `$1C` answer describes.
pub const REFRESH_ACK_GROUP1: &str = "$0512";
pub const REFRESH_ACK_GROUP2: &str = "$0517";

/// Prefix of a feedback/state answer frame.
pub const FEEDBACK_ANSWER_PREFIX: &str = "$1C";

/// Prefix of a write-command answer.
pub const WRITE_ANSWER_PREFIX: &str = "$0EFF";

/// Prefix under which the interface reports its own address.
pub const CONTROLLER_ADDRESS_PREFIX: &str = "$18";

/// Number of state chars carried by an answer (6 bytes).
const ANSWER_STATE_CHARS: usize = 12;

/// Chars between a matched answer signal and the state field.
const ANSWER_STATE_SKIP: usize = 2;

/// The function code that reads one group's state.
pub fn read_func(group: Group) -> u8 {
    match group {
        Group::One => func::READ_GROUP1,
        Group::Two => func::READ_GROUP2,
    }
}

/// The function code that writes one group's state.
pub fn write_func(group: Group) -> u8 {
    match group {
        Group::One => func::WRITE_GROUP1,
        Group::Two => func::WRITE_GROUP2,
    }
}

/// Build a read-state command for one group of a module.
pub fn read_command(addr: ModuleAddress, group: Group) -> String {
    protocol::build_command(read_func(group), addr, &[])
}

/// Build a write-state command carrying a full group image plus the 0xFF
/// trailer byte the modules expect.
pub fn write_command(addr: ModuleAddress, group: Group, values: [u8; 6]) -> String {
    let mut args = [0xFFu8; 7];
    args[..6].copy_from_slice(&values);
    protocol::build_command(write_func(group), addr, &args)
}

/// The ACK token and answer signal to install before transmitting `frame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationSignals {
    /// Matched as a substring of incoming lines.
    pub ack: String,
    /// Matched as a substring; the state field follows it.
    pub answer: String,
}

/// Derive the correlation signals for a built command frame.
///
/// The ACK echoes the function code: `$05` + chars 3-4 of the frame. The
/// answer prefix depends on the frame's length prefix (`$1E` for writes,
/// `$10`/`$05` for reads) followed by the byte-swapped module address.
pub fn correlation_signals(frame: &str, addr: ModuleAddress) -> CorrelationSignals {
    let command_part = frame.get(3..5).unwrap_or("");
    let ack = format!("{ACK_PREFIX}{command_part}");

    let answer_prefix = match frame.get(0..3) {
        Some("$1E") => WRITE_ANSWER_PREFIX,
        Some("$05") | Some("$10") => FEEDBACK_ANSWER_PREFIX,
        _ => FEEDBACK_ANSWER_PREFIX,
    };
    let answer = format!("{answer_prefix}{}", addr.wire_hex());

    CorrelationSignals { ack, answer }
}

/// Extract the 6 state bytes that follow a matched answer signal.
///
/// The state field starts two chars after the signal (a status byte sits
/// between the address and the state).
pub fn extract_answer_state(message: &str, answer_signal: &str) -> Option<[u8; 6]> {
    let at = message.find(answer_signal)?;
    let start = at + answer_signal.len() + ANSWER_STATE_SKIP;
    let hex = message.get(start..start + ANSWER_STATE_CHARS)?;
    let bytes = protocol::hex_to_bytes(hex)?;
    let mut state = [0u8; 6];
    state.copy_from_slice(&bytes);
    Some(state)
}

/// Parse a validated `$1C` feedback answer into its module address and
/// 6 state bytes.
///
/// The answer's payload is `addr_lo addr_hi status s0..s5`; the group is
/// not encoded and must be inferred from the preceding refresh ACK.
pub fn parse_feedback_answer(frame: &ValidFrame) -> Option<(ModuleAddress, [u8; 6])> {
    if !frame.as_str().starts_with(FEEDBACK_ANSWER_PREFIX) {
        return None;
    }
    let payload = frame.payload();
    if payload.len() < 18 {
        return None;
    }
    let addr = ModuleAddress::from_wire_hex(&payload[0..4]).ok()?;
    let bytes = protocol::hex_to_bytes(&payload[6..18])?;
    let mut state = [0u8; 6];
    state.copy_from_slice(&bytes);
    Some((addr, state))
}
