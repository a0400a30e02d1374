//! Core types used throughout nikolink.
//!
//! These types model the Nikobus data plane: module and button addresses,
//! output groups, the 12-byte output state vector, and cover motion.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 2-byte Nikobus module address.
///
/// Displayed as 4 uppercase hex characters in the order users see on the
/// module label (e.g. `"4707"`). On the wire the two bytes are swapped
/// (little-endian, low byte first): `4707` is transmitted as `0747`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleAddress(u16);

impl ModuleAddress {
    /// Create an address from its numeric value.
    pub fn new(raw: u16) -> Self {
        ModuleAddress(raw)
    }

    /// Parse an address from its 4-hex-character display form.
    pub fn from_hex(s: &str) -> Result<Self, ParseAddressError> {
        if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseAddressError(s.to_string()));
        }
        // Validated above; hex parse of 4 hex digits cannot fail.
        let raw = u16::from_str_radix(s, 16).map_err(|_| ParseAddressError(s.to_string()))?;
        Ok(ModuleAddress(raw))
    }

    /// The raw numeric value.
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// The on-wire hex form: low byte first (`"4707"` -> `"0747"`).
    pub fn wire_hex(&self) -> String {
        format!("{:02X}{:02X}", self.0 & 0xFF, self.0 >> 8)
    }

    /// Parse an address from its on-wire (byte-swapped) hex form.
    pub fn from_wire_hex(s: &str) -> Result<Self, ParseAddressError> {
        if s.len() != 4 {
            return Err(ParseAddressError(s.to_string()));
        }
        let swapped = format!("{}{}", &s[2..4], &s[0..2]);
        Self::from_hex(&swapped)
    }
}

impl fmt::Display for ModuleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for ModuleAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ModuleAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ModuleAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A 3-byte Nikobus button address, displayed as 6 uppercase hex characters
/// (the `AAAAAA` part of a `#NAAAAAA` frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ButtonAddress([u8; 3]);

impl ButtonAddress {
    /// Parse a button address from its 6-hex-character form.
    pub fn from_hex(s: &str) -> Result<Self, ParseAddressError> {
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseAddressError(s.to_string()));
        }
        let mut bytes = [0u8; 3];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|_| ParseAddressError(s.into()))?;
            bytes[i] =
                u8::from_str_radix(pair, 16).map_err(|_| ParseAddressError(s.to_string()))?;
        }
        Ok(ButtonAddress(bytes))
    }
}

impl fmt::Display for ButtonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }
}

impl FromStr for ButtonAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ButtonAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ButtonAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Error returned when a string cannot be parsed into an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAddressError(String);

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address: {}", self.0)
    }
}

impl std::error::Error for ParseAddressError {}

/// Half of a 12-output module.
///
/// Group 1 covers channels 1-6, group 2 covers channels 7-12. A 6-output
/// module only has group 1; its group-2 bytes exist in the cache but are
/// never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    One,
    Two,
}

impl Group {
    /// The group a 1-indexed channel belongs to.
    pub fn of_channel(channel: u8) -> Group {
        if channel <= 6 { Group::One } else { Group::Two }
    }

    /// Byte range of this group within the 12-byte output state.
    pub fn byte_range(&self) -> std::ops::Range<usize> {
        match self {
            Group::One => 0..6,
            Group::Two => 6..12,
        }
    }

    /// First 1-indexed channel of this group.
    pub fn first_channel(&self) -> u8 {
        match self {
            Group::One => 1,
            Group::Two => 7,
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::One => write!(f, "1"),
            Group::Two => write!(f, "2"),
        }
    }
}

impl Serialize for Group {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Group {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.trim() {
            "1" => Ok(Group::One),
            "2" => Ok(Group::Two),
            other => Err(serde::de::Error::custom(format!("invalid group: {other}"))),
        }
    }
}

/// The kind of a Nikobus output module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// Relay outputs: `0x00` off, `0xFF` on.
    Switch,
    /// Dimmed outputs: `0x00` off, `0x01..=0xFF` brightness.
    Dimmer,
    /// Shutter outputs: `0x00` stopped, `0x01` opening, `0x02` closing.
    Roller,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleKind::Switch => "switch",
            ModuleKind::Dimmer => "dimmer",
            ModuleKind::Roller => "roller",
        };
        write!(f, "{s}")
    }
}

/// The 12-byte output state of one module: two 6-byte groups.
///
/// Channels are 1-indexed; `byte(1)` is `s[0]`. For a 6-channel module the
/// second group is defined but never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputState([u8; 12]);

impl OutputState {
    /// An all-off state.
    pub fn new() -> Self {
        OutputState([0u8; 12])
    }

    /// State byte of a 1-indexed channel.
    pub fn channel(&self, channel: u8) -> u8 {
        self.0[(channel - 1) as usize]
    }

    /// Set the state byte of a 1-indexed channel.
    pub fn set_channel(&mut self, channel: u8, value: u8) {
        self.0[(channel - 1) as usize] = value;
    }

    /// The 6 bytes of one group.
    pub fn group(&self, group: Group) -> [u8; 6] {
        let mut out = [0u8; 6];
        out.copy_from_slice(&self.0[group.byte_range()]);
        out
    }

    /// Overwrite the 6 bytes of one group.
    pub fn set_group(&mut self, group: Group, bytes: [u8; 6]) {
        self.0[group.byte_range()].copy_from_slice(&bytes);
    }

    /// The full 12-byte vector.
    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }
}

/// Motion state of a cover (roller shutter) channel, matching the on-wire
/// channel byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverMotion {
    Stopped,
    Opening,
    Closing,
}

impl CoverMotion {
    /// The output state byte this motion is written as.
    pub fn as_byte(&self) -> u8 {
        match self {
            CoverMotion::Stopped => 0x00,
            CoverMotion::Opening => 0x01,
            CoverMotion::Closing => 0x02,
        }
    }

    /// Interpret an output state byte. Unknown values read as `Stopped`.
    pub fn from_byte(b: u8) -> CoverMotion {
        match b {
            0x01 => CoverMotion::Opening,
            0x02 => CoverMotion::Closing,
            _ => CoverMotion::Stopped,
        }
    }
}

impl fmt::Display for CoverMotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoverMotion::Stopped => "stopped",
            CoverMotion::Opening => "opening",
            CoverMotion::Closing => "closing",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_address_display_and_wire_swap() {
        let addr = ModuleAddress::from_hex("4707").unwrap();
        assert_eq!(addr.to_string(), "4707");
        assert_eq!(addr.wire_hex(), "0747");
        assert_eq!(addr.raw(), 0x4707);
    }

    #[test]
    fn module_address_from_wire_hex_round_trip() {
        let addr = ModuleAddress::from_wire_hex("0747").unwrap();
        assert_eq!(addr, ModuleAddress::from_hex("4707").unwrap());
        assert_eq!(addr.wire_hex(), "0747");
    }

    #[test]
    fn module_address_lowercase_accepted() {
        let addr = ModuleAddress::from_hex("c9a5").unwrap();
        assert_eq!(addr.to_string(), "C9A5");
    }

    #[test]
    fn module_address_rejects_bad_input() {
        assert!(ModuleAddress::from_hex("470").is_err());
        assert!(ModuleAddress::from_hex("47070").is_err());
        assert!(ModuleAddress::from_hex("47G7").is_err());
    }

    #[test]
    fn button_address_round_trip() {
        let addr = ButtonAddress::from_hex("4ECB1A").unwrap();
        assert_eq!(addr.to_string(), "4ECB1A");
    }

    #[test]
    fn button_address_rejects_bad_input() {
        assert!(ButtonAddress::from_hex("4ECB1").is_err());
        assert!(ButtonAddress::from_hex("4ECB1AFF").is_err());
        assert!(ButtonAddress::from_hex("4ECB1Z").is_err());
    }

    #[test]
    fn group_of_channel() {
        assert_eq!(Group::of_channel(1), Group::One);
        assert_eq!(Group::of_channel(6), Group::One);
        assert_eq!(Group::of_channel(7), Group::Two);
        assert_eq!(Group::of_channel(12), Group::Two);
    }

    #[test]
    fn group_byte_ranges() {
        assert_eq!(Group::One.byte_range(), 0..6);
        assert_eq!(Group::Two.byte_range(), 6..12);
        assert_eq!(Group::One.first_channel(), 1);
        assert_eq!(Group::Two.first_channel(), 7);
    }

    #[test]
    fn output_state_channel_indexing() {
        let mut state = OutputState::new();
        state.set_channel(1, 0xFF);
        state.set_channel(12, 0x80);
        assert_eq!(state.channel(1), 0xFF);
        assert_eq!(state.channel(2), 0x00);
        assert_eq!(state.channel(12), 0x80);
        assert_eq!(state.bytes()[0], 0xFF);
        assert_eq!(state.bytes()[11], 0x80);
    }

    #[test]
    fn output_state_groups() {
        let mut state = OutputState::new();
        state.set_group(Group::Two, [1, 2, 3, 4, 5, 6]);
        assert_eq!(state.group(Group::One), [0; 6]);
        assert_eq!(state.group(Group::Two), [1, 2, 3, 4, 5, 6]);
        assert_eq!(state.channel(7), 1);
        assert_eq!(state.channel(12), 6);
    }

    #[test]
    fn cover_motion_byte_round_trip() {
        assert_eq!(CoverMotion::from_byte(0x00), CoverMotion::Stopped);
        assert_eq!(CoverMotion::from_byte(0x01), CoverMotion::Opening);
        assert_eq!(CoverMotion::from_byte(0x02), CoverMotion::Closing);
        assert_eq!(CoverMotion::Opening.as_byte(), 0x01);
        // Unknown bytes read as stopped.
        assert_eq!(CoverMotion::from_byte(0x03), CoverMotion::Stopped);
    }

    #[test]
    fn serde_module_address() {
        let addr: ModuleAddress = serde_json::from_str("\"4707\"").unwrap();
        assert_eq!(addr.to_string(), "4707");
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"4707\"");
    }

    #[test]
    fn serde_group() {
        let g: Group = serde_json::from_str("\"2\"").unwrap();
        assert_eq!(g, Group::Two);
        assert_eq!(serde_json::to_string(&Group::One).unwrap(), "\"1\"");
    }

    #[test]
    fn serde_module_kind() {
        let k: ModuleKind = serde_json::from_str("\"roller\"").unwrap();
        assert_eq!(k, ModuleKind::Roller);
    }
}
