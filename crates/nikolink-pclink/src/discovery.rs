//! Bus inventory message catalog (optional discovery support).
//!
//! A PC-Link can be asked to enumerate the installation: sweep commands
//! (`$..10…` for modules, `$..22…` for dimmer internals) walk an index
//! range, and the interface answers with chunked `$0510$2E…` /
//! `$0522$1E…` responses. Each response carries fixed-size data chunks --
//! 6 bytes for switch/roller maps, 8 bytes for dimmer maps -- followed by
//! a CRC tail the chunk walk must not swallow. An all-`FF` chunk
//! terminates a sweep.
//!
//! Discovery is optional equipment: the engine only provides the message
//! catalog (builders, parsers, a device-type table) and a passive
//! collector; nothing here is required for normal operation.

use nikolink_core::types::ModuleAddress;

use crate::protocol;

/// Prefixes of chunked inventory responses.
pub const INVENTORY_RESPONSE_PREFIXES: [&str; 2] = ["$0510$", "$0522$"];

/// Classification of a discovered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCategory {
    Module,
    Button,
}

/// Static description of a Nikobus device type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceType {
    pub category: DeviceCategory,
    pub model: &'static str,
    pub channels: u8,
    pub name: &'static str,
}

/// The device types the sweep parser recognizes.
const DEVICE_TYPES: &[(u8, DeviceType)] = &[
    (0x01, DeviceType { category: DeviceCategory::Module, model: "05-000-02", channels: 12, name: "Switch Module" }),
    (0x02, DeviceType { category: DeviceCategory::Module, model: "05-001-02", channels: 6, name: "Roller Shutter Module" }),
    (0x03, DeviceType { category: DeviceCategory::Module, model: "05-007-02", channels: 12, name: "Dimmer Module" }),
    (0x04, DeviceType { category: DeviceCategory::Button, model: "05-342", channels: 2, name: "Button with 2 Operation Points" }),
    (0x06, DeviceType { category: DeviceCategory::Button, model: "05-346", channels: 4, name: "Button with 4 Operation Points" }),
    (0x08, DeviceType { category: DeviceCategory::Module, model: "05-201", channels: 0, name: "PC Logic" }),
    (0x09, DeviceType { category: DeviceCategory::Module, model: "05-002-02", channels: 4, name: "Compact Switch Module" }),
    (0x0A, DeviceType { category: DeviceCategory::Module, model: "05-200", channels: 0, name: "PC Link" }),
    (0x0C, DeviceType { category: DeviceCategory::Button, model: "05-348", channels: 4, name: "IR Button with 4 Operation Points" }),
    (0x12, DeviceType { category: DeviceCategory::Button, model: "05-349", channels: 8, name: "Button with 8 Operation Points" }),
    (0x1F, DeviceType { category: DeviceCategory::Button, model: "05-311", channels: 2, name: "Button with 2 Operation Points" }),
];

/// Look up a device type code.
pub fn classify(type_code: u8) -> Option<&'static DeviceType> {
    DEVICE_TYPES
        .iter()
        .find(|(code, _)| *code == type_code)
        .map(|(_, t)| t)
}

/// Whether a line is a chunked inventory response.
pub fn is_inventory_response(line: &str) -> bool {
    INVENTORY_RESPONSE_PREFIXES
        .iter()
        .any(|p| line.starts_with(p))
}

/// A device found during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Raw device address as swept (modules: 4 hex chars; buttons: 6).
    pub address: String,
    pub type_code: u8,
    pub device_type: Option<DeviceType>,
}

/// What kind of map a module sweep walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// Switch / roller command maps: 6-byte chunks, command index from 0x10.
    Module,
    /// Dimmer command maps: 8-byte chunks, command index from 0x20.
    Dimmer,
}

impl SweepKind {
    /// Data chunk size in bytes.
    pub fn chunk_bytes(&self) -> usize {
        match self {
            SweepKind::Module => 6,
            SweepKind::Dimmer => 8,
        }
    }

    fn base_code(&self) -> &'static str {
        match self {
            SweepKind::Module => "10",
            SweepKind::Dimmer => "22",
        }
    }

    fn index_range(&self) -> std::ops::Range<u8> {
        match self {
            SweepKind::Module => 0x10..0xFF,
            SweepKind::Dimmer => 0x20..0xFF,
        }
    }
}

/// Build one inventory query frame from a raw partial payload.
///
/// Unlike module commands, inventory payloads do not follow the
/// func+addr layout, so the frame is built over the raw hex.
pub fn make_inventory_command(partial_hex: &str) -> String {
    protocol::frame_from_payload(partial_hex)
}

/// The full sweep frame sequence for one module.
pub fn sweep_frames(addr: ModuleAddress, kind: SweepKind) -> Vec<String> {
    let base = format!("{}{}", kind.base_code(), addr.wire_hex());
    kind.index_range()
        .map(|index| make_inventory_command(&format!("{base}{index:02X}04")))
        .collect()
}

/// A parsed chunked inventory response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryChunks {
    /// Address chars echoed at the head of the response body.
    pub address: String,
    /// Complete data chunks, in order, excluding the terminator.
    pub chunks: Vec<String>,
    /// Trailing CRC chars after the last chunk.
    pub crc: String,
    /// Whether the all-`FF` terminator chunk was seen.
    pub terminated: bool,
}

/// Split a `$0510$2E…` / `$0522$1E…` response into its chunks.
///
/// The 8-char header is followed by 4 address chars and then data chunks
/// of [`SweepKind::chunk_bytes`] bytes each. Whatever trails the last
/// full chunk is the CRC and must not be treated as data.
pub fn parse_inventory_chunks(message: &str, kind: SweepKind) -> Option<InventoryChunks> {
    if !message.is_ascii() || !is_inventory_response(message) || message.len() < 12 {
        return None;
    }

    // "$0510$2E" -- two '$' tokens, 8 chars total.
    let header = &message[..8];
    let body = &message[8..];
    if body.len() < 4 {
        return None;
    }

    let address = format!("{}{}", &header[6..8], &body[..4]);
    let payload = &body[4..];

    let chunk_chars = kind.chunk_bytes() * 2;
    let mut chunks = Vec::new();
    let mut terminated = false;
    let mut at = 0;

    while at + chunk_chars <= payload.len() {
        let chunk = &payload[at..at + chunk_chars];
        at += chunk_chars;
        if chunk.bytes().all(|b| b == b'F') {
            terminated = true;
            break;
        }
        chunks.push(chunk.to_string());
    }

    Some(InventoryChunks {
        address,
        chunks,
        crc: payload[at..].to_string(),
        terminated,
    })
}

/// Parse a single-device announcement out of a `$0510$…` response.
///
/// Offsets follow the interface's fixed layout: the device type code is
/// payload byte 7; the device address is bytes 11..13 for modules and
/// 11..14 for buttons, transmitted low byte first. All-`FF` addresses
/// mark the end of an address-space sweep and yield `None`.
pub fn parse_device_announcement(message: &str) -> Option<DiscoveredDevice> {
    let stripped = message.strip_prefix("$0510$")?;
    let stripped = stripped.trim_start_matches('$');
    let bytes = protocol::hex_to_bytes(stripped)?;
    if bytes.len() < 14 {
        return None;
    }

    let type_code = bytes[7];
    let device_type = classify(type_code).copied();
    let span = match device_type.map(|t| t.category) {
        Some(DeviceCategory::Button) => &bytes[11..14],
        _ => &bytes[11..13],
    };
    let address: String = span.iter().rev().map(|b| format!("{b:02X}")).collect();

    if address.chars().all(|c| c == 'F') || type_code == 0xFF {
        return None;
    }

    Some(DiscoveredDevice {
        address,
        type_code,
        device_type,
    })
}
