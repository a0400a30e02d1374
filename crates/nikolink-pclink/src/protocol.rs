//! PC-Link frame codec: CRCs, frame building, and frame validation.
//!
//! Two frame families coexist on the Nikobus wire.
//!
//! # `$` frames (binary-as-ASCII-hex)
//!
//! ```text
//! '$' LL PAYLOAD CRC16 CRC8
//! ```
//!
//! - `LL`: two hex chars; `payload chars = LL - 10` (the `-10` is a
//!   protocol constant, not derived from anything else).
//! - `PAYLOAD`: even-length uppercase hex. First byte is the function
//!   code; for module commands the next two bytes are the address in
//!   little-endian order (low byte first).
//! - `CRC16`: 4 hex chars over the hex-decoded payload *bytes*
//!   (poly 0x1021, init 0xFFFF, no reflection, no final XOR).
//! - `CRC8`: 2 hex chars over the ASCII *characters* of
//!   `"$" + LL + PAYLOAD + CRC16` (poly 0x99, init 0x00).
//!
//! On RX only the CRC8 is validated; the CRC16 is sender-side only. That
//! asymmetry is long-standing Nikobus client behaviour and is preserved
//! here -- changing it would need a protocol-compat mode.
//!
//! # Button frames (plain ASCII, no CRC)
//!
//! ```text
//! #NAAAAAA      button event (RX) / button action (TX)
//! #E1           end-of-sequence marker (TX)
//! ```

use nikolink_core::error::{Error, FrameRejectReason, Result};
use nikolink_core::types::{ButtonAddress, ModuleAddress};

/// CRC-16 polynomial used over payload bytes.
pub const CRC16_POLY: u16 = 0x1021;

/// CRC-8 polynomial used over the frame's ASCII prefix.
pub const CRC8_POLY: u8 = 0x99;

/// Offset between the `LL` length field and the payload character count.
pub const LENGTH_BIAS: u8 = 10;

/// Prefix of a button event/action frame.
pub const BUTTON_PREFIX: &str = "#N";

/// End-of-sequence marker sent after a TX button action.
pub const BUTTON_EXECUTE: &str = "#E1";

// ---------------------------------------------------------------------------
// CRCs
// ---------------------------------------------------------------------------

/// CRC-16 over the *bytes* encoded by an even-length hex string.
///
/// Returns `None` when the input is not valid even-length hex.
pub fn crc16_payload(payload_hex: &str) -> Option<u16> {
    let bytes = hex_to_bytes(payload_hex)?;
    let mut crc: u16 = 0xFFFF;
    for byte in bytes {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    Some(crc)
}

/// CRC-8 over the ASCII characters of `data`.
pub fn crc8_ascii(data: &str) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data.as_bytes() {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ CRC8_POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Append the 4-hex-char CRC-16 of `data` (an even-length hex string).
pub fn append_crc16(data: &str) -> Option<String> {
    crc16_payload(data).map(|crc| format!("{data}{crc:04X}"))
}

/// Append the 2-hex-char CRC-8 of `data`'s ASCII characters.
pub fn append_crc8(data: &str) -> String {
    format!("{data}{:02X}", crc8_ascii(data))
}

// ---------------------------------------------------------------------------
// Frame building
// ---------------------------------------------------------------------------

/// Build a complete `$` frame for a module command.
///
/// The payload is `func + addr_lo + addr_hi + args`; the length field is
/// `payload chars + 10`; both CRCs are appended.
///
/// # Example
///
/// ```
/// use nikolink_pclink::protocol::build_command;
/// use nikolink_core::types::ModuleAddress;
///
/// let addr = ModuleAddress::from_hex("4707").unwrap();
/// let frame = build_command(0x15, addr, &[0xFF, 0, 0, 0, 0, 0, 0xFF]);
/// assert_eq!(frame, "$1E150747FF0000000000FF8C3D0A");
/// ```
pub fn build_command(func: u8, addr: ModuleAddress, args: &[u8]) -> String {
    let mut data = format!("{func:02X}{}", addr.wire_hex());
    for byte in args {
        data.push_str(&format!("{byte:02X}"));
    }
    frame_from_payload(&data)
}

/// Build a `$` frame from a raw hex payload (used by the inventory sweep,
/// whose partial payloads do not follow the func+addr layout).
pub fn frame_from_payload(payload_hex: &str) -> String {
    // Payload is produced internally and always valid hex.
    let with_crc16 = append_crc16(payload_hex).expect("payload is valid hex");
    let prefix = format!("${:02X}{with_crc16}", payload_hex.len() as u8 + LENGTH_BIAS);
    append_crc8(&prefix)
}

/// The TX sequence that simulates a wall-button press: the button frame
/// and the execute marker as two CR-separated tokens.
///
/// The transport appends the final CR, producing `#NAAAAAA\r#E1\r` on the
/// wire.
pub fn virtual_button_sequence(addr: ButtonAddress) -> String {
    format!("{BUTTON_PREFIX}{addr}\r{BUTTON_EXECUTE}")
}

// ---------------------------------------------------------------------------
// Frame validation
// ---------------------------------------------------------------------------

/// A received `$` frame that passed validation.
///
/// Accessors index into the raw string; the candidate always starts at
/// offset 0 (leading noise is removed during validation, so the parse
/// offsets of the protocol description apply unshifted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidFrame {
    raw: String,
    payload_len: usize,
}

impl ValidFrame {
    /// The full validated frame text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The hex payload between the length field and the CRC16.
    pub fn payload(&self) -> &str {
        &self.raw[3..3 + self.payload_len]
    }

    /// The function code (first payload byte).
    pub fn func_code(&self) -> u8 {
        u8::from_str_radix(&self.payload()[0..2], 16).unwrap_or(0)
    }

    /// The module address (payload bytes 2-3, byte-swapped on the wire),
    /// when the payload is long enough to carry one.
    pub fn address(&self) -> Option<ModuleAddress> {
        if self.payload_len < 6 {
            return None;
        }
        ModuleAddress::from_wire_hex(&self.payload()[2..6]).ok()
    }

    /// Function-specific argument bytes after the address.
    pub fn args(&self) -> Vec<u8> {
        if self.payload_len <= 6 {
            return Vec::new();
        }
        hex_to_bytes(&self.payload()[6..]).unwrap_or_default()
    }
}

/// Validate a received line as a `$` frame.
///
/// Policy (preserved upstream behaviour):
/// - if the line contains more than one `'$'`, the candidate starts at the
///   *second* one -- the first is a concatenated echo;
/// - the two chars after `'$'` must be hex (`NonHexLength` otherwise);
/// - the character count must be `1 + 2 + (LL - 10) + 4 + 2`
///   (`LengthMismatch` otherwise);
/// - the trailing two chars must equal the CRC-8 of everything before
///   them (`Crc8Mismatch` otherwise);
/// - the CRC-16 is deliberately **not** checked on RX.
pub fn validate_frame(line: &str) -> Result<ValidFrame> {
    let candidate = second_dollar_candidate(line);

    // Frames are pure ASCII; stray high bytes from the line would break
    // the character-offset arithmetic below.
    if !candidate.is_ascii() || !candidate.starts_with('$') || candidate.len() < 3 {
        return Err(Error::FrameRejected(FrameRejectReason::LengthMismatch));
    }

    let ll_chars = &candidate[1..3];
    if !ll_chars.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::FrameRejected(FrameRejectReason::NonHexLength));
    }
    let ll = u8::from_str_radix(ll_chars, 16)
        .map_err(|_| Error::FrameRejected(FrameRejectReason::NonHexLength))?;

    let payload_len = match ll.checked_sub(LENGTH_BIAS) {
        Some(n) => n as usize,
        None => return Err(Error::FrameRejected(FrameRejectReason::LengthMismatch)),
    };

    let expected_len = 1 + 2 + payload_len + 4 + 2;
    if candidate.len() != expected_len {
        return Err(Error::FrameRejected(FrameRejectReason::LengthMismatch));
    }

    let (prefix, crc) = candidate.split_at(expected_len - 2);
    let computed = format!("{:02X}", crc8_ascii(prefix));
    if crc != computed {
        return Err(Error::FrameRejected(FrameRejectReason::Crc8Mismatch));
    }

    Ok(ValidFrame {
        raw: candidate.to_string(),
        payload_len,
    })
}

/// When a line holds more than one `'$'`, the candidate frame starts at
/// the second; otherwise at the first.
fn second_dollar_candidate(line: &str) -> &str {
    let mut indices = line.match_indices('$').map(|(i, _)| i);
    let first = indices.next();
    match (first, indices.next()) {
        (_, Some(second)) => &line[second..],
        (Some(first), None) => &line[first..],
        (None, None) => line,
    }
}

// ---------------------------------------------------------------------------
// Button frames
// ---------------------------------------------------------------------------

/// Extract the button address from a line carrying a `#N` frame.
///
/// The bus repeats `#NAAAAAA` while a button is held; the address is the
/// 6 hex chars after the prefix, wherever the prefix sits in the line.
pub fn button_address_in(line: &str) -> Option<ButtonAddress> {
    let at = line.find(BUTTON_PREFIX)?;
    let rest = &line[at + BUTTON_PREFIX.len()..];
    if rest.len() < 6 {
        return None;
    }
    ButtonAddress::from_hex(&rest[..6]).ok()
}

// ---------------------------------------------------------------------------
// Byte decoding
// ---------------------------------------------------------------------------

/// Decode an even-length hex string into bytes.
pub fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

/// Decode received bytes as Windows-1252 text.
///
/// Frames are plain ASCII; this decoding only matters for the occasional
/// stray high byte picked up on the serial line, which must not poison an
/// otherwise valid line. Codepoints 0x80-0x9F map per cp1252, everything
/// else passes through as Latin-1.
pub fn decode_cp1252(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| match b {
            0x80 => '\u{20AC}',
            0x82 => '\u{201A}',
            0x83 => '\u{0192}',
            0x84 => '\u{201E}',
            0x85 => '\u{2026}',
            0x86 => '\u{2020}',
            0x87 => '\u{2021}',
            0x88 => '\u{02C6}',
            0x89 => '\u{2030}',
            0x8A => '\u{0160}',
            0x8B => '\u{2039}',
            0x8C => '\u{0152}',
            0x8E => '\u{017D}',
            0x91 => '\u{2018}',
            0x92 => '\u{2019}',
            0x93 => '\u{201C}',
            0x94 => '\u{201D}',
            0x95 => '\u{2022}',
            0x96 => '\u{2013}',
            0x97 => '\u{2014}',
            0x98 => '\u{02DC}',
            0x99 => '\u{2122}',
            0x9A => '\u{0161}',
            0x9B => '\u{203A}',
            0x9C => '\u{0153}',
            0x9E => '\u{017E}',
            0x9F => '\u{0178}',
            other => other as char,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ModuleAddress {
        ModuleAddress::from_hex(s).unwrap()
    }

    // -------------------------------------------------------------------
    // CRC algorithms
    // -------------------------------------------------------------------

    #[test]
    fn crc16_known_vectors() {
        // Payloads and CRCs from live bus captures.
        assert_eq!(crc16_payload("110000"), Some(0xB8CF));
        assert_eq!(crc16_payload("150747FF0000000000FF"), Some(0x8C3D));
        assert_eq!(crc16_payload("074700FF0000000000"), Some(0xCCAE));
    }

    #[test]
    fn crc16_rejects_bad_hex() {
        assert_eq!(crc16_payload("11000"), None);
        assert_eq!(crc16_payload("11000G"), None);
    }

    #[test]
    fn crc8_known_vectors() {
        assert_eq!(crc8_ascii("$10110000B8CF"), 0x9D);
        assert_eq!(crc8_ascii("$1E150747FF0000000000FF8C3D"), 0x0A);
        assert_eq!(crc8_ascii("$1C074700FF0000000000CCAE"), 0xA3);
    }

    #[test]
    fn append_helpers() {
        assert_eq!(append_crc16("110000").unwrap(), "110000B8CF");
        assert_eq!(append_crc8("$10110000B8CF"), "$10110000B8CF9D");
    }

    // -------------------------------------------------------------------
    // Frame building
    // -------------------------------------------------------------------

    #[test]
    fn build_write_group1() {
        let frame = build_command(0x15, addr("4707"), &[0xFF, 0, 0, 0, 0, 0, 0xFF]);
        assert_eq!(frame, "$1E150747FF0000000000FF8C3D0A");
    }

    #[test]
    fn build_write_group2_dimmer() {
        // Channel 9 of C9A5 at half brightness: third byte of group 2.
        let frame = build_command(0x16, addr("C9A5"), &[0, 0, 0x80, 0, 0, 0, 0xFF]);
        assert_eq!(frame, "$1E16A5C9000080000000FF07EAE2");
    }

    #[test]
    fn build_read_commands() {
        assert_eq!(build_command(0x12, addr("4707"), &[]), "$10120747402BFC");
        assert_eq!(build_command(0x17, addr("4707"), &[]), "$10170747ABDBF7");
        assert_eq!(build_command(0x12, addr("C9A5"), &[]), "$1012A5C94B71C1");
    }

    #[test]
    fn build_echo_mode_handshake_frame() {
        // The PC-Link echo-mode frame, func 0x11 with payload 110000.
        assert_eq!(frame_from_payload("110000"), "$10110000B8CF9D");
    }

    #[test]
    fn virtual_button_sequence_format() {
        let button = ButtonAddress::from_hex("4ECB1A").unwrap();
        assert_eq!(virtual_button_sequence(button), "#N4ECB1A\r#E1");
    }

    // -------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------

    #[test]
    fn validate_accepts_built_frames() {
        for frame in [
            "$1E150747FF0000000000FF8C3D0A",
            "$10120747402BFC",
            "$1C074700FF0000000000CCAEA3",
            "$10110000B8CF9D",
        ] {
            let valid = validate_frame(frame).unwrap();
            assert_eq!(valid.as_str(), frame);
        }
    }

    #[test]
    fn validate_rejects_crc8_mismatch() {
        let result = validate_frame("$1C074700FF0000000000CCAEA4");
        assert!(matches!(
            result,
            Err(Error::FrameRejected(FrameRejectReason::Crc8Mismatch))
        ));
    }

    #[test]
    fn validate_rejects_length_mismatch() {
        // One payload char short.
        let result = validate_frame("$1C07470FF0000000000CCAEA3");
        assert!(matches!(
            result,
            Err(Error::FrameRejected(FrameRejectReason::LengthMismatch))
        ));
    }

    #[test]
    fn validate_rejects_non_hex_length() {
        let result = validate_frame("$ZZ120747402BFC");
        assert!(matches!(
            result,
            Err(Error::FrameRejected(FrameRejectReason::NonHexLength))
        ));
    }

    #[test]
    fn validate_rejects_undersized_length_field() {
        // LL = 0x05 would make the payload length negative.
        let result = validate_frame("$0512");
        assert!(matches!(
            result,
            Err(Error::FrameRejected(FrameRejectReason::LengthMismatch))
        ));
    }

    #[test]
    fn validate_extracts_second_dollar_on_echo_concatenation() {
        // A command echo glued to the answer on one line: the answer (the
        // second '$') is the candidate.
        let line = "$10120747402BFC$1C074700FF0000000000CCAEA3";
        let valid = validate_frame(line).unwrap();
        assert_eq!(valid.as_str(), "$1C074700FF0000000000CCAEA3");
    }

    #[test]
    fn validate_tolerates_leading_noise() {
        let valid = validate_frame("\u{FFFD}$10120747402BFC").unwrap();
        assert_eq!(valid.as_str(), "$10120747402BFC");
    }

    #[test]
    fn crc16_is_not_checked_on_rx() {
        // Same frame with a corrupted CRC16 but a CRC8 recomputed over the
        // corrupted prefix: accepted, because only the CRC8 is validated.
        let prefix = "$1C074700FF0000000000DEAD";
        let frame = append_crc8(prefix);
        assert!(validate_frame(&frame).is_ok());
    }

    // -------------------------------------------------------------------
    // Parse accessors + round trip
    // -------------------------------------------------------------------

    #[test]
    fn round_trip_all_module_function_codes() {
        let cases: &[(u8, &str, &[u8])] = &[
            (0x12, "4707", &[]),
            (0x17, "4707", &[]),
            (0x15, "C9A5", &[0xFF, 0x00, 0x10, 0x00, 0x00, 0x00, 0xFF]),
            (0x16, "0001", &[0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0xFF]),
        ];

        for &(func, address, args) in cases {
            let frame = build_command(func, addr(address), args);
            let valid = validate_frame(&frame).unwrap();
            assert_eq!(valid.func_code(), func);
            assert_eq!(valid.address(), Some(addr(address)));
            assert_eq!(valid.args(), args);
        }
    }

    #[test]
    fn payload_accessor() {
        let valid = validate_frame("$1C074700FF0000000000CCAEA3").unwrap();
        assert_eq!(valid.payload(), "074700FF0000000000");
        assert_eq!(valid.func_code(), 0x07);
    }

    // -------------------------------------------------------------------
    // Button frames
    // -------------------------------------------------------------------

    #[test]
    fn button_address_extraction() {
        let expected = ButtonAddress::from_hex("4ECB1A").unwrap();
        assert_eq!(button_address_in("#N4ECB1A"), Some(expected));
        // The prefix may not start the line.
        assert_eq!(button_address_in("xx#N4ECB1A"), Some(expected));
    }

    #[test]
    fn button_address_extraction_failures() {
        assert_eq!(button_address_in("#N4ECB"), None);
        assert_eq!(button_address_in("$0512"), None);
        assert_eq!(button_address_in("#N4ECB1Z"), None);
    }

    // -------------------------------------------------------------------
    // Byte decoding
    // -------------------------------------------------------------------

    #[test]
    fn hex_to_bytes_round_trip() {
        assert_eq!(hex_to_bytes("FF0010"), Some(vec![0xFF, 0x00, 0x10]));
        assert_eq!(hex_to_bytes(""), Some(vec![]));
        assert_eq!(hex_to_bytes("F"), None);
        assert_eq!(hex_to_bytes("FG"), None);
    }

    #[test]
    fn cp1252_ascii_passthrough() {
        assert_eq!(decode_cp1252(b"$0512"), "$0512");
        assert_eq!(decode_cp1252(b"#N4ECB1A"), "#N4ECB1A");
    }

    #[test]
    fn cp1252_high_bytes() {
        assert_eq!(decode_cp1252(&[0x80]), "\u{20AC}");
        assert_eq!(decode_cp1252(&[0xE9]), "\u{E9}");
    }
}
