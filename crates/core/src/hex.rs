//! Intel HEX parser.
//!
//! Parses Intel HEX text (`:LLAAAATT[DD...]CC`) into flash segments.
//! Supports record types 00 (data), 01 (EOF), 02 (extended segment
//! address), 03/05 (start address) and 04 (extended linear address).
//! HEX images carry no symbols.

use std::collections::HashMap;

use crate::error::{Result, SimError};
use crate::firmware::{Firmware, FirmwareFormat, Segment, SegmentKind};

/// Parse an Intel HEX document. Contiguous data records are merged into
/// one segment.
pub fn parse_hex(text: &str) -> Result<Firmware> {
    let mut base_addr: u32 = 0;
    let mut entry: u32 = 0;
    let mut segments: Vec<Segment> = Vec::new();
    let mut saw_eof = false;

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let body = line
            .strip_prefix(':')
            .ok_or_else(|| SimError::Load(format!("line {}: missing ':' start code", lineno + 1)))?;
        let bytes = hex_line_to_bytes(body).map_err(|e| SimError::Load(format!("line {}: {}", lineno + 1, e)))?;
        if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
            return Err(SimError::Load(format!("line {}: bad record length", lineno + 1)));
        }

        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(SimError::Load(format!("line {}: checksum error", lineno + 1)));
        }

        let payload = &bytes[4..bytes.len() - 1];
        let addr = ((bytes[1] as u32) << 8) | bytes[2] as u32;
        match bytes[3] {
            0x00 => {
                let out_of_range = || SimError::Load(format!("line {}: record beyond 32-bit address space", lineno + 1));
                let full = base_addr.checked_add(addr).ok_or_else(out_of_range)?;
                full.checked_add(payload.len() as u32).ok_or_else(out_of_range)?;
                match segments.last_mut() {
                    Some(seg) if seg.addr.checked_add(seg.data.len() as u32) == Some(full) => {
                        seg.data.extend_from_slice(payload)
                    }
                    _ => segments.push(Segment { kind: SegmentKind::Flash, addr: full, data: payload.to_vec() }),
                }
            }
            0x01 => {
                saw_eof = true;
                break;
            }
            0x02 if payload.len() == 2 => {
                base_addr = (((payload[0] as u32) << 8) | payload[1] as u32) << 4;
            }
            0x04 if payload.len() == 2 => {
                base_addr = (((payload[0] as u32) << 8) | payload[1] as u32) << 16;
            }
            0x03 if payload.len() == 4 => {
                let cs = ((payload[0] as u32) << 8) | payload[1] as u32;
                let ip = ((payload[2] as u32) << 8) | payload[3] as u32;
                entry = (cs << 4) + ip;
            }
            0x05 if payload.len() == 4 => {
                entry = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            }
            t => return Err(SimError::Load(format!("line {}: unsupported record type {:02X}", lineno + 1, t))),
        }
    }

    if !saw_eof {
        return Err(SimError::Load("missing end-of-file record".into()));
    }
    Ok(Firmware { format: FirmwareFormat::IntelHex, entry, segments, symbols: HashMap::new() })
}

fn hex_line_to_bytes(hex_str: &str) -> std::result::Result<Vec<u8>, String> {
    if hex_str.len() % 2 != 0 {
        return Err("odd number of hex characters".into());
    }
    (0..hex_str.len())
        .step_by(2)
        .map(|i| {
            hex_str
                .get(i..i + 2)
                .filter(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| format!("invalid hex digits at column {}", i + 2))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_hex() {
        let hex = ":100000000C9434000C944E000C944E000C944E00A4\n:00000001FF\n";
        let fw = parse_hex(hex).unwrap();
        assert_eq!(fw.format, FirmwareFormat::IntelHex);
        assert_eq!(fw.segments.len(), 1);
        let seg = &fw.segments[0];
        assert_eq!(seg.addr, 0);
        assert_eq!(seg.data.len(), 16);
        assert_eq!(&seg.data[..6], &[0x0C, 0x94, 0x34, 0x00, 0x0C, 0x94]);
        assert!(fw.symbols.is_empty());
    }

    #[test]
    fn test_contiguous_records_merge() {
        let hex = ":0200000001FFFE\n:02000200FFCF2E\n:00000001FF\n";
        let fw = parse_hex(hex).unwrap();
        assert_eq!(fw.segments.len(), 1);
        assert_eq!(fw.segments[0].data, vec![0x01, 0xFF, 0xFF, 0xCF]);
    }

    #[test]
    fn test_checksum_error() {
        let hex = ":100000000C9434000C944E000C944E000C944E00FF\n:00000001FF\n";
        assert!(parse_hex(hex).is_err());
    }

    #[test]
    fn test_empty_hex() {
        let fw = parse_hex(":00000001FF\n").unwrap();
        assert!(fw.segments.is_empty());
    }

    #[test]
    fn test_missing_eof() {
        let hex = ":100000000C9434000C944E000C944E000C944E00A4\n";
        assert!(parse_hex(hex).is_err());
    }

    #[test]
    fn test_garbage_line() {
        assert!(parse_hex("hello\n:00000001FF\n").is_err());
        assert!(parse_hex(":0G000001FF\n").is_err());
        // from_str_radix alone would take "+1" as 1
        assert!(parse_hex(":+1000001FF\n:00000001FF\n").is_err());
    }

    /// One record line with a correct checksum.
    fn record(addr: u16, kind: u8, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8, (addr >> 8) as u8, addr as u8, kind];
        bytes.extend_from_slice(data);
        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        bytes.push(sum.wrapping_neg());
        let body: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        format!(":{}\n", body)
    }

    #[test]
    fn test_records_past_address_space() {
        let fill = [0u8; 255];
        let mut hex = record(0, 0x04, &[0xFF, 0xFF]);
        hex += &record(0xFF00, 0x00, &fill);
        hex += &record(0xFFFF, 0x00, &fill);
        hex += &record(0x0000, 0x00, &[0]);
        hex += &record(0, 0x01, &[]);
        let err = parse_hex(&hex).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Load);
    }
}
