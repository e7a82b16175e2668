//! Firmware images.
//!
//! A [`Firmware`] is the format-independent result of parsing an ELF or
//! Intel HEX file: loadable segments, the entry point and (ELF only) a
//! symbol table used to resolve termination labels.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, SimError};
use crate::{elf, hex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareFormat {
    Elf,
    IntelHex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Flash,
    Eeprom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Byte address within the segment's memory.
    pub addr: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Firmware {
    pub format: FirmwareFormat,
    /// Entry point, byte address.
    pub entry: u32,
    pub segments: Vec<Segment>,
    /// Symbol name -> byte address.
    pub symbols: HashMap<String, u32>,
}

impl Firmware {
    /// Parse an image, detecting the format from its content.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if elf::is_elf(bytes) {
            return elf::parse_elf(bytes);
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| SimError::Load("unrecognized firmware format".into()))?;
        if text.trim_start().starts_with(':') {
            return hex::parse_hex(text);
        }
        Err(SimError::Load("unrecognized firmware format".into()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| SimError::Load(format!("{}: {}", path.display(), e)))?;
        Self::parse(&bytes)
    }

    pub fn symbol(&self, name: &str) -> Option<u32> {
        self.symbols.get(name).copied()
    }

    /// Total bytes destined for flash.
    pub fn flash_bytes(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Flash)
            .map(|s| s.data.len())
            .sum()
    }

    /// Check every segment fits the given memory sizes.
    pub fn check_fits(&self, flash_size: usize, eeprom_size: usize) -> Result<()> {
        for seg in &self.segments {
            let (limit, what) = match seg.kind {
                SegmentKind::Flash => (flash_size, "flash"),
                SegmentKind::Eeprom => (eeprom_size, "EEPROM"),
            };
            let end = seg.addr as usize + seg.data.len();
            if end > limit {
                return Err(SimError::Load(format!(
                    "segment at {:#06x}..{:#06x} exceeds {} size {:#x}",
                    seg.addr, end, what, limit
                )));
            }
        }
        Ok(())
    }
}
