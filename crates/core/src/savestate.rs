//! Device snapshots.
//!
//! Captures the complete run state of a [`Device`] (registers, data memory,
//! EEPROM, clock, port latches and timer units) with bincode serialization
//! and deflate compression. Flash is not stored: a snapshot can only be
//! restored onto a device of the same variant running the same firmware.
//!
//! ## Format
//!
//! ```text
//! +------------------+
//! | Magic "PSIM"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```
//!
//! Restoring does not notify pin observers.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::device::{Device, DeviceState};
use crate::error::{Result, SimError};
use crate::peripherals::{PortState, TimerState};

const MAGIC: &[u8; 4] = b"PSIM";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

#[derive(Serialize, Deserialize)]
pub struct SaveState {
    pub variant: String,
    /// FNV-1a hash of flash, to reject snapshots taken with other firmware.
    pub flash_hash: u64,

    // CPU
    pub pc: u16,
    pub sp: u16,
    pub sreg: u8,
    pub sleeping: bool,
    pub irq_hold: bool,

    // Memory
    pub data: Vec<u8>,
    pub eeprom: Vec<u8>,

    pub cycles: u64,
    pub ports: Vec<PortState>,
    pub timers: Vec<TimerState>,
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

/// Wrap a state in the header and compress it.
pub fn encode(state: &SaveState) -> Result<Vec<u8>> {
    let payload = bincode::serialize(state)
        .map_err(|e| SimError::Snapshot(format!("serialize error: {}", e)))?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Check the header and decompress a state.
pub fn decode(data: &[u8]) -> Result<SaveState> {
    if data.len() < HEADER_LEN {
        return Err(SimError::Snapshot("snapshot too small".into()));
    }
    if &data[0..4] != MAGIC {
        return Err(SimError::Snapshot("not a snapshot (bad magic)".into()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(SimError::Snapshot(format!(
            "unsupported snapshot version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let decompressed = miniz_oxide::inflate::decompress_to_vec(&data[HEADER_LEN..])
        .map_err(|e| SimError::Snapshot(format!("decompress error: {:?}", e)))?;
    bincode::deserialize(&decompressed)
        .map_err(|e| SimError::Snapshot(format!("deserialize error: {}", e)))
}

impl Device {
    pub fn capture_state(&self) -> SaveState {
        SaveState {
            variant: self.variant.name.to_string(),
            flash_hash: fnv1a(&self.mem.flash),
            pc: self.cpu.pc,
            sp: self.cpu.sp,
            sreg: self.cpu.sreg,
            sleeping: self.cpu.sleeping,
            irq_hold: self.cpu.irq_hold,
            data: self.mem.data.clone(),
            eeprom: self.mem.eeprom.clone(),
            cycles: self.clock.now(),
            ports: self.ports.iter().map(|p| p.save_state()).collect(),
            timers: self.timers.iter().map(|t| t.save_state()).collect(),
        }
    }

    /// Restore a captured state. The clock moves to the snapshot's cycle, so
    /// every observer is dropped as on [`reset`](Device::reset) and the
    /// restored levels are not notified.
    pub fn restore_state(&mut self, s: &SaveState) -> Result<()> {
        if self.state != DeviceState::Ready {
            return Err(SimError::Snapshot("device has no firmware loaded".into()));
        }
        if s.variant != self.variant.name {
            return Err(SimError::Snapshot(format!(
                "variant mismatch: snapshot={} device={}",
                s.variant, self.variant.name
            )));
        }
        if s.flash_hash != fnv1a(&self.mem.flash) {
            return Err(SimError::Snapshot("snapshot was taken with different firmware".into()));
        }
        if s.data.len() != self.mem.data.len()
            || s.eeprom.len() != self.mem.eeprom.len()
            || s.ports.len() != self.ports.len()
            || s.timers.len() != self.timers.len()
        {
            return Err(SimError::Snapshot("snapshot layout does not match device".into()));
        }

        self.cpu.pc = s.pc;
        self.cpu.sp = s.sp;
        self.cpu.sreg = s.sreg;
        self.cpu.sleeping = s.sleeping;
        self.cpu.irq_hold = s.irq_hold;
        self.mem.data.copy_from_slice(&s.data);
        self.mem.eeprom.copy_from_slice(&s.eeprom);
        self.clock.restore(s.cycles);
        for port in self.ports.iter_mut() {
            port.clear_observers();
        }
        for (port, ps) in self.ports.iter_mut().zip(s.ports.iter()) {
            port.load_state(ps);
        }
        for (timer, ts) in self.timers.iter_mut().zip(s.timers.iter()) {
            timer.load_state(ts);
        }
        tracing::debug!(cycles = s.cycles, pc = s.pc, "state restored");
        Ok(())
    }

    /// Serialized snapshot of the current state.
    pub fn save_state(&self) -> Result<Vec<u8>> {
        encode(&self.capture_state())
    }

    pub fn load_state(&mut self, data: &[u8]) -> Result<()> {
        let s = decode(data)?;
        self.restore_state(&s)
    }

    pub fn save_state_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.save_state()?;
        std::fs::write(path, &bytes)
            .map_err(|e| SimError::Snapshot(format!("{}: {}", path.display(), e)))
    }

    pub fn load_state_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| SimError::Snapshot(format!("{}: {}", path.display(), e)))?;
        self.load_state(&bytes)
    }
}
