//! # pinsim-core
//!
//! Cycle-accurate pin and timer simulation core for AVR microcontrollers
//! (ATmega328P / ATmega168).
//!
//! Firmware images (ELF or Intel HEX) run on a minimal AVR CPU; GPIO ports
//! and Timer/Counter units respond to the firmware's register writes, and
//! every pin level change is delivered synchronously to the pin's observers
//! together with the cycle at which it happened. Test code attaches
//! [`PinMonitor`]s and checks the recorded transitions or PWM pulse widths.
//!
//! ## Architecture
//!
//! - [`Device`]: owns CPU, memory, ports, timers and the clock of one variant
//! - [`Clock`]: monotonic cycle counter
//! - [`Pin`]: resolved level of one port bit plus its observer list
//! - [`TimerUnit`]: Timer/Counter with compare outputs (Normal, CTC, fast and phase-correct PWM)
//! - [`PinMonitor`] / [`Trace`]: recorded pin-change sequences
//! - [`variant`]: built-in hardware layouts, selected by name
//! - [`driver`]: `step`, `run` (until a termination label) and the step budget
//! - [`savestate`]: compressed snapshots of a running device
//!
//! ## Timing model
//!
//! The clock advances one cycle at a time. Within a cycle every timer ticks
//! and all resulting pin notifications are delivered before the next cycle,
//! so identical firmware and input always produce an identical trace.

pub mod clock;
pub mod config;
pub mod cpu;
pub mod device;
pub mod driver;
pub mod elf;
pub mod error;
pub mod firmware;
pub mod hex;
pub mod memory;
pub mod monitor;
pub mod opcodes;
pub mod peripherals;
pub mod pin;
pub mod savestate;
pub mod variant;

use std::path::Path;

pub use clock::Clock;
pub use config::SimConfig;
pub use cpu::Cpu;
pub use device::{Device, DeviceState};
pub use driver::RunReport;
pub use error::{ErrorKind, Result, SimError};
pub use firmware::{Firmware, FirmwareFormat};
pub use memory::Memory;
pub use monitor::{pulse_widths, PinMonitor, PinRecord, Trace};
pub use peripherals::{CompareOutput, TimerConfig, TimerUnit, WaveformMode};
pub use pin::{Level, Pin, PinEvent, PinId, PinObserver};
pub use variant::Variant;

/// Default CPU clock frequency: 16 MHz
pub const CLOCK_HZ: u32 = 16_000_000;

/// Number of general-purpose registers (R0–R31)
pub const REG_COUNT: usize = 32;
/// I/O + extended I/O register space size (0x20..0xFF)
pub const IO_SIZE: usize = 224;

/// Data-space addresses of the core registers
pub const SPL_ADDR: u16 = 0x5D;
pub const SPH_ADDR: u16 = 0x5E;
pub const SREG_ADDR: u16 = 0x5F;

// SREG bit positions
pub const SREG_C: u8 = 0;
pub const SREG_Z: u8 = 1;
pub const SREG_N: u8 = 2;
pub const SREG_V: u8 = 3;
pub const SREG_S: u8 = 4;
pub const SREG_H: u8 = 5;
pub const SREG_T: u8 = 6;
pub const SREG_I: u8 = 7;

/// Build a device of the named variant and load a firmware file into it.
///
/// Fails with [`SimError::Load`] for an unknown variant name or a bad image.
pub fn load_device(variant: &str, path: impl AsRef<Path>) -> Result<Device> {
    let v = variant::lookup(variant)
        .ok_or_else(|| SimError::Load(format!("unknown device variant '{}'", variant)))?;
    let mut dev = Device::new(v);
    dev.load_firmware(path)?;
    Ok(dev)
}

/// Like [`load_device`], with a run configuration.
pub fn load_device_with_config(variant: &str, path: impl AsRef<Path>, config: SimConfig) -> Result<Device> {
    let v = variant::lookup(variant)
        .ok_or_else(|| SimError::Load(format!("unknown device variant '{}'", variant)))?;
    let mut dev = Device::with_config(v, config)?;
    dev.load_firmware(path)?;
    Ok(dev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_variant() {
        let err = load_device("attiny13", "/nonexistent.hex").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Load);
        assert!(err.to_string().contains("attiny13"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_device("atmega328", "/nonexistent.hex").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Load);
    }
}
