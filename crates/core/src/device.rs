//! The simulated microcontroller.
//!
//! A [`Device`] owns the CPU, memories, GPIO ports (and through them every
//! [`Pin`]) and timer units of one [`Variant`]. It routes data-space
//! accesses to the peripherals, wires each timer's compare outputs to
//! their pins, advances the [`Clock`] and dispatches timer interrupts.
//!
//! ```no_run
//! use pinsim_core::{load_device, Level, PinEvent};
//!
//! let mut dev = load_device("atmega328", "blink.elf")?;
//! dev.register_termination_symbol("exit")?;
//! dev.pin_mut("B5")?.register_observer(|e: &PinEvent| println!("{} {}", e.pin, e.level));
//! dev.run()?;
//! assert_eq!(dev.get_pin("B5")?.level(), Level::Low);
//! # Ok::<(), pinsim_core::SimError>(())
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::SimConfig;
use crate::cpu::Cpu;
use crate::error::{Result, SimError};
use crate::firmware::{Firmware, SegmentKind};
use crate::memory::Memory;
use crate::peripherals::{Port, TimerConfig, TimerUnit};
use crate::pin::{Level, Pin, PinId};
use crate::variant::Variant;
use crate::{SPH_ADDR, SPL_ADDR, SREG_ADDR, SREG_I};

/// Whether the device can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No firmware loaded yet.
    Empty,
    Ready,
    /// The last load failed; `reset()` and a successful reload are required.
    Faulted,
}

pub struct Device {
    pub(crate) variant: &'static Variant,
    pub(crate) config: SimConfig,
    pub cpu: Cpu,
    pub mem: Memory,
    pub(crate) clock: Clock,
    pub(crate) ports: Vec<Port>,
    pub(crate) timers: Vec<TimerUnit>,
    pub(crate) firmware: Option<Firmware>,
    /// Word addresses that stop `run()`.
    pub(crate) termination: BTreeSet<u16>,
    pub(crate) state: DeviceState,
}

impl Device {
    pub fn new(variant: &'static Variant) -> Self {
        let ports = variant.ports.iter().map(Port::new).collect();
        let timers = variant.timers.iter().map(TimerUnit::new).collect();
        let ramend = (variant.data_size() - 1) as u16;
        Device {
            variant,
            config: SimConfig::default(),
            cpu: Cpu::new(ramend),
            mem: Memory::new(variant),
            clock: Clock::new(),
            ports,
            timers,
            firmware: None,
            termination: BTreeSet::new(),
            state: DeviceState::Empty,
        }
    }

    pub fn with_config(variant: &'static Variant, config: SimConfig) -> Result<Self> {
        config.validate()?;
        let mut dev = Device::new(variant);
        dev.config = config;
        Ok(dev)
    }

    pub fn variant(&self) -> &'static Variant {
        self.variant
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Current cycle count.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Simulated time since power-on at the configured clock rate.
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed(self.config.clock_hz)
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn firmware(&self) -> Option<&Firmware> {
        self.firmware.as_ref()
    }

    // ---- Firmware loading ----

    /// Load an ELF or Intel HEX file into flash and power the device on.
    ///
    /// On failure the device is left unusable (`DeviceState::Faulted`)
    /// until `reset()` and a successful reload.
    pub fn load_firmware(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_loadable()?;
        match Firmware::from_file(path) {
            Ok(fw) => self.load_image(fw),
            Err(e) => Err(self.fault(e)),
        }
    }

    /// Like [`load_firmware`](Self::load_firmware), from an in-memory image.
    pub fn load_firmware_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_loadable()?;
        match Firmware::parse(bytes) {
            Ok(fw) => self.load_image(fw),
            Err(e) => Err(self.fault(e)),
        }
    }

    pub fn load_image(&mut self, fw: Firmware) -> Result<()> {
        self.ensure_loadable()?;
        if let Err(e) = fw.check_fits(self.mem.flash.len(), self.mem.eeprom.len()) {
            return Err(self.fault(e));
        }
        self.mem.flash.fill(0xFF);
        self.mem.eeprom.fill(0xFF);
        for seg in &fw.segments {
            let start = seg.addr as usize;
            let dst = match seg.kind {
                SegmentKind::Flash => &mut self.mem.flash,
                SegmentKind::Eeprom => &mut self.mem.eeprom,
            };
            dst[start..start + seg.data.len()].copy_from_slice(&seg.data);
        }
        tracing::info!(
            variant = self.variant.name,
            format = ?fw.format,
            bytes = fw.flash_bytes(),
            symbols = fw.symbols.len(),
            entry = fw.entry,
            "firmware loaded"
        );
        self.termination.clear();
        self.firmware = Some(fw);
        self.state = DeviceState::Ready;
        self.power_on();
        Ok(())
    }

    fn fault(&mut self, err: SimError) -> SimError {
        tracing::debug!(error = %err, "firmware load failed");
        self.mem.flash.fill(0xFF);
        self.firmware = None;
        self.termination.clear();
        self.state = DeviceState::Faulted;
        err
    }

    fn ensure_loadable(&self) -> Result<()> {
        if self.state == DeviceState::Faulted {
            return Err(SimError::Load("last firmware load failed; reset before reloading".into()));
        }
        Ok(())
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        match self.state {
            DeviceState::Ready => Ok(()),
            DeviceState::Empty => Err(SimError::Load("no firmware loaded".into())),
            DeviceState::Faulted => Err(SimError::Load("last firmware load failed; reset and reload".into())),
        }
    }

    // ---- Reset ----

    /// Restore pins, timers, clock and registers to power-on defaults.
    ///
    /// Every observer is dropped: monitors must be attached again. Flash
    /// contents and registered termination points are kept. A device faulted
    /// by a failed load becomes empty and needs a new load.
    pub fn reset(&mut self) {
        for port in self.ports.iter_mut() {
            port.clear_observers();
        }
        self.power_on();
        if self.state == DeviceState::Faulted {
            self.state = DeviceState::Empty;
        }
        tracing::debug!(variant = self.variant.name, "device reset");
    }

    /// Power-on state of everything but flash, observers and termination points.
    fn power_on(&mut self) {
        self.clock.reset();
        self.mem.clear_data();
        self.cpu = Cpu::new((self.variant.data_size() - 1) as u16);
        if let Some(fw) = &self.firmware {
            self.cpu.pc = (fw.entry / 2) as u16;
        }
        for timer in self.timers.iter_mut() {
            timer.reset();
        }
        for port in self.ports.iter_mut() {
            port.power_on();
        }
    }

    // ---- Pins ----

    fn locate(&self, name: &str) -> Result<(usize, u8)> {
        let id = PinId::parse(name).ok_or_else(|| SimError::not_found("pin", name))?;
        self.ports
            .iter()
            .position(|p| p.letter() == id.port && p.has_bit(id.bit))
            .map(|idx| (idx, id.bit))
            .ok_or_else(|| SimError::not_found("pin", name))
    }

    /// Look up a pin by name (`D5`, `d5`, `PD5`).
    pub fn get_pin(&self, name: &str) -> Result<&Pin> {
        let (port, bit) = self.locate(name)?;
        self.ports[port].pin(bit).ok_or_else(|| SimError::not_found("pin", name))
    }

    pub fn pin_mut(&mut self, name: &str) -> Result<&mut Pin> {
        let (port, bit) = self.locate(name)?;
        self.ports[port].pin_mut(bit).ok_or_else(|| SimError::not_found("pin", name))
    }

    /// Every pin of the variant, in port then bit order.
    pub fn pins(&self) -> impl Iterator<Item = &Pin> {
        self.ports.iter().flat_map(|p| p.pins())
    }

    /// Apply an external level to an input pin. It is seen by PINx reads
    /// only; `Level::Tristate` removes it.
    pub fn set_input(&mut self, name: &str, level: Level) -> Result<()> {
        let (port, bit) = self.locate(name)?;
        self.ports[port].set_input(bit, level);
        Ok(())
    }

    // ---- Termination ----

    /// Stop `run()` when execution reaches the named program label.
    /// Returns the label's byte address.
    pub fn register_termination_symbol(&mut self, name: &str) -> Result<u32> {
        let addr = self
            .firmware
            .as_ref()
            .and_then(|fw| fw.symbol(name))
            .ok_or_else(|| SimError::not_found("symbol", name))?;
        self.register_termination_address(addr)?;
        tracing::debug!(symbol = name, addr, "termination symbol registered");
        Ok(addr)
    }

    /// Stop `run()` when execution reaches a flash byte address.
    pub fn register_termination_address(&mut self, byte_addr: u32) -> Result<()> {
        if byte_addr % 2 != 0 || byte_addr as usize >= self.mem.flash.len() {
            return Err(SimError::Configuration(format!(
                "termination address {:#x} is not a flash instruction address",
                byte_addr
            )));
        }
        self.termination.insert((byte_addr / 2) as u16);
        Ok(())
    }

    pub(crate) fn at_termination(&self) -> bool {
        self.termination.contains(&self.cpu.pc)
    }

    // ---- Timers ----

    fn timer_index(&self, name: &str) -> Result<usize> {
        self.variant
            .timer(name)
            .map(|(idx, _)| idx)
            .ok_or_else(|| SimError::not_found("timer", name))
    }

    pub fn timer(&self, name: &str) -> Result<&TimerUnit> {
        let idx = self.timer_index(name)?;
        Ok(&self.timers[idx])
    }

    /// Configure a timer directly. Connected compare outputs get their pin
    /// switched to output, as firmware would do through DDRx.
    pub fn configure_timer(&mut self, name: &str, cfg: &TimerConfig) -> Result<()> {
        let idx = self.timer_index(name)?;
        self.timers[idx].configure(cfg)?;
        let now = self.clock.now();
        self.apply_timer_outputs(idx, now);
        let layout = self.timers[idx].layout();
        for ch in 0..2 {
            if self.timers[idx].output(ch).is_some() {
                let id = layout.outputs[ch];
                if let Some(port) = self.ports.iter_mut().find(|p| p.letter() == id.port) {
                    port.set_direction(id.bit, true, now);
                }
            }
        }
        Ok(())
    }

    /// Write a compare threshold between ticks. `channel` is 0 (A) or 1 (B).
    pub fn set_compare(&mut self, name: &str, channel: usize, value: u16) -> Result<()> {
        let idx = self.timer_index(name)?;
        if channel > 1 {
            return Err(SimError::Configuration(format!("{}: no compare channel {}", name, channel)));
        }
        self.timers[idx].set_compare(channel, value);
        Ok(())
    }

    /// Drive both compare-output pins of a timer from its current latches.
    fn apply_timer_outputs(&mut self, idx: usize, cycle: u64) {
        let layout = self.timers[idx].layout();
        for ch in 0..2 {
            let out = self.timers[idx].output(ch);
            let id = layout.outputs[ch];
            if let Some(port) = self.ports.iter_mut().find(|p| p.letter() == id.port) {
                port.set_override(id.bit, out, cycle);
            }
        }
    }

    // ---- Clock ----

    /// Advance the clock by `cycles`, one cycle at a time. Within a cycle
    /// every timer ticks and its pin notifications are delivered before the
    /// next cycle starts.
    pub fn advance(&mut self, cycles: u64) {
        for _ in 0..cycles {
            let now = self.clock.advance(1);
            for idx in 0..self.timers.len() {
                let changes = self.timers[idx].clock();
                if changes.iter().any(Option::is_some) {
                    self.apply_timer_outputs(idx, now);
                }
            }
        }
    }

    // ---- Interrupts ----

    /// Dispatch the highest-priority pending timer interrupt, if enabled.
    pub(crate) fn service_interrupts(&mut self) {
        if self.cpu.irq_hold {
            self.cpu.irq_hold = false;
            return;
        }
        if !self.cpu.flag(SREG_I) {
            return;
        }
        let pending = self
            .timers
            .iter()
            .enumerate()
            .filter_map(|(idx, t)| t.pending_interrupt().map(|v| (idx, v)))
            .min_by_key(|&(_, v)| v);
        let Some((idx, vector)) = pending else { return };

        self.timers[idx].acknowledge(vector);
        self.cpu.sleeping = false;
        let ret = self.cpu.pc;
        self.push_word(ret);
        self.cpu.set_flag(SREG_I, false);
        self.cpu.pc = self.variant.vector_addr(vector);
        tracing::trace!(vector, cycle = self.clock.now(), "interrupt");
        self.advance(4);
    }

    // ---- Data bus ----

    /// Read a data-space byte, routing I/O addresses to the peripherals.
    pub fn read_data(&mut self, addr: u16) -> u8 {
        match addr {
            SPL_ADDR => return self.cpu.sp as u8,
            SPH_ADDR => return (self.cpu.sp >> 8) as u8,
            SREG_ADDR => return self.cpu.sreg,
            _ => {}
        }
        if let Some(v) = self.ports.iter().find_map(|p| p.read(addr)) {
            return v;
        }
        if let Some(v) = self.timers.iter_mut().find_map(|t| t.read(addr)) {
            return v;
        }
        self.mem.read_raw(addr)
    }

    /// Write a data-space byte. Pin changes caused by the write are
    /// stamped with the current cycle.
    pub fn write_data(&mut self, addr: u16, value: u8) {
        let now = self.clock.now();
        match addr {
            SPL_ADDR => {
                self.cpu.sp = (self.cpu.sp & 0xFF00) | value as u16;
                return;
            }
            SPH_ADDR => {
                self.cpu.sp = (self.cpu.sp & 0x00FF) | ((value as u16) << 8);
                return;
            }
            SREG_ADDR => {
                self.cpu.sreg = value;
                return;
            }
            _ => {}
        }
        for port in self.ports.iter_mut() {
            if port.write(addr, value, now) {
                return;
            }
        }
        for idx in 0..self.timers.len() {
            if self.timers[idx].write(addr, value) {
                self.apply_timer_outputs(idx, now);
                return;
            }
        }
        self.mem.write_raw(addr, value);
    }

    /// SBI/CBI. On a PINx register only the addressed bit is written, so
    /// SBI toggles exactly one PORTx bit.
    pub fn write_bit(&mut self, addr: u16, bit: u8, set: bool) {
        if self.variant.ports.iter().any(|p| p.pin_addr == addr) {
            if set {
                self.write_data(addr, 1 << bit);
            }
            return;
        }
        let val = self.read_data(addr);
        let new_val = if set { val | (1 << bit) } else { val & !(1 << bit) };
        self.write_data(addr, new_val);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("variant", &self.variant.name)
            .field("state", &self.state)
            .field("cycle", &self.clock.now())
            .field("cpu", &self.cpu)
            .field("termination", &self.termination)
            .finish_non_exhaustive()
    }
}
