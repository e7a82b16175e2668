//! GPIO port (PINx / DDRx / PORTx).
//!
//! A port owns the [`Pin`]s of its bits and re-resolves their levels after
//! every register write or timer output change:
//!
//! - DDR=1: compare-output level when a timer has taken over the pin,
//!   otherwise the PORT bit
//! - DDR=0, PORT=1: High (pull-up)
//! - DDR=0, PORT=0: Tri-state
//!
//! Writing 1 to a PINx bit toggles the matching PORTx bit.

use serde::{Deserialize, Serialize};

use crate::pin::{Level, Pin, PinId};
use crate::variant::PortLayout;

/// Latches of one port, as stored in a savestate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortState {
    ddr: u8,
    port: u8,
    input_driven: u8,
    input_high: u8,
    oc_mask: u8,
    oc_level: u8,
    levels: Vec<Level>,
}

pub struct Port {
    layout: &'static PortLayout,
    ddr: u8,
    port: u8,
    /// Bits with an external input level applied (see `set_input`).
    input_driven: u8,
    input_high: u8,
    /// Bits currently driven by a timer compare output.
    oc_mask: u8,
    oc_level: u8,
    pins: Vec<Pin>,
}

impl Port {
    pub fn new(layout: &'static PortLayout) -> Self {
        let pins = (0..8).map(|b| Pin::new(PinId::new(layout.letter, b))).collect();
        Port {
            layout,
            ddr: 0,
            port: 0,
            input_driven: 0,
            input_high: 0,
            oc_mask: 0,
            oc_level: 0,
            pins,
        }
    }

    pub fn letter(&self) -> char {
        self.layout.letter
    }

    pub fn has_bit(&self, bit: u8) -> bool {
        bit < 8 && self.layout.mask & (1 << bit) != 0
    }

    pub fn pin(&self, bit: u8) -> Option<&Pin> {
        if self.has_bit(bit) { self.pins.get(bit as usize) } else { None }
    }

    pub fn pin_mut(&mut self, bit: u8) -> Option<&mut Pin> {
        if self.has_bit(bit) { self.pins.get_mut(bit as usize) } else { None }
    }

    pub fn pins(&self) -> impl Iterator<Item = &Pin> {
        let mask = self.layout.mask;
        self.pins.iter().filter(move |p| mask & (1 << p.id().bit) != 0)
    }

    /// Power-on state. Pin levels are reset silently; observers are kept.
    pub fn power_on(&mut self) {
        self.ddr = 0;
        self.port = 0;
        self.input_driven = 0;
        self.input_high = 0;
        self.oc_mask = 0;
        self.oc_level = 0;
        for pin in self.pins.iter_mut() {
            pin.restore_level(Level::Tristate);
        }
    }

    pub fn clear_observers(&mut self) {
        for pin in self.pins.iter_mut() {
            pin.clear_observers();
        }
    }

    fn resolve(&self, bit: u8) -> Level {
        let m = 1u8 << bit;
        if self.ddr & m != 0 {
            let high = if self.oc_mask & m != 0 { self.oc_level & m != 0 } else { self.port & m != 0 };
            Level::from_bool(high)
        } else if self.port & m != 0 {
            Level::High
        } else {
            Level::Tristate
        }
    }

    /// Push resolved levels to the pins, in ascending bit order.
    fn refresh(&mut self, cycle: u64) {
        for bit in 0..8u8 {
            if !self.has_bit(bit) {
                continue;
            }
            let level = self.resolve(bit);
            self.pins[bit as usize].set_level(level, cycle);
        }
    }

    /// Hand a bit over to a timer compare output (`Some(level)`) or give it
    /// back to the PORT latch (`None`).
    pub fn set_override(&mut self, bit: u8, level: Option<bool>, cycle: u64) {
        let m = 1u8 << bit;
        match level {
            Some(high) => {
                self.oc_mask |= m;
                if high { self.oc_level |= m } else { self.oc_level &= !m }
            }
            None => {
                self.oc_mask &= !m;
                self.oc_level &= !m;
            }
        }
        if self.has_bit(bit) {
            let lvl = self.resolve(bit);
            self.pins[bit as usize].set_level(lvl, cycle);
        }
    }

    /// Set one DDR bit, as a write to DDRx would.
    pub fn set_direction(&mut self, bit: u8, output: bool, cycle: u64) {
        let m = (1u8 << bit) & self.layout.mask;
        if output { self.ddr |= m } else { self.ddr &= !m }
        if m != 0 {
            let lvl = self.resolve(bit);
            self.pins[bit as usize].set_level(lvl, cycle);
        }
    }

    /// External level seen by PINx reads on an input bit. `Tristate`
    /// removes the stimulus.
    pub fn set_input(&mut self, bit: u8, level: Level) {
        let m = 1u8 << bit;
        match level {
            Level::Tristate => {
                self.input_driven &= !m;
                self.input_high &= !m;
            }
            Level::High => {
                self.input_driven |= m;
                self.input_high |= m;
            }
            Level::Low => {
                self.input_driven |= m;
                self.input_high &= !m;
            }
        }
    }

    fn pin_register(&self) -> u8 {
        let mut v = 0u8;
        for bit in 0..8u8 {
            let m = 1u8 << bit;
            let high = if self.ddr & m != 0 {
                self.resolve(bit) == Level::High
            } else if self.input_driven & m != 0 {
                self.input_high & m != 0
            } else {
                self.port & m != 0
            };
            if high {
                v |= m;
            }
        }
        v & self.layout.mask
    }

    /// Handle a data-space write. Returns true if `addr` belongs to this port.
    pub fn write(&mut self, addr: u16, value: u8, cycle: u64) -> bool {
        let l = self.layout;
        if addr == l.ddr_addr {
            self.ddr = value & l.mask;
        } else if addr == l.port_addr {
            self.port = value & l.mask;
        } else if addr == l.pin_addr {
            self.port ^= value & l.mask;
        } else {
            return false;
        }
        self.refresh(cycle);
        true
    }

    /// Handle a data-space read. Returns `Some` if `addr` belongs to this port.
    pub fn read(&self, addr: u16) -> Option<u8> {
        let l = self.layout;
        if addr == l.ddr_addr {
            Some(self.ddr)
        } else if addr == l.port_addr {
            Some(self.port)
        } else if addr == l.pin_addr {
            Some(self.pin_register())
        } else {
            None
        }
    }

    pub fn save_state(&self) -> PortState {
        PortState {
            ddr: self.ddr,
            port: self.port,
            input_driven: self.input_driven,
            input_high: self.input_high,
            oc_mask: self.oc_mask,
            oc_level: self.oc_level,
            levels: self.pins.iter().map(|p| p.level()).collect(),
        }
    }

    /// Restore latches and pin levels without notifying observers.
    pub fn load_state(&mut self, s: &PortState) {
        self.ddr = s.ddr;
        self.port = s.port;
        self.input_driven = s.input_driven;
        self.input_high = s.input_high;
        self.oc_mask = s.oc_mask;
        self.oc_level = s.oc_level;
        for (pin, level) in self.pins.iter_mut().zip(s.levels.iter()) {
            pin.restore_level(*level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::PinEvent;
    use crate::variant::ATMEGA328;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn port_d() -> Port {
        Port::new(&ATMEGA328.ports[2])
    }

    #[test]
    fn test_output_levels() {
        let mut p = port_d();
        assert_eq!(p.pin(0).unwrap().level(), Level::Tristate);
        p.write(0x2A, 0x01, 0);
        assert_eq!(p.pin(0).unwrap().level(), Level::Low);
        p.write(0x2B, 0x01, 1);
        assert_eq!(p.pin(0).unwrap().level(), Level::High);
    }

    #[test]
    fn test_pullup_and_tristate() {
        let mut p = port_d();
        p.write(0x2B, 0x04, 0);
        assert_eq!(p.pin(2).unwrap().level(), Level::High);
        p.write(0x2B, 0x00, 1);
        assert_eq!(p.pin(2).unwrap().level(), Level::Tristate);
    }

    #[test]
    fn test_pin_write_toggles_port() {
        let mut p = port_d();
        p.write(0x2A, 0xFF, 0);
        p.write(0x29, 0x81, 1);
        assert_eq!(p.read(0x2B), Some(0x81));
        p.write(0x29, 0x01, 2);
        assert_eq!(p.read(0x2B), Some(0x80));
        assert_eq!(p.read(0x29), Some(0x80));
    }

    #[test]
    fn test_timer_override() {
        let mut p = port_d();
        p.write(0x2A, 0x40, 0);
        p.set_override(6, Some(true), 5);
        assert_eq!(p.pin(6).unwrap().level(), Level::High);
        p.set_override(6, None, 6);
        assert_eq!(p.pin(6).unwrap().level(), Level::Low);
    }

    #[test]
    fn test_override_needs_output_direction() {
        let mut p = port_d();
        p.set_override(6, Some(true), 0);
        assert_eq!(p.pin(6).unwrap().level(), Level::Tristate);
        p.write(0x2A, 0x40, 1);
        assert_eq!(p.pin(6).unwrap().level(), Level::High);
    }

    #[test]
    fn test_input_stimulus_only_affects_pin_register() {
        let mut p = port_d();
        p.set_input(3, Level::High);
        assert_eq!(p.read(0x29).unwrap() & 0x08, 0x08);
        assert_eq!(p.pin(3).unwrap().level(), Level::Tristate);
        p.set_input(3, Level::Tristate);
        assert_eq!(p.read(0x29).unwrap() & 0x08, 0);
    }

    #[test]
    fn test_changes_notify_in_bit_order() {
        let mut p = port_d();
        let log = Rc::new(RefCell::new(Vec::new()));
        for bit in 0..8 {
            let l = log.clone();
            p.pin_mut(bit).unwrap().register_observer(move |e: &PinEvent| l.borrow_mut().push(e.pin.bit));
        }
        p.write(0x2A, 0xFF, 0);
        assert_eq!(*log.borrow(), (0..8).collect::<Vec<u8>>());
    }

    #[test]
    fn test_missing_bit() {
        let mut p = Port::new(&ATMEGA328.ports[1]);
        assert!(p.pin(7).is_none());
        assert!(p.pin_mut(6).is_some());
        assert_eq!(p.pins().count(), 7);
    }

    #[test]
    fn test_state_restore_is_silent() {
        let mut p = port_d();
        p.write(0x2A, 0x01, 0);
        p.write(0x2B, 0x01, 0);
        let saved = p.save_state();
        let mut q = port_d();
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();
        q.pin_mut(0).unwrap().register_observer(move |_: &PinEvent| *h.borrow_mut() += 1);
        q.load_state(&saved);
        assert_eq!(q.pin(0).unwrap().level(), Level::High);
        assert_eq!(*hits.borrow(), 0);
    }
}
