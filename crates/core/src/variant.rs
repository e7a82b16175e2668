//! Built-in microcontroller variant descriptors.
//!
//! Each supported part is a static [`Variant`] describing its memory sizes,
//! GPIO ports and timers, including which pin every timer compare output is
//! wired to. Variants are selected by name and are not configurable at runtime.
//!
//! All register addresses are data-space addresses (I/O address + 0x20).

use crate::pin::PinId;

/// GPIO port register layout.
#[derive(Debug)]
pub struct PortLayout {
    pub letter: char,
    pub pin_addr: u16,
    pub ddr_addr: u16,
    pub port_addr: u16,
    /// Bits physically present on this port.
    pub mask: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerWidth {
    Eight,
    Sixteen,
}

/// Clock-select (CSn2:0) to prescaler mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTable {
    /// Timer0/Timer1: stop, 1, 8, 64, 256, 1024, ext, ext
    Standard,
    /// Timer2: stop, 1, 8, 32, 64, 128, 256, 1024
    Async,
}

impl ClockTable {
    /// Prescaler for a CS value. `None` means the timer is stopped (or
    /// clocked externally, which is not simulated).
    pub fn prescaler(self, cs: u8) -> Option<u32> {
        let p = match (self, cs & 7) {
            (_, 0) => 0,
            (_, 1) => 1,
            (_, 2) => 8,
            (ClockTable::Standard, 3) => 64,
            (ClockTable::Standard, 4) => 256,
            (ClockTable::Standard, 5) => 1024,
            (ClockTable::Standard, _) => 0,
            (ClockTable::Async, 3) => 32,
            (ClockTable::Async, 4) => 64,
            (ClockTable::Async, 5) => 128,
            (ClockTable::Async, 6) => 256,
            (ClockTable::Async, _) => 1024,
        };
        if p == 0 { None } else { Some(p) }
    }
}

/// Register addresses of one timer. 16-bit registers list the low byte;
/// the high byte is at `addr + 1`.
#[derive(Debug)]
pub struct TimerRegs {
    pub tccr_a: u16,
    pub tccr_b: u16,
    /// TCCRnC (force output compare), Timer1 only.
    pub tccr_c: Option<u16>,
    pub tcnt: u16,
    pub ocr_a: u16,
    pub ocr_b: u16,
    /// ICR1, Timer1 only.
    pub icr: Option<u16>,
    pub timsk: u16,
    pub tifr: u16,
}

/// Interrupt vector numbers (not addresses) of one timer.
#[derive(Debug)]
pub struct TimerVectors {
    pub compa: u8,
    pub compb: u8,
    pub ovf: u8,
}

#[derive(Debug)]
pub struct TimerLayout {
    pub name: &'static str,
    pub width: TimerWidth,
    pub clock: ClockTable,
    pub regs: TimerRegs,
    /// Compare output pins for channels A and B.
    pub outputs: [PinId; 2],
    pub vectors: TimerVectors,
}

impl TimerLayout {
    pub fn max(&self) -> u16 {
        match self.width {
            TimerWidth::Eight => 0xFF,
            TimerWidth::Sixteen => 0xFFFF,
        }
    }
}

#[derive(Debug)]
pub struct Variant {
    pub name: &'static str,
    pub flash_size: usize,
    pub sram_size: usize,
    pub eeprom_size: usize,
    /// Words per interrupt vector slot (2 when the table holds JMPs).
    pub vector_words: u16,
    pub ports: &'static [PortLayout],
    pub timers: &'static [TimerLayout],
}

impl Variant {
    /// Total data space: 32 registers + 224 I/O bytes + SRAM.
    pub fn data_size(&self) -> usize {
        crate::REG_COUNT + crate::IO_SIZE + self.sram_size
    }

    /// Word address of interrupt vector `n`.
    pub fn vector_addr(&self, n: u8) -> u16 {
        n as u16 * self.vector_words
    }

    pub fn timer(&self, name: &str) -> Option<(usize, &'static TimerLayout)> {
        self.timers
            .iter()
            .enumerate()
            .find(|(_, t)| t.name.eq_ignore_ascii_case(name))
    }

    /// Names of every pin on the part, in port then bit order.
    pub fn pin_names(&self) -> Vec<String> {
        self.ports
            .iter()
            .flat_map(|p| (0..8u8).filter(move |b| p.mask & (1u8 << *b) != 0).map(move |b| format!("{}{}", p.letter, b)))
            .collect()
    }
}

// ATmega48/88/168/328 family share one I/O layout.

const MEGA_X8_PORTS: [PortLayout; 3] = [
    PortLayout { letter: 'B', pin_addr: 0x23, ddr_addr: 0x24, port_addr: 0x25, mask: 0xFF },
    PortLayout { letter: 'C', pin_addr: 0x26, ddr_addr: 0x27, port_addr: 0x28, mask: 0x7F },
    PortLayout { letter: 'D', pin_addr: 0x29, ddr_addr: 0x2A, port_addr: 0x2B, mask: 0xFF },
];

const MEGA_X8_TIMERS: [TimerLayout; 3] = [
    TimerLayout {
        name: "timer0",
        width: TimerWidth::Eight,
        clock: ClockTable::Standard,
        regs: TimerRegs {
            tccr_a: 0x44, tccr_b: 0x45, tccr_c: None, tcnt: 0x46,
            ocr_a: 0x47, ocr_b: 0x48, icr: None, timsk: 0x6E, tifr: 0x35,
        },
        outputs: [PinId::new('D', 6), PinId::new('D', 5)],
        vectors: TimerVectors { compa: 14, compb: 15, ovf: 16 },
    },
    TimerLayout {
        name: "timer1",
        width: TimerWidth::Sixteen,
        clock: ClockTable::Standard,
        regs: TimerRegs {
            tccr_a: 0x80, tccr_b: 0x81, tccr_c: Some(0x82), tcnt: 0x84,
            ocr_a: 0x88, ocr_b: 0x8A, icr: Some(0x86), timsk: 0x6F, tifr: 0x36,
        },
        outputs: [PinId::new('B', 1), PinId::new('B', 2)],
        vectors: TimerVectors { compa: 11, compb: 12, ovf: 13 },
    },
    TimerLayout {
        name: "timer2",
        width: TimerWidth::Eight,
        clock: ClockTable::Async,
        regs: TimerRegs {
            tccr_a: 0xB0, tccr_b: 0xB1, tccr_c: None, tcnt: 0xB2,
            ocr_a: 0xB3, ocr_b: 0xB4, icr: None, timsk: 0x70, tifr: 0x37,
        },
        outputs: [PinId::new('B', 3), PinId::new('D', 3)],
        vectors: TimerVectors { compa: 7, compb: 8, ovf: 9 },
    },
];

static PORTS: [PortLayout; 3] = MEGA_X8_PORTS;
static TIMERS: [TimerLayout; 3] = MEGA_X8_TIMERS;

pub static ATMEGA328: Variant = Variant {
    name: "atmega328",
    flash_size: 32 * 1024,
    sram_size: 2 * 1024,
    eeprom_size: 1024,
    vector_words: 2,
    ports: &PORTS,
    timers: &TIMERS,
};

pub static ATMEGA168: Variant = Variant {
    name: "atmega168",
    flash_size: 16 * 1024,
    sram_size: 1024,
    eeprom_size: 512,
    vector_words: 2,
    ports: &PORTS,
    timers: &TIMERS,
};

/// Look up a variant by name (case-insensitive). `atmega328p` aliases `atmega328`.
pub fn lookup(name: &str) -> Option<&'static Variant> {
    match name.trim().to_ascii_lowercase().as_str() {
        "atmega328" | "atmega328p" => Some(&ATMEGA328),
        "atmega168" | "atmega168p" => Some(&ATMEGA168),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("atmega328").unwrap().name, "atmega328");
        assert_eq!(lookup("ATmega328P").unwrap().name, "atmega328");
        assert_eq!(lookup("atmega168").unwrap().flash_size, 16 * 1024);
        assert!(lookup("atmega32u4").is_none());
    }

    #[test]
    fn test_timer2_prescalers() {
        let t = ClockTable::Async;
        let got: Vec<_> = (0..8).map(|cs| t.prescaler(cs)).collect();
        assert_eq!(got, vec![None, Some(1), Some(8), Some(32), Some(64), Some(128), Some(256), Some(1024)]);
    }

    #[test]
    fn test_standard_prescalers_external_clock_stops() {
        let t = ClockTable::Standard;
        assert_eq!(t.prescaler(3), Some(64));
        assert_eq!(t.prescaler(6), None);
        assert_eq!(t.prescaler(7), None);
    }

    #[test]
    fn test_pwm_pin_wiring() {
        let v = lookup("atmega328").unwrap();
        let (_, t0) = v.timer("timer0").unwrap();
        assert_eq!(t0.outputs, [PinId::new('D', 6), PinId::new('D', 5)]);
        let (idx, t2) = v.timer("TIMER2").unwrap();
        assert_eq!(idx, 2);
        assert_eq!(t2.outputs, [PinId::new('B', 3), PinId::new('D', 3)]);
    }

    #[test]
    fn test_pin_names() {
        let names = ATMEGA328.pin_names();
        assert_eq!(names.len(), 8 + 7 + 8);
        assert_eq!(names[0], "B0");
        assert!(names.contains(&"C6".to_string()));
        assert!(!names.contains(&"C7".to_string()));
    }

    #[test]
    fn test_vector_addresses() {
        assert_eq!(ATMEGA328.vector_addr(16), 0x20);
        assert_eq!(ATMEGA328.vector_addr(0), 0);
    }
}
