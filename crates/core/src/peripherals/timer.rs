//! Timer/Counter with PWM output compare.
//!
//! One [`TimerUnit`] models Timer0, Timer1 or Timer2 of the ATmega x8 family:
//! 8- or 16-bit counter, clock prescaler, two compare channels (A/B) each
//! bound to an output pin, and overflow/compare-match interrupt flags.
//!
//! Supported waveform modes: Normal, CTC, Fast PWM and Phase-correct PWM
//! (phase-and-frequency-correct is run as phase-correct). The counter is
//! advanced one effective tick at a time, so every compare match is seen
//! exactly once, on the tick where the counter arrives at the threshold.
//!
//! Output levels in PWM modes:
//!
//! | Mode | Non-inverting (COM=2) | Boundaries |
//! |------|-----------------------|------------|
//! | Fast | set at BOTTOM, cleared on match | OCR=0 stays low, OCR>=TOP stays high |
//! | Phase-correct | cleared on up-count match, set on down-count match | OCR=0 stays low, OCR>=TOP stays high |
//!
//! Inverting (COM=3) is the complement. A fast-mode period is TOP+1 ticks;
//! a phase-correct period is 2*TOP ticks.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::variant::{TimerLayout, TimerWidth};

// TIFRn / TIMSKn bits
const TOV: u8 = 1 << 0;
const OCFA: u8 = 1 << 1;
const OCFB: u8 = 1 << 2;
const OCF: [u8; 2] = [OCFA, OCFB];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaveformMode {
    Normal,
    Ctc,
    FastPwm,
    PhaseCorrectPwm,
}

impl WaveformMode {
    pub fn is_pwm(self) -> bool {
        matches!(self, WaveformMode::FastPwm | WaveformMode::PhaseCorrectPwm)
    }
}

/// Where the counter's TOP value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopSource {
    Max,
    Fixed(u16),
    OcrA,
    Icr,
}

/// Compare output mode (COMnx1:0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOutput {
    Disconnected,
    Toggle,
    /// Clear on match. Non-inverting in PWM modes.
    Clear,
    /// Set on match. Inverting in PWM modes.
    Set,
}

impl CompareOutput {
    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => CompareOutput::Disconnected,
            1 => CompareOutput::Toggle,
            2 => CompareOutput::Clear,
            _ => CompareOutput::Set,
        }
    }
}

/// Typed timer setup, bypassing the register interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub mode: WaveformMode,
    /// Raw clock cycles per counter tick. Must be non-zero.
    pub prescaler: u32,
    /// Counter value at which the count wraps (fast, normal, CTC) or
    /// reverses (phase-correct). Must be non-zero and fit the counter width.
    pub top: u16,
    /// Compare thresholds for channels A and B.
    pub compare: [u16; 2],
    pub outputs: [CompareOutput; 2],
}

impl TimerConfig {
    /// Non-inverting PWM on both channels.
    pub fn pwm(mode: WaveformMode, prescaler: u32, top: u16, compare: [u16; 2]) -> Self {
        TimerConfig {
            mode,
            prescaler,
            top,
            compare,
            outputs: [CompareOutput::Clear, CompareOutput::Clear],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Channel {
    ocr: u16,
    com: u8,
    /// Output compare latch (OCnx).
    latch: bool,
}

/// Serializable timer state; everything except the static layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    counter: u16,
    counting_down: bool,
    prescale_count: u32,
    prescaler: Option<u32>,
    mode: WaveformMode,
    top_source: TopSource,
    tccr_a: u8,
    tccr_b: u8,
    channels: [Channel; 2],
    icr: u16,
    temp: u8,
    tifr: u8,
    timsk: u8,
}

impl Default for TimerState {
    fn default() -> Self {
        TimerState {
            counter: 0,
            counting_down: false,
            prescale_count: 0,
            prescaler: None,
            mode: WaveformMode::Normal,
            top_source: TopSource::Max,
            tccr_a: 0,
            tccr_b: 0,
            channels: [Channel::default(); 2],
            icr: 0,
            temp: 0,
            tifr: 0,
            timsk: 0,
        }
    }
}

/// Latch changes produced by one clock cycle, per channel.
pub type OutputChanges = [Option<bool>; 2];

pub struct TimerUnit {
    layout: &'static TimerLayout,
    s: TimerState,
}

impl TimerUnit {
    pub fn new(layout: &'static TimerLayout) -> Self {
        TimerUnit { layout, s: TimerState::default() }
    }

    pub fn reset(&mut self) {
        self.s = TimerState::default();
    }

    pub fn layout(&self) -> &'static TimerLayout {
        self.layout
    }

    pub fn name(&self) -> &'static str {
        self.layout.name
    }

    pub fn counter(&self) -> u16 {
        self.s.counter
    }

    pub fn mode(&self) -> WaveformMode {
        self.s.mode
    }

    pub fn prescaler(&self) -> Option<u32> {
        self.s.prescaler
    }

    pub fn compare(&self, channel: usize) -> u16 {
        self.s.channels[channel].ocr
    }

    /// Current TOP value for the configured mode.
    pub fn top(&self) -> u16 {
        match self.s.top_source {
            TopSource::Max => self.layout.max(),
            TopSource::Fixed(v) => v,
            TopSource::OcrA => self.s.channels[0].ocr,
            TopSource::Icr => self.s.icr,
        }
    }

    /// Level driven onto the channel's pin, or `None` when the compare
    /// output is disconnected and the pin follows its PORT bit.
    pub fn output(&self, channel: usize) -> Option<bool> {
        let ch = &self.s.channels[channel];
        match self.output_mode(channel) {
            CompareOutput::Disconnected => None,
            _ => Some(ch.latch),
        }
    }

    /// Effective compare output mode. COM=1 in PWM modes only toggles
    /// channel A when TOP comes from a register; otherwise it is disconnected.
    fn output_mode(&self, channel: usize) -> CompareOutput {
        let com = CompareOutput::from_bits(self.s.channels[channel].com);
        if com == CompareOutput::Toggle && self.s.mode.is_pwm() {
            let register_top = matches!(self.s.top_source, TopSource::OcrA | TopSource::Icr);
            if channel != 0 || !register_top {
                return CompareOutput::Disconnected;
            }
        }
        com
    }

    /// Apply a typed configuration. The counter restarts from BOTTOM and the
    /// output latches take their BOTTOM level.
    pub fn configure(&mut self, cfg: &TimerConfig) -> Result<()> {
        if cfg.prescaler == 0 {
            return Err(SimError::Configuration(format!("{}: prescaler must be non-zero", self.name())));
        }
        if cfg.top == 0 || cfg.top > self.layout.max() {
            return Err(SimError::Configuration(format!(
                "{}: TOP {} outside 1..={}", self.name(), cfg.top, self.layout.max()
            )));
        }
        let mut s = TimerState {
            prescaler: Some(cfg.prescaler),
            mode: cfg.mode,
            top_source: TopSource::Fixed(cfg.top),
            tccr_a: self.s.tccr_a,
            tccr_b: self.s.tccr_b,
            timsk: self.s.timsk,
            ..TimerState::default()
        };
        for ch in 0..2 {
            let com = match cfg.outputs[ch] {
                CompareOutput::Disconnected => 0,
                CompareOutput::Toggle => 1,
                CompareOutput::Clear => 2,
                CompareOutput::Set => 3,
            };
            s.channels[ch] = Channel { ocr: cfg.compare[ch], com, latch: false };
        }
        self.s = s;
        for ch in 0..2 {
            self.s.channels[ch].latch = self.bottom_level(ch);
        }
        tracing::debug!(timer = self.name(), mode = ?cfg.mode, prescaler = cfg.prescaler, top = cfg.top, "timer configured");
        Ok(())
    }

    /// Write a compare threshold. It is used from the next tick on; a value
    /// the counter has already passed does not fire retroactively.
    pub fn set_compare(&mut self, channel: usize, value: u16) {
        let v = value & self.layout.max();
        self.s.channels[channel].ocr = v;
    }

    /// Latch level a PWM channel has right after BOTTOM.
    fn bottom_level(&self, channel: usize) -> bool {
        let ocr = self.s.channels[channel].ocr;
        let active = match self.output_mode(channel) {
            CompareOutput::Clear => true,
            CompareOutput::Set => false,
            _ => return false,
        };
        if !self.s.mode.is_pwm() {
            return false;
        }
        if ocr == 0 { !active } else { active }
    }

    // ---- Clocking ----

    /// Advance by one raw clock cycle. Counts only on every `prescaler`-th call.
    pub fn clock(&mut self) -> OutputChanges {
        let Some(p) = self.s.prescaler else { return [None, None] };
        self.s.prescale_count += 1;
        if self.s.prescale_count < p {
            return [None, None];
        }
        self.s.prescale_count = 0;
        self.count()
    }

    /// One effective tick: move the counter, raise flags, update latches.
    fn count(&mut self) -> OutputChanges {
        let top = self.top();
        let max = self.layout.max();
        let mut at_bottom = false;
        let mut at_top = false;
        let mut stepped_up = true;

        if self.s.mode == WaveformMode::PhaseCorrectPwm {
            if top == 0 {
                self.s.counter = 0;
                return [None, None];
            }
            if self.s.counting_down {
                stepped_up = false;
                self.s.counter = self.s.counter.saturating_sub(1);
                if self.s.counter == 0 {
                    self.s.counting_down = false;
                    at_bottom = true;
                    self.s.tifr |= TOV;
                }
            } else {
                self.s.counter = self.s.counter.wrapping_add(1) & max;
                if self.s.counter >= top {
                    self.s.counting_down = true;
                    at_top = true;
                }
            }
        } else {
            let from = self.s.counter;
            if from == top || from == max {
                self.s.counter = 0;
                at_bottom = true;
                if self.s.mode != WaveformMode::Ctc || from == max {
                    self.s.tifr |= TOV;
                }
            } else {
                self.s.counter = from + 1;
            }
        }

        let mut changes = [None, None];
        for ch in 0..2 {
            let ocr = self.s.channels[ch].ocr;
            let matched = self.s.counter == ocr;
            if matched {
                self.s.tifr |= OCF[ch];
            }
            let old = self.s.channels[ch].latch;
            let new = self.next_latch(ch, old, matched, at_bottom, at_top, stepped_up, top);
            if new != old {
                self.s.channels[ch].latch = new;
                if self.output_mode(ch) != CompareOutput::Disconnected {
                    changes[ch] = Some(new);
                }
            }
        }
        changes
    }

    #[allow(clippy::too_many_arguments)]
    fn next_latch(&self, ch: usize, latch: bool, matched: bool, at_bottom: bool,
                  at_top: bool, stepped_up: bool, top: u16) -> bool {
        let ocr = self.s.channels[ch].ocr;
        let com = self.output_mode(ch);
        match (self.s.mode, com) {
            (_, CompareOutput::Disconnected) => latch,
            (_, CompareOutput::Toggle) => if matched { !latch } else { latch },
            (WaveformMode::Normal | WaveformMode::Ctc, CompareOutput::Clear) => if matched { false } else { latch },
            (WaveformMode::Normal | WaveformMode::Ctc, CompareOutput::Set) => if matched { true } else { latch },
            (WaveformMode::FastPwm, _) => {
                let active = com == CompareOutput::Clear;
                let mut v = latch;
                if at_bottom {
                    v = active;
                }
                // OCR >= TOP never clears; OCR == 0 clears on the same tick it was set
                if matched && ocr < top {
                    v = !active;
                }
                v
            }
            (WaveformMode::PhaseCorrectPwm, _) => {
                let active = com == CompareOutput::Clear;
                if ocr == 0 {
                    if at_bottom || at_top { !active } else { latch }
                } else if ocr >= top {
                    if at_bottom || at_top { active } else { latch }
                } else if matched {
                    if stepped_up { !active } else { active }
                } else {
                    latch
                }
            }
        }
    }

    // ---- Interrupts ----

    /// Highest-priority pending and enabled interrupt, as a vector number.
    pub fn pending_interrupt(&self) -> Option<u8> {
        let pending = self.s.tifr & self.s.timsk;
        let v = &self.layout.vectors;
        [(OCFA, v.compa), (OCFB, v.compb), (TOV, v.ovf)]
            .into_iter()
            .filter(|(bit, _)| pending & bit != 0)
            .map(|(_, vec)| vec)
            .min()
    }

    /// Clear the flag belonging to a dispatched vector.
    pub fn acknowledge(&mut self, vector: u8) {
        let v = &self.layout.vectors;
        if vector == v.compa {
            self.s.tifr &= !OCFA;
        } else if vector == v.compb {
            self.s.tifr &= !OCFB;
        } else if vector == v.ovf {
            self.s.tifr &= !TOV;
        }
    }

    // ---- Register interface ----

    /// Handle a data-space write. Returns true if `addr` belongs to this timer.
    pub fn write(&mut self, addr: u16, value: u8) -> bool {
        let layout: &'static TimerLayout = self.layout;
        let r = &layout.regs;
        let wide = layout.width == TimerWidth::Sixteen;

        if addr == r.tccr_a {
            self.s.tccr_a = value;
            self.s.channels[0].com = (value >> 6) & 3;
            self.s.channels[1].com = (value >> 4) & 3;
            self.update_mode();
        } else if addr == r.tccr_b {
            self.s.tccr_b = value & if wide { 0x1F } else { 0x0F };
            self.update_mode();
            if !wide {
                self.force_compare(value);
            }
        } else if Some(addr) == r.tccr_c {
            self.force_compare(value);
        } else if addr == r.timsk {
            self.s.timsk = value & (TOV | OCFA | OCFB);
        } else if addr == r.tifr {
            self.s.tifr &= !value;
        } else if addr == r.tcnt {
            self.s.counter = if wide { self.wide_value(value) } else { value as u16 };
        } else if addr == r.ocr_a {
            let v = if wide { self.wide_value(value) } else { value as u16 };
            self.set_compare(0, v);
        } else if addr == r.ocr_b {
            let v = if wide { self.wide_value(value) } else { value as u16 };
            self.set_compare(1, v);
        } else if Some(addr) == r.icr {
            self.s.icr = self.wide_value(value);
        } else if wide && self.is_high_byte(addr) {
            self.s.temp = value;
        } else {
            return false;
        }
        true
    }

    /// Handle a data-space read. Returns `Some` if `addr` belongs to this timer.
    pub fn read(&mut self, addr: u16) -> Option<u8> {
        let layout: &'static TimerLayout = self.layout;
        let r = &layout.regs;
        let wide = layout.width == TimerWidth::Sixteen;

        if addr == r.tccr_a {
            return Some(self.s.tccr_a);
        }
        if addr == r.tccr_b {
            return Some(self.s.tccr_b);
        }
        if Some(addr) == r.tccr_c {
            return Some(0);
        }
        if addr == r.timsk {
            return Some(self.s.timsk);
        }
        if addr == r.tifr {
            return Some(self.s.tifr);
        }
        if addr == r.tcnt {
            if wide {
                self.s.temp = (self.s.counter >> 8) as u8;
            }
            return Some(self.s.counter as u8);
        }
        if Some(addr) == r.icr {
            self.s.temp = (self.s.icr >> 8) as u8;
            return Some(self.s.icr as u8);
        }
        if addr == r.ocr_a {
            return Some(self.s.channels[0].ocr as u8);
        }
        if addr == r.ocr_b {
            return Some(self.s.channels[1].ocr as u8);
        }
        if wide {
            if addr == r.tcnt + 1 || Some(addr) == r.icr.map(|a| a + 1) {
                return Some(self.s.temp);
            }
            if addr == r.ocr_a + 1 {
                return Some((self.s.channels[0].ocr >> 8) as u8);
            }
            if addr == r.ocr_b + 1 {
                return Some((self.s.channels[1].ocr >> 8) as u8);
            }
        }
        None
    }

    /// Combine the TEMP high byte with a low-byte write.
    fn wide_value(&self, low: u8) -> u16 {
        ((self.s.temp as u16) << 8) | low as u16
    }

    fn is_high_byte(&self, addr: u16) -> bool {
        let r = &self.layout.regs;
        addr == r.tcnt + 1 || addr == r.ocr_a + 1 || addr == r.ocr_b + 1 || Some(addr) == r.icr.map(|a| a + 1)
    }

    /// FOCnA/FOCnB strobes: apply the match action without raising a flag.
    /// Ignored in PWM modes.
    fn force_compare(&mut self, value: u8) {
        if self.s.mode.is_pwm() {
            return;
        }
        for (ch, bit) in [(0usize, 0x80u8), (1, 0x40)] {
            if value & bit == 0 {
                continue;
            }
            let c = &mut self.s.channels[ch];
            c.latch = match CompareOutput::from_bits(c.com) {
                CompareOutput::Disconnected => c.latch,
                CompareOutput::Toggle => !c.latch,
                CompareOutput::Clear => false,
                CompareOutput::Set => true,
            };
        }
    }

    fn update_mode(&mut self) {
        let wgm_lo = self.s.tccr_a & 3;
        let (mode, top) = match self.layout.width {
            TimerWidth::Eight => {
                let wgm = wgm_lo | ((self.s.tccr_b >> 1) & 4);
                decode_wgm8(wgm)
            }
            TimerWidth::Sixteen => {
                let wgm = wgm_lo | ((self.s.tccr_b >> 1) & 0x0C);
                decode_wgm16(wgm)
            }
        };
        let prescaler = self.layout.clock.prescaler(self.s.tccr_b & 7);
        if mode != self.s.mode || top != self.s.top_source || prescaler != self.s.prescaler {
            tracing::debug!(timer = self.name(), ?mode, ?top, ?prescaler, "timer mode change");
        }
        if mode != WaveformMode::PhaseCorrectPwm {
            self.s.counting_down = false;
        }
        self.s.mode = mode;
        self.s.top_source = top;
        if prescaler != self.s.prescaler {
            self.s.prescale_count = 0;
        }
        self.s.prescaler = prescaler;
    }

    // ---- Savestate ----

    pub fn save_state(&self) -> TimerState {
        self.s.clone()
    }

    pub fn load_state(&mut self, s: &TimerState) {
        self.s = s.clone();
    }
}

/// WGM02:0 of Timer0/Timer2.
fn decode_wgm8(wgm: u8) -> (WaveformMode, TopSource) {
    match wgm {
        1 => (WaveformMode::PhaseCorrectPwm, TopSource::Max),
        2 => (WaveformMode::Ctc, TopSource::OcrA),
        3 => (WaveformMode::FastPwm, TopSource::Max),
        5 => (WaveformMode::PhaseCorrectPwm, TopSource::OcrA),
        7 => (WaveformMode::FastPwm, TopSource::OcrA),
        _ => (WaveformMode::Normal, TopSource::Max),
    }
}

/// WGM13:0 of Timer1.
fn decode_wgm16(wgm: u8) -> (WaveformMode, TopSource) {
    match wgm {
        1 => (WaveformMode::PhaseCorrectPwm, TopSource::Fixed(0x00FF)),
        2 => (WaveformMode::PhaseCorrectPwm, TopSource::Fixed(0x01FF)),
        3 => (WaveformMode::PhaseCorrectPwm, TopSource::Fixed(0x03FF)),
        4 => (WaveformMode::Ctc, TopSource::OcrA),
        5 => (WaveformMode::FastPwm, TopSource::Fixed(0x00FF)),
        6 => (WaveformMode::FastPwm, TopSource::Fixed(0x01FF)),
        7 => (WaveformMode::FastPwm, TopSource::Fixed(0x03FF)),
        8 | 10 => (WaveformMode::PhaseCorrectPwm, TopSource::Icr),
        9 | 11 => (WaveformMode::PhaseCorrectPwm, TopSource::OcrA),
        12 => (WaveformMode::Ctc, TopSource::Icr),
        14 => (WaveformMode::FastPwm, TopSource::Icr),
        15 => (WaveformMode::FastPwm, TopSource::OcrA),
        _ => (WaveformMode::Normal, TopSource::Max),
    }
}
