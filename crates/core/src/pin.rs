//! Logical GPIO lines and pin-change notification.
//!
//! A [`Pin`] holds the resolved level of one port bit and an ordered list of
//! observers. Observers run synchronously inside [`Pin::set_level`], in
//! registration order, and only when the level actually changes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical pin level.
///
/// Tri-state is what an unconfigured input (DDR=0, PORT=0) resolves to; an
/// input with the pull-up enabled reads as `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Low,
    High,
    Tristate,
}

impl Level {
    /// Single-character form used in traces: `H`, `L`, or `t`.
    pub fn as_char(self) -> char {
        match self {
            Level::High => 'H',
            Level::Low => 'L',
            Level::Tristate => 't',
        }
    }

    pub fn from_bool(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }

    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Pin identifier: port letter plus bit index, e.g. `D5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinId {
    pub port: char,
    pub bit: u8,
}

impl PinId {
    pub const fn new(port: char, bit: u8) -> Self {
        PinId { port, bit }
    }

    /// Parse `D5`, `d5` or `PD5`.
    pub fn parse(name: &str) -> Option<PinId> {
        let upper = name.trim().to_ascii_uppercase();
        let s = if upper.len() == 3 && upper.starts_with('P') { &upper[1..] } else { upper.as_str() };
        let mut chars = s.chars();
        let port = chars.next()?;
        if !port.is_ascii_alphabetic() {
            return None;
        }
        let bit: u8 = chars.as_str().parse().ok()?;
        if bit > 7 {
            return None;
        }
        Some(PinId { port, bit })
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.port, self.bit)
    }
}

/// A level change as delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinEvent {
    pub pin: PinId,
    pub level: Level,
    /// Clock cycle at which the change happened.
    pub cycle: u64,
}

/// Receiver of pin-change notifications.
///
/// Implemented for any `FnMut(&PinEvent)`, so plain closures can be registered.
pub trait PinObserver {
    fn pin_changed(&mut self, event: &PinEvent);
}

impl<F: FnMut(&PinEvent)> PinObserver for F {
    fn pin_changed(&mut self, event: &PinEvent) {
        self(event)
    }
}

pub struct Pin {
    id: PinId,
    level: Level,
    observers: Vec<Box<dyn PinObserver>>,
}

impl Pin {
    pub fn new(id: PinId) -> Self {
        Pin { id, level: Level::Tristate, observers: Vec::new() }
    }

    pub fn id(&self) -> PinId {
        self.id
    }

    pub fn name(&self) -> String {
        self.id.to_string()
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Update the level. Observers are notified before this returns, and
    /// only if the level differs from the previous one. Returns whether it changed.
    pub fn set_level(&mut self, level: Level, cycle: u64) -> bool {
        if level == self.level {
            return false;
        }
        self.level = level;
        tracing::trace!(pin = %self.id, level = %level, cycle, "pin changed");
        let event = PinEvent { pin: self.id, level, cycle };
        for obs in self.observers.iter_mut() {
            obs.pin_changed(&event);
        }
        true
    }

    /// Append an observer. No de-duplication is performed.
    pub fn register_observer(&mut self, observer: impl PinObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn clear_observers(&mut self) {
        self.observers.clear();
    }

    /// Set the level without notifying anyone (savestate restore, reset).
    pub(crate) fn restore_level(&mut self, level: Level) {
        self.level = level;
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("observers", &self.observers.len())
            .finish()
    }
}
