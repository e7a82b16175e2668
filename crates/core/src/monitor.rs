//! Pin monitors: recorded pin-change traces.
//!
//! A [`PinMonitor`] registers itself as an observer of one pin and appends a
//! [`PinRecord`] per level change to a [`Trace`]. Several monitors can share
//! one trace to capture the interleaving of changes across pins.
//!
//! Monitors are attached after loading and dropped by [`Device::reset`] and
//! by a savestate restore: attach them again after either.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Serialize, Serializer};

use crate::device::Device;
use crate::error::{Result, SimError};
use crate::pin::{Level, PinEvent};

fn level_char<S: Serializer>(level: &Level, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_char(level.as_char())
}

/// One observed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinRecord {
    pub pin: String,
    #[serde(serialize_with = "level_char")]
    pub level: Level,
    /// Cycle of the change, when the monitor records timestamps.
    pub cycle: Option<u64>,
}

impl PinRecord {
    pub fn new(pin: &str, level: Level, cycle: Option<u64>) -> Self {
        PinRecord { pin: pin.to_string(), level, cycle }
    }
}

/// Append-only record sequence, shareable between monitors.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    records: Rc<RefCell<Vec<PinRecord>>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, rec: PinRecord) {
        self.records.borrow_mut().push(rec);
    }

    /// Copy of the records so far.
    pub fn records(&self) -> Vec<PinRecord> {
        self.records.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    /// `(pin, level)` pairs, the form scenario checks compare against.
    pub fn levels(&self) -> Vec<(String, char)> {
        self.records.borrow().iter().map(|r| (r.pin.clone(), r.level.as_char())).collect()
    }

    /// Records for one pin, in order.
    pub fn for_pin(&self, pin: &str) -> Vec<PinRecord> {
        self.records.borrow().iter().filter(|r| r.pin == pin).cloned().collect()
    }

    pub fn clear(&self) {
        self.records.borrow_mut().clear();
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&*self.records.borrow())
            .map_err(|e| SimError::Configuration(format!("trace serialization failed: {}", e)))
    }
}

/// Observer recording the changes of one pin.
#[derive(Debug, Clone)]
pub struct PinMonitor {
    pin: String,
    /// Level at attach time.
    initial: Level,
    trace: Trace,
}

impl PinMonitor {
    /// Attach a monitor with its own trace.
    pub fn attach(dev: &mut Device, pin: &str, timestamps: bool) -> Result<PinMonitor> {
        Self::attach_shared(dev, pin, timestamps, &Trace::new())
    }

    /// Attach a monitor appending to an existing trace.
    pub fn attach_shared(dev: &mut Device, pin: &str, timestamps: bool, trace: &Trace) -> Result<PinMonitor> {
        let p = dev.pin_mut(pin)?;
        let name = p.name();
        let initial = p.level();
        let sink = trace.clone();
        let label = name.clone();
        let mut last = initial;
        p.register_observer(move |e: &PinEvent| {
            if e.level == last {
                return;
            }
            last = e.level;
            let cycle = if timestamps { Some(e.cycle) } else { None };
            sink.push(PinRecord { pin: label.clone(), level: e.level, cycle });
        });
        Ok(PinMonitor { pin: name, initial, trace: trace.clone() })
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn initial(&self) -> Level {
        self.initial
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// This monitor's records. On a shared trace, other pins are filtered out.
    pub fn records(&self) -> Vec<PinRecord> {
        self.trace.for_pin(&self.pin)
    }

    pub fn pulses(&self) -> Vec<(Level, u64)> {
        pulse_widths(&self.records())
    }
}

/// Turn one pin's timestamped records into `(level, duration)` pulses.
///
/// Each record opens a pulse that the next record closes, so the last level
/// is never reported. Records without a timestamp are skipped, and a record
/// stamped earlier than its predecessor starts a new run.
pub fn pulse_widths(records: &[PinRecord]) -> Vec<(Level, u64)> {
    let stamped: Vec<(Level, u64)> = records.iter().filter_map(|r| r.cycle.map(|c| (r.level, c))).collect();
    stamped
        .windows(2)
        .filter_map(|w| w[1].1.checked_sub(w[0].1).map(|d| (w[0].0, d)))
        .collect()
}
