//! On-chip peripherals that can drive pins.
//!
//! - [`TimerUnit`]: Timer/Counter0/1/2 with compare outputs and PWM
//! - [`Port`]: GPIO port latches (PINx/DDRx/PORTx) owning their [`Pin`](crate::Pin)s
//!
//! Both expose the same bus hooks: `write(addr, value, ..) -> bool` claims a
//! data-space write, `read(addr) -> Option<u8>` claims a read.

mod port;
mod timer;

pub use port::{Port, PortState};
pub use timer::{CompareOutput, OutputChanges, TimerConfig, TimerState, TimerUnit, TopSource, WaveformMode};
