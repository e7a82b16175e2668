//! Run configuration.
//!
//! Hardware layout is fixed per variant (see [`crate::variant`]); only the
//! knobs of the execution driver live here. Configurations can be built in
//! code or parsed from JSON, with missing fields taking their defaults:
//!
//! ```text
//! { "step_limit": 2000000, "strict_decode": true }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::CLOCK_HZ;

/// Default safety budget of executed instructions per `run()`.
pub const DEFAULT_STEP_LIMIT: u64 = 50_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Maximum instructions executed by one `run()` before it fails with a timeout.
    pub step_limit: u64,
    /// Base clock frequency, used only to convert cycles to wall time.
    pub clock_hz: u32,
    /// Abort on undecodable opcodes instead of executing them as NOPs.
    pub strict_decode: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            step_limit: DEFAULT_STEP_LIMIT,
            clock_hz: CLOCK_HZ,
            strict_decode: false,
        }
    }
}

impl SimConfig {
    /// Parse a JSON document and validate the result.
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: SimConfig = serde_json::from_str(text)
            .map_err(|e| SimError::Configuration(format!("invalid config JSON: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_limit == 0 {
            return Err(SimError::Configuration("step_limit must be non-zero".into()));
        }
        if self.clock_hz == 0 {
            return Err(SimError::Configuration("clock_hz must be non-zero".into()));
        }
        Ok(())
    }
}
