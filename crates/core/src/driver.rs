//! Execution driver: single steps and bounded runs.
//!
//! One step fetches, decodes and executes one instruction, advances the
//! clock by the instruction's cycle cost (ticking every timer once per
//! cycle) and then dispatches a pending interrupt. A sleeping CPU spends
//! one idle cycle per step until an interrupt wakes it.

use std::time::Duration;

use crate::device::Device;
use crate::error::{Result, SimError};
use crate::opcodes::decode;

/// Outcome of a [`Device::run`] that reached a termination address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Instructions executed (idle sleep cycles count as steps).
    pub steps: u64,
    /// Cycle count at stop.
    pub cycles: u64,
    /// Byte address of the termination point that stopped the run.
    pub stop_addr: u32,
    /// Simulated time at stop.
    pub elapsed: Duration,
}

impl Device {
    /// Execute one instruction. Returns the cycles consumed by it,
    /// not counting an interrupt dispatched afterwards.
    pub fn step(&mut self) -> Result<u8> {
        self.ensure_ready()?;
        let cycles = if self.cpu.sleeping {
            1
        } else {
            let words = self.mem.flash_words();
            if self.cpu.pc as usize >= words {
                self.cpu.pc = (self.cpu.pc as usize % words) as u16;
            }
            let pc = self.cpu.pc as usize;
            let word = self.mem.read_program_word(pc);
            let next = self.mem.read_program_word(pc + 1);
            let (op, size) = decode(word, next);
            self.execute(op, size)?
        };
        self.advance(cycles as u64);
        self.service_interrupts();
        Ok(cycles)
    }

    /// Run until execution reaches a registered termination address.
    ///
    /// Fails with [`SimError::Timeout`] after `step_limit` steps. An empty
    /// termination set therefore always times out.
    pub fn run(&mut self) -> Result<RunReport> {
        self.ensure_ready()?;
        let limit = self.config.step_limit;
        let mut steps = 0u64;
        loop {
            if self.at_termination() {
                let report = RunReport {
                    steps,
                    cycles: self.now(),
                    stop_addr: self.cpu.pc as u32 * 2,
                    elapsed: self.elapsed(),
                };
                tracing::info!(
                    steps,
                    cycles = report.cycles,
                    stop_addr = report.stop_addr,
                    "run reached termination point"
                );
                return Ok(report);
            }
            if steps >= limit {
                tracing::warn!(steps, cycles = self.now(), "run exceeded step limit");
                return Err(SimError::Timeout { steps, cycles: self.now() });
            }
            self.step()?;
            steps += 1;
        }
    }

    /// Step until at least `cycles` more cycles have elapsed.
    /// Termination points are ignored.
    pub fn run_cycles(&mut self, cycles: u64) -> Result<u64> {
        self.ensure_ready()?;
        let target = self.now().saturating_add(cycles);
        let mut steps = 0u64;
        while self.now() < target {
            self.step()?;
            steps += 1;
        }
        Ok(steps)
    }
}
