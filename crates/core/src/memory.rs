//! AVR memory subsystem.
//!
//! The memory model follows the AVR unified data-space layout:
//!
//! | Address Range | Content             |
//! |---------------|---------------------|
//! | 0x0000–0x001F | General registers R0–R31 |
//! | 0x0020–0x00FF | I/O + extended I/O registers |
//! | 0x0100–       | SRAM (size per variant) |
//!
//! Flash and EEPROM are separate address spaces. EEPROM is only kept so that
//! firmware images with an `.eeprom` section load; nothing reads it back.

use crate::variant::Variant;

pub struct Memory {
    /// Unified data space: registers (0x00-0x1F) + I/O (0x20-0xFF) + SRAM (0x100+)
    pub data: Vec<u8>,
    /// Program memory (flash), erased state 0xFF
    pub flash: Vec<u8>,
    pub eeprom: Vec<u8>,
}

impl Memory {
    pub fn new(variant: &Variant) -> Self {
        Memory {
            data: vec![0u8; variant.data_size()],
            flash: vec![0xFFu8; variant.flash_size],
            eeprom: vec![0xFFu8; variant.eeprom_size],
        }
    }

    /// Zero the data space (registers, I/O and SRAM). Flash and EEPROM survive.
    pub fn clear_data(&mut self) {
        self.data.fill(0);
    }

    // --- Register access ---

    #[inline(always)]
    pub fn reg(&self, r: u8) -> u8 {
        self.data[r as usize]
    }

    #[inline(always)]
    pub fn set_reg(&mut self, r: u8, v: u8) {
        self.data[r as usize] = v;
    }

    /// Read the 16-bit pair starting at `r` (low register first).
    #[inline(always)]
    pub fn reg_pair(&self, r: u8) -> u16 {
        let base = r as usize;
        self.data[base] as u16 | ((self.data[base + 1] as u16) << 8)
    }

    #[inline(always)]
    pub fn set_reg_pair(&mut self, r: u8, v: u16) {
        let base = r as usize;
        self.data[base] = v as u8;
        self.data[base + 1] = (v >> 8) as u8;
    }

    // --- Program memory ---

    /// Read 16-bit word from flash at word address. Reads past the end of
    /// flash return erased flash.
    #[inline(always)]
    pub fn read_program_word(&self, word_addr: usize) -> u16 {
        let byte_addr = word_addr * 2;
        if byte_addr + 1 < self.flash.len() {
            self.flash[byte_addr] as u16 | ((self.flash[byte_addr + 1] as u16) << 8)
        } else {
            0xFFFF
        }
    }

    #[inline(always)]
    pub fn read_flash_byte(&self, byte_addr: usize) -> u8 {
        self.flash.get(byte_addr).copied().unwrap_or(0xFF)
    }

    pub fn flash_words(&self) -> usize {
        self.flash.len() / 2
    }

    // --- Data space ---

    #[inline(always)]
    pub fn read_raw(&self, addr: u16) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0)
    }

    #[inline(always)]
    pub fn write_raw(&mut self, addr: u16, v: u8) {
        if let Some(b) = self.data.get_mut(addr as usize) {
            *b = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::{ATMEGA168, ATMEGA328};

    #[test]
    fn test_register_pair() {
        let mut mem = Memory::new(&ATMEGA328);
        mem.set_reg_pair(30, 0x1234);
        assert_eq!(mem.reg_pair(30), 0x1234);
        assert_eq!(mem.data[30], 0x34);
        assert_eq!(mem.data[31], 0x12);
    }

    #[test]
    fn test_program_word() {
        let mut mem = Memory::new(&ATMEGA328);
        mem.flash[0] = 0x0C;
        mem.flash[1] = 0x94;
        assert_eq!(mem.read_program_word(0), 0x940C);
        assert_eq!(mem.read_program_word(mem.flash_words() + 10), 0xFFFF);
    }

    #[test]
    fn test_sizes_follow_variant() {
        let mem = Memory::new(&ATMEGA168);
        assert_eq!(mem.flash.len(), 16 * 1024);
        assert_eq!(mem.data.len(), 32 + 224 + 1024);
    }

    #[test]
    fn test_out_of_range_data_access() {
        let mut mem = Memory::new(&ATMEGA328);
        mem.write_raw(0xFFFF, 1);
        assert_eq!(mem.read_raw(0xFFFF), 0);
    }
}
