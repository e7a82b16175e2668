//! Firmware builders for integration tests: a tiny AVR assembler and an
//! ELF writer, so tests need no cross toolchain.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

// I/O addresses as used by IN/OUT/SBI/CBI (data address - 0x20)
pub const PINB: u8 = 0x03;
pub const DDRB: u8 = 0x04;
pub const PORTB: u8 = 0x05;
pub const PIND: u8 = 0x09;
pub const DDRD: u8 = 0x0A;
pub const PORTD: u8 = 0x0B;
pub const TCCR0A: u8 = 0x24;
pub const TCCR0B: u8 = 0x25;
pub const OCR0A: u8 = 0x27;
pub const OCR0B: u8 = 0x28;

// Data-space addresses (STS only)
pub const TIMSK0: u16 = 0x6E;
pub const TCCR1A: u16 = 0x80;
pub const TCCR1B: u16 = 0x81;
pub const OCR1AL: u16 = 0x88;
pub const OCR1AH: u16 = 0x89;
pub const OCR1BL: u16 = 0x8A;
pub const OCR1BH: u16 = 0x8B;
pub const TCCR2A: u16 = 0xB0;
pub const TCCR2B: u16 = 0xB1;
pub const OCR2A: u16 = 0xB3;
pub const OCR2B: u16 = 0xB4;

enum Fixup {
    Rjmp,
    Brne,
}

/// Word-oriented assembler with forward and backward labels.
#[derive(Default)]
pub struct Asm {
    words: Vec<u16>,
    labels: HashMap<&'static str, usize>,
    fixups: Vec<(usize, &'static str, Fixup)>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current word address.
    pub fn here(&self) -> usize {
        self.words.len()
    }

    pub fn label(&mut self, name: &'static str) -> &mut Self {
        self.labels.insert(name, self.here());
        self
    }

    /// Pad with NOPs up to a word address.
    pub fn org(&mut self, word: usize) -> &mut Self {
        assert!(word >= self.here(), "org moves backwards");
        self.words.resize(word, 0x0000);
        self
    }

    fn emit(&mut self, w: u16) -> &mut Self {
        self.words.push(w);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.emit(0x0000)
    }

    pub fn ldi(&mut self, d: u8, k: u8) -> &mut Self {
        assert!((16..32).contains(&d));
        self.emit(0xE000 | ((k as u16 & 0xF0) << 4) | (((d - 16) as u16) << 4) | (k as u16 & 0x0F))
    }

    pub fn out(&mut self, a: u8, r: u8) -> &mut Self {
        self.emit(0xB800 | ((a as u16 & 0x30) << 5) | ((r as u16) << 4) | (a as u16 & 0x0F))
    }

    pub fn sts(&mut self, addr: u16, r: u8) -> &mut Self {
        self.emit(0x9200 | ((r as u16) << 4));
        self.emit(addr)
    }

    pub fn sbi(&mut self, a: u8, b: u8) -> &mut Self {
        self.emit(0x9A00 | ((a as u16) << 3) | b as u16)
    }

    pub fn cbi(&mut self, a: u8, b: u8) -> &mut Self {
        self.emit(0x9800 | ((a as u16) << 3) | b as u16)
    }

    pub fn sbiw(&mut self, d: u8, k: u8) -> &mut Self {
        let dd = ((d - 24) / 2) as u16;
        self.emit(0x9700 | ((k as u16 & 0x30) << 2) | (dd << 4) | (k as u16 & 0x0F))
    }

    pub fn sei(&mut self) -> &mut Self {
        self.emit(0x9478)
    }

    pub fn reti(&mut self) -> &mut Self {
        self.emit(0x9518)
    }

    pub fn rjmp(&mut self, label: &'static str) -> &mut Self {
        self.fixups.push((self.here(), label, Fixup::Rjmp));
        self.emit(0xC000)
    }

    pub fn brne(&mut self, label: &'static str) -> &mut Self {
        self.fixups.push((self.here(), label, Fixup::Brne));
        self.emit(0xF401)
    }

    /// Busy-wait of `iterations` * 4 cycles using R25:R24.
    pub fn delay(&mut self, iterations: u16, label: &'static str) -> &mut Self {
        self.ldi(24, iterations as u8);
        self.ldi(25, (iterations >> 8) as u8);
        self.label(label);
        self.sbiw(24, 1);
        self.brne(label)
    }

    /// Byte address of a label.
    pub fn addr(&self, label: &str) -> u32 {
        self.labels[label] as u32 * 2
    }

    /// Resolve labels and return the little-endian image.
    pub fn assemble(&self) -> Vec<u8> {
        let mut words = self.words.clone();
        for (at, label, kind) in &self.fixups {
            let target = *self.labels.get(label).unwrap_or_else(|| panic!("undefined label {}", label)) as i32;
            let k = target - (*at as i32 + 1);
            words[*at] |= match kind {
                Fixup::Rjmp => (k as u16) & 0x0FFF,
                Fixup::Brne => {
                    assert!((-64..64).contains(&k), "branch out of range");
                    ((k as u16) & 0x7F) << 3
                }
            };
        }
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// ELF image exporting every label as a symbol.
    pub fn elf(&self) -> Vec<u8> {
        let syms: Vec<(&str, u32)> = self.labels.keys().map(|&l| (l, self.addr(l))).collect();
        elf_image(&self.assemble(), &syms)
    }
}

/// Little-endian ELF32 EM_AVR image: one PT_LOAD at address 0 plus a
/// `.symtab`/`.strtab` pair.
pub fn elf_image(code: &[u8], symbols: &[(&str, u32)]) -> Vec<u8> {
    const EHDR: usize = 52;
    const PHDR: usize = 32;
    const SHDR: usize = 40;

    let mut f = vec![0u8; EHDR];
    f[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    f[4] = 1;
    f[5] = 1;
    f[6] = 1;
    f[16] = 2; // ET_EXEC
    f[18] = 83; // EM_AVR
    f[20] = 1;
    f[28..32].copy_from_slice(&(EHDR as u32).to_le_bytes());
    f[40..42].copy_from_slice(&(EHDR as u16).to_le_bytes());
    f[42..44].copy_from_slice(&(PHDR as u16).to_le_bytes());
    f[44..46].copy_from_slice(&1u16.to_le_bytes());
    f[46..48].copy_from_slice(&(SHDR as u16).to_le_bytes());

    let code_off = EHDR + PHDR;
    let mut ph = vec![0u8; PHDR];
    ph[0..4].copy_from_slice(&1u32.to_le_bytes());
    ph[4..8].copy_from_slice(&(code_off as u32).to_le_bytes());
    ph[16..20].copy_from_slice(&(code.len() as u32).to_le_bytes());
    ph[20..24].copy_from_slice(&(code.len() as u32).to_le_bytes());
    ph[24..28].copy_from_slice(&5u32.to_le_bytes());
    f.extend_from_slice(&ph);
    f.extend_from_slice(code);

    let mut strtab = vec![0u8];
    let mut symtab = vec![0u8; 16];
    for (name, value) in symbols {
        let mut sym = [0u8; 16];
        sym[0..4].copy_from_slice(&(strtab.len() as u32).to_le_bytes());
        sym[4..8].copy_from_slice(&value.to_le_bytes());
        sym[12] = 0x10; // GLOBAL NOTYPE
        sym[14..16].copy_from_slice(&1u16.to_le_bytes());
        symtab.extend_from_slice(&sym);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }
    let str_off = f.len();
    f.extend_from_slice(&strtab);
    let sym_off = f.len();
    f.extend_from_slice(&symtab);

    let shoff = f.len();
    f[32..36].copy_from_slice(&(shoff as u32).to_le_bytes());
    f[48..50].copy_from_slice(&3u16.to_le_bytes());
    f.extend_from_slice(&[0u8; SHDR]);

    let mut sh_sym = [0u8; SHDR];
    sh_sym[4..8].copy_from_slice(&2u32.to_le_bytes());
    sh_sym[16..20].copy_from_slice(&(sym_off as u32).to_le_bytes());
    sh_sym[20..24].copy_from_slice(&(symtab.len() as u32).to_le_bytes());
    sh_sym[24..28].copy_from_slice(&2u32.to_le_bytes());
    sh_sym[36..40].copy_from_slice(&16u32.to_le_bytes());
    f.extend_from_slice(&sh_sym);

    let mut sh_str = [0u8; SHDR];
    sh_str[4..8].copy_from_slice(&3u32.to_le_bytes());
    sh_str[16..20].copy_from_slice(&(str_off as u32).to_le_bytes());
    sh_str[20..24].copy_from_slice(&(strtab.len() as u32).to_le_bytes());
    f.extend_from_slice(&sh_str);
    f
}

/// Write bytes to a fresh file under the system temp directory.
pub fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("pinsim-{}-{}-{}", std::process::id(), n, name));
    std::fs::write(&path, bytes).expect("write temp firmware");
    path
}

/// Firmware that enables D0..D7 then B0..B5 one pin at a time: DDR bit,
/// then PORT bit.
pub fn digital_sweep() -> Asm {
    let mut a = Asm::new();
    for bit in 0..8 {
        a.sbi(DDRD, bit);
        a.sbi(PORTD, bit);
    }
    for bit in 0..6 {
        a.sbi(DDRB, bit);
        a.sbi(PORTB, bit);
    }
    a.label("exit");
    a.rjmp("exit");
    a
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
