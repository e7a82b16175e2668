//! Minimal ELF reader for AVR executables.
//!
//! Reads little-endian 32-bit ELF (EM_AVR = 83) as produced by avr-gcc:
//! - PT_LOAD segments, placed at their physical (load) address so that
//!   initialized `.data` lands in flash after `.text`
//! - `.symtab` for label lookup (termination symbols)
//! - the entry point

use std::collections::HashMap;

use crate::error::{Result, SimError};
use crate::firmware::{Firmware, FirmwareFormat, Segment, SegmentKind};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const EM_AVR: u16 = 83;
const PT_LOAD: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHN_UNDEF: u16 = 0;

// avr-gcc address space offsets
const DATA_OFFSET: u32 = 0x80_0000;
const EEPROM_OFFSET: u32 = 0x81_0000;
const EEPROM_END: u32 = 0x82_0000;

pub fn is_elf(data: &[u8]) -> bool {
    data.len() >= 4 && data[0..4] == ELF_MAGIC
}

fn u16le(d: &[u8], o: usize) -> Result<u16> {
    d.get(o..o + 2)
        .map(|b| b[0] as u16 | (b[1] as u16) << 8)
        .ok_or_else(|| truncated(o))
}

fn u32le(d: &[u8], o: usize) -> Result<u32> {
    d.get(o..o + 4)
        .map(|b| b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16 | (b[3] as u32) << 24)
        .ok_or_else(|| truncated(o))
}

fn truncated(offset: usize) -> SimError {
    SimError::Load(format!("ELF truncated at offset {:#x}", offset))
}

fn read_str(d: &[u8], o: usize) -> String {
    if o >= d.len() {
        return String::new();
    }
    let end = d[o..].iter().position(|&b| b == 0).unwrap_or(d.len() - o);
    String::from_utf8_lossy(&d[o..o + end]).into_owned()
}

/// Parse an ELF image into loadable segments and symbols.
pub fn parse_elf(data: &[u8]) -> Result<Firmware> {
    if data.len() < 52 {
        return Err(SimError::Load("file too small for ELF header".into()));
    }
    if !is_elf(data) {
        return Err(SimError::Load("not an ELF file".into()));
    }
    if data[4] != 1 {
        return Err(SimError::Load("only 32-bit ELF is supported".into()));
    }
    if data[5] != 1 {
        return Err(SimError::Load("only little-endian ELF is supported".into()));
    }
    let e_machine = u16le(data, 18)?;
    if e_machine != EM_AVR {
        return Err(SimError::Load(format!("not an AVR ELF (machine={})", e_machine)));
    }

    let entry = u32le(data, 24)?;
    let e_phoff = u32le(data, 28)? as usize;
    let e_shoff = u32le(data, 32)? as usize;
    let e_phentsize = u16le(data, 42)? as usize;
    let e_phnum = u16le(data, 44)? as usize;
    let e_shentsize = u16le(data, 46)? as usize;
    let e_shnum = u16le(data, 48)? as usize;

    let mut segments = Vec::new();
    for i in 0..e_phnum {
        let off = e_phoff + i * e_phentsize;
        if u32le(data, off)? != PT_LOAD {
            continue;
        }
        let p_offset = u32le(data, off + 4)? as usize;
        let p_paddr = u32le(data, off + 12)?;
        let p_filesz = u32le(data, off + 16)? as usize;
        if p_filesz == 0 {
            continue;
        }
        let bytes = data
            .get(p_offset..p_offset + p_filesz)
            .ok_or_else(|| SimError::Load(format!("segment {} extends past end of file", i)))?;
        let (kind, addr) = match p_paddr {
            a if a < DATA_OFFSET => (SegmentKind::Flash, a),
            a if (EEPROM_OFFSET..EEPROM_END).contains(&a) => (SegmentKind::Eeprom, a - EEPROM_OFFSET),
            // fuses, lock bits, signature
            _ => continue,
        };
        segments.push(Segment { kind, addr, data: bytes.to_vec() });
    }

    let symbols = if e_shoff > 0 && e_shnum > 0 {
        read_symbols(data, e_shoff, e_shentsize, e_shnum)?
    } else {
        HashMap::new()
    };

    Ok(Firmware { format: FirmwareFormat::Elf, entry, segments, symbols })
}

/// Collect defined, named symbols from `.symtab`: name -> byte address.
fn read_symbols(data: &[u8], e_shoff: usize, e_shentsize: usize, e_shnum: usize) -> Result<HashMap<String, u32>> {
    let mut symbols = HashMap::new();
    for i in 0..e_shnum {
        let sh = e_shoff + i * e_shentsize;
        if u32le(data, sh + 4)? != SHT_SYMTAB {
            continue;
        }
        let sym_off = u32le(data, sh + 16)? as usize;
        let sym_size = u32le(data, sh + 20)? as usize;
        let link = u32le(data, sh + 24)? as usize;
        let entsize = match u32le(data, sh + 36)? as usize {
            0 => 16,
            n => n,
        };
        let strtab_off = u32le(data, e_shoff + link * e_shentsize + 16)? as usize;

        for n in 0..sym_size / entsize {
            let off = sym_off + n * entsize;
            let st_name = u32le(data, off)? as usize;
            let st_value = u32le(data, off + 4)?;
            let st_info = *data.get(off + 12).ok_or_else(|| truncated(off + 12))?;
            let st_shndx = u16le(data, off + 14)?;
            // STT_NOTYPE=0 (asm labels), STT_OBJECT=1, STT_FUNC=2
            if st_info & 0xF > 2 || st_name == 0 || st_shndx == SHN_UNDEF {
                continue;
            }
            let name = read_str(data, strtab_off + st_name);
            if !name.is_empty() {
                symbols.entry(name).or_insert(st_value);
            }
        }
    }
    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ELF header + one PT_LOAD + .symtab/.strtab holding `exit` at 0x10.
    fn tiny_elf(code: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 52];
        f[0..4].copy_from_slice(&ELF_MAGIC);
        f[4] = 1;
        f[5] = 1;
        f[6] = 1;
        f[18] = EM_AVR as u8;
        f[28] = 52; // e_phoff
        f[42] = 32; // e_phentsize
        f[44] = 1; // e_phnum
        f[46] = 40; // e_shentsize

        let code_off = 52 + 32;
        let mut ph = vec![0u8; 32];
        ph[0] = PT_LOAD as u8;
        ph[4..8].copy_from_slice(&(code_off as u32).to_le_bytes());
        ph[16..20].copy_from_slice(&(code.len() as u32).to_le_bytes());
        f.extend_from_slice(&ph);
        f.extend_from_slice(code);

        let strtab = b"\0exit\0".to_vec();
        let str_off = f.len();
        f.extend_from_slice(&strtab);
        let sym_off = f.len();
        f.extend_from_slice(&[0u8; 16]);
        let mut sym = [0u8; 16];
        sym[0] = 1;
        sym[4] = 0x10;
        sym[12] = 0x12; // GLOBAL FUNC
        sym[14] = 1;
        f.extend_from_slice(&sym);

        let shoff = f.len();
        f[32..36].copy_from_slice(&(shoff as u32).to_le_bytes());
        f[48] = 3; // e_shnum
        f.extend_from_slice(&[0u8; 40]);
        let mut symtab = [0u8; 40];
        symtab[4] = SHT_SYMTAB as u8;
        symtab[16..20].copy_from_slice(&(sym_off as u32).to_le_bytes());
        symtab[20] = 32;
        symtab[24] = 2; // sh_link -> strtab
        symtab[36] = 16;
        f.extend_from_slice(&symtab);
        let mut strsec = [0u8; 40];
        strsec[4] = 3;
        strsec[16..20].copy_from_slice(&(str_off as u32).to_le_bytes());
        strsec[20] = strtab.len() as u8;
        f.extend_from_slice(&strsec);
        f
    }

    #[test]
    fn test_parse_segments_and_symbols() {
        let fw = parse_elf(&tiny_elf(&[0x00, 0x00, 0xFF, 0xCF])).unwrap();
        assert_eq!(fw.format, FirmwareFormat::Elf);
        assert_eq!(fw.segments.len(), 1);
        assert_eq!(fw.segments[0].addr, 0);
        assert_eq!(fw.segments[0].data, vec![0x00, 0x00, 0xFF, 0xCF]);
        assert_eq!(fw.symbol("exit"), Some(0x10));
        assert_eq!(fw.symbol("main"), None);
    }

    #[test]
    fn test_rejects_other_machine() {
        let mut img = tiny_elf(&[0, 0]);
        img[18] = 40; // EM_ARM
        let err = parse_elf(&img).unwrap_err();
        assert!(err.to_string().contains("not an AVR ELF"));
    }

    #[test]
    fn test_truncated_image() {
        let img = tiny_elf(&[0, 0]);
        assert!(parse_elf(&img[..60]).is_err());
        assert!(parse_elf(&img[..10]).is_err());
    }
}
