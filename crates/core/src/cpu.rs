//! AVR CPU core.
//!
//! Executes decoded [`Op`]s on a [`Device`], so that data-space accesses
//! reach the port and timer registers through
//! [`read_data`](Device::read_data) / [`write_data`](Device::write_data).
//!
//! Flag computation follows the datasheet formulas, including the carry
//! chain behavior of SBC/SBCI/CPC where Z is only ever cleared, never set,
//! so multi-byte compares work.

use crate::device::Device;
use crate::error::{Result, SimError};
use crate::opcodes::{is_two_word, AluOp, ImmOp, Op, Ptr, PtrMode, SkipIf, UnaryOp};
use crate::{SREG_C, SREG_I, SREG_T, SREG_Z};

/// CPU state. The register file R0–R31 lives in
/// [`Memory::data`](crate::Memory) at 0x00–0x1F; SREG and SP live only here
/// and are mapped into the data space by the device bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu {
    /// Program counter (word address)
    pub pc: u16,
    /// Stack pointer (byte address in data space)
    pub sp: u16,
    /// Status register: I T H S V N Z C (bits 7..0)
    pub sreg: u8,
    /// Set by SLEEP, cleared by an interrupt
    pub sleeping: bool,
    /// Interrupts are held off for one instruction after SEI and RETI.
    pub irq_hold: bool,
}

impl Cpu {
    pub fn new(sp: u16) -> Self {
        Cpu { pc: 0, sp, sreg: 0, sleeping: false, irq_hold: false }
    }

    #[inline(always)]
    pub fn flag(&self, bit: u8) -> bool {
        self.sreg & (1 << bit) != 0
    }

    #[inline(always)]
    pub fn set_flag(&mut self, bit: u8, v: bool) {
        if v { self.sreg |= 1 << bit; } else { self.sreg &= !(1 << bit); }
    }
}

// --- Flag helpers ---

/// H S V N Z C after ADD/ADC.
pub fn flags_add(cpu: &mut Cpu, rd: u8, rr: u8, r: u8) {
    let r7 = (r >> 7) & 1; let rd7 = (rd >> 7) & 1; let rr7 = (rr >> 7) & 1;
    let r3 = (r >> 3) & 1; let rd3 = (rd >> 3) & 1; let rr3 = (rr >> 3) & 1;
    let h = (rd3 & rr3) | (rr3 & (r3 ^ 1)) | ((r3 ^ 1) & rd3);
    let v = (rd7 & rr7 & (r7 ^ 1)) | ((rd7 ^ 1) & (rr7 ^ 1) & r7);
    let c = (rd7 & rr7) | (rr7 & (r7 ^ 1)) | ((r7 ^ 1) & rd7);
    let z = (r == 0) as u8;
    cpu.sreg = (cpu.sreg & 0b1100_0000) | (h << 5) | ((r7 ^ v) << 4) | (v << 3) | (r7 << 2) | (z << 1) | c;
}

/// H S V N Z C after SUB/SBC/CP/CPC/NEG. With `set_z == false` Z can
/// only be cleared.
pub fn flags_sub(cpu: &mut Cpu, rd: u8, rr: u8, r: u8, set_z: bool) {
    let r7 = (r >> 7) & 1; let rd7 = (rd >> 7) & 1; let rr7 = (rr >> 7) & 1;
    let r3 = (r >> 3) & 1; let rd3 = (rd >> 3) & 1; let rr3 = (rr >> 3) & 1;
    let h = ((rd3 ^ 1) & rr3) | (rr3 & r3) | (r3 & (rd3 ^ 1));
    let v = (rd7 & (rr7 ^ 1) & (r7 ^ 1)) | ((rd7 ^ 1) & rr7 & r7);
    let c = ((rd7 ^ 1) & rr7) | (rr7 & r7) | (r7 & (rd7 ^ 1));
    let z = if r != 0 { 0 } else if set_z { 1 } else { (cpu.sreg >> SREG_Z) & 1 };
    cpu.sreg = (cpu.sreg & 0b1100_0000) | (h << 5) | ((r7 ^ v) << 4) | (v << 3) | (r7 << 2) | (z << 1) | c;
}

/// S V N Z after AND/OR/EOR/COM (V cleared).
pub fn flags_logic(cpu: &mut Cpu, r: u8) {
    let n = (r >> 7) & 1;
    let z = (r == 0) as u8;
    cpu.sreg = (cpu.sreg & 0b1110_0001) | (n << 4) | (n << 2) | (z << 1);
}

/// S V N Z C after ASR/LSR/ROR; `c` is the bit shifted out.
fn flags_shift(cpu: &mut Cpu, r: u8, c: bool) {
    let n = (r >> 7) & 1;
    let v = n ^ c as u8;
    let z = (r == 0) as u8;
    cpu.sreg = (cpu.sreg & 0b1110_0000) | ((n ^ v) << 4) | (v << 3) | (n << 2) | (z << 1) | c as u8;
}

/// S V N Z after INC/DEC; `v` is the signed-overflow condition.
fn flags_incdec(cpu: &mut Cpu, r: u8, v: bool) {
    let n = (r >> 7) & 1;
    let v = v as u8;
    let z = (r == 0) as u8;
    cpu.sreg = (cpu.sreg & 0b1110_0001) | ((n ^ v) << 4) | (v << 3) | (n << 2) | (z << 1);
}

// ---- Instruction execution on Device ----

impl Device {
    /// Execute one decoded instruction and return its cycle cost.
    ///
    /// Undecodable opcodes run as 1-cycle NOPs unless strict decoding is
    /// enabled, in which case they fail with a configuration error.
    pub(crate) fn execute(&mut self, op: Op, size: u8) -> Result<u8> {
        let at = self.cpu.pc;
        self.cpu.pc = self.cpu.pc.wrapping_add(size as u16);

        let cycles = match op {
            Op::Nop | Op::Wdr | Op::Break => 1,
            Op::Alu { op, d, r } => self.exec_alu(op, d, r),
            Op::Imm { op, d, k } => {
                self.exec_imm(op, d, k);
                1
            }
            Op::Unary { op, d } => {
                self.exec_unary(op, d);
                1
            }
            Op::Movw { d, r } => {
                let v = self.mem.reg_pair(r);
                self.mem.set_reg_pair(d, v);
                1
            }
            Op::WordImm { sub, d, k } => {
                let rdw = self.mem.reg_pair(d);
                let res = if sub { rdw.wrapping_sub(k as u16) } else { rdw.wrapping_add(k as u16) };
                self.mem.set_reg_pair(d, res);
                let rdh7 = rdw & 0x8000 != 0;
                let r15 = res & 0x8000 != 0;
                let (v, c) = if sub { (rdh7 && !r15, r15 && !rdh7) } else { (!rdh7 && r15, !r15 && rdh7) };
                let (n, z) = (r15 as u8, (res == 0) as u8);
                let v = v as u8;
                self.cpu.sreg = (self.cpu.sreg & 0b1110_0000) | ((n ^ v) << 4) | (v << 3) | (n << 2) | (z << 1) | c as u8;
                2
            }
            Op::Load { d, ptr, mode } => {
                let addr = self.pointer_access(ptr, mode);
                let v = self.read_data(addr);
                self.mem.set_reg(d, v);
                2
            }
            Op::Store { r, ptr, mode } => {
                // ST X+, R26 stores the pre-increment value
                let v = self.mem.reg(r);
                let addr = self.pointer_access(ptr, mode);
                self.write_data(addr, v);
                2
            }
            Op::Lds { d, addr } => {
                let v = self.read_data(addr);
                self.mem.set_reg(d, v);
                2
            }
            Op::Sts { addr, r } => {
                let v = self.mem.reg(r);
                self.write_data(addr, v);
                2
            }
            Op::Lpm { d, inc } => {
                let z = self.mem.reg_pair(30);
                let v = self.mem.read_flash_byte(z as usize);
                self.mem.set_reg(d, v);
                if inc {
                    self.mem.set_reg_pair(30, z.wrapping_add(1));
                }
                3
            }
            Op::Push { r } => {
                let v = self.mem.reg(r);
                self.push(v);
                2
            }
            Op::Pop { d } => {
                let v = self.pop();
                self.mem.set_reg(d, v);
                2
            }
            Op::In { d, a } => {
                let v = self.read_data(a);
                self.mem.set_reg(d, v);
                1
            }
            Op::Out { a, r } => {
                let v = self.mem.reg(r);
                self.write_data(a, v);
                1
            }
            Op::IoBit { a, b, set } => {
                self.write_bit(a, b, set);
                2
            }
            Op::Skip(cond) => {
                let taken = match cond {
                    SkipIf::Equal { d, r } => self.mem.reg(d) == self.mem.reg(r),
                    SkipIf::RegBit { r, b, set } => (self.mem.reg(r) >> b) & 1 == set as u8,
                    SkipIf::IoBit { a, b, set } => (self.read_data(a) >> b) & 1 == set as u8,
                };
                if taken {
                    let next = self.mem.read_program_word(self.cpu.pc as usize);
                    let words = if is_two_word(next) { 2 } else { 1 };
                    self.cpu.pc = self.cpu.pc.wrapping_add(words);
                    1 + words as u8
                } else {
                    1
                }
            }
            Op::Bst { d, b } => {
                let bit = (self.mem.reg(d) >> b) & 1 != 0;
                self.cpu.set_flag(SREG_T, bit);
                1
            }
            Op::Bld { d, b } => {
                let v = self.mem.reg(d);
                let v = if self.cpu.flag(SREG_T) { v | (1 << b) } else { v & !(1 << b) };
                self.mem.set_reg(d, v);
                1
            }
            Op::Branch { s, set, k } => {
                if self.cpu.flag(s) == set {
                    self.cpu.pc = self.cpu.pc.wrapping_add(k as i16 as u16);
                    2
                } else {
                    1
                }
            }
            Op::Flag { s, set } => {
                if s == SREG_I && set && !self.cpu.flag(SREG_I) {
                    self.cpu.irq_hold = true;
                }
                self.cpu.set_flag(s, set);
                1
            }
            Op::Rjmp { k } => {
                self.cpu.pc = self.cpu.pc.wrapping_add(k as u16);
                2
            }
            Op::Rcall { k } => {
                let ret = self.cpu.pc;
                self.push_word(ret);
                self.cpu.pc = self.cpu.pc.wrapping_add(k as u16);
                3
            }
            Op::Jmp { k } => {
                self.cpu.pc = k as u16;
                3
            }
            Op::Call { k } => {
                let ret = self.cpu.pc;
                self.push_word(ret);
                self.cpu.pc = k as u16;
                4
            }
            Op::Ijmp => {
                self.cpu.pc = self.mem.reg_pair(30);
                2
            }
            Op::Icall => {
                let ret = self.cpu.pc;
                self.push_word(ret);
                self.cpu.pc = self.mem.reg_pair(30);
                3
            }
            Op::Ret => {
                self.cpu.pc = self.pop_word();
                4
            }
            Op::Reti => {
                self.cpu.pc = self.pop_word();
                self.cpu.set_flag(SREG_I, true);
                self.cpu.irq_hold = true;
                4
            }
            Op::Sleep => {
                self.cpu.sleeping = true;
                1
            }
            Op::Unknown(w) => {
                if self.config().strict_decode {
                    return Err(SimError::Configuration(format!(
                        "undecodable opcode {:#06x} at {:#06x}",
                        w,
                        at as u32 * 2
                    )));
                }
                tracing::warn!("undecodable opcode {:#06x} at {:#06x}, executed as NOP", w, at as u32 * 2);
                1
            }
        };
        Ok(cycles)
    }

    fn exec_alu(&mut self, op: AluOp, d: u8, r: u8) -> u8 {
        let rd = self.mem.reg(d);
        let rr = self.mem.reg(r);
        let carry = self.cpu.flag(SREG_C) as u8;
        match op {
            AluOp::Add | AluOp::Adc => {
                let c = if op == AluOp::Adc { carry } else { 0 };
                let res = rd.wrapping_add(rr).wrapping_add(c);
                self.mem.set_reg(d, res);
                flags_add(&mut self.cpu, rd, rr, res);
            }
            AluOp::Sub | AluOp::Cp => {
                let res = rd.wrapping_sub(rr);
                if op == AluOp::Sub {
                    self.mem.set_reg(d, res);
                }
                flags_sub(&mut self.cpu, rd, rr, res, true);
            }
            AluOp::Sbc | AluOp::Cpc => {
                // flags use the original Rr; the result already includes the carry
                let res = rd.wrapping_sub(rr).wrapping_sub(carry);
                if op == AluOp::Sbc {
                    self.mem.set_reg(d, res);
                }
                flags_sub(&mut self.cpu, rd, rr, res, false);
            }
            AluOp::And | AluOp::Or | AluOp::Eor => {
                let res = match op {
                    AluOp::And => rd & rr,
                    AluOp::Or => rd | rr,
                    _ => rd ^ rr,
                };
                self.mem.set_reg(d, res);
                flags_logic(&mut self.cpu, res);
            }
            AluOp::Mov => self.mem.set_reg(d, rr),
            AluOp::Mul => {
                let res = rd as u16 * rr as u16;
                self.mem.set_reg_pair(0, res);
                self.cpu.set_flag(SREG_C, res & 0x8000 != 0);
                self.cpu.set_flag(SREG_Z, res == 0);
                return 2;
            }
        }
        1
    }

    fn exec_imm(&mut self, op: ImmOp, d: u8, k: u8) {
        let rd = self.mem.reg(d);
        match op {
            ImmOp::Ldi => self.mem.set_reg(d, k),
            ImmOp::Subi | ImmOp::Cpi => {
                let res = rd.wrapping_sub(k);
                if op == ImmOp::Subi {
                    self.mem.set_reg(d, res);
                }
                flags_sub(&mut self.cpu, rd, k, res, true);
            }
            ImmOp::Sbci => {
                let res = rd.wrapping_sub(k).wrapping_sub(self.cpu.flag(SREG_C) as u8);
                self.mem.set_reg(d, res);
                flags_sub(&mut self.cpu, rd, k, res, false);
            }
            ImmOp::Andi | ImmOp::Ori => {
                let res = if op == ImmOp::Andi { rd & k } else { rd | k };
                self.mem.set_reg(d, res);
                flags_logic(&mut self.cpu, res);
            }
        }
    }

    fn exec_unary(&mut self, op: UnaryOp, d: u8) {
        let rd = self.mem.reg(d);
        let res = match op {
            UnaryOp::Com => {
                let res = !rd;
                flags_logic(&mut self.cpu, res);
                self.cpu.set_flag(SREG_C, true);
                res
            }
            UnaryOp::Neg => {
                let res = 0u8.wrapping_sub(rd);
                flags_sub(&mut self.cpu, 0, rd, res, true);
                res
            }
            UnaryOp::Swap => rd.rotate_left(4),
            UnaryOp::Inc => {
                let res = rd.wrapping_add(1);
                flags_incdec(&mut self.cpu, res, rd == 0x7F);
                res
            }
            UnaryOp::Dec => {
                let res = rd.wrapping_sub(1);
                flags_incdec(&mut self.cpu, res, rd == 0x80);
                res
            }
            UnaryOp::Asr => {
                let res = (rd >> 1) | (rd & 0x80);
                flags_shift(&mut self.cpu, res, rd & 1 != 0);
                res
            }
            UnaryOp::Lsr => {
                let res = rd >> 1;
                flags_shift(&mut self.cpu, res, rd & 1 != 0);
                res
            }
            UnaryOp::Ror => {
                let res = (rd >> 1) | ((self.cpu.flag(SREG_C) as u8) << 7);
                flags_shift(&mut self.cpu, res, rd & 1 != 0);
                res
            }
        };
        self.mem.set_reg(d, res);
    }

    /// Effective address of an LD/ST, applying post-increment/pre-decrement.
    fn pointer_access(&mut self, ptr: Ptr, mode: PtrMode) -> u16 {
        let reg = ptr.reg();
        let p = self.mem.reg_pair(reg);
        match mode {
            PtrMode::Disp(q) => p.wrapping_add(q as u16),
            PtrMode::PostInc => {
                self.mem.set_reg_pair(reg, p.wrapping_add(1));
                p
            }
            PtrMode::PreDec => {
                let a = p.wrapping_sub(1);
                self.mem.set_reg_pair(reg, a);
                a
            }
        }
    }

    fn push(&mut self, v: u8) {
        self.mem.write_raw(self.cpu.sp, v);
        self.cpu.sp = self.cpu.sp.wrapping_sub(1);
    }

    fn pop(&mut self) -> u8 {
        self.cpu.sp = self.cpu.sp.wrapping_add(1);
        self.mem.read_raw(self.cpu.sp)
    }

    /// Push a return address (high byte at the higher address).
    pub(crate) fn push_word(&mut self, val: u16) {
        self.push(val as u8);
        self.push((val >> 8) as u8);
    }

    fn pop_word(&mut self) -> u16 {
        let hi = self.pop();
        let lo = self.pop();
        (hi as u16) << 8 | lo as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::ATMEGA328;
    use crate::{SREG_N, SREG_V};

    fn device() -> Device {
        Device::new(&ATMEGA328)
    }

    fn exec(d: &mut Device, op: Op) -> u8 {
        d.execute(op, 1).unwrap()
    }

    #[test]
    fn test_add() {
        let mut a = device();
        a.mem.set_reg(0, 10);
        a.mem.set_reg(1, 20);
        exec(&mut a, Op::Alu { op: AluOp::Add, d: 0, r: 1 });
        assert_eq!(a.mem.reg(0), 30);
    }

    #[test]
    fn test_add_overflow() {
        let mut a = device();
        a.mem.set_reg(0, 200);
        a.mem.set_reg(1, 100);
        exec(&mut a, Op::Alu { op: AluOp::Add, d: 0, r: 1 });
        assert_eq!(a.mem.reg(0), 44);
        assert!(a.cpu.flag(SREG_C));
    }

    #[test]
    fn test_sbci_carry_propagation() {
        // 0x0100 - 1 over two bytes
        let mut a = device();
        a.mem.set_reg(24, 0x00);
        a.mem.set_reg(25, 0x01);
        exec(&mut a, Op::Imm { op: ImmOp::Subi, d: 24, k: 1 });
        exec(&mut a, Op::Imm { op: ImmOp::Sbci, d: 25, k: 0 });
        assert_eq!(a.mem.reg(24), 0xFF);
        assert_eq!(a.mem.reg(25), 0x00);
        assert!(!a.cpu.flag(SREG_C));
        assert!(!a.cpu.flag(SREG_Z));
    }

    #[test]
    fn test_cpc_16bit_compare() {
        let mut a = device();
        a.mem.set_reg_pair(24, 0x1234);
        a.mem.set_reg_pair(22, 0x1234);
        exec(&mut a, Op::Alu { op: AluOp::Cp, d: 24, r: 22 });
        exec(&mut a, Op::Alu { op: AluOp::Cpc, d: 25, r: 23 });
        assert!(a.cpu.flag(SREG_Z));
        a.mem.set_reg_pair(22, 0x1235);
        exec(&mut a, Op::Alu { op: AluOp::Cp, d: 24, r: 22 });
        exec(&mut a, Op::Alu { op: AluOp::Cpc, d: 25, r: 23 });
        assert!(!a.cpu.flag(SREG_Z));
        assert!(a.cpu.flag(SREG_C));
    }

    #[test]
    fn test_sbiw_loop_counter() {
        let mut a = device();
        a.mem.set_reg_pair(24, 1);
        let c = exec(&mut a, Op::WordImm { sub: true, d: 24, k: 1 });
        assert_eq!(c, 2);
        assert_eq!(a.mem.reg_pair(24), 0);
        assert!(a.cpu.flag(SREG_Z));
        exec(&mut a, Op::WordImm { sub: true, d: 24, k: 1 });
        assert_eq!(a.mem.reg_pair(24), 0xFFFF);
        assert!(a.cpu.flag(SREG_C));
        assert!(a.cpu.flag(SREG_N));
    }

    #[test]
    fn test_inc_dec_overflow() {
        let mut a = device();
        a.mem.set_reg(16, 0x7F);
        exec(&mut a, Op::Unary { op: UnaryOp::Inc, d: 16 });
        assert!(a.cpu.flag(SREG_V));
        exec(&mut a, Op::Unary { op: UnaryOp::Dec, d: 16 });
        assert_eq!(a.mem.reg(16), 0x7F);
        assert!(a.cpu.flag(SREG_V));
    }

    #[test]
    fn test_neg_and_ror() {
        let mut a = device();
        a.mem.set_reg(16, 1);
        exec(&mut a, Op::Unary { op: UnaryOp::Neg, d: 16 });
        assert_eq!(a.mem.reg(16), 0xFF);
        assert!(a.cpu.flag(SREG_C));
        exec(&mut a, Op::Unary { op: UnaryOp::Ror, d: 16 });
        assert_eq!(a.mem.reg(16), 0xFF);
        assert!(a.cpu.flag(SREG_C));
    }

    #[test]
    fn test_push_pop() {
        let mut a = device();
        let sp0 = a.cpu.sp;
        a.mem.set_reg(5, 0x42);
        exec(&mut a, Op::Push { r: 5 });
        assert_eq!(a.cpu.sp, sp0 - 1);
        exec(&mut a, Op::Pop { d: 10 });
        assert_eq!(a.cpu.sp, sp0);
        assert_eq!(a.mem.reg(10), 0x42);
    }

    #[test]
    fn test_rcall_ret() {
        let mut a = device();
        a.cpu.pc = 0x100;
        exec(&mut a, Op::Rcall { k: 5 });
        assert_eq!(a.cpu.pc, 0x106);
        exec(&mut a, Op::Ret);
        assert_eq!(a.cpu.pc, 0x101);
    }

    #[test]
    fn test_branch_cycles() {
        let mut a = device();
        a.cpu.pc = 0x50;
        a.cpu.set_flag(SREG_Z, true);
        assert_eq!(exec(&mut a, Op::Branch { s: SREG_Z, set: true, k: 3 }), 2);
        assert_eq!(a.cpu.pc, 0x55);
        assert_eq!(exec(&mut a, Op::Branch { s: SREG_Z, set: false, k: -3 }), 1);
        assert_eq!(a.cpu.pc, 0x56);
    }

    #[test]
    fn test_skip_over_two_word_instruction() {
        let mut a = device();
        // next instruction: STS 0x0100, R0
        a.mem.flash[2] = 0x00;
        a.mem.flash[3] = 0x92;
        a.mem.set_reg(1, 7);
        a.mem.set_reg(2, 7);
        let c = exec(&mut a, Op::Skip(SkipIf::Equal { d: 1, r: 2 }));
        assert_eq!(c, 3);
        assert_eq!(a.cpu.pc, 3);
    }

    #[test]
    fn test_lpm_post_increment() {
        let mut a = device();
        a.mem.flash[0x40] = 0xAB;
        a.mem.set_reg_pair(30, 0x40);
        exec(&mut a, Op::Lpm { d: 20, inc: true });
        assert_eq!(a.mem.reg(20), 0xAB);
        assert_eq!(a.mem.reg_pair(30), 0x41);
    }

    #[test]
    fn test_mul() {
        let mut a = device();
        a.mem.set_reg(16, 200);
        a.mem.set_reg(17, 200);
        assert_eq!(exec(&mut a, Op::Alu { op: AluOp::Mul, d: 16, r: 17 }), 2);
        assert_eq!(a.mem.reg_pair(0), 40000);
        assert!(a.cpu.flag(SREG_C));
    }

    #[test]
    fn test_sreg_through_io() {
        let mut a = device();
        a.mem.set_reg(16, 0x81);
        exec(&mut a, Op::Out { a: crate::SREG_ADDR, r: 16 });
        assert!(a.cpu.flag(SREG_I));
        assert!(a.cpu.flag(SREG_C));
        exec(&mut a, Op::In { d: 17, a: crate::SREG_ADDR });
        assert_eq!(a.mem.reg(17), 0x81);
    }

    #[test]
    fn test_sei_holds_interrupts_for_one_instruction() {
        let mut a = device();
        exec(&mut a, Op::Flag { s: SREG_I, set: true });
        assert!(a.cpu.flag(SREG_I));
        assert!(a.cpu.irq_hold);
    }

    #[test]
    fn test_unknown_opcode_strict() {
        let cfg = crate::SimConfig { strict_decode: true, ..Default::default() };
        let mut a = Device::with_config(&ATMEGA328, cfg).unwrap();
        assert!(a.execute(Op::Unknown(0xFFFF), 1).is_err());
        let mut b = device();
        assert_eq!(b.execute(Op::Unknown(0xFFFF), 1).unwrap(), 1);
    }
}
