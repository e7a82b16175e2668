//! AVR instruction decoder.
//!
//! Decodes 16-bit (and 32-bit) instruction words into a typed [`Op`].
//! Instructions are grouped into families sharing one execution path
//! (two-register ALU ops, register-immediate ops, single-register ops,
//! pointer loads/stores, ...). The set covers what avr-gcc emits for the
//! C runtime startup, GPIO and timer access, loops, calls and interrupt
//! handlers on the classic (non-XMEGA) core. Anything else decodes to
//! [`Op::Unknown`].

/// Two-register ALU operations: `Rd <- Rd op Rr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbc,
    And,
    Or,
    Eor,
    Mov,
    Cp,
    Cpc,
    Mul,
}

/// Register-immediate operations on R16..R31.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmOp {
    Subi,
    Sbci,
    Andi,
    Ori,
    Cpi,
    Ldi,
}

/// Single-register read-modify-write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Com,
    Neg,
    Swap,
    Inc,
    Dec,
    Asr,
    Lsr,
    Ror,
}

/// Pointer register used by LD/ST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ptr {
    X,
    Y,
    Z,
}

impl Ptr {
    /// Low register of the pair.
    pub fn reg(self) -> u8 {
        match self {
            Ptr::X => 26,
            Ptr::Y => 28,
            Ptr::Z => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrMode {
    /// `X`, or `Y+q`/`Z+q` with displacement (0 for plain access)
    Disp(u8),
    PostInc,
    PreDec,
}

/// Condition tested by the skip instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipIf {
    /// CPSE
    Equal { d: u8, r: u8 },
    /// SBRC / SBRS
    RegBit { r: u8, b: u8, set: bool },
    /// SBIC / SBIS; `a` is a data-space address
    IoBit { a: u16, b: u8, set: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Nop,
    Alu { op: AluOp, d: u8, r: u8 },
    Imm { op: ImmOp, d: u8, k: u8 },
    Unary { op: UnaryOp, d: u8 },
    Movw { d: u8, r: u8 },
    /// ADIW (`sub == false`) / SBIW on R24..R31 pairs
    WordImm { sub: bool, d: u8, k: u8 },
    Load { d: u8, ptr: Ptr, mode: PtrMode },
    Store { r: u8, ptr: Ptr, mode: PtrMode },
    Lds { d: u8, addr: u16 },
    Sts { addr: u16, r: u8 },
    /// LPM; plain `LPM` is `d = 0, inc = false`
    Lpm { d: u8, inc: bool },
    Push { r: u8 },
    Pop { d: u8 },
    /// `a` is a data-space address
    In { d: u8, a: u16 },
    Out { a: u16, r: u8 },
    /// SBI (`set`) / CBI
    IoBit { a: u16, b: u8, set: bool },
    Skip(SkipIf),
    Bst { d: u8, b: u8 },
    Bld { d: u8, b: u8 },
    /// BRBS (`set`) / BRBC on SREG bit `s`
    Branch { s: u8, set: bool, k: i8 },
    /// BSET (`set`) / BCLR: SEI, CLI, SEC, ...
    Flag { s: u8, set: bool },
    Rjmp { k: i16 },
    Rcall { k: i16 },
    Jmp { k: u32 },
    Call { k: u32 },
    Ijmp,
    Icall,
    Ret,
    Reti,
    Sleep,
    Wdr,
    Break,
    Unknown(u16),
}

/// True for the 32-bit encodings (JMP, CALL, LDS, STS).
#[inline(always)]
pub fn is_two_word(word: u16) -> bool {
    word & 0xFE0C == 0x940C || word & 0xFC0F == 0x9000
}

/// Decode an instruction word (with the following word for 32-bit
/// instructions). Returns the op and its size in words.
pub fn decode(word: u16, next: u16) -> (Op, u8) {
    if is_two_word(word) {
        return (decode_long(word, next), 2);
    }
    let op = match word >> 12 {
        0x0 => decode_0000(word),
        0x1 | 0x2 => decode_alu(word),
        0x3 => imm(ImmOp::Cpi, word),
        0x4 => imm(ImmOp::Sbci, word),
        0x5 => imm(ImmOp::Subi, word),
        0x6 => imm(ImmOp::Ori, word),
        0x7 => imm(ImmOp::Andi, word),
        0x8 | 0xA => decode_ldd_std(word),
        0x9 => decode_1001(word),
        0xB => {
            let rd = reg5(word);
            let a = ((((word >> 9) & 3) << 4) | (word & 0xF)) + 0x20;
            if word & 0x0800 == 0 { Op::In { d: rd, a } } else { Op::Out { a, r: rd } }
        }
        0xC => Op::Rjmp { k: sign_extend_12(word) },
        0xD => Op::Rcall { k: sign_extend_12(word) },
        0xE => imm(ImmOp::Ldi, word),
        _ => decode_1111(word),
    };
    (op, 1)
}

fn decode_long(word: u16, next: u16) -> Op {
    let rd = reg5(word);
    match word & 0xFE0E {
        0x940C | 0x940E => {
            let hi = (((word as u32) >> 3) & 0x3E) | (word as u32 & 1);
            let k = (hi << 16) | next as u32;
            if word & 0x0002 == 0 { Op::Jmp { k } } else { Op::Call { k } }
        }
        _ if word & 0x0200 == 0 => Op::Lds { d: rd, addr: next },
        _ => Op::Sts { addr: next, r: rd },
    }
}

fn decode_0000(word: u16) -> Op {
    match word & 0xFF00 {
        0x0000 if word == 0 => Op::Nop,
        0x0100 => Op::Movw { d: (((word >> 4) & 0xF) * 2) as u8, r: ((word & 0xF) * 2) as u8 },
        _ => match word & 0xFC00 {
            0x0400 => alu(AluOp::Cpc, word),
            0x0800 => alu(AluOp::Sbc, word),
            0x0C00 => alu(AluOp::Add, word),
            // MULS/MULSU/FMUL* are not generated for the supported programs
            _ => Op::Unknown(word),
        },
    }
}

fn decode_alu(word: u16) -> Op {
    match word & 0xFC00 {
        0x1000 => {
            let (d, r) = reg_pair_5_5(word);
            Op::Skip(SkipIf::Equal { d, r })
        }
        0x1400 => alu(AluOp::Cp, word),
        0x1800 => alu(AluOp::Sub, word),
        0x1C00 => alu(AluOp::Adc, word),
        0x2000 => alu(AluOp::And, word),
        0x2400 => alu(AluOp::Eor, word),
        0x2800 => alu(AluOp::Or, word),
        _ => alu(AluOp::Mov, word),
    }
}

/// LDD/STD with displacement: 10q0 qqsd dddd yqqq
fn decode_ldd_std(word: u16) -> Op {
    if word & 0xD000 != 0x8000 {
        return Op::Unknown(word);
    }
    let q = ((((word >> 13) & 1) << 5) | (((word >> 10) & 3) << 3) | (word & 7)) as u8;
    let ptr = if word & 0x0008 != 0 { Ptr::Y } else { Ptr::Z };
    let rd = reg5(word);
    let mode = PtrMode::Disp(q);
    if word & 0x0200 == 0 {
        Op::Load { d: rd, ptr, mode }
    } else {
        Op::Store { r: rd, ptr, mode }
    }
}

fn decode_1001(word: u16) -> Op {
    let rd = reg5(word);
    match word & 0xFE00 {
        // loads / pop / lpm
        0x9000 => {
            return match word & 0xF {
                0x1 => Op::Load { d: rd, ptr: Ptr::Z, mode: PtrMode::PostInc },
                0x2 => Op::Load { d: rd, ptr: Ptr::Z, mode: PtrMode::PreDec },
                0x4 => Op::Lpm { d: rd, inc: false },
                0x5 => Op::Lpm { d: rd, inc: true },
                0x9 => Op::Load { d: rd, ptr: Ptr::Y, mode: PtrMode::PostInc },
                0xA => Op::Load { d: rd, ptr: Ptr::Y, mode: PtrMode::PreDec },
                0xC => Op::Load { d: rd, ptr: Ptr::X, mode: PtrMode::Disp(0) },
                0xD => Op::Load { d: rd, ptr: Ptr::X, mode: PtrMode::PostInc },
                0xE => Op::Load { d: rd, ptr: Ptr::X, mode: PtrMode::PreDec },
                0xF => Op::Pop { d: rd },
                _ => Op::Unknown(word),
            };
        }
        // stores / push
        0x9200 => {
            return match word & 0xF {
                0x1 => Op::Store { r: rd, ptr: Ptr::Z, mode: PtrMode::PostInc },
                0x2 => Op::Store { r: rd, ptr: Ptr::Z, mode: PtrMode::PreDec },
                0x9 => Op::Store { r: rd, ptr: Ptr::Y, mode: PtrMode::PostInc },
                0xA => Op::Store { r: rd, ptr: Ptr::Y, mode: PtrMode::PreDec },
                0xC => Op::Store { r: rd, ptr: Ptr::X, mode: PtrMode::Disp(0) },
                0xD => Op::Store { r: rd, ptr: Ptr::X, mode: PtrMode::PostInc },
                0xE => Op::Store { r: rd, ptr: Ptr::X, mode: PtrMode::PreDec },
                0xF => Op::Push { r: rd },
                _ => Op::Unknown(word),
            };
        }
        0x9400 => return decode_9400(word),
        _ => {}
    }
    match word & 0xFF00 {
        0x9600 | 0x9700 => {
            let d = (((word >> 4) & 3) * 2 + 24) as u8;
            let k = ((((word >> 6) & 3) << 4) | (word & 0xF)) as u8;
            Op::WordImm { sub: word & 0x0100 != 0, d, k }
        }
        0x9800 | 0x9A00 => Op::IoBit { a: io5(word), b: (word & 7) as u8, set: word & 0x0200 != 0 },
        0x9900 | 0x9B00 => Op::Skip(SkipIf::IoBit { a: io5(word), b: (word & 7) as u8, set: word & 0x0200 != 0 }),
        _ if word & 0xFC00 == 0x9C00 => alu(AluOp::Mul, word),
        _ => Op::Unknown(word),
    }
}

/// 1001 010x xxxx xxxx: one-operand ops, flag ops, control transfer
fn decode_9400(word: u16) -> Op {
    let rd = reg5(word);
    let unary = |op| Op::Unary { op, d: rd };
    match word & 0xF {
        0x0 => unary(UnaryOp::Com),
        0x1 => unary(UnaryOp::Neg),
        0x2 => unary(UnaryOp::Swap),
        0x3 => unary(UnaryOp::Inc),
        0x5 => unary(UnaryOp::Asr),
        0x6 => unary(UnaryOp::Lsr),
        0x7 => unary(UnaryOp::Ror),
        0xA => unary(UnaryOp::Dec),
        0x8 => match word {
            0x9508 => Op::Ret,
            0x9518 => Op::Reti,
            0x9588 => Op::Sleep,
            0x9598 => Op::Break,
            0x95A8 => Op::Wdr,
            0x95C8 => Op::Lpm { d: 0, inc: false },
            _ if word & 0xFF00 == 0x9400 => Op::Flag { s: ((word >> 4) & 7) as u8, set: word & 0x0080 == 0 },
            _ => Op::Unknown(word),
        },
        0x9 => match word {
            0x9409 => Op::Ijmp,
            0x9509 => Op::Icall,
            _ => Op::Unknown(word),
        },
        _ => Op::Unknown(word),
    }
}

fn decode_1111(word: u16) -> Op {
    let s = (word & 7) as u8;
    let b = s;
    let rd = reg5(word);
    match word & 0xFC00 {
        0xF000 | 0xF400 => {
            let k = ((((word >> 3) & 0x7F) as i16) << 9 >> 9) as i8;
            return Op::Branch { s, set: word & 0x0400 == 0, k };
        }
        _ => {}
    }
    if word & 0x0008 != 0 {
        return Op::Unknown(word);
    }
    match word & 0xFE00 {
        0xF800 => Op::Bld { d: rd, b },
        0xFA00 => Op::Bst { d: rd, b },
        0xFC00 => Op::Skip(SkipIf::RegBit { r: rd, b, set: false }),
        _ => Op::Skip(SkipIf::RegBit { r: rd, b, set: true }),
    }
}

// --- Operand fields ---

fn alu(op: AluOp, word: u16) -> Op {
    let (d, r) = reg_pair_5_5(word);
    Op::Alu { op, d, r }
}

/// xxxx KKKK dddd KKKK, d in R16..R31
fn imm(op: ImmOp, word: u16) -> Op {
    let d = (((word >> 4) & 0xF) + 16) as u8;
    let k = (((word >> 4) & 0xF0) | (word & 0xF)) as u8;
    Op::Imm { op, d, k }
}

#[inline(always)]
fn reg5(word: u16) -> u8 {
    ((word >> 4) & 0x1F) as u8
}

/// xxxx xxrd dddd rrrr
#[inline(always)]
fn reg_pair_5_5(word: u16) -> (u8, u8) {
    (reg5(word), ((word & 0xF) | ((word >> 5) & 0x10)) as u8)
}

/// xxxx xxxx AAAA Abbb -> data-space address
#[inline(always)]
fn io5(word: u16) -> u16 {
    ((word >> 3) & 0x1F) + 0x20
}

#[inline(always)]
fn sign_extend_12(word: u16) -> i16 {
    ((word << 4) as i16) >> 4
}
