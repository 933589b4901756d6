//! Decoding of 64-bit instruction bundles.
use crate::{Flag, FlagSet};
use bitos::{
    BitUtils, bitos,
    integer::{u2, u3, u4, u5, u6, u7, u12, u14},
};
use strum::FromRepr;

/// Sign extends the low `bits` bits of `value`.
#[inline(always)]
pub fn sext(value: u32, bits: u32) -> i32 {
    ((value << (32 - bits)) as i32) >> (32 - bits)
}

/// The format class of a bundle, which determines what its slots contain.
#[bitos(3)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// ALU, MUL and a double transfer (type 1).
    AluMulDouble1 = 0,
    /// ALU, MUL and a transfer (type 1).
    AluMulTransfer1 = 1,
    /// ALU, MUL and a control op.
    AluMulControl = 2,
    Invalid = 3,
    /// ALU or MUL and a double transfer (type 2).
    UnitDouble2 = 4,
    /// ALU or MUL and a transfer (type 2).
    UnitTransfer2 = 5,
    /// ALU or MUL and a control op.
    UnitControl = 6,
    /// A transfer (type 3).
    Transfer3 = 7,
}

/// A 64-bit instruction bundle.
#[bitos(64)]
#[derive(Debug, Clone, Copy)]
pub struct Bundle {
    /// Whether the single unit op of formats 4-6 is an ALU op (otherwise it is a MUL op).
    #[bits(41)]
    pub unit_is_alu: bool,
    #[bits(61..64)]
    pub format: Format,
}

/// The decoded slots of a bundle.
#[derive(Debug, Clone, Copy)]
pub struct Slots {
    pub alu: Option<AluOp>,
    pub mul: Option<MulOp>,
    pub transfer: Option<Transfer>,
    pub control: Option<ControlOp>,
}

impl Bundle {
    #[inline(always)]
    pub fn new(word: u64) -> Self {
        Self::from_bits(word)
    }

    #[inline(always)]
    pub fn word(&self) -> u64 {
        self.to_bits()
    }

    fn field(&self, start: u64, end: u64) -> u64 {
        self.to_bits().bits(start, end)
    }

    /// Splits this bundle into its slots.
    pub fn slots(&self) -> Slots {
        let mut slots = Slots {
            alu: None,
            mul: None,
            transfer: None,
            control: None,
        };

        let dual_units = |slots: &mut Slots| {
            slots.alu = Some(AluOp::from_bits(self.field(42, 61) as u32));
            slots.mul = Some(MulOp::from_bits(self.field(27, 42) as u16));
        };

        let single_unit = |slots: &mut Slots| {
            if self.unit_is_alu() {
                slots.alu = Some(AluOp::from_bits(self.field(42, 61) as u32));
            } else {
                slots.mul = Some(MulOp::from_bits(self.field(42, 57) as u16));
            }
        };

        let low27 = self.field(0, 27) as u32;
        match self.format() {
            Format::AluMulDouble1 => {
                dual_units(&mut slots);
                slots.transfer = Some(Transfer::Double1(DoubleTransfer::from_bits(low27)));
            }
            Format::AluMulTransfer1 => {
                dual_units(&mut slots);
                slots.transfer = Some(Transfer::Single1(Transfer1::from_bits(low27)));
            }
            Format::AluMulControl => {
                dual_units(&mut slots);
                slots.control = Some(ControlOp::from_bits(low27));
            }
            Format::Invalid => (),
            Format::UnitDouble2 => {
                single_unit(&mut slots);
                slots.transfer = Some(Transfer::Double2 {
                    op: self.field(39, 41) as u8,
                    halves: DoubleTransfer::from_bits(low27),
                });
            }
            Format::UnitTransfer2 => {
                single_unit(&mut slots);
                slots.transfer = Some(Transfer::Single2(Transfer2::from_bits(
                    self.field(0, 41),
                )));
            }
            Format::UnitControl => {
                single_unit(&mut slots);
                slots.control = Some(ControlOp::from_bits(low27));
            }
            Format::Transfer3 => {
                slots.transfer = Some(Transfer::Immediate(Transfer3::from_bits(self.word())));
            }
        }

        slots
    }
}

/// Movement of a parameter ring buffer pointer when accessing through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrMode {
    Plain,
    Increment,
    Decrement,
    Reset,
}

impl PrMode {
    #[inline(always)]
    pub fn from_index(index: u8) -> Self {
        match index & 3 {
            0 => PrMode::Plain,
            1 => PrMode::Increment,
            2 => PrMode::Decrement,
            _ => PrMode::Reset,
        }
    }
}

/// An ALU or MUL input operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Aa(u8),
    Ab(u8),
    Ma(u8),
    Mb(u8),
    Pr(PrMode),
    /// An entry of the unit's constant pool.
    Const(u8),
}

/// An ALU or MUL output register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    Ma(u8),
    Mb(u8),
    Aa(u8),
    Ab(u8),
}

impl Dest {
    pub fn decode(io: u5) -> Self {
        let io = io.value();
        let index = io & 7;
        match io >> 3 {
            0 => Dest::Ma(index),
            1 => Dest::Mb(index),
            2 => Dest::Aa(index),
            _ => Dest::Ab(index),
        }
    }
}

#[bitos(5)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOpcode {
    Fadd = 0x00,
    Faddz = 0x01,
    Fsub = 0x02,
    Fsubz = 0x03,
    Fcmp = 0x04,
    Fabs = 0x05,
    Fabc = 0x06,
    Nop = 0x07,
    Fea = 0x08,
    Fes = 0x09,
    Frcp = 0x0A,
    Frsq = 0x0B,
    Flog = 0x0C,
    Cif = 0x0D,
    Cfi = 0x0E,
    Cfib = 0x0F,
    Add = 0x10,
    Addz = 0x11,
    Sub = 0x12,
    Subz = 0x13,
    Cmp = 0x14,
    Abs = 0x15,
    Atr = 0x16,
    Atrz = 0x17,
    And = 0x18,
    Or = 0x19,
    Xor = 0x1A,
    Not = 0x1B,
    Lsr = 0x1C,
    Lsl = 0x1D,
    Asr = 0x1E,
    Asl = 0x1F,
}

/// Static properties of an ALU opcode.
#[derive(Debug, Clone, Copy)]
pub struct AluInfo {
    /// Whether `i2` is read as an operand.
    pub second_input: bool,
    /// Whether the result is written to `io`.
    pub has_output: bool,
    /// Whether the operands are single precision floats.
    pub float: bool,
    /// The flags this opcode defines.
    pub flags: FlagSet,
}

impl AluOpcode {
    pub fn info(self) -> AluInfo {
        use Flag::*;

        let (second_input, has_output, float, flags): (bool, bool, bool, &[Flag]) = match self {
            AluOpcode::Fadd => (true, true, true, &[An, Az, Av, Au]),
            AluOpcode::Faddz => (true, true, true, &[Zc, An, Az, Av, Au, Ad]),
            AluOpcode::Fsub => (true, true, true, &[An, Az, Av, Au, Ad]),
            AluOpcode::Fsubz => (true, true, true, &[Zc, An, Az, Av, Au, Ad]),
            AluOpcode::Fcmp => (true, false, true, &[An, Az, Av, Au, Ad]),
            AluOpcode::Fabs => (false, true, true, &[An, Az, Ad]),
            AluOpcode::Fabc => (true, true, true, &[An, Az, Au, Ad]),
            AluOpcode::Nop => (false, false, false, &[]),
            AluOpcode::Fea => (false, true, true, &[An, Az, Av, Ad]),
            AluOpcode::Fes => (false, true, true, &[An, Az, Au, Ad]),
            AluOpcode::Frcp => (false, true, true, &[Zd, An, Az, Au, Ad]),
            AluOpcode::Frsq => (false, true, true, &[Nr, An, Az, Au, Ad]),
            AluOpcode::Flog => (false, true, true, &[Il, An, Az, Ad]),
            AluOpcode::Cif => (false, true, false, &[An, Az]),
            AluOpcode::Cfi => (false, true, true, &[An, Az, Av, Ad]),
            AluOpcode::Cfib => (false, true, true, &[An, Az, Av, Ad, Au]),
            AluOpcode::Add => (true, true, false, &[An, Az, Av]),
            AluOpcode::Addz => (true, true, false, &[Zc, An, Az, Av]),
            AluOpcode::Sub => (true, true, false, &[An, Az, Av]),
            AluOpcode::Subz => (true, true, false, &[Zc, An, Az, Av]),
            AluOpcode::Cmp => (true, false, false, &[An, Az, Av]),
            AluOpcode::Abs => (false, true, false, &[An, Az, Av]),
            AluOpcode::Atr => (false, true, false, &[]),
            AluOpcode::Atrz => (false, true, false, &[Zc]),
            AluOpcode::And | AluOpcode::Or | AluOpcode::Xor => {
                (true, true, false, &[An, Az, Av, Au])
            }
            AluOpcode::Not | AluOpcode::Lsr | AluOpcode::Lsl => {
                (false, true, false, &[An, Az, Av, Au])
            }
            AluOpcode::Asr | AluOpcode::Asl => (false, true, false, &[An, Az]),
        };

        AluInfo {
            second_input,
            has_output,
            float,
            flags: FlagSet::of(flags),
        }
    }

    /// Whether this opcode takes its shift amount from `i2`.
    pub fn is_shift(self) -> bool {
        matches!(
            self,
            AluOpcode::Lsr | AluOpcode::Lsl | AluOpcode::Asr | AluOpcode::Asl
        )
    }
}

/// An ALU op (19 bits).
#[bitos(32)]
#[derive(Debug, Clone, Copy)]
pub struct AluOp {
    #[bits(0..5)]
    pub io: u5,
    #[bits(5..10)]
    pub i2: u5,
    #[bits(10..14)]
    pub i1: u4,
    #[bits(14..19)]
    pub opcode: AluOpcode,
}

impl AluOp {
    pub fn first(&self) -> Source {
        let i1 = self.i1().value();
        if i1 < 8 {
            Source::Aa(i1)
        } else {
            Source::Ab(i1 & 7)
        }
    }

    /// The second operand, or `None` if the encoding is not a valid ALU input.
    pub fn second(&self) -> Option<Source> {
        let i2 = self.i2().value();
        Some(match i2 {
            0x00..0x08 => Source::Aa(i2),
            0x08..0x10 => Source::Ab(i2 & 7),
            0x10..0x14 => Source::Pr(PrMode::from_index(i2)),
            0x14..0x17 => Source::Const(i2 - 0x14),
            _ => return None,
        })
    }

    pub fn dest(&self) -> Dest {
        Dest::decode(self.io())
    }
}

/// A MUL op (15 bits).
#[bitos(16)]
#[derive(Debug, Clone, Copy)]
pub struct MulOp {
    #[bits(0..5)]
    pub io: u5,
    #[bits(5..10)]
    pub i2: u5,
    #[bits(10..14)]
    pub i1: u4,
    /// FMUL when set, MUL otherwise.
    #[bits(14)]
    pub float: bool,
}

/// Number of constants in the MUL unit's integer pool.
pub const MUL_INT_CONSTS: u8 = 3;

/// Single precision constants of the MUL unit's float pool.
pub const MUL_FLOAT_CONSTS: [f32; 12] = [
    0.0, 1.0, -1.0, 0.5, -0.5, 2.0, -2.0, 0.25, -0.25, 4.0, -4.0, 1.5,
];

impl MulOp {
    pub fn first(&self) -> Source {
        let i1 = self.i1().value();
        if i1 < 8 {
            Source::Ma(i1)
        } else {
            Source::Mb(i1 & 7)
        }
    }

    /// The second operand, or `None` if the encoding is not a valid MUL input.
    pub fn second(&self) -> Option<Source> {
        let i2 = self.i2().value();
        Some(match i2 {
            0x00..0x08 => Source::Ma(i2),
            0x08..0x10 => Source::Mb(i2 & 7),
            0x10..0x14 => Source::Pr(PrMode::from_index(i2)),
            _ => {
                let index = i2 - 0x14;
                let pool = if self.float() {
                    MUL_FLOAT_CONSTS.len() as u8
                } else {
                    MUL_INT_CONSTS
                };

                if index >= pool {
                    return None;
                }

                Source::Const(index)
            }
        })
    }

    pub fn dest(&self) -> Dest {
        Dest::decode(self.io())
    }

    pub fn flags(&self) -> FlagSet {
        use Flag::*;
        if self.float() {
            FlagSet::of(&[Mn, Mz, Mv, Mu, Md])
        } else {
            FlagSet::of(&[Mn, Mz, Mv])
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum ControlOpcode {
    Nop = 0x00,
    Clrf = 0x03,
    Setm = 0x08,
    Db = 0x10,
    Dbn = 0x11,
    Djmp = 0x12,
    Dcall = 0x1A,
    Dret = 0x1B,
}

impl ControlOpcode {
    /// Whether this opcode transfers control after a delay slot.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            ControlOpcode::Db
                | ControlOpcode::Dbn
                | ControlOpcode::Djmp
                | ControlOpcode::Dcall
                | ControlOpcode::Dret
        )
    }
}

/// Where a control op transfers control to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    /// `pc + displacement`.
    Relative(i32),
    /// The value of an address register.
    Ar(u8),
    /// An unknown target type.
    Invalid(u8),
}

/// A control op (27 bits).
#[bitos(32)]
#[derive(Debug, Clone, Copy)]
pub struct ControlOp {
    #[bits(0..16)]
    pub ef2: u16,
    #[bits(16..22)]
    pub ef1: u6,
    #[bits(22..27)]
    pub cop: u5,
}

impl ControlOp {
    pub fn opcode(&self) -> Option<ControlOpcode> {
        ControlOpcode::from_repr(self.cop().value())
    }

    /// The condition code tested by conditional branches.
    pub fn condition(&self) -> u8 {
        self.ef1().value() & 0xF
    }

    pub fn target(&self) -> BranchTarget {
        let ef2 = self.ef2();
        match ef2.bits(12, 16) {
            0 => BranchTarget::Relative(sext(ef2.bits(0, 12) as u32, 12)),
            4 => BranchTarget::Ar(ef2.bits(0, 3) as u8),
            ty => BranchTarget::Invalid(ty as u8),
        }
    }
}

/// A transfer slot.
#[derive(Debug, Clone, Copy)]
pub enum Transfer {
    Double1(DoubleTransfer),
    Double2 { op: u8, halves: DoubleTransfer },
    Single1(Transfer1),
    Single2(Transfer2),
    Immediate(Transfer3),
}

/// Where a 7-bit transfer operand code points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// A register, by 6-bit register code.
    Reg(u8),
    /// The immediate field of the transfer.
    Imm,
    RamA { ar: u8 },
    RamB { ar: u8 },
}

/// Operand code selecting the immediate field as a transfer source.
pub const IMMEDIATE_SOURCE: u8 = 0x58;

impl Location {
    pub fn decode(code: u7) -> Self {
        let code = code.value();
        if code & 0x40 == 0 {
            Location::Reg(code & 0x3F)
        } else if code == IMMEDIATE_SOURCE {
            Location::Imm
        } else if code & 0x20 != 0 {
            Location::RamB { ar: code & 7 }
        } else {
            Location::RamA { ar: code & 7 }
        }
    }
}

/// A register reachable by transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferReg {
    Aa(u8),
    Ab(u8),
    Eb,
    Eo,
    Sp,
    Mod,
    Ar(u8),
    Ma(u8),
    Mb(u8),
    Pr(PrMode),
    Pdr,
    Ddr,
    Prp,
    Pwp,
    FifoIn,
    FifoOut0,
    FifoOut1,
}

impl XferReg {
    pub fn decode(code: u8) -> Option<Self> {
        let index = code & 7;
        Some(match code & 0x3F {
            0x00..0x08 => XferReg::Aa(index),
            0x08..0x10 => XferReg::Ab(index),
            0x10 => XferReg::Eb,
            0x13 => XferReg::Eo,
            0x14 => XferReg::Sp,
            0x16 => XferReg::Mod,
            0x18..0x20 => XferReg::Ar(index),
            0x20..0x28 => XferReg::Ma(index),
            0x28..0x30 => XferReg::Mb(index),
            0x30..0x34 => XferReg::Pr(PrMode::from_index(code)),
            0x34 => XferReg::Pdr,
            0x35 => XferReg::Ddr,
            0x36 => XferReg::Prp,
            0x37 => XferReg::Pwp,
            0x38 => XferReg::FifoIn,
            0x39 => XferReg::FifoOut0,
            0x3A => XferReg::FifoOut1,
            _ => return None,
        })
    }

    pub fn readable(self) -> bool {
        !matches!(self, XferReg::FifoOut0 | XferReg::FifoOut1)
    }

    pub fn writable(self) -> bool {
        !matches!(self, XferReg::FifoIn)
    }
}

/// Effective address computation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EaMode {
    /// `@ARx`
    Ar,
    /// `@ARx++`
    ArInc,
    /// `@ARx--`
    ArDec,
    /// `@ARx++disp`
    ArIncDisp,
    /// `@ARx+ARy`
    ArPlusAy,
    /// `@ARx+ARy++`
    ArPlusAyInc,
    /// `@ARx+ARy--`
    ArPlusAyDec,
    /// `@ARx++ARy`
    ArIncAy,
    /// `@ARx+disp`
    ArDisp,
}

impl EaMode {
    pub fn decode(md: u8) -> Option<Self> {
        Some(match md {
            0x0 => EaMode::Ar,
            0x1 => EaMode::ArInc,
            0x2 => EaMode::ArDec,
            0x3 => EaMode::ArIncDisp,
            0x4 => EaMode::ArPlusAy,
            0x5 => EaMode::ArPlusAyInc,
            0x6 => EaMode::ArPlusAyDec,
            0x7 => EaMode::ArIncAy,
            0xA => EaMode::ArDisp,
            _ => return None,
        })
    }

    /// Whether this mode reads ARy.
    pub fn uses_ary(self) -> bool {
        matches!(
            self,
            EaMode::ArPlusAy | EaMode::ArPlusAyInc | EaMode::ArPlusAyDec | EaMode::ArIncAy
        )
    }

    /// Whether this mode writes ARx.
    pub fn writes_arx(self) -> bool {
        matches!(
            self,
            EaMode::ArInc | EaMode::ArDec | EaMode::ArIncDisp | EaMode::ArIncAy
        )
    }

    /// Whether this mode writes ARy.
    pub fn writes_ary(self) -> bool {
        matches!(self, EaMode::ArPlusAyInc | EaMode::ArPlusAyDec)
    }
}

/// A general transfer (type 1).
#[bitos(32)]
#[derive(Debug, Clone, Copy)]
pub struct Transfer1 {
    #[bits(0..4)]
    pub md: u4,
    #[bits(4..7)]
    pub ary: u3,
    #[bits(7..12)]
    pub disp: u5,
    #[bits(12..19)]
    pub dr: u7,
    #[bits(19..26)]
    pub sr: u7,
    /// External transfer.
    #[bits(26)]
    pub trm: bool,
}

impl Transfer1 {
    pub fn displacement(&self) -> i32 {
        sext(self.disp().value() as u32, 5)
    }

    pub fn immediate(&self) -> u32 {
        sext(self.to_bits().bits(0, 12), 12) as u32
    }

    /// For external transfers, whether data flows from the bus into the register.
    pub fn from_bus(&self) -> bool {
        self.sr().value() & 0x40 != 0
    }
}

/// A general transfer (type 2).
#[bitos(64)]
#[derive(Debug, Clone, Copy)]
pub struct Transfer2 {
    #[bits(0..4)]
    pub md: u4,
    #[bits(4..7)]
    pub ary: u3,
    #[bits(7..21)]
    pub disp: u14,
    #[bits(24..31)]
    pub dr: u7,
    #[bits(31..38)]
    pub sr: u7,
    /// External transfer.
    #[bits(38)]
    pub trm: bool,
    #[bits(39..41)]
    pub op: u2,
}

impl Transfer2 {
    pub fn displacement(&self) -> i32 {
        sext(self.disp().value() as u32, 14)
    }

    pub fn immediate(&self) -> u32 {
        sext(self.to_bits().bits(0, 24) as u32, 24) as u32
    }

    /// For external transfers, whether data flows from the bus into the register.
    pub fn from_bus(&self) -> bool {
        self.sr().value() & 0x40 != 0
    }
}

/// An immediate transfer (type 3).
#[bitos(64)]
#[derive(Debug, Clone, Copy)]
pub struct Transfer3 {
    #[bits(0..4)]
    pub md: u4,
    #[bits(4..7)]
    pub ary: u3,
    #[bits(7..19)]
    pub disp: u12,
    #[bits(19..26)]
    pub dr: u7,
    #[bits(27..59)]
    pub imm: u32,
}

impl Transfer3 {
    pub fn displacement(&self) -> i32 {
        sext(self.disp().value() as u32, 12)
    }

    /// Where the immediate goes.
    pub fn dest(&self) -> Location {
        let dr = self.dr().value();
        match dr >> 5 {
            0 | 1 => Location::Reg(dr & 0x3F),
            2 => Location::RamA { ar: dr & 7 },
            _ => Location::RamB { ar: dr & 7 },
        }
    }
}

/// One half of a double transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Half {
    /// Register to memory when set, memory to register otherwise.
    pub store: bool,
    pub reg: u8,
    pub ar: u8,
    pub md: u8,
}

/// A double transfer: half A moves between a register and RAM-A, half B between a register and
/// RAM-B.
#[bitos(32)]
#[derive(Debug, Clone, Copy)]
pub struct DoubleTransfer {
    #[bits(0..3)]
    pub b_md: u3,
    #[bits(3..6)]
    pub b_ar: u3,
    #[bits(6..12)]
    pub b_reg: u6,
    #[bits(12)]
    pub b_store: bool,
    #[bits(13..16)]
    pub a_md: u3,
    #[bits(16..19)]
    pub a_ar: u3,
    #[bits(19..25)]
    pub a_reg: u6,
    #[bits(25)]
    pub a_store: bool,
    #[bits(26)]
    pub extended: bool,
}

impl DoubleTransfer {
    pub fn a(&self) -> Half {
        Half {
            store: self.a_store(),
            reg: self.a_reg().value(),
            ar: self.a_ar().value(),
            md: self.a_md().value(),
        }
    }

    pub fn b(&self) -> Half {
        Half {
            store: self.b_store(),
            reg: self.b_reg().value(),
            ar: self.b_ar().value(),
            md: self.b_md().value(),
        }
    }
}

/// Bundle encoders, mostly useful to write test programs.
pub mod asm {
    use super::*;

    pub fn alu(opcode: AluOpcode, i1: u8, i2: u8, io: u8) -> u32 {
        0u32.with_bits(0, 5, io as u32)
            .with_bits(5, 10, i2 as u32)
            .with_bits(10, 14, i1 as u32)
            .with_bits(14, 19, opcode as u32)
    }

    pub fn mul(float: bool, i1: u8, i2: u8, io: u8) -> u32 {
        0u32.with_bits(0, 5, io as u32)
            .with_bits(5, 10, i2 as u32)
            .with_bits(10, 14, i1 as u32)
            .with_bit(14, float)
    }

    pub fn control(opcode: ControlOpcode, ef1: u8, ef2: u16) -> u32 {
        0u32.with_bits(0, 16, ef2 as u32)
            .with_bits(16, 22, ef1 as u32)
            .with_bits(22, 27, opcode as u32)
    }

    /// A relative branch target field.
    pub fn relative(displacement: i32) -> u16 {
        (displacement as u16) & 0xFFF
    }

    /// An address register branch target field.
    pub fn to_ar(ar: u8) -> u16 {
        (4 << 12) | (ar as u16 & 7)
    }

    /// Formats 0-2.
    pub fn dual(format: Format, alu: u32, mul: u32, low: u32) -> u64 {
        0u64.with_bits(0, 27, low as u64)
            .with_bits(27, 42, mul as u64)
            .with_bits(42, 61, alu as u64)
            .with_bits(61, 64, format as u64)
    }

    /// Formats 4-6 with an ALU op.
    pub fn single_alu(format: Format, alu: u32, low: u64) -> u64 {
        0u64.with_bits(0, 41, low)
            .with_bit(41, true)
            .with_bits(42, 61, alu as u64)
            .with_bits(61, 64, format as u64)
    }

    /// Formats 4-6 with a MUL op.
    pub fn single_mul(format: Format, mul: u32, low: u64) -> u64 {
        0u64.with_bits(0, 41, low)
            .with_bits(42, 57, mul as u64)
            .with_bits(61, 64, format as u64)
    }

    /// A bundle doing nothing but a control op.
    pub fn control_only(opcode: ControlOpcode, ef1: u8, ef2: u16) -> u64 {
        single_alu(
            Format::UnitControl,
            alu(AluOpcode::Nop, 0, 0, 0),
            control(opcode, ef1, ef2) as u64,
        )
    }

    /// A bundle doing nothing.
    pub fn nop() -> u64 {
        control_only(ControlOpcode::Nop, 0, 0)
    }

    pub fn transfer1(sr: u8, dr: u8, md: u8, ary: u8, disp: i32) -> u32 {
        0u32.with_bits(0, 4, md as u32)
            .with_bits(4, 7, ary as u32)
            .with_bits(7, 12, disp as u32 & 0x1F)
            .with_bits(12, 19, dr as u32)
            .with_bits(19, 26, sr as u32)
    }

    pub fn transfer1_imm(dr: u8, imm: i32) -> u32 {
        0u32.with_bits(0, 12, imm as u32 & 0xFFF)
            .with_bits(12, 19, dr as u32)
            .with_bits(19, 26, IMMEDIATE_SOURCE as u32)
    }

    pub fn transfer1_external(from_bus: bool, reg: u8, disp: i32) -> u32 {
        0u32.with_bits(7, 12, disp as u32 & 0x1F)
            .with_bits(12, 19, reg as u32)
            .with_bits(19, 26, if from_bus { 0x40 } else { 0 })
            .with_bit(26, true)
    }

    pub fn transfer2(sr: u8, dr: u8, md: u8, ary: u8, disp: i32) -> u64 {
        0u64.with_bits(0, 4, md as u64)
            .with_bits(4, 7, ary as u64)
            .with_bits(7, 21, disp as u64 & 0x3FFF)
            .with_bits(24, 31, dr as u64)
            .with_bits(31, 38, sr as u64)
    }

    pub fn transfer2_imm(dr: u8, imm: i32) -> u64 {
        0u64.with_bits(0, 24, imm as u64 & 0xFF_FFFF)
            .with_bits(24, 31, dr as u64)
            .with_bits(31, 38, IMMEDIATE_SOURCE as u64)
    }

    pub fn transfer3(dr: u8, imm: u32, md: u8, ary: u8, disp: i32) -> u64 {
        0u64.with_bits(0, 4, md as u64)
            .with_bits(4, 7, ary as u64)
            .with_bits(7, 19, disp as u64 & 0xFFF)
            .with_bits(19, 26, dr as u64)
            .with_bits(27, 59, imm as u64)
            .with_bits(61, 64, Format::Transfer3 as u64)
    }

    pub fn double(a: Half, b: Half) -> u32 {
        0u32.with_bits(0, 3, b.md as u32)
            .with_bits(3, 6, b.ar as u32)
            .with_bits(6, 12, b.reg as u32)
            .with_bit(12, b.store)
            .with_bits(13, 16, a.md as u32)
            .with_bits(16, 19, a.ar as u32)
            .with_bits(19, 25, a.reg as u32)
            .with_bit(25, a.store)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formats() {
        let nop = Bundle::new(asm::nop());
        assert_eq!(nop.format(), Format::UnitControl);

        let slots = nop.slots();
        assert_eq!(slots.alu.unwrap().opcode(), AluOpcode::Nop);
        assert!(slots.mul.is_none());
        assert!(slots.transfer.is_none());
        assert_eq!(slots.control.unwrap().opcode(), Some(ControlOpcode::Nop));
    }

    #[test]
    fn dual_units() {
        let word = asm::dual(
            Format::AluMulControl,
            asm::alu(AluOpcode::Add, 0, 8, 0x10),
            asm::mul(true, 1, 0x15, 0x02),
            asm::control(ControlOpcode::Setm, 0, 0x80),
        );

        let slots = Bundle::new(word).slots();
        let alu = slots.alu.unwrap();
        assert_eq!(alu.opcode(), AluOpcode::Add);
        assert_eq!(alu.first(), Source::Aa(0));
        assert_eq!(alu.second(), Some(Source::Ab(0)));
        assert_eq!(alu.dest(), Dest::Aa(0));

        let mul = slots.mul.unwrap();
        assert!(mul.float());
        assert_eq!(mul.first(), Source::Ma(1));
        assert_eq!(mul.second(), Some(Source::Const(1)));
        assert_eq!(mul.dest(), Dest::Ma(2));

        let control = slots.control.unwrap();
        assert_eq!(control.opcode(), Some(ControlOpcode::Setm));
        assert_eq!(control.ef2(), 0x80);
    }

    #[test]
    fn single_mul() {
        let word = asm::single_mul(Format::UnitTransfer2, asm::mul(false, 9, 3, 0x19), 0);
        let slots = Bundle::new(word).slots();
        assert!(slots.alu.is_none());

        let mul = slots.mul.unwrap();
        assert_eq!(mul.first(), Source::Mb(1));
        assert_eq!(mul.second(), Some(Source::Ma(3)));
        assert_eq!(mul.dest(), Dest::Ab(1));
        assert!(matches!(slots.transfer, Some(Transfer::Single2(_))));
    }

    #[test]
    fn constant_pools() {
        let int = MulOp::from_bits(asm::mul(false, 0, 0x17, 0) as u16);
        assert_eq!(int.second(), None);

        let float = MulOp::from_bits(asm::mul(true, 0, 0x1F, 0) as u16);
        assert_eq!(float.second(), Some(Source::Const(11)));

        let alu = AluOp::from_bits(asm::alu(AluOpcode::Add, 0, 0x17, 0));
        assert_eq!(alu.second(), None);
    }

    #[test]
    fn transfer_fields() {
        let t1 = Transfer1::from_bits(asm::transfer1(0x41, 0x05, 0xA, 2, -3));
        assert_eq!(Location::decode(t1.sr()), Location::RamA { ar: 1 });
        assert_eq!(Location::decode(t1.dr()), Location::Reg(5));
        assert_eq!(t1.displacement(), -3);
        assert_eq!(EaMode::decode(t1.md().value()), Some(EaMode::ArDisp));

        let imm = Transfer1::from_bits(asm::transfer1_imm(0x18, -2));
        assert_eq!(Location::decode(imm.sr()), Location::Imm);
        assert_eq!(imm.immediate(), -2i32 as u32);

        let t2 = Transfer2::from_bits(asm::transfer2_imm(0x04, -0x12345));
        assert_eq!(t2.immediate(), -0x12345i32 as u32);

        let t3 = Transfer3::from_bits(asm::transfer3(0x63, 0xDEAD_BEEF, 1, 0, -1));
        assert_eq!(t3.imm(), 0xDEAD_BEEF);
        assert_eq!(t3.dest(), Location::RamB { ar: 3 });
        assert_eq!(t3.displacement(), -1);
    }

    #[test]
    fn control_targets() {
        let rel = ControlOp::from_bits(asm::control(ControlOpcode::Djmp, 0, asm::relative(-4)));
        assert_eq!(rel.target(), BranchTarget::Relative(-4));

        let ar = ControlOp::from_bits(asm::control(ControlOpcode::Djmp, 0, asm::to_ar(5)));
        assert_eq!(ar.target(), BranchTarget::Ar(5));

        let bad = ControlOp::from_bits(asm::control(ControlOpcode::Djmp, 0, 0x7000));
        assert_eq!(bad.target(), BranchTarget::Invalid(7));
    }

    #[test]
    fn register_codes() {
        assert_eq!(XferReg::decode(0x09), Some(XferReg::Ab(1)));
        assert_eq!(XferReg::decode(0x1A), Some(XferReg::Ar(2)));
        assert_eq!(XferReg::decode(0x31), Some(XferReg::Pr(PrMode::Increment)));
        assert_eq!(XferReg::decode(0x11), None);
        assert!(!XferReg::FifoIn.writable());
        assert!(!XferReg::FifoOut1.readable());
    }
}
