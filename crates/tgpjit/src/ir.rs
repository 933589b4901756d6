//! The intermediate operation stream handed to back ends.
//!
//! Values are 32-bit words. Floats travel as raw single precision bit patterns.
use easyerr::Error;
use std::mem::offset_of;
use strum::FromRepr;
use tgpx4::{Flag, PCS_LEN, PR_LEN, Registers};

/// A fragment-local scratch value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Temp(pub u32);

/// A fragment-local jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// A word of the register file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Field {
    #[default]
    Pc,
    Aa(u8),
    Ab(u8),
    Ma(u8),
    Mb(u8),
    Ar(u8),
    Sp,
    Eb,
    Eo,
    Mode,
    Pdr,
    Ddr,
    Prp,
    Pwp,
    PcsPtr,
    Flag(Flag),
    Icount,
    JmpDest,
    Exp,
    Arg(u8),
    Trap,
}

impl Field {
    /// Byte offset of this field in [`Registers`].
    pub fn offset(self) -> usize {
        const WORD: usize = size_of::<u32>();
        let bank = |base: usize, index: u8, len: usize| base + WORD * (index as usize % len);

        match self {
            Field::Pc => offset_of!(Registers, pc),
            Field::Aa(i) => bank(offset_of!(Registers, aa), i, 8),
            Field::Ab(i) => bank(offset_of!(Registers, ab), i, 8),
            Field::Ma(i) => bank(offset_of!(Registers, ma), i, 8),
            Field::Mb(i) => bank(offset_of!(Registers, mb), i, 8),
            Field::Ar(i) => bank(offset_of!(Registers, ar), i, 8),
            Field::Sp => offset_of!(Registers, sp),
            Field::Eb => offset_of!(Registers, eb),
            Field::Eo => offset_of!(Registers, eo),
            Field::Mode => offset_of!(Registers, mode),
            Field::Pdr => offset_of!(Registers, pdr),
            Field::Ddr => offset_of!(Registers, ddr),
            Field::Prp => offset_of!(Registers, prp),
            Field::Pwp => offset_of!(Registers, pwp),
            Field::PcsPtr => offset_of!(Registers, pcs_ptr),
            Field::Flag(flag) => bank(offset_of!(Registers, flags), flag as u8, tgpx4::FLAG_COUNT),
            Field::Icount => offset_of!(Registers, icount),
            Field::JmpDest => offset_of!(Registers, jmpdest),
            Field::Exp => offset_of!(Registers, exp),
            Field::Arg(i) => bank(offset_of!(Registers, arg), i, 4),
            Field::Trap => offset_of!(Registers, trap),
        }
    }
}

/// An indexed array of the register file. Indices wrap around the array length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Array {
    Pr,
    Pcs,
}

impl Array {
    pub fn offset(self) -> usize {
        match self {
            Array::Pr => offset_of!(Registers, pr),
            Array::Pcs => offset_of!(Registers, pcs),
        }
    }

    pub fn len(self) -> u32 {
        match self {
            Array::Pr => PR_LEN as u32,
            Array::Pcs => PCS_LEN as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Imm(u32),
    Temp(Temp),
    Field(Field),
}

impl From<u32> for Operand {
    fn from(value: u32) -> Self {
        Operand::Imm(value)
    }
}

impl From<Temp> for Operand {
    fn from(value: Temp) -> Self {
        Operand::Temp(value)
    }
}

impl From<Field> for Operand {
    fn from(value: Field) -> Self {
        Operand::Field(value)
    }
}

/// A writable operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Temp(Temp),
    Field(Field),
}

impl From<Temp> for Place {
    fn from(value: Temp) -> Self {
        Place::Temp(value)
    }
}

impl From<Field> for Place {
    fn from(value: Field) -> Self {
        Place::Field(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    /// Shift amounts are taken modulo 32.
    Shl,
    Shr,
    Sar,
    /// Low word of the product.
    Mul,
    /// High word of the signed 64-bit product.
    MulHiS,
    /// Unsigned remainder, the divisor must not be zero.
    Rem,
    FAdd,
    FSub,
    FMul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
    FAbs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    SLt,
    SLe,
    SGt,
    SGe,
    ULt,
    ULe,
    UGt,
    UGe,
    /// Ordered float comparisons: false if either side is NaN.
    FEq,
    FLt,
    FLe,
    FGt,
    FGe,
}

impl Cond {
    pub fn eval(self, a: u32, b: u32) -> bool {
        let (fa, fb) = (f32::from_bits(a), f32::from_bits(b));
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::SLt => (a as i32) < (b as i32),
            Cond::SLe => (a as i32) <= (b as i32),
            Cond::SGt => (a as i32) > (b as i32),
            Cond::SGe => (a as i32) >= (b as i32),
            Cond::ULt => a < b,
            Cond::ULe => a <= b,
            Cond::UGt => a > b,
            Cond::UGe => a >= b,
            Cond::FEq => fa == fb,
            Cond::FLt => fa < fb,
            Cond::FLe => fa <= fb,
            Cond::FGt => fa > fb,
            Cond::FGe => fa >= fb,
        }
    }
}

/// Conversions between signed integers and floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conv {
    /// Float to integer, rounding to nearest (ties to even), saturating.
    FloatToIntNearest,
    /// Float to integer, rounding towards zero, saturating.
    FloatToIntTrunc,
    /// Integer to float, rounding to nearest (ties to even).
    IntToFloatNearest,
    /// Integer to float, rounding towards zero.
    IntToFloatTrunc,
}

impl Conv {
    pub fn eval(self, value: u32) -> u32 {
        match self {
            Conv::FloatToIntNearest => f32::from_bits(value).round_ties_even() as i32 as u32,
            Conv::FloatToIntTrunc => f32::from_bits(value) as i32 as u32,
            Conv::IntToFloatNearest => (value as i32 as f32).to_bits(),
            Conv::IntToFloatTrunc => {
                let int = value as i32;
                let float = int as f32;
                if (float as f64).abs() > (int as f64).abs() {
                    float.to_bits() - 1
                } else {
                    float.to_bits()
                }
            }
        }
    }
}

impl BinOp {
    pub fn eval(self, a: u32, b: u32) -> u32 {
        let (fa, fb) = (f32::from_bits(a), f32::from_bits(b));
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => a.wrapping_shl(b),
            BinOp::Shr => a.wrapping_shr(b),
            BinOp::Sar => (a as i32).wrapping_shr(b) as u32,
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::MulHiS => (((a as i32 as i64) * (b as i32 as i64)) >> 32) as u32,
            BinOp::Rem => a.checked_rem(b).unwrap_or(0),
            BinOp::FAdd => (fa + fb).to_bits(),
            BinOp::FSub => (fa - fb).to_bits(),
            BinOp::FMul => (fa * fb).to_bits(),
        }
    }
}

impl UnOp {
    pub fn eval(self, a: u32) -> u32 {
        match self {
            UnOp::Not => !a,
            UnOp::Neg => a.wrapping_neg(),
            UnOp::FAbs => a & 0x7FFF_FFFF,
        }
    }
}

/// Services of the host reachable from generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum HostFn {
    /// `(addr)` -> value
    ReadA,
    /// `(addr, value)`
    WriteA,
    /// `(addr)` -> value
    ReadB,
    /// `(addr, value)`
    WriteB,
    /// `(addr)` -> value
    ReadExternal,
    /// `(addr, value)`
    WriteExternal,
    /// `()` -> value popped from the input FIFO
    FifoPop,
    /// `(output, value)`
    FifoPush,
    /// `(mask)`: bit 0 clears the input FIFO, bit 1 clears both output FIFOs
    FifoClear,
    /// `(kind | detail << 8, bundle low, bundle high)`
    Fault,
}

/// Classes of faults reported through [`HostFn::Fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum FaultKind {
    /// Invalid bundle format.
    Bundle,
    Alu,
    Mul,
    Transfer,
    DoubleTransfer,
    /// Detail is the control opcode.
    Control,
    PcsOverflow,
    PcsUnderflow,
    BranchInDelaySlot,
}

/// Reason for leaving generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum ExitCode {
    /// The cycle budget is exhausted. `PC` holds the resume address.
    OutOfCycles = 0,
    /// No fragment exists for `PC`.
    MissingCode = 1,
    /// `PC` is not backed by program memory.
    UnmappedCode = 2,
    /// A cache reset was requested.
    ResetCache = 3,
    /// A fault was reported to the host.
    Fault = 4,
    /// Continue at the fragment for `PC`. Never escapes a back end.
    Dispatch = 0xFF,
}

/// Fixed subroutines shared by every fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
#[repr(u8)]
pub enum Handle {
    /// Dispatches to the fragment for `PC`.
    Entry,
    /// `PC = EXP`, exit with [`ExitCode::MissingCode`].
    NoCode,
    /// `PC = EXP`, exit with [`ExitCode::OutOfCycles`].
    OutOfCycles,
    /// `ARG1 = RAM-A[ARG0]`, through the bus window when outside of internal RAM.
    ReadAbus,
    /// `RAM-A[ARG0] = ARG1`, through the bus window when outside of internal RAM.
    WriteAbus,
}

impl Handle {
    pub const ALL: [Handle; 5] = [
        Handle::Entry,
        Handle::NoCode,
        Handle::OutOfCycles,
        Handle::ReadAbus,
        Handle::WriteAbus,
    ];
}

/// Variables mapped to the current position of a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapVar {
    Pc,
    Cycles,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Mov {
        dst: Place,
        src: Operand,
    },
    Bin {
        op: BinOp,
        dst: Place,
        a: Operand,
        b: Operand,
    },
    Un {
        op: UnOp,
        dst: Place,
        a: Operand,
    },
    /// `dst = cond(a, b) as u32`
    Cmp {
        cond: Cond,
        dst: Place,
        a: Operand,
        b: Operand,
    },
    /// `dst = if cond != 0 { a } else { b }`
    Select {
        dst: Place,
        cond: Operand,
        a: Operand,
        b: Operand,
    },
    Conv {
        conv: Conv,
        dst: Place,
        src: Operand,
    },
    Load {
        dst: Place,
        array: Array,
        index: Operand,
    },
    Store {
        array: Array,
        index: Operand,
        value: Operand,
    },
    HostCall {
        func: HostFn,
        args: [Operand; 3],
        ret: Option<Place>,
    },
    Bind(Label),
    Jump(Label),
    /// Jumps to `label` if `cond != 0`.
    Branch {
        cond: Operand,
        label: Label,
    },
    /// Runs a subroutine handle, which returns with [`Op::Ret`].
    Call(Handle),
    Ret,
    /// `EXP = param`, then transfers control to an exiting handle.
    Exh {
        handle: Handle,
        param: Operand,
    },
    /// Continues at the fragment for `PC`.
    Dispatch,
    Exit(ExitCode),
    MapVar {
        var: MapVar,
        value: u32,
    },
}

impl Op {
    /// Whether control never falls through this op.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Jump(_) | Op::Ret | Op::Exh { .. } | Op::Dispatch | Op::Exit(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("fragment does not end with a terminator")]
    Unterminated,
    #[error("label {f0:?} is bound more than once")]
    Rebound(Label),
    #[error("label {f0:?} is used but never bound")]
    Unbound(Label),
}

/// A validated op stream.
#[derive(Debug, Clone)]
pub struct Fragment {
    ops: Vec<Op>,
    temps: u32,
    labels: u32,
}

impl Fragment {
    #[inline(always)]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    #[inline(always)]
    pub fn temps(&self) -> u32 {
        self.temps
    }

    #[inline(always)]
    pub fn labels(&self) -> u32 {
        self.labels
    }

    /// Op index of every label.
    pub fn label_positions(&self) -> Vec<usize> {
        let mut positions = vec![usize::MAX; self.labels as usize];
        for (index, op) in self.ops.iter().enumerate() {
            if let Op::Bind(label) = op {
                positions[label.0 as usize] = index;
            }
        }

        positions
    }
}

/// Builds [`Fragment`]s.
#[derive(Debug, Default)]
pub struct Emitter {
    ops: Vec<Op>,
    temps: u32,
    labels: u32,
}

/// A position in an [`Emitter`] which can be rolled back to.
#[derive(Debug, Clone, Copy)]
pub struct Mark(usize);

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn temp(&mut self) -> Temp {
        self.temps += 1;
        Temp(self.temps - 1)
    }

    pub fn label(&mut self) -> Label {
        self.labels += 1;
        Label(self.labels - 1)
    }

    #[inline(always)]
    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn mark(&self) -> Mark {
        Mark(self.ops.len())
    }

    /// Discards every op emitted after `mark`.
    pub fn rollback(&mut self, mark: Mark) {
        self.ops.truncate(mark.0);
    }

    /// Whether the last emitted op is a terminator.
    pub fn terminated(&self) -> bool {
        self.ops.last().is_some_and(Op::is_terminator)
    }

    pub fn mov(&mut self, dst: impl Into<Place>, src: impl Into<Operand>) {
        self.push(Op::Mov {
            dst: dst.into(),
            src: src.into(),
        });
    }

    pub fn bin(&mut self, op: BinOp, a: impl Into<Operand>, b: impl Into<Operand>) -> Temp {
        let dst = self.temp();
        self.push(Op::Bin {
            op,
            dst: dst.into(),
            a: a.into(),
            b: b.into(),
        });

        dst
    }

    /// Like [`Emitter::bin`], but writes to `dst`.
    pub fn bin_into(
        &mut self,
        op: BinOp,
        dst: impl Into<Place>,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
    ) {
        self.push(Op::Bin {
            op,
            dst: dst.into(),
            a: a.into(),
            b: b.into(),
        });
    }

    pub fn un(&mut self, op: UnOp, a: impl Into<Operand>) -> Temp {
        let dst = self.temp();
        self.push(Op::Un {
            op,
            dst: dst.into(),
            a: a.into(),
        });

        dst
    }

    pub fn cmp(&mut self, cond: Cond, a: impl Into<Operand>, b: impl Into<Operand>) -> Temp {
        let dst = self.temp();
        self.push(Op::Cmp {
            cond,
            dst: dst.into(),
            a: a.into(),
            b: b.into(),
        });

        dst
    }

    pub fn select(
        &mut self,
        cond: impl Into<Operand>,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
    ) -> Temp {
        let dst = self.temp();
        self.push(Op::Select {
            dst: dst.into(),
            cond: cond.into(),
            a: a.into(),
            b: b.into(),
        });

        dst
    }

    pub fn conv(&mut self, conv: Conv, src: impl Into<Operand>) -> Temp {
        let dst = self.temp();
        self.push(Op::Conv {
            conv,
            dst: dst.into(),
            src: src.into(),
        });

        dst
    }

    pub fn load(&mut self, array: Array, index: impl Into<Operand>) -> Temp {
        let dst = self.temp();
        self.push(Op::Load {
            dst: dst.into(),
            array,
            index: index.into(),
        });

        dst
    }

    pub fn store(&mut self, array: Array, index: impl Into<Operand>, value: impl Into<Operand>) {
        self.push(Op::Store {
            array,
            index: index.into(),
            value: value.into(),
        });
    }

    pub fn host_call(&mut self, func: HostFn, args: [Operand; 3]) -> Temp {
        let ret = self.temp();
        self.push(Op::HostCall {
            func,
            args,
            ret: Some(ret.into()),
        });

        ret
    }

    pub fn host_call_void(&mut self, func: HostFn, args: [Operand; 3]) {
        self.push(Op::HostCall {
            func,
            args,
            ret: None,
        });
    }

    pub fn bind(&mut self, label: Label) {
        self.push(Op::Bind(label));
    }

    pub fn jump(&mut self, label: Label) {
        self.push(Op::Jump(label));
    }

    pub fn branch(&mut self, cond: impl Into<Operand>, label: Label) {
        self.push(Op::Branch {
            cond: cond.into(),
            label,
        });
    }

    pub fn call(&mut self, handle: Handle) {
        self.push(Op::Call(handle));
    }

    pub fn ret(&mut self) {
        self.push(Op::Ret);
    }

    pub fn exh(&mut self, handle: Handle, param: impl Into<Operand>) {
        self.push(Op::Exh {
            handle,
            param: param.into(),
        });
    }

    pub fn dispatch(&mut self) {
        self.push(Op::Dispatch);
    }

    pub fn exit(&mut self, code: ExitCode) {
        self.push(Op::Exit(code));
    }

    pub fn map_var(&mut self, var: MapVar, value: u32) {
        self.push(Op::MapVar { var, value });
    }

    /// Validates the emitted ops and turns them into a [`Fragment`].
    pub fn finish(self) -> Result<Fragment, FragmentError> {
        if !self.terminated() {
            return Err(FragmentError::Unterminated);
        }

        let mut bound = vec![false; self.labels as usize];
        for op in &self.ops {
            if let Op::Bind(label) = op {
                let slot = &mut bound[label.0 as usize];
                if *slot {
                    return Err(FragmentError::Rebound(*label));
                }

                *slot = true;
            }
        }

        for op in &self.ops {
            if let Op::Jump(label) | Op::Branch { label, .. } = op
                && !bound[label.0 as usize]
            {
                return Err(FragmentError::Unbound(*label));
            }
        }

        Ok(Fragment {
            ops: self.ops,
            temps: self.temps,
            labels: self.labels,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_offsets() {
        assert_eq!(Field::Pc.offset(), 0);
        assert_eq!(Field::Aa(1).offset(), 8);
        assert_eq!(Field::Ab(0).offset(), 4 + 8 * 4);
        assert_eq!(
            Field::Flag(Flag::Md).offset(),
            offset_of!(Registers, flags) + 13 * 4
        );
    }

    #[test]
    fn validation() {
        let mut em = Emitter::new();
        em.mov(Field::Aa(0), 1u32);
        assert!(matches!(em.finish(), Err(FragmentError::Unterminated)));

        let mut em = Emitter::new();
        let label = em.label();
        em.jump(label);
        assert!(matches!(em.finish(), Err(FragmentError::Unbound(_))));

        let mut em = Emitter::new();
        let label = em.label();
        em.bind(label);
        em.bind(label);
        em.exit(ExitCode::OutOfCycles);
        assert!(matches!(em.finish(), Err(FragmentError::Rebound(_))));
    }

    #[test]
    fn rollback() {
        let mut em = Emitter::new();
        em.mov(Field::Aa(0), 1u32);
        let mark = em.mark();
        em.mov(Field::Aa(1), 2u32);
        em.exit(ExitCode::Fault);
        em.rollback(mark);
        em.dispatch();

        let fragment = em.finish().unwrap();
        assert_eq!(fragment.ops().len(), 2);
    }

    #[test]
    fn conversions() {
        assert_eq!(Conv::FloatToIntNearest.eval(2.5f32.to_bits()), 2);
        assert_eq!(Conv::FloatToIntNearest.eval(3.5f32.to_bits()), 4);
        assert_eq!(Conv::FloatToIntTrunc.eval((-2.7f32).to_bits()), -2i32 as u32);
        assert_eq!(Conv::FloatToIntTrunc.eval(f32::NAN.to_bits()), 0);

        // 2^24 + 1 is not representable
        let odd: u32 = (1 << 24) + 1;
        assert_eq!(f32::from_bits(Conv::IntToFloatTrunc.eval(odd)), 16777216.0);
        let big: i32 = (1 << 25) + 3;
        assert_eq!(f32::from_bits(Conv::IntToFloatNearest.eval(big as u32)), 33554436.0);
        assert_eq!(f32::from_bits(Conv::IntToFloatTrunc.eval(big as u32)), 33554432.0);
        assert_eq!(
            f32::from_bits(Conv::IntToFloatTrunc.eval((-big) as u32)),
            -33554432.0
        );
    }

    #[test]
    fn signed_high_product() {
        assert_eq!(BinOp::MulHiS.eval(-1i32 as u32, 1), u32::MAX);
        assert_eq!(BinOp::MulHiS.eval(0x4000_0000, 4), 1);
    }
}
