use super::{BlockBuilder, Emit, Unimplemented};
use crate::{
    frontend::dest_bit,
    ir::{BinOp, Cond, Conv, FaultKind, Field, Temp, UnOp},
};
use tgpx4::{
    Flag, MOD_ROUND_NEAREST,
    bundle::{AluOp, AluOpcode, Dest},
};

/// ALU constants 0, 1 and -1 for integer ops.
const INT_CONSTS: [u32; 3] = [0, 1, u32::MAX];

/// ALU constants 0.0, 1.0 and -1.0 for float ops.
const FLOAT_CONSTS: [u32; 3] = [0x0000_0000, 0x3F80_0000, 0xBF80_0000];

/// Largest value of a saturated 24-bit result.
pub(super) const SAT_MAX: u32 = 0x007F_FFFF;
/// Smallest value of a saturated 24-bit result.
pub(super) const SAT_MIN: u32 = 0xFF80_0000;

pub(super) fn dest_field(dest: Dest) -> Field {
    match dest {
        Dest::Ma(i) => Field::Ma(i),
        Dest::Mb(i) => Field::Mb(i),
        Dest::Aa(i) => Field::Aa(i),
        Dest::Ab(i) => Field::Ab(i),
    }
}

impl BlockBuilder<'_> {
    /// Emits an ALU op.
    pub(super) fn alu(&mut self, op: AluOp) -> Emit {
        let opcode = op.opcode();
        let info = opcode.info();
        let unimplemented = Unimplemented::new(FaultKind::Alu, opcode as u32);

        match opcode {
            AluOpcode::Nop => return Ok(()),
            AluOpcode::Fabc
            | AluOpcode::Fea
            | AluOpcode::Fes
            | AluOpcode::Frcp
            | AluOpcode::Frsq
            | AluOpcode::Flog
            | AluOpcode::Cfib => return Err(unimplemented),
            _ => (),
        }

        let consts: &[u32] = if info.float {
            &FLOAT_CONSTS
        } else {
            &INT_CONSTS
        };

        let a = self.read_source(op.first(), consts, FaultKind::Alu)?;
        let b = if info.second_input && !opcode.is_shift() {
            let second = op.second().ok_or(unimplemented)?;
            Some(self.read_source(second, consts, FaultKind::Alu)?)
        } else {
            None
        };

        let b = || b.ok_or(unimplemented);
        let shift = op.i2().value() as u32;

        let result = match opcode {
            AluOpcode::Fadd | AluOpcode::Faddz | AluOpcode::Fsub | AluOpcode::Fsubz => {
                let b = b()?;
                let bin = if matches!(opcode, AluOpcode::Fadd | AluOpcode::Faddz) {
                    BinOp::FAdd
                } else {
                    BinOp::FSub
                };

                let result = self.em.bin(bin, a, b);
                let result = if matches!(opcode, AluOpcode::Faddz | AluOpcode::Fsubz) {
                    self.clamp_negative_float(result)
                } else {
                    result
                };

                self.float_flags(result);
                self.set_denormal_input(Flag::Ad, &[a, b]);
                Some(result)
            }
            AluOpcode::Fcmp => {
                let b = b()?;
                let result = self.em.bin(BinOp::FSub, a, b);
                self.float_flags(result);
                self.set_denormal_input(Flag::Ad, &[a, b]);
                None
            }
            AluOpcode::Fabs => {
                let result = self.em.un(UnOp::FAbs, a);
                self.float_flags(result);
                self.set_denormal_input(Flag::Ad, &[a]);
                Some(result)
            }
            AluOpcode::Cif => {
                let result = self.convert(Conv::IntToFloatNearest, Conv::IntToFloatTrunc, a);
                self.set_flag_cmp(Flag::An, Cond::FLt, result, 0u32);
                self.set_flag_cmp(Flag::Az, Cond::FEq, result, 0u32);
                Some(result)
            }
            AluOpcode::Cfi => {
                let int = self.convert(Conv::FloatToIntNearest, Conv::FloatToIntTrunc, a);
                let result = self.saturate(int, Flag::Av);
                self.int_flags(result);
                self.set_denormal_input(Flag::Ad, &[a]);
                Some(result)
            }
            AluOpcode::Add | AluOpcode::Addz => {
                let b = b()?;
                let result = self.em.bin(BinOp::Add, a, b);
                if self.required(Flag::Av) {
                    let x = self.em.bin(BinOp::Xor, a, result);
                    let y = self.em.bin(BinOp::Xor, b, result);
                    self.overflow_bit(x, y);
                }

                let result = if opcode == AluOpcode::Addz {
                    self.clamp_negative_int(result)
                } else {
                    result
                };

                self.int_flags(result);
                Some(result)
            }
            AluOpcode::Sub | AluOpcode::Subz | AluOpcode::Cmp => {
                let b = b()?;
                let result = self.em.bin(BinOp::Sub, a, b);
                if self.required(Flag::Av) {
                    let x = self.em.bin(BinOp::Xor, a, b);
                    let y = self.em.bin(BinOp::Xor, a, result);
                    self.overflow_bit(x, y);
                }

                let result = if opcode == AluOpcode::Subz {
                    self.clamp_negative_int(result)
                } else {
                    result
                };

                self.int_flags(result);
                (opcode != AluOpcode::Cmp).then_some(result)
            }
            AluOpcode::Abs => {
                let negative = self.em.cmp(Cond::SLt, a, 0u32);
                let negated = self.em.un(UnOp::Neg, a);
                let result = self.em.select(negative, negated, a);

                self.set_flag_cmp(Flag::Av, Cond::Eq, a, 0x8000_0000u32);
                self.int_flags(result);
                Some(result)
            }
            AluOpcode::Atr => Some(a),
            AluOpcode::Atrz => Some(self.clamp_negative_int(a)),
            AluOpcode::And | AluOpcode::Or | AluOpcode::Xor => {
                let bin = match opcode {
                    AluOpcode::And => BinOp::And,
                    AluOpcode::Or => BinOp::Or,
                    _ => BinOp::Xor,
                };

                let result = self.em.bin(bin, a, b()?);
                self.logic_flags(result);
                Some(result)
            }
            AluOpcode::Not => {
                let result = self.em.un(UnOp::Not, a);
                self.logic_flags(result);
                Some(result)
            }
            AluOpcode::Lsr | AluOpcode::Lsl => {
                let bin = if opcode == AluOpcode::Lsr {
                    BinOp::Shr
                } else {
                    BinOp::Shl
                };

                let result = self.em.bin(bin, a, shift);
                self.logic_flags(result);
                Some(result)
            }
            AluOpcode::Asr | AluOpcode::Asl => {
                let bin = if opcode == AluOpcode::Asr {
                    BinOp::Sar
                } else {
                    BinOp::Shl
                };

                let result = self.em.bin(bin, a, shift);
                self.int_flags(result);
                Some(result)
            }
            _ => return Err(unimplemented),
        };

        if let Some(result) = result
            && info.has_output
        {
            let dest = op.dest();
            self.write_field(dest_field(dest), Some(dest_bit(dest)), result.into());
        }

        Ok(())
    }

    /// Selects between the two conversions of a pair according to `MOD`.
    fn convert(&mut self, nearest: Conv, trunc: Conv, value: Temp) -> Temp {
        let mode = self.em.bin(BinOp::Shr, Field::Mode, MOD_ROUND_NEAREST);
        let round = self.em.bin(BinOp::And, mode, 1u32);

        let near = self.em.conv(nearest, value);
        let truncated = self.em.conv(trunc, value);
        self.em.select(round, near, truncated)
    }

    /// Clamps an integer to 24 bits, setting `flag` when it does.
    pub(super) fn saturate(&mut self, value: Temp, flag: Flag) -> Temp {
        let above = self.em.cmp(Cond::SGt, value, SAT_MAX);
        let below = self.em.cmp(Cond::SLt, value, SAT_MIN);
        let low = self.em.select(below, SAT_MIN, value);
        let result = self.em.select(above, SAT_MAX, low);

        if self.required(flag) {
            let clamped = self.em.bin(BinOp::Or, above, below);
            self.em.mov(Field::Flag(flag), clamped);
        }

        result
    }

    /// Sets `AV` to the sign bit of `x & y`.
    fn overflow_bit(&mut self, x: Temp, y: Temp) {
        let both = self.em.bin(BinOp::And, x, y);
        let sign = self.em.bin(BinOp::Shr, both, 31u32);
        self.em.mov(Field::Flag(Flag::Av), sign);
    }

    fn clamp_negative_int(&mut self, value: Temp) -> Temp {
        let negative = self.em.cmp(Cond::SLt, value, 0u32);
        self.set_flag(Flag::Zc, negative);
        self.em.select(negative, 0u32, value)
    }

    fn clamp_negative_float(&mut self, value: Temp) -> Temp {
        let negative = self.em.cmp(Cond::FLt, value, 0u32);
        self.set_flag(Flag::Zc, negative);
        self.em.select(negative, 0u32, value)
    }

    fn int_flags(&mut self, result: Temp) {
        self.set_flag_cmp(Flag::An, Cond::SLt, result, 0u32);
        self.set_flag_cmp(Flag::Az, Cond::Eq, result, 0u32);
    }

    fn logic_flags(&mut self, result: Temp) {
        self.int_flags(result);
        self.set_flag(Flag::Av, 0u32);
        self.set_flag(Flag::Au, 0u32);
    }

    fn float_flags(&mut self, result: Temp) {
        self.set_flag_cmp(Flag::An, Cond::FLt, result, 0u32);
        self.set_flag_cmp(Flag::Az, Cond::FEq, result, 0u32);

        if self.required(Flag::Av) {
            let infinite = self.is_infinite(result);
            self.em.mov(Field::Flag(Flag::Av), infinite);
        }

        if self.required(Flag::Au) {
            let denormal = self.is_denormal(result);
            self.em.mov(Field::Flag(Flag::Au), denormal);
        }
    }
}
