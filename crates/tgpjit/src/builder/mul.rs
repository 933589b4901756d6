use super::{
    BlockBuilder, Emit, Unimplemented,
    alu::{SAT_MAX, SAT_MIN, dest_field},
};
use crate::{
    frontend::dest_bit,
    ir::{BinOp, Cond, FaultKind, Field},
};
use tgpx4::{
    Flag,
    bundle::{MUL_FLOAT_CONSTS, MulOp},
};

const INT_CONSTS: [u32; 3] = [0, 1, u32::MAX];

impl BlockBuilder<'_> {
    /// Emits a MUL op.
    pub(super) fn mul(&mut self, op: MulOp) -> Emit {
        let unimplemented = Unimplemented::new(FaultKind::Mul, op.i2().value() as u32);

        let float_consts = MUL_FLOAT_CONSTS.map(f32::to_bits);
        let consts: &[u32] = if op.float() {
            &float_consts
        } else {
            &INT_CONSTS
        };

        let a = self.read_source(op.first(), consts, FaultKind::Mul)?;
        let second = op.second().ok_or(unimplemented)?;
        let b = self.read_source(second, consts, FaultKind::Mul)?;

        let result = if op.float() {
            let result = self.em.bin(BinOp::FMul, a, b);

            self.set_flag_cmp(Flag::Mn, Cond::FLt, result, 0u32);
            self.set_flag_cmp(Flag::Mz, Cond::FEq, result, 0u32);

            if self.required(Flag::Mv) {
                let infinite = self.is_infinite(result);
                self.em.mov(Field::Flag(Flag::Mv), infinite);
            }

            if self.required(Flag::Mu) {
                let denormal = self.is_denormal(result);
                self.em.mov(Field::Flag(Flag::Mu), denormal);
            }

            self.set_denormal_input(Flag::Md, &[a, b]);
            result
        } else {
            // saturate the full 64-bit product to 24 bits
            let low = self.em.bin(BinOp::Mul, a, b);
            let high = self.em.bin(BinOp::MulHiS, a, b);

            let sign = self.em.bin(BinOp::Sar, low, 31u32);
            let wide = self.em.cmp(Cond::Ne, high, sign);
            let above = self.em.cmp(Cond::SGt, low, SAT_MAX);
            let below = self.em.cmp(Cond::SLt, low, SAT_MIN);
            let narrow = self.em.bin(BinOp::Or, above, below);
            let over = self.em.bin(BinOp::Or, wide, narrow);

            let negative = self.em.cmp(Cond::SLt, high, 0u32);
            let clamp = self.em.select(negative, SAT_MIN, SAT_MAX);
            let result = self.em.select(over, clamp, low);

            self.set_flag(Flag::Mv, over);
            self.set_flag_cmp(Flag::Mn, Cond::SLt, result, 0u32);
            self.set_flag_cmp(Flag::Mz, Cond::Eq, result, 0u32);
            result
        };

        let dest = op.dest();
        self.write_field(dest_field(dest), Some(dest_bit(dest)), result.into());

        Ok(())
    }
}
