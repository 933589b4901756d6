//! Operand access shared by the slot emitters.
use super::{BlockBuilder, Emit, Held, Unimplemented};
use crate::{
    frontend::{RegSet, xfer_bit},
    ir::{Array, BinOp, Cond, FaultKind, Field, Handle, HostFn, Operand, Temp},
};
use tgpx4::{
    Flag, PR_LEN,
    bundle::{EaMode, PrMode, Source, XferReg},
};

/// Field of a register reachable by transfers, if it is a plain word.
fn scalar_field(reg: XferReg) -> Option<Field> {
    Some(match reg {
        XferReg::Aa(i) => Field::Aa(i),
        XferReg::Ab(i) => Field::Ab(i),
        XferReg::Ma(i) => Field::Ma(i),
        XferReg::Mb(i) => Field::Mb(i),
        XferReg::Ar(i) => Field::Ar(i),
        XferReg::Eb => Field::Eb,
        XferReg::Eo => Field::Eo,
        XferReg::Sp => Field::Sp,
        XferReg::Mod => Field::Mode,
        XferReg::Pdr => Field::Pdr,
        XferReg::Ddr => Field::Ddr,
        XferReg::Prp => Field::Prp,
        XferReg::Pwp => Field::Pwp,
        XferReg::Pr(_) | XferReg::FifoIn | XferReg::FifoOut0 | XferReg::FifoOut1 => return None,
    })
}

impl BlockBuilder<'_> {
    /// Moves a ring buffer pointer according to `mode`.
    pub(super) fn move_pointer(&mut self, field: Field, bit: u32, pointer: Temp, mode: PrMode) {
        let last = PR_LEN as u32 - 1;
        let moved: Operand = match mode {
            PrMode::Plain => return,
            PrMode::Increment => {
                let next = self.em.bin(BinOp::Add, pointer, 1u32);
                let wraps = self.em.cmp(Cond::UGe, next, PR_LEN as u32);
                self.em.select(wraps, 0u32, next).into()
            }
            PrMode::Decrement => {
                let prev = self.em.bin(BinOp::Sub, pointer, 1u32);
                let wraps = self.em.cmp(Cond::Eq, pointer, 0u32);
                self.em.select(wraps, last, prev).into()
            }
            PrMode::Reset => 0u32.into(),
        };

        self.write_field(field, Some(bit), moved);
    }

    /// Reads the ring buffer through the read pointer.
    pub(super) fn read_pr(&mut self, mode: PrMode) -> Temp {
        let pointer = self.em.temp();
        self.em.mov(pointer, Field::Prp);
        let value = self.em.load(Array::Pr, pointer);
        self.move_pointer(Field::Prp, RegSet::PRP, pointer, mode);

        value
    }

    /// Writes the ring buffer through the write pointer.
    pub(super) fn write_pr(&mut self, mode: PrMode, value: Operand) {
        let pointer = self.em.temp();
        self.em.mov(pointer, Field::Pwp);

        if self.hold.contains(RegSet::PR) {
            let held = self.em.temp();
            self.em.mov(held, value);
            self.held.push(Held::Pr {
                index: pointer,
                value: held,
            });
        } else {
            self.em.store(Array::Pr, pointer, value);
        }

        self.move_pointer(Field::Pwp, RegSet::PWP, pointer, mode);
    }

    /// Reads an ALU or MUL input. `consts` is the constant pool of the unit, as raw words.
    pub(super) fn read_source(
        &mut self,
        source: Source,
        consts: &[u32],
        kind: FaultKind,
    ) -> Emit<Temp> {
        let field = match source {
            Source::Aa(i) => Field::Aa(i),
            Source::Ab(i) => Field::Ab(i),
            Source::Ma(i) => Field::Ma(i),
            Source::Mb(i) => Field::Mb(i),
            Source::Pr(mode) => return Ok(self.read_pr(mode)),
            Source::Const(index) => {
                let Some(value) = consts.get(index as usize).copied() else {
                    return Err(Unimplemented::new(kind, index as u32));
                };

                let temp = self.em.temp();
                self.em.mov(temp, value);
                return Ok(temp);
            }
        };

        let temp = self.em.temp();
        self.em.mov(temp, field);
        Ok(temp)
    }

    /// Reads a register by transfer register code.
    pub(super) fn read_reg(&mut self, code: u8) -> Emit<Temp> {
        let reg = XferReg::decode(code)
            .filter(|reg| reg.readable())
            .ok_or(Unimplemented::new(FaultKind::Transfer, code as u32))?;

        if let Some(field) = scalar_field(reg) {
            let temp = self.em.temp();
            self.em.mov(temp, field);
            return Ok(temp);
        }

        match reg {
            XferReg::Pr(mode) => Ok(self.read_pr(mode)),
            XferReg::FifoIn => {
                let value = self.em.host_call(
                    HostFn::FifoPop,
                    [0u32.into(), 0u32.into(), 0u32.into()],
                );
                self.check_trap();
                Ok(value)
            }
            _ => Err(Unimplemented::new(FaultKind::Transfer, code as u32)),
        }
    }

    /// Writes a register by transfer register code.
    pub(super) fn write_reg(&mut self, code: u8, value: Operand) -> Emit {
        let reg = XferReg::decode(code)
            .filter(|reg| reg.writable())
            .ok_or(Unimplemented::new(FaultKind::Transfer, code as u32))?;

        if let Some(field) = scalar_field(reg) {
            let value = if matches!(reg, XferReg::Prp | XferReg::Pwp) {
                self.em.bin(BinOp::Rem, value, PR_LEN as u32).into()
            } else {
                value
            };

            self.write_field(field, xfer_bit(reg), value);
            return Ok(());
        }

        match reg {
            XferReg::Pr(mode) => self.write_pr(mode, value),
            XferReg::FifoOut0 | XferReg::FifoOut1 => {
                let output = (reg == XferReg::FifoOut1) as u32;
                self.em
                    .host_call_void(HostFn::FifoPush, [output.into(), value, 0u32.into()]);
                self.check_trap();
            }
            _ => return Err(Unimplemented::new(FaultKind::Transfer, code as u32)),
        }

        Ok(())
    }

    /// Computes an effective address, updating the address registers as the mode requires.
    pub(super) fn effective_address(
        &mut self,
        md: u8,
        arx: u8,
        ary: u8,
        disp: i32,
    ) -> Emit<Temp> {
        let mode = EaMode::decode(md).ok_or(Unimplemented::new(FaultKind::Transfer, md as u32))?;
        let disp = disp as u32;

        let x = self.em.temp();
        self.em.mov(x, Field::Ar(arx));
        let y = || Field::Ar(ary);

        let addr = match mode {
            EaMode::Ar => x,
            EaMode::ArInc => {
                let next = self.em.bin(BinOp::Add, x, 1u32);
                self.write_ar(arx, next);
                x
            }
            EaMode::ArDec => {
                let prev = self.em.bin(BinOp::Sub, x, 1u32);
                self.write_ar(arx, prev);
                x
            }
            EaMode::ArIncDisp => {
                let next = self.em.bin(BinOp::Add, x, disp);
                self.write_ar(arx, next);
                x
            }
            EaMode::ArPlusAy => self.em.bin(BinOp::Add, x, y()),
            EaMode::ArPlusAyInc | EaMode::ArPlusAyDec => {
                let ay = self.em.temp();
                self.em.mov(ay, y());
                let addr = self.em.bin(BinOp::Add, x, ay);

                let op = if mode == EaMode::ArPlusAyInc {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };

                let moved = self.em.bin(op, ay, 1u32);
                self.write_ar(ary, moved);
                addr
            }
            EaMode::ArIncAy => {
                let next = self.em.bin(BinOp::Add, x, y());
                self.write_ar(arx, next);
                x
            }
            EaMode::ArDisp => self.em.bin(BinOp::Add, x, disp),
        };

        Ok(addr)
    }

    fn write_ar(&mut self, index: u8, value: Temp) {
        self.write_field(
            Field::Ar(index),
            Some(RegSet::AR + index as u32),
            value.into(),
        );
    }

    /// Reads RAM-A, going through the bus window above the internal RAM.
    pub(super) fn read_ram_a(&mut self, addr: Temp) -> Temp {
        self.em.mov(Field::Arg(0), addr);
        self.em.call(Handle::ReadAbus);

        let value = self.em.temp();
        self.em.mov(value, Field::Arg(1));
        value
    }

    /// Writes RAM-A, going through the bus window above the internal RAM.
    pub(super) fn write_ram_a(&mut self, addr: Temp, value: Operand) {
        self.em.mov(Field::Arg(0), addr);
        self.em.mov(Field::Arg(1), value);
        self.em.call(Handle::WriteAbus);
    }

    pub(super) fn read_ram_b(&mut self, addr: Temp) -> Temp {
        self.em
            .host_call(HostFn::ReadB, [addr.into(), 0u32.into(), 0u32.into()])
    }

    pub(super) fn write_ram_b(&mut self, addr: Temp, value: Operand) {
        self.em
            .host_call_void(HostFn::WriteB, [addr.into(), value, 0u32.into()]);
    }

    /// Whether `flag` must be computed by this bundle.
    #[inline(always)]
    pub(super) fn required(&self, flag: Flag) -> bool {
        self.desc.flags_required.contains(flag)
    }

    /// Sets `flag` to `value` (0 or 1) if it is required.
    pub(super) fn set_flag(&mut self, flag: Flag, value: impl Into<Operand>) {
        if self.required(flag) {
            self.em.mov(Field::Flag(flag), value);
        }
    }

    /// Sets `flag` to `cond(a, b)` if it is required.
    pub(super) fn set_flag_cmp(
        &mut self,
        flag: Flag,
        cond: Cond,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
    ) {
        if self.required(flag) {
            let value = self.em.cmp(cond, a, b);
            self.em.mov(Field::Flag(flag), value);
        }
    }

    /// Whether a float is infinite, as a 0/1 word.
    pub(super) fn is_infinite(&mut self, value: Temp) -> Temp {
        let magnitude = self.em.bin(BinOp::And, value, 0x7FFF_FFFFu32);
        self.em.cmp(Cond::Eq, magnitude, 0x7F80_0000u32)
    }

    /// Whether a float is denormal, as a 0/1 word.
    pub(super) fn is_denormal(&mut self, value: Temp) -> Temp {
        let exponent = self.em.bin(BinOp::And, value, 0x7F80_0000u32);
        let mantissa = self.em.bin(BinOp::And, value, 0x007F_FFFFu32);
        let no_exponent = self.em.cmp(Cond::Eq, exponent, 0u32);
        let has_mantissa = self.em.cmp(Cond::Ne, mantissa, 0u32);
        self.em.bin(BinOp::And, no_exponent, has_mantissa)
    }

    /// Computes `AD`/`MD`: any of `inputs` is denormal.
    pub(super) fn set_denormal_input(&mut self, flag: Flag, inputs: &[Temp]) {
        if !self.required(flag) {
            return;
        }

        let mut any: Operand = 0u32.into();
        for input in inputs {
            let denormal = self.is_denormal(*input);
            any = self.em.bin(BinOp::Or, any, denormal).into();
        }

        self.em.mov(Field::Flag(flag), any);
    }
}
