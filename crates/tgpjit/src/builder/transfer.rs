use super::{BlockBuilder, Emit, Unimplemented};
use crate::{
    frontend::RegSet,
    ir::{BinOp, FaultKind, Field, HostFn, Operand, Temp},
};
use bitos::integer::u7;
use tgpx4::bundle::{DoubleTransfer, Half, Location, Transfer, Transfer3};

/// Fields shared by the general transfer encodings.
struct General {
    sr: u7,
    dr: u7,
    md: u8,
    ary: u8,
    disp: i32,
    imm: u32,
}

impl BlockBuilder<'_> {
    pub(super) fn transfer(&mut self, transfer: Transfer) -> Emit {
        match transfer {
            Transfer::Double1(double) => {
                if double.extended() {
                    return Err(Unimplemented::new(FaultKind::DoubleTransfer, 1 << 7));
                }

                self.double(double)
            }
            Transfer::Double2 { op, halves } => {
                if op != 0 {
                    return Err(Unimplemented::new(FaultKind::DoubleTransfer, op as u32));
                }

                self.double(halves)
            }
            Transfer::Single1(t) => {
                if t.trm() {
                    self.external(t.dr().value() & 0x3F, t.from_bus(), t.displacement())
                } else {
                    self.general(General {
                        sr: t.sr(),
                        dr: t.dr(),
                        md: t.md().value(),
                        ary: t.ary().value(),
                        disp: t.displacement(),
                        imm: t.immediate(),
                    })
                }
            }
            Transfer::Single2(t) => {
                if t.op().value() != 0 {
                    return Err(Unimplemented::new(
                        FaultKind::Transfer,
                        t.op().value() as u32,
                    ));
                }

                if t.trm() {
                    self.external(t.dr().value() & 0x3F, t.from_bus(), t.displacement())
                } else {
                    self.general(General {
                        sr: t.sr(),
                        dr: t.dr(),
                        md: t.md().value(),
                        ary: t.ary().value(),
                        disp: t.displacement(),
                        imm: t.immediate(),
                    })
                }
            }
            Transfer::Immediate(t) => self.immediate(t),
        }
    }

    fn general(&mut self, t: General) -> Emit {
        let unimplemented = || {
            Unimplemented::new(
                FaultKind::Transfer,
                ((t.sr.value() as u32) << 7) | t.dr.value() as u32,
            )
        };

        let src = Location::decode(t.sr);
        let dst = Location::decode(t.dr);

        let value: Operand = match src {
            Location::Imm => {
                let Location::Reg(code) = dst else {
                    return Err(unimplemented());
                };

                return self.write_reg(code, t.imm.into());
            }
            Location::Reg(code) => self.read_reg(code)?.into(),
            Location::RamA { ar } => {
                if !matches!(dst, Location::Reg(_)) {
                    return Err(unimplemented());
                }

                let addr = self.effective_address(t.md, ar, t.ary, t.disp)?;
                self.read_ram_a(addr).into()
            }
            Location::RamB { ar } => {
                if !matches!(dst, Location::Reg(_)) {
                    return Err(unimplemented());
                }

                let addr = self.effective_address(t.md, ar, t.ary, t.disp)?;
                self.read_ram_b(addr).into()
            }
        };

        match dst {
            Location::Reg(code) => self.write_reg(code, value)?,
            Location::RamA { ar } => {
                let addr = self.effective_address(t.md, ar, t.ary, t.disp)?;
                self.write_ram_a(addr, value);
            }
            Location::RamB { ar } => {
                let addr = self.effective_address(t.md, ar, t.ary, t.disp)?;
                self.write_ram_b(addr, value);
            }
            Location::Imm => return Err(unimplemented()),
        }

        Ok(())
    }

    /// A transfer through the external bus at `EB + EO`, followed by `EO += disp`.
    fn external(&mut self, reg: u8, from_bus: bool, disp: i32) -> Emit {
        let eo = self.em.temp();
        self.em.mov(eo, Field::Eo);
        let addr = self.em.bin(BinOp::Add, Field::Eb, eo);

        let value = if from_bus {
            let value = self
                .em
                .host_call(HostFn::ReadExternal, [addr.into(), 0u32.into(), 0u32.into()]);
            Some(value)
        } else {
            let value = self.read_reg(reg)?;
            self.em.host_call_void(
                HostFn::WriteExternal,
                [addr.into(), value.into(), 0u32.into()],
            );
            None
        };

        let next = self.em.bin(BinOp::Add, eo, disp as u32);
        self.write_field(Field::Eo, Some(RegSet::EO), next.into());

        if let Some(value) = value {
            self.write_reg(reg, value.into())?;
        }

        Ok(())
    }

    fn immediate(&mut self, t: Transfer3) -> Emit {
        let imm = t.imm();
        let (md, ary, disp) = (t.md().value(), t.ary().value(), t.displacement());

        match t.dest() {
            Location::Reg(code) => self.write_reg(code, imm.into())?,
            Location::RamA { ar } => {
                let addr = self.effective_address(md, ar, ary, disp)?;
                self.write_ram_a(addr, imm.into());
            }
            Location::RamB { ar } => {
                let addr = self.effective_address(md, ar, ary, disp)?;
                self.write_ram_b(addr, imm.into());
            }
            Location::Imm => {
                return Err(Unimplemented::new(FaultKind::Transfer, t.dr().value() as u32));
            }
        }

        Ok(())
    }

    /// Address and read side of one half of a double transfer.
    fn half_read(&mut self, half: Half, ram_b: bool) -> Emit<(Temp, Temp)> {
        if half.md > 2 {
            return Err(Unimplemented::new(FaultKind::DoubleTransfer, half.md as u32));
        }

        let addr = self.effective_address(half.md, half.ar, 0, 0)?;
        let value = match (half.store, ram_b) {
            (true, _) => self.read_reg(half.reg)?,
            (false, false) => self.read_ram_a(addr),
            (false, true) => self.read_ram_b(addr),
        };

        Ok((addr, value))
    }

    fn half_write(&mut self, half: Half, ram_b: bool, addr: Temp, value: Temp) -> Emit {
        match (half.store, ram_b) {
            (true, false) => self.write_ram_a(addr, value.into()),
            (true, true) => self.write_ram_b(addr, value.into()),
            (false, _) => self.write_reg(half.reg, value.into())?,
        }

        Ok(())
    }

    /// Half A moves between a register and RAM-A, half B between a register and RAM-B. Both halves
    /// read before either writes.
    fn double(&mut self, double: DoubleTransfer) -> Emit {
        let (a, b) = (double.a(), double.b());

        // address register updates of one half must not be visible to the other
        self.hold = self
            .hold
            .with(RegSet::AR + a.ar as u32)
            .with(RegSet::AR + b.ar as u32);

        let (addr_a, value_a) = self.half_read(a, false)?;
        let (addr_b, value_b) = self.half_read(b, true)?;

        self.half_write(a, false, addr_a, value_a)?;
        self.half_write(b, true, addr_b, value_b)?;

        Ok(())
    }
}
