use super::{BlockBuilder, Emit, Unimplemented};
use crate::{
    frontend::{BranchKind, Target},
    ir::{Array, BinOp, Cond, ExitCode, FaultKind, Field, HostFn, Operand},
};
use tgpx4::{
    Flag, PCS_LEN,
    bundle::{BranchTarget, ControlOp, ControlOpcode},
};

impl BlockBuilder<'_> {
    /// Checks and captures which must happen before any state of the bundle is mutated.
    pub(super) fn control_prepare(&mut self, op: ControlOp) -> Emit {
        let cop = op.cop().value();
        let opcode = op
            .opcode()
            .ok_or(Unimplemented::new(FaultKind::Control, cop as u32))?;

        if !opcode.is_branch() {
            return Ok(());
        }

        if self.desc.in_delay_slot {
            return Err(Unimplemented::new(FaultKind::BranchInDelaySlot, cop as u32));
        }

        if matches!(opcode, ControlOpcode::Db | ControlOpcode::Dbn)
            && Flag::from_condition(op.condition()).is_none()
        {
            return Err(Unimplemented::new(FaultKind::Control, cop as u32));
        }

        if opcode != ControlOpcode::Dret {
            match op.target() {
                BranchTarget::Relative(_) => (),
                BranchTarget::Ar(index) => self.em.mov(Field::JmpDest, Field::Ar(index)),
                BranchTarget::Invalid(_) => {
                    return Err(Unimplemented::new(FaultKind::Control, cop as u32));
                }
            }
        }

        match opcode {
            ControlOpcode::Dcall => {
                let room = self.em.cmp(Cond::ULt, Field::PcsPtr, PCS_LEN as u32);
                self.fault_unless(room, FaultKind::PcsOverflow);
            }
            ControlOpcode::Dret => {
                let any = self.em.cmp(Cond::Ne, Field::PcsPtr, 0u32);
                self.fault_unless(any, FaultKind::PcsUnderflow);
            }
            _ => (),
        }

        Ok(())
    }

    /// Emits the control op, after every other slot of the bundle.
    pub(super) fn control(&mut self, op: ControlOp) -> Emit {
        let cop = op.cop().value();
        let opcode = op
            .opcode()
            .ok_or(Unimplemented::new(FaultKind::Control, cop as u32))?;

        match opcode {
            ControlOpcode::Nop => (),
            ControlOpcode::Clrf => {
                let mask = op.ef1().value() as u32 & 0b11;
                if mask != 0 {
                    self.em.host_call_void(
                        HostFn::FifoClear,
                        [mask.into(), 0u32.into(), 0u32.into()],
                    );
                }
            }
            ControlOpcode::Setm => self.em.mov(Field::Mode, op.ef2() as u32),
            _ => self.branch(op, opcode)?,
        }

        Ok(())
    }

    fn branch(&mut self, op: ControlOp, opcode: ControlOpcode) -> Emit {
        let desc = self.desc;
        let Some(branch) = desc.branch else {
            return Err(Unimplemented::new(FaultKind::Control, opcode as u32));
        };

        // not taken: continue with the next bundle in linear order
        let mut skip = None;
        if branch.kind == BranchKind::Conditional {
            let flag = Flag::from_condition(op.condition())
                .ok_or(Unimplemented::new(FaultKind::Control, opcode as u32))?;

            let cond = if opcode == ControlOpcode::Db {
                Cond::Eq
            } else {
                Cond::Ne
            };

            let label = self.em.label();
            let not_taken = self.em.cmp(cond, Field::Flag(flag), 0u32);
            self.em.branch(not_taken, label);
            skip = Some(label);
        }

        match branch.kind {
            BranchKind::Call => {
                let ret = desc.pc.wrapping_add(2);
                self.em.store(Array::Pcs, Field::PcsPtr, ret);
                self.em
                    .bin_into(BinOp::Add, Field::PcsPtr, Field::PcsPtr, 1u32);
            }
            BranchKind::Return => {
                self.em
                    .bin_into(BinOp::Sub, Field::PcsPtr, Field::PcsPtr, 1u32);
                let ret = self.em.load(Array::Pcs, Field::PcsPtr);
                self.em.mov(Field::JmpDest, ret);
            }
            _ => (),
        }

        // the delay slot runs on the taken path only, the not taken path reaches it linearly
        let mut cycles = self.seq_cycles;
        if let Some(delay) = desc.delay.as_deref() {
            cycles += delay.cycles;
            if delay.unmapped {
                self.em.mov(Field::Pc, delay.pc);
                self.em.exit(ExitCode::UnmappedCode);
            } else {
                self.bundle(delay);
            }
        }

        let target: Operand = match branch.target {
            Target::Static(pc) => pc.into(),
            Target::Dynamic => Field::JmpDest.into(),
        };

        self.update_cycles(cycles, target);

        let label = match branch.target {
            Target::Static(pc) => self.label_of(pc),
            Target::Dynamic => None,
        };

        if let Some(label) = label {
            self.em.jump(label);
        } else {
            self.em.mov(Field::Pc, target);
            self.em.dispatch();
        }

        if let Some(skip) = skip {
            self.em.bind(skip);
        }

        Ok(())
    }
}
