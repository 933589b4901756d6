mod alu;
mod control;
mod mul;
mod transfer;
mod util;

use crate::{
    frontend::{Block, BundleDesc, RegSet},
    ir::{
        Array, BinOp, Cond, Emitter, ExitCode, FaultKind, Field, Fragment, FragmentError, Handle,
        HostFn, Label, MapVar, Operand, Temp,
    },
};
use rustc_hash::FxHashMap;
use tinyvec::ArrayVec;
use tgpx4::{
    Trap,
    bundle::{Format, Transfer},
};

/// An op the code generator has no semantics for.
#[derive(Debug, Clone, Copy)]
struct Unimplemented {
    kind: FaultKind,
    detail: u32,
}

impl Unimplemented {
    fn new(kind: FaultKind, detail: u32) -> Self {
        Self { kind, detail }
    }
}

type Emit<T = ()> = Result<T, Unimplemented>;

/// A write delayed until the end of the bundle.
#[derive(Debug, Clone, Copy)]
enum Held {
    Field(Field, Temp),
    Pr { index: Temp, value: Temp },
}

impl Default for Held {
    fn default() -> Self {
        Held::Field(Field::default(), Temp::default())
    }
}

/// Emits the ops of a [`Block`].
pub struct BlockBuilder<'a> {
    em: Emitter,
    block: &'a Block,
    /// Labels of bundles targeted by branches inside the block.
    labels: FxHashMap<u32, Label>,
    /// Cycles accumulated by the current sequence.
    seq_cycles: u32,

    // == per bundle state
    desc: &'a BundleDesc,
    /// Registers read by the slots other than the one being emitted.
    hold: RegSet,
    /// Writes delayed until every slot of the bundle has read its inputs.
    held: ArrayVec<[Held; 16]>,
}

impl<'a> BlockBuilder<'a> {
    pub fn new(block: &'a Block) -> Option<Self> {
        let first = block.bundles.first()?;

        let mut em = Emitter::new();
        let labels = block
            .bundles
            .iter()
            .filter(|desc| desc.branch_target)
            .map(|desc| (desc.pc, em.label()))
            .collect();

        Some(Self {
            em,
            block,
            labels,
            seq_cycles: 0,
            desc: first,
            hold: RegSet::NONE,
            held: ArrayVec::new(),
        })
    }

    /// Emits the whole block.
    pub fn build(mut self) -> Result<Fragment, FragmentError> {
        let block = self.block;
        for (index, desc) in block.bundles.iter().enumerate() {
            if desc.branch_target
                && let Some(label) = self.label_of(desc.pc)
            {
                self.em.bind(label);
            }

            self.em.map_var(MapVar::Pc, desc.pc);
            self.em.map_var(MapVar::Cycles, self.seq_cycles);

            if desc.unmapped {
                // the bundles before it still pay for themselves
                let pending = std::mem::take(&mut self.seq_cycles);
                if pending > 0 {
                    self.update_cycles(pending, desc.pc.into());
                }

                self.em.mov(Field::Pc, desc.pc);
                self.em.exit(ExitCode::UnmappedCode);
                continue;
            }

            self.seq_cycles += desc.cycles;

            self.bundle(desc);

            if !desc.end_sequence {
                continue;
            }

            let cycles = std::mem::take(&mut self.seq_cycles);
            if desc.ends_flow() {
                continue;
            }

            let next = desc.pc.wrapping_add(1);
            self.update_cycles(cycles, next.into());

            let falls_through = block
                .bundles
                .get(index + 1)
                .is_some_and(|desc| desc.pc == next);

            if !falls_through {
                self.em.mov(Field::Pc, next);
                self.em.dispatch();
            }
        }

        self.em.finish()
    }

    /// Subtracts `cycles` from the budget, leaving through the out of cycles handle with `resume`
    /// as the PC if it runs out.
    fn update_cycles(&mut self, cycles: u32, resume: Operand) {
        self.em
            .bin_into(BinOp::Sub, Field::Icount, Field::Icount, cycles);

        let remaining = self.em.cmp(Cond::SGe, Field::Icount, 0u32);
        let cont = self.em.label();
        self.em.branch(remaining, cont);
        self.em.exh(Handle::OutOfCycles, resume);
        self.em.bind(cont);
    }

    /// Reports a fault for the current bundle and leaves.
    fn fault(&mut self, kind: FaultKind, detail: u32) {
        let word = self.desc.word;
        self.em.mov(Field::Pc, self.desc.pc);
        self.em.host_call_void(
            HostFn::Fault,
            [
                (kind as u32 | (detail << 8)).into(),
                (word as u32).into(),
                ((word >> 32) as u32).into(),
            ],
        );
        self.em.exit(ExitCode::Fault);
    }

    /// Reports a fault if `ok` is zero.
    fn fault_unless(&mut self, ok: Temp, kind: FaultKind) {
        let cont = self.em.label();
        self.em.branch(ok, cont);
        self.fault(kind, 0);
        self.em.bind(cont);
    }

    /// Leaves if a host call recorded a fault.
    fn check_trap(&mut self) {
        let trap = self
            .em
            .bin(BinOp::And, Field::Trap, Trap::Fault as u32);
        let ok = self.em.cmp(Cond::Eq, trap, 0u32);

        let cont = self.em.label();
        self.em.branch(ok, cont);
        self.em.mov(Field::Pc, self.desc.pc);
        self.em.exit(ExitCode::Fault);
        self.em.bind(cont);
    }

    /// Emits a bundle. Bundles with unimplemented ops are replaced by a fault.
    fn bundle(&mut self, desc: &'a BundleDesc) {
        let outer = std::mem::replace(&mut self.desc, desc);
        let mark = self.em.mark();
        self.held.clear();

        if let Err(unimplemented) = self.bundle_inner() {
            tracing::warn!(
                pc = desc.pc,
                word = format_args!("{:016X}", desc.word),
                kind = ?unimplemented.kind,
                "unimplemented op, emitting fault"
            );

            self.em.rollback(mark);
            self.held.clear();
            self.fault(unimplemented.kind, unimplemented.detail);
        }

        self.desc = outer;
    }

    fn bundle_inner(&mut self) -> Emit {
        let desc = self.desc;
        let bundle = desc.bundle();
        if bundle.format() == Format::Invalid {
            return Err(Unimplemented::new(FaultKind::Bundle, 0));
        }

        let slots = bundle.slots();

        // 1. checks and captures which must happen before anything is mutated
        if let Some(control) = slots.control {
            self.control_prepare(control)?;
        }

        // 2. transfer
        if let Some(transfer) = slots.transfer {
            self.hold = desc.alu.reads.union(desc.mul.reads);
            let double = matches!(
                transfer,
                Transfer::Double1(_) | Transfer::Double2 { .. }
            );

            self.transfer(transfer).map_err(|err| {
                if double && err.kind == FaultKind::Transfer {
                    Unimplemented::new(FaultKind::DoubleTransfer, err.detail)
                } else {
                    err
                }
            })?;
        }

        // 3. ALU
        if let Some(alu) = slots.alu {
            self.hold = desc.transfer.reads.union(desc.mul.reads);
            self.alu(alu)?;
        }

        // 4. MUL
        if let Some(mul) = slots.mul {
            self.hold = desc.transfer.reads.union(desc.alu.reads);
            self.mul(mul)?;
        }

        // 5. commit held writes
        self.hold = RegSet::NONE;
        for held in std::mem::take(&mut self.held) {
            match held {
                Held::Field(field, value) => self.em.mov(field, value),
                Held::Pr { index, value } => self.em.store(Array::Pr, index, value),
            }
        }

        // 6. control
        if let Some(control) = slots.control {
            self.control(control)?;
        }

        Ok(())
    }

    /// Writes `value` to `field`, delaying the write if another slot reads it.
    fn write_field(&mut self, field: Field, bit: Option<u32>, value: Operand) {
        if bit.is_some_and(|bit| self.hold.contains(bit)) {
            let temp = self.em.temp();
            self.em.mov(temp, value);
            self.held.push(Held::Field(field, temp));
        } else {
            self.em.mov(field, value);
        }
    }

    /// Label of the bundle at `pc` if it is a branch target inside the block.
    fn label_of(&self, pc: u32) -> Option<Label> {
        self.labels.get(&pc).copied()
    }
}

/// Generates the fragment for a block. Returns `None` for empty blocks.
pub fn build(block: &Block) -> Option<Result<Fragment, FragmentError>> {
    BlockBuilder::new(block).map(BlockBuilder::build)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{frontend::analyze, ir::Op};
    use tgpx4::{
        Bus,
        bundle::{AluOpcode, ControlOpcode, asm},
    };

    struct Program(Vec<u64>);

    impl Bus for Program {
        fn fetch(&mut self, pc: u32) -> Option<u64> {
            self.0.get(pc as usize).copied()
        }

        fn read_a(&mut self, _: u32) -> u32 {
            0
        }

        fn write_a(&mut self, _: u32, _: u32) {}

        fn read_b(&mut self, _: u32) -> u32 {
            0
        }

        fn write_b(&mut self, _: u32, _: u32) {}

        fn read_external(&mut self, _: u32) -> u32 {
            0
        }

        fn write_external(&mut self, _: u32, _: u32) {}
    }

    fn fragment(program: Vec<u64>, max: usize) -> Fragment {
        let block = analyze(0, max, &mut Program(program));
        build(&block).unwrap().unwrap()
    }

    fn subtracted_cycles(fragment: &Fragment) -> Vec<u32> {
        fragment
            .ops()
            .iter()
            .filter_map(|op| match op {
                Op::Bin {
                    op: BinOp::Sub,
                    dst: crate::ir::Place::Field(Field::Icount),
                    b: Operand::Imm(cycles),
                    ..
                } => Some(*cycles),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn sequence_cycles_match_bundles() {
        let fragment = fragment(vec![asm::nop(); 5], 5);
        assert_eq!(subtracted_cycles(&fragment), vec![5]);
        assert!(matches!(fragment.ops().last(), Some(Op::Dispatch)));
    }

    #[test]
    fn unmapped_exits() {
        let fragment = fragment(vec![asm::nop()], 8);
        assert!(
            fragment
                .ops()
                .contains(&Op::Exit(ExitCode::UnmappedCode))
        );
        assert_eq!(subtracted_cycles(&fragment), vec![1]);
    }

    #[test]
    fn loop_uses_label() {
        let fragment = fragment(
            vec![
                asm::nop(),
                asm::nop(),
                asm::control_only(ControlOpcode::Djmp, 0, asm::relative(-2)),
                asm::nop(),
            ],
            8,
        );

        // the jump subtracts the whole loop body plus its delay slot
        assert_eq!(subtracted_cycles(&fragment), vec![4]);
        assert!(fragment.ops().iter().any(|op| matches!(op, Op::Jump(_))));
        assert!(!fragment.ops().contains(&Op::Dispatch));
    }

    #[test]
    fn unimplemented_alu_faults() {
        let word = asm::single_alu(
            Format::UnitControl,
            asm::alu(AluOpcode::Frcp, 0, 0, 0),
            asm::control(ControlOpcode::Nop, 0, 0) as u64,
        );

        let fragment = fragment(vec![word], 1);
        let fault = fragment.ops().iter().find_map(|op| match op {
            Op::HostCall {
                func: HostFn::Fault,
                args,
                ..
            } => Some(args[0]),
            _ => None,
        });

        assert_eq!(fault, Some(Operand::Imm(FaultKind::Alu as u32 | (0x0A << 8))));
    }

    #[test]
    fn invalid_format_faults() {
        let fragment = fragment(vec![3 << 61, asm::nop()], 8);
        assert!(fragment.ops().contains(&Op::Exit(ExitCode::Fault)));
        assert!(
            !fragment
                .ops()
                .iter()
                .any(|op| matches!(op, Op::Exit(ExitCode::UnmappedCode)))
        );
    }
}
