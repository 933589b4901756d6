//! Front-end analysis: splits the code at a PC into a block of described bundles.
use tgpx4::{
    Bus, Flag, FlagSet,
    bundle::{
        AluOp, BranchTarget, Bundle, ControlOp, ControlOpcode, Dest, DoubleTransfer, EaMode,
        Format, Half, Location, MulOp, PrMode, Source, Transfer, XferReg,
    },
};

/// A set of registers, one bit per register.
///
/// Bits 0..40 hold the AA, AB, MA, MB and AR banks (8 each), the remaining bits hold the scalar
/// registers visible to transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegSet(pub u64);

impl RegSet {
    pub const NONE: Self = Self(0);

    pub const AA: u32 = 0;
    pub const AB: u32 = 8;
    pub const MA: u32 = 16;
    pub const MB: u32 = 24;
    pub const AR: u32 = 32;
    pub const EB: u32 = 40;
    pub const EO: u32 = 41;
    pub const SP: u32 = 42;
    pub const MOD: u32 = 43;
    pub const PDR: u32 = 44;
    pub const DDR: u32 = 45;
    pub const PRP: u32 = 46;
    pub const PWP: u32 = 47;
    /// The whole parameter ring buffer.
    pub const PR: u32 = 48;

    #[inline(always)]
    pub fn with(self, bit: u32) -> Self {
        Self(self.0 | (1 << bit))
    }

    #[inline(always)]
    pub fn contains(self, bit: u32) -> bool {
        self.0 & (1 << bit) != 0
    }

    #[inline(always)]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline(always)]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// Returns the [`RegSet`] bit of an ALU/MUL destination.
pub fn dest_bit(dest: Dest) -> u32 {
    match dest {
        Dest::Aa(i) => RegSet::AA + i as u32,
        Dest::Ab(i) => RegSet::AB + i as u32,
        Dest::Ma(i) => RegSet::MA + i as u32,
        Dest::Mb(i) => RegSet::MB + i as u32,
    }
}

/// Returns the [`RegSet`] bit of a register reachable by transfers, if it has one.
pub fn xfer_bit(reg: XferReg) -> Option<u32> {
    Some(match reg {
        XferReg::Aa(i) => RegSet::AA + i as u32,
        XferReg::Ab(i) => RegSet::AB + i as u32,
        XferReg::Ma(i) => RegSet::MA + i as u32,
        XferReg::Mb(i) => RegSet::MB + i as u32,
        XferReg::Ar(i) => RegSet::AR + i as u32,
        XferReg::Eb => RegSet::EB,
        XferReg::Eo => RegSet::EO,
        XferReg::Sp => RegSet::SP,
        XferReg::Mod => RegSet::MOD,
        XferReg::Pdr => RegSet::PDR,
        XferReg::Ddr => RegSet::DDR,
        XferReg::Prp => RegSet::PRP,
        XferReg::Pwp => RegSet::PWP,
        XferReg::Pr(_) => RegSet::PR,
        XferReg::FifoIn | XferReg::FifoOut0 | XferReg::FifoOut1 => return None,
    })
}

fn source_bits(source: Source, reads: &mut RegSet, writes: &mut RegSet) {
    match source {
        Source::Aa(i) => *reads = reads.with(RegSet::AA + i as u32),
        Source::Ab(i) => *reads = reads.with(RegSet::AB + i as u32),
        Source::Ma(i) => *reads = reads.with(RegSet::MA + i as u32),
        Source::Mb(i) => *reads = reads.with(RegSet::MB + i as u32),
        Source::Pr(mode) => {
            *reads = reads.with(RegSet::PR).with(RegSet::PRP);
            if mode != PrMode::Plain {
                *writes = writes.with(RegSet::PRP);
            }
        }
        Source::Const(_) => (),
    }
}

/// Registers accessed by one slot of a bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    pub reads: RegSet,
    pub writes: RegSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// `DBcc`/`DBNcc`: execution continues after the delay slot when not taken.
    Conditional,
    Jump,
    Call,
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Static(u32),
    /// Only known at runtime (an address register or the PCS).
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub kind: BranchKind,
    pub target: Target,
}

/// A decoded bundle along with everything the code generator needs to know about it.
#[derive(Debug, Clone)]
pub struct BundleDesc {
    pub pc: u32,
    pub word: u64,
    pub cycles: u32,

    pub transfer: Access,
    pub alu: Access,
    pub mul: Access,

    /// Flags read by this bundle.
    pub flags_used: FlagSet,
    /// Flags this bundle may define.
    pub flags_defined: FlagSet,
    /// Flags this bundle must actually compute.
    pub flags_required: FlagSet,

    pub branch: Option<Branch>,
    /// The delay slot of a branch.
    pub delay: Option<Box<BundleDesc>>,

    /// Last bundle of a sequence.
    pub end_sequence: bool,
    /// Target of a branch inside the same block.
    pub branch_target: bool,
    /// Copy executing in the delay slot of a branch.
    pub in_delay_slot: bool,
    /// No program memory backs this PC.
    pub unmapped: bool,
}

impl BundleDesc {
    #[inline(always)]
    pub fn bundle(&self) -> Bundle {
        Bundle::new(self.word)
    }

    /// Whether control never continues to the next bundle in linear order.
    pub fn ends_flow(&self) -> bool {
        self.unmapped
            || self.bundle().format() == Format::Invalid
            || self
                .branch
                .is_some_and(|branch| branch.kind != BranchKind::Conditional)
    }

    fn describe(pc: u32, bus: &mut dyn Bus) -> Self {
        let mut desc = Self {
            pc,
            word: 0,
            cycles: 1,
            transfer: Access::default(),
            alu: Access::default(),
            mul: Access::default(),
            flags_used: FlagSet::NONE,
            flags_defined: FlagSet::NONE,
            flags_required: FlagSet::NONE,
            branch: None,
            delay: None,
            end_sequence: false,
            branch_target: false,
            in_delay_slot: false,
            unmapped: false,
        };

        let Some(word) = bus.fetch(pc) else {
            desc.unmapped = true;
            desc.end_sequence = true;
            return desc;
        };

        desc.word = word;
        let bundle = Bundle::new(word);
        if bundle.format() == Format::Invalid {
            desc.end_sequence = true;
            return desc;
        }

        let slots = bundle.slots();
        if let Some(alu) = slots.alu {
            desc.describe_alu(alu);
        }

        if let Some(mul) = slots.mul {
            desc.describe_mul(mul);
        }

        if let Some(transfer) = slots.transfer {
            desc.describe_transfer(transfer);
        }

        if let Some(control) = slots.control {
            desc.describe_control(control);
        }

        desc
    }

    fn describe_alu(&mut self, op: AluOp) {
        let info = op.opcode().info();
        let access = &mut self.alu;

        source_bits(op.first(), &mut access.reads, &mut access.writes);
        if info.second_input
            && !op.opcode().is_shift()
            && let Some(second) = op.second()
        {
            source_bits(second, &mut access.reads, &mut access.writes);
        }

        if info.has_output {
            access.writes = access.writes.with(dest_bit(op.dest()));
        }

        self.flags_defined = self.flags_defined.union(info.flags);
    }

    fn describe_mul(&mut self, op: MulOp) {
        let access = &mut self.mul;

        source_bits(op.first(), &mut access.reads, &mut access.writes);
        if let Some(second) = op.second() {
            source_bits(second, &mut access.reads, &mut access.writes);
        }

        access.writes = access.writes.with(dest_bit(op.dest()));
        self.flags_defined = self.flags_defined.union(op.flags());
    }

    fn describe_ea(access: &mut Access, md: u8, arx: u8, ary: u8) {
        let Some(mode) = EaMode::decode(md) else {
            return;
        };

        access.reads = access.reads.with(RegSet::AR + arx as u32);
        if mode.uses_ary() {
            access.reads = access.reads.with(RegSet::AR + ary as u32);
        }

        if mode.writes_arx() {
            access.writes = access.writes.with(RegSet::AR + arx as u32);
        }

        if mode.writes_ary() {
            access.writes = access.writes.with(RegSet::AR + ary as u32);
        }
    }

    fn describe_reg(access: &mut Access, code: u8, write: bool) {
        let Some(reg) = XferReg::decode(code) else {
            return;
        };

        let Some(bit) = xfer_bit(reg) else {
            return;
        };

        if write {
            access.writes = access.writes.with(bit);
            if let XferReg::Pr(mode) = reg {
                access.reads = access.reads.with(RegSet::PWP);
                if mode != PrMode::Plain {
                    access.writes = access.writes.with(RegSet::PWP);
                }
            }
        } else {
            access.reads = access.reads.with(bit);
            if let XferReg::Pr(mode) = reg {
                access.reads = access.reads.with(RegSet::PRP);
                if mode != PrMode::Plain {
                    access.writes = access.writes.with(RegSet::PRP);
                }
            }
        }
    }

    fn describe_location(access: &mut Access, location: Location, write: bool, ea: (u8, u8)) {
        let (md, ary) = ea;
        match location {
            Location::Reg(code) => Self::describe_reg(access, code, write),
            Location::Imm => (),
            Location::RamA { ar } | Location::RamB { ar } => {
                Self::describe_ea(access, md, ar, ary);
                access.reads = access.reads.with(RegSet::EB);
            }
        }
    }

    fn describe_half(access: &mut Access, half: Half) {
        Self::describe_reg(access, half.reg, !half.store);
        Self::describe_ea(access, half.md, half.ar, 0);
    }

    fn describe_double(access: &mut Access, double: DoubleTransfer) {
        Self::describe_half(access, double.a());
        Self::describe_half(access, double.b());
        access.reads = access.reads.with(RegSet::EB);
    }

    fn describe_transfer(&mut self, transfer: Transfer) {
        let access = &mut self.transfer;
        match transfer {
            Transfer::Double1(double) | Transfer::Double2 { halves: double, .. } => {
                Self::describe_double(access, double);
            }
            Transfer::Single1(t) => {
                if t.trm() {
                    let reg = t.dr().value() & 0x3F;
                    Self::describe_reg(access, reg, t.from_bus());
                    access.reads = access.reads.with(RegSet::EB).with(RegSet::EO);
                    access.writes = access.writes.with(RegSet::EO);
                } else {
                    let ea = (t.md().value(), t.ary().value());
                    Self::describe_location(access, Location::decode(t.sr()), false, ea);
                    Self::describe_location(access, Location::decode(t.dr()), true, ea);
                }
            }
            Transfer::Single2(t) => {
                if t.trm() {
                    let reg = t.dr().value() & 0x3F;
                    Self::describe_reg(access, reg, t.from_bus());
                    access.reads = access.reads.with(RegSet::EB).with(RegSet::EO);
                    access.writes = access.writes.with(RegSet::EO);
                } else {
                    let ea = (t.md().value(), t.ary().value());
                    Self::describe_location(access, Location::decode(t.sr()), false, ea);
                    Self::describe_location(access, Location::decode(t.dr()), true, ea);
                }
            }
            Transfer::Immediate(t) => {
                let ea = (t.md().value(), t.ary().value());
                Self::describe_location(access, t.dest(), true, ea);
            }
        }
    }

    fn describe_control(&mut self, op: ControlOp) {
        let Some(opcode) = op.opcode() else {
            return;
        };

        let target = match op.target() {
            BranchTarget::Relative(disp) => Target::Static(self.pc.wrapping_add_signed(disp)),
            _ => Target::Dynamic,
        };

        let kind = match opcode {
            ControlOpcode::Db | ControlOpcode::Dbn => {
                if let Some(flag) = Flag::from_condition(op.condition()) {
                    self.flags_used.insert(flag);
                }

                BranchKind::Conditional
            }
            ControlOpcode::Djmp => BranchKind::Jump,
            ControlOpcode::Dcall => BranchKind::Call,
            ControlOpcode::Dret => BranchKind::Return,
            _ => return,
        };

        let target = if kind == BranchKind::Return {
            Target::Dynamic
        } else {
            target
        };

        self.branch = Some(Branch { kind, target });
        self.end_sequence = true;
    }

    /// Registers read by any slot.
    pub fn reads(&self) -> RegSet {
        self.transfer
            .reads
            .union(self.alu.reads)
            .union(self.mul.reads)
    }
}

/// A described block, in linear order.
#[derive(Debug, Clone)]
pub struct Block {
    pub start: u32,
    pub bundles: Vec<BundleDesc>,
}

impl Block {
    /// Index of the bundle at `pc`, if it is part of this block.
    pub fn position(&self, pc: u32) -> Option<usize> {
        self.bundles.iter().position(|desc| desc.pc == pc)
    }

    /// Sum of the cycles of every bundle in linear order.
    pub fn cycles(&self) -> u32 {
        self.bundles.iter().map(|desc| desc.cycles).sum()
    }
}

/// Describes the block starting at `start`, with at most `max_bundles` bundles.
pub fn analyze(start: u32, max_bundles: usize, bus: &mut dyn Bus) -> Block {
    let mut bundles: Vec<BundleDesc> = Vec::new();
    let mut pc = start;

    while bundles.len() < max_bundles.max(1) {
        let mut desc = BundleDesc::describe(pc, bus);

        if desc.branch.is_some() {
            let mut delay = BundleDesc::describe(pc.wrapping_add(1), bus);
            delay.in_delay_slot = true;
            delay.flags_required = delay.flags_defined;
            desc.delay = Some(Box::new(delay));
        }

        let ends_flow = desc.ends_flow();
        bundles.push(desc);

        if ends_flow {
            break;
        }

        pc = pc.wrapping_add(1);
    }

    if let Some(last) = bundles.last_mut() {
        last.end_sequence = true;
    }

    // static targets inside the block start their own sequence
    let targets: Vec<u32> = bundles
        .iter()
        .filter_map(|desc| match desc.branch?.target {
            Target::Static(target) => Some(target),
            Target::Dynamic => None,
        })
        .collect();

    for target in targets {
        if let Some(index) = bundles.iter().position(|desc| desc.pc == target) {
            bundles[index].branch_target = true;
            if index > 0 {
                bundles[index - 1].end_sequence = true;
            }
        }
    }

    // flag liveness, backwards
    let mut live = FlagSet::ALL;
    for desc in bundles.iter_mut().rev() {
        if desc.branch.is_some() || desc.ends_flow() {
            live = FlagSet::ALL;
        }

        desc.flags_required = desc.flags_defined.intersection(live);
        live = live.difference(desc.flags_defined).union(desc.flags_used);
    }

    Block { start, bundles }
}

#[cfg(test)]
mod test {
    use super::*;
    use tgpx4::bundle::{AluOpcode, asm};

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

    fn add(i1: u8, i2: u8, io: u8) -> u64 {
        asm::single_alu(
            Format::UnitControl,
            asm::alu(AluOpcode::Add, i1, i2, io),
            asm::control(ControlOpcode::Nop, 0, 0) as u64,
        )
    }

    #[test]
    fn linear_block_ends_at_unmapped() {
        let mut program = Program(vec![asm::nop(), asm::nop(), asm::nop()]);
        let block = analyze(0, 64, &mut program);

        assert_eq!(block.bundles.len(), 4);
        assert!(block.bundles[3].unmapped);
        assert!(block.bundles[3].end_sequence);
        assert!(!block.bundles[0].end_sequence);
        assert_eq!(block.cycles(), 4);
    }

    #[test]
    fn window_is_bounded() {
        let mut program = Program(vec![asm::nop(); 100]);
        let block = analyze(0, 64, &mut program);

        assert_eq!(block.bundles.len(), 64);
        assert!(block.bundles[63].end_sequence);
    }

    #[test]
    fn jump_ends_block() {
        let mut program = Program(vec![
            asm::nop(),
            asm::control_only(ControlOpcode::Djmp, 0, asm::relative(-1)),
            asm::nop(),
            asm::nop(),
        ]);

        let block = analyze(0, 64, &mut program);
        assert_eq!(block.bundles.len(), 2);

        let jump = &block.bundles[1];
        assert_eq!(
            jump.branch,
            Some(Branch {
                kind: BranchKind::Jump,
                target: Target::Static(0),
            })
        );

        let delay = jump.delay.as_ref().unwrap();
        assert_eq!(delay.pc, 2);
        assert!(delay.in_delay_slot);

        assert!(block.bundles[0].branch_target);
    }

    #[test]
    fn conditional_branch_continues() {
        let mut program = Program(vec![
            asm::control_only(ControlOpcode::Db, 9, asm::relative(3)),
            asm::nop(),
            asm::nop(),
            asm::nop(),
        ]);

        let block = analyze(0, 64, &mut program);
        assert_eq!(block.bundles.len(), 5);
        assert!(block.bundles[0].end_sequence);
        assert!(block.bundles[0].flags_used.contains(Flag::Az));
        assert!(block.bundles[3].branch_target);
        assert!(block.bundles[2].end_sequence);
    }

    #[test]
    fn flags_are_lazy() {
        let mut program = Program(vec![
            add(0, 8, 0x10),
            add(1, 9, 0x11),
            asm::control_only(ControlOpcode::Dbn, 9, asm::relative(-2)),
            asm::nop(),
        ]);

        let block = analyze(0, 3, &mut program);

        // overwritten by the second add before anyone reads it
        assert!(block.bundles[0].flags_required.is_empty());
        // read by the branch
        assert!(block.bundles[1].flags_required.contains(Flag::Az));
        // a branch bundle and its delay slot compute everything they define
        let delay = block.bundles[2].delay.as_ref().unwrap();
        assert_eq!(delay.flags_required, delay.flags_defined);
    }

    #[test]
    fn slot_accesses() {
        let word = asm::dual(
            Format::AluMulTransfer1,
            asm::alu(AluOpcode::Add, 0, 0x11, 0x00),
            asm::mul(false, 0, 1, 0x10),
            asm::transfer1(0x41, 0x05, 0x1, 0, 0),
        );

        let mut program = Program(vec![word]);
        let block = analyze(0, 1, &mut program);
        let desc = &block.bundles[0];

        assert!(desc.alu.reads.contains(RegSet::AA));
        assert!(desc.alu.reads.contains(RegSet::PR));
        assert!(desc.alu.writes.contains(RegSet::PRP));
        assert!(desc.alu.writes.contains(RegSet::MA));

        assert!(desc.mul.reads.contains(RegSet::MA));
        assert!(desc.mul.writes.contains(RegSet::AA));

        assert!(desc.transfer.reads.contains(RegSet::AR + 1));
        assert!(desc.transfer.writes.contains(RegSet::AR + 1));
        assert!(desc.transfer.writes.contains(RegSet::AA + 5));
    }
}
