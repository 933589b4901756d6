//! A Fujitsu MB86235 (TGPx4) processor running translated code.
mod fault;
mod memory;

pub use fault::Fault;
pub use memory::Memory;
pub use tgpjit::{self, BackendKind, Settings};
pub use tgpx4;

use easyerr::ResultExt;
use fault::{FaultCtx, Pending};
use tgpjit::{ExitCode, Host, HostFn, InstallError, Translator};
use tgpx4::{Bus, FifoError, FifoId, Fifos, Reg, Registers, Trap};

/// Information regarding a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Executed {
    /// How many cycles were executed. May exceed the budget by the length of the last sequence.
    pub cycles: u64,
}

/// Host side of generated code for the duration of a run.
struct Context<'a> {
    bus: &'a mut dyn Bus,
    fifos: &'a mut Fifos,
    pending: Option<Pending>,
}

impl Context<'_> {
    fn fail(&mut self, regs: &mut Registers, pending: Pending) {
        regs.raise_trap(Trap::Fault);
        self.pending.get_or_insert(pending);
    }
}

impl Host for Context<'_> {
    fn call(&mut self, regs: &mut Registers, func: HostFn, [a, b, c]: [u32; 3]) -> u32 {
        let value = match func {
            HostFn::ReadA => self.bus.read_a(a),
            HostFn::WriteA => {
                self.bus.write_a(a, b);
                0
            }
            HostFn::ReadB => self.bus.read_b(a),
            HostFn::WriteB => {
                self.bus.write_b(a, b);
                0
            }
            HostFn::ReadExternal => self.bus.read_external(a),
            HostFn::WriteExternal => {
                self.bus.write_external(a, b);
                0
            }
            HostFn::FifoPop => match self.fifos.input.pop() {
                Some(value) => value as u32,
                None => {
                    self.fail(regs, Pending::FifoEmpty);
                    0
                }
            },
            HostFn::FifoPush => {
                let id = if a == 0 { FifoId::Out0 } else { FifoId::Out1 };
                if self.fifos.get_mut(id).push(b as u64).is_err() {
                    self.fail(regs, Pending::FifoFull(id));
                }

                0
            }
            HostFn::FifoClear => {
                if a & 0b01 != 0 {
                    self.fifos.input.clear();
                }

                if a & 0b10 != 0 {
                    self.fifos.out0.clear();
                    self.fifos.out1.clear();
                }

                0
            }
            HostFn::Fault => {
                let bundle = ((c as u64) << 32) | b as u64;
                self.fail(regs, Pending::Reported { code: a, bundle });
                0
            }
        };

        if self.bus.take_code_invalidation() {
            regs.raise_trap(Trap::ResetCache);
        }

        value
    }
}

/// A TGPx4 processor: register file, FIFOs and the translation cache.
pub struct Processor {
    regs: Registers,
    fifos: Fifos,
    translator: Translator,
}

impl Processor {
    pub fn new(settings: Settings) -> Result<Self, InstallError> {
        Ok(Self {
            regs: Registers::default(),
            fifos: Fifos::default(),
            translator: Translator::new(settings)?,
        })
    }

    #[inline(always)]
    pub fn settings(&self) -> &Settings {
        self.translator.settings()
    }

    /// Resets the register file and the FIFOs. Translated code is discarded at the next run.
    pub fn reset(&mut self) {
        self.regs = Registers::default();
        self.fifos = Fifos::default();
        self.request_cache_reset();
    }

    /// Runs until the cycle budget is exhausted, i.e. until the remaining budget drops below
    /// zero at the end of a sequence. At least one sequence always runs.
    pub fn run(&mut self, bus: &mut dyn Bus, cycles: u32) -> Result<Executed, Fault> {
        let budget = cycles.min(i32::MAX as u32) as i32;
        self.regs.icount = budget;
        self.regs.clear_trap(Trap::Fault);

        if bus.take_code_invalidation() {
            self.request_cache_reset();
        }

        loop {
            let mut ctx = Context {
                bus: &mut *bus,
                fifos: &mut self.fifos,
                pending: None,
            };

            let exit = self.translator.execute(&mut self.regs, &mut ctx);
            let pending = ctx.pending;
            let pc = self.regs.pc;

            match exit {
                ExitCode::OutOfCycles => break,
                ExitCode::MissingCode => self.translate(bus)?,
                ExitCode::ResetCache => {
                    tracing::warn!(pc, "translation cache reset requested");
                    self.regs.clear_trap(Trap::ResetCache);
                    self.flush()?;
                }
                ExitCode::UnmappedCode => return Err(Self::abort(Fault::UnmappedCode(pc))),
                ExitCode::Fault | ExitCode::Dispatch => {
                    let fault = pending.map_or(Fault::Internal(pc), |p| p.into_fault(pc));
                    return Err(Self::abort(fault));
                }
            }
        }

        let consumed = budget as i64 - self.regs.icount as i64;
        Ok(Executed {
            cycles: consumed.max(0) as u64,
        })
    }

    fn abort(fault: Fault) -> Fault {
        tracing::error!(pc = ?fault.pc(), "run terminated: {fault}");
        fault
    }

    /// Translates the block at the current PC, flushing the cache once if it is full.
    fn translate(&mut self, bus: &mut dyn Bus) -> Result<(), Fault> {
        let pc = self.regs.pc;
        match self.translator.translate(pc, bus) {
            Err(err) if err.is_cache_full() => {
                tracing::debug!(pc, "translation cache is full");
                self.flush()?;
                self.translator
                    .translate(pc, bus)
                    .context(FaultCtx::Translate)
            }
            result => result.context(FaultCtx::Translate),
        }
    }

    /// Discards every translated block.
    pub fn flush(&mut self) -> Result<(), Fault> {
        self.translator.flush().context(FaultCtx::Flush)
    }

    /// Requests translated code to be discarded at the next dispatch.
    pub fn request_cache_reset(&mut self) {
        self.regs.raise_trap(Trap::ResetCache);
    }

    /// Number of translated blocks.
    #[inline(always)]
    pub fn cached_blocks(&self) -> usize {
        self.translator.cached_blocks()
    }

    #[inline(always)]
    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    #[inline(always)]
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    #[inline(always)]
    pub fn get(&self, reg: Reg) -> u32 {
        self.regs.get(reg)
    }

    #[inline(always)]
    pub fn set(&mut self, reg: Reg, value: u32) {
        self.regs.set(reg, value);
    }

    #[inline(always)]
    pub fn pc(&self) -> u32 {
        self.regs.pc
    }

    #[inline(always)]
    pub fn set_pc(&mut self, pc: u32) {
        self.regs.pc = pc;
    }

    #[inline(always)]
    pub fn fifos(&self) -> &Fifos {
        &self.fifos
    }

    pub fn push_fifo_in(&mut self, value: u64) -> Result<(), FifoError> {
        self.fifos.input.push(value)
    }

    pub fn pop_fifo_out0(&mut self) -> Option<u64> {
        self.fifos.out0.pop()
    }

    pub fn pop_fifo_out1(&mut self) -> Option<u64> {
        self.fifos.out1.pop()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tgpx4::{
        Flag,
        bundle::{AluOpcode, ControlOpcode, Format, asm},
    };

    fn processor(max_sequence: usize) -> Processor {
        Processor::new(Settings {
            backend: BackendKind::Interpreter,
            max_sequence,
            ..Default::default()
        })
        .unwrap()
    }

    fn alu(opcode: AluOpcode, i1: u8, i2: u8, io: u8) -> u64 {
        asm::single_alu(
            Format::UnitControl,
            asm::alu(opcode, i1, i2, io),
            asm::control(ControlOpcode::Nop, 0, 0) as u64,
        )
    }

    #[test]
    fn nop_advances_pc() {
        let mut memory = Memory::new(vec![asm::nop(); 4]);
        let mut cpu = processor(1);
        let before = cpu.registers().clone();

        let executed = cpu.run(&mut memory, 0).unwrap();
        assert_eq!(executed.cycles, 1);
        assert_eq!(cpu.pc(), 1);

        let after = Registers {
            pc: before.pc,
            icount: before.icount,
            exp: before.exp,
            jmpdest: before.jmpdest,
            arg: before.arg,
            ..cpu.registers().clone()
        };
        assert_eq!(after, before);
    }

    #[test]
    fn unmapped_code_faults() {
        let mut memory = Memory::new(vec![asm::nop()]);
        let mut cpu = processor(64);

        let fault = cpu.run(&mut memory, 100).unwrap_err();
        assert!(matches!(fault, Fault::UnmappedCode(1)));
        assert_eq!(cpu.pc(), 1);
    }

    #[test]
    fn unimplemented_op_faults() {
        let mut memory = Memory::new(vec![
            alu(AluOpcode::Add, 0, 8, 0x10),
            alu(AluOpcode::Frcp, 0, 0, 0x10),
        ]);

        let mut cpu = processor(64);
        cpu.set(Reg::Aa(0), 1);
        cpu.set(Reg::Ab(0), 2);

        let fault = cpu.run(&mut memory, 100).unwrap_err();
        assert!(matches!(
            fault,
            Fault::UnimplementedAlu(1, 0x0A, bundle) if bundle == memory.program()[1]
        ));

        // the bundle before the faulting one is committed
        assert_eq!(cpu.get(Reg::Aa(0)), 3);
        assert_eq!(cpu.pc(), 1);
    }

    #[test]
    fn empty_fifo_faults() {
        // AA0 <- FIFO-in
        let word = asm::single_alu(
            Format::UnitTransfer2,
            asm::alu(AluOpcode::Nop, 0, 0, 0),
            asm::transfer2(0x38, 0x00, 0, 0, 0),
        );

        let mut memory = Memory::new(vec![word, word, asm::nop()]);
        let mut cpu = processor(64);
        cpu.push_fifo_in(0xDEAD_BEEF_0000_0042).unwrap();

        let fault = cpu.run(&mut memory, 100).unwrap_err();
        assert!(matches!(fault, Fault::FifoEmpty(1)));
        assert_eq!(cpu.get(Reg::Aa(0)), 0x42);
        assert!(cpu.fifos().input.is_empty());
    }

    #[test]
    fn reset_request_flushes() {
        let mut memory = Memory::new(vec![
            alu(AluOpcode::Add, 0, 8, 0x10),
            asm::control_only(ControlOpcode::Djmp, 0, asm::relative(-1)),
            asm::nop(),
        ]);

        let mut cpu = processor(64);
        cpu.set(Reg::Ab(0), 1);
        cpu.run(&mut memory, 10).unwrap();
        assert_eq!(cpu.cached_blocks(), 1);

        // patch the add into a sub
        memory.write_program(0, alu(AluOpcode::Sub, 0, 8, 0x10));
        let before = cpu.get(Reg::Aa(0));
        cpu.run(&mut memory, 10).unwrap();
        assert!(cpu.get(Reg::Aa(0)) < before);
        assert!(!cpu.registers().trap_pending(Trap::ResetCache));
    }

    #[test]
    fn flags_are_visible() {
        let mut memory = Memory::new(vec![alu(AluOpcode::Sub, 0, 8, 0x10), asm::nop()]);
        let mut cpu = processor(1);
        cpu.set(Reg::Aa(0), 1);
        cpu.set(Reg::Ab(0), 2);

        cpu.run(&mut memory, 0).unwrap();
        assert_eq!(cpu.get(Reg::Aa(0)), u32::MAX);
        assert!(cpu.registers().flag(Flag::An));
        assert!(!cpu.registers().flag(Flag::Az));
        assert!(cpu.registers().status().an());
    }
}
