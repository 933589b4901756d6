use libtest_mimic::{Arguments, Failed, Trial};
use std::fmt::Debug;
use tgpcore::{
    BackendKind, Fault, Memory, Processor, Settings,
    tgpx4::{
        Reg, Registers,
        bundle::{AluOpcode, ControlOpcode, Format, Half, asm},
    },
};

// transfer codes
const AA0: u8 = 0x00;
const AA1: u8 = 0x01;
const PR_PWP_INC: u8 = 0x31;
const RAM_A_AR0: u8 = 0x40;
const RAM_B_AR1: u8 = 0x61;
const FIFO_IN: u8 = 0x38;
const FIFO_OUT0: u8 = 0x39;

// condition codes
const AZ: u8 = 9;

type Outcome = Result<(), Failed>;

fn expect_eq<T: PartialEq + Debug>(what: &str, value: T, expected: T) -> Outcome {
    if value != expected {
        return Err(Failed::from(format!(
            "{what}: got {value:X?}, expected {expected:X?}"
        )));
    }

    Ok(())
}

/// Architectural state only, without translator scratch.
fn architectural(regs: &Registers) -> Registers {
    Registers {
        icount: 0,
        jmpdest: 0,
        exp: 0,
        arg: [0; 4],
        trap: 0,
        ..regs.clone()
    }
}

fn processor(backend: BackendKind, settings: Settings) -> Result<Processor, Failed> {
    Ok(Processor::new(Settings {
        backend,
        ..settings
    })?)
}

fn alu(opcode: AluOpcode, i1: u8, i2: u8, io: u8) -> u64 {
    asm::single_alu(
        Format::UnitControl,
        asm::alu(opcode, i1, i2, io),
        asm::control(ControlOpcode::Nop, 0, 0) as u64,
    )
}

fn transfer(sr: u8, dr: u8, md: u8) -> u64 {
    asm::single_alu(
        Format::UnitTransfer2,
        asm::alu(AluOpcode::Nop, 0, 0, 0),
        asm::transfer2(sr, dr, md, 0, 0),
    )
}

fn branch(opcode: ControlOpcode, cc: u8, displacement: i32) -> u64 {
    asm::control_only(opcode, cc, asm::relative(displacement))
}

fn nop_loop(backend: BackendKind) -> Outcome {
    let mut program = vec![asm::nop(); 6];
    program.push(branch(ControlOpcode::Djmp, 0, -6));
    program.push(asm::nop());

    let mut memory = Memory::new(program);
    let mut cpu = processor(backend, Settings::default())?;
    let executed = cpu.run(&mut memory, 20)?;

    expect_eq("cycles", executed.cycles, 24)?;
    expect_eq("pc", cpu.pc(), 0)?;
    expect_eq("blocks", cpu.cached_blocks(), 1)
}

fn counted_loop(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![
        alu(AluOpcode::Add, 0, 8, 0x10),
        alu(AluOpcode::Sub, 1, 8, 0x11),
        branch(ControlOpcode::Dbn, AZ, -2),
        asm::nop(),
        branch(ControlOpcode::Djmp, 0, 0),
        asm::nop(),
    ]);

    let mut cpu = processor(backend, Settings::default())?;
    cpu.set(Reg::Ab(0), 1);
    cpu.set(Reg::Aa(1), 10);
    cpu.run(&mut memory, 1000)?;

    expect_eq("sum", cpu.get(Reg::Aa(0)), 10)?;
    expect_eq("counter", cpu.get(Reg::Aa(1)), 0)?;
    expect_eq("pc", cpu.pc(), 4)
}

fn parallel_reads_see_old_values(backend: BackendKind) -> Outcome {
    // ALU: MA0 <- AA0 + AB0, MUL: AA0 <- MA0 * 1
    let word = asm::dual(
        Format::AluMulControl,
        asm::alu(AluOpcode::Add, 0, 8, 0x00),
        asm::mul(false, 0, 0x15, 0x10),
        asm::control(ControlOpcode::Nop, 0, 0),
    );

    let mut memory = Memory::new(vec![word, asm::nop()]);
    let mut cpu = processor(
        backend,
        Settings {
            max_sequence: 1,
            ..Default::default()
        },
    )?;

    cpu.set(Reg::Aa(0), 5);
    cpu.set(Reg::Ab(0), 7);
    cpu.set(Reg::Ma(0), 100);
    cpu.run(&mut memory, 0)?;

    expect_eq("MA0", cpu.get(Reg::Ma(0)), 12)?;
    expect_eq("AA0", cpu.get(Reg::Aa(0)), 100)?;
    expect_eq("pc", cpu.pc(), 1)
}

fn address_register_post_increment(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![
        // AA0 <- @AR0++
        transfer(RAM_A_AR0, AA0, 1),
        // @AR1 (RAM-B) <- AA0
        transfer(AA0, RAM_B_AR1, 0),
        asm::nop(),
    ]);
    memory.ram_a[3] = 0xABCD;

    let mut cpu = processor(
        backend,
        Settings {
            max_sequence: 2,
            ..Default::default()
        },
    )?;

    cpu.set(Reg::Ar(0), 3);
    cpu.set(Reg::Ar(1), 0x20);
    cpu.run(&mut memory, 0)?;

    expect_eq("AA0", cpu.get(Reg::Aa(0)), 0xABCD)?;
    expect_eq("AR0", cpu.get(Reg::Ar(0)), 4)?;
    expect_eq("RAM-B", memory.ram_b[0x20], 0xABCD)
}

fn post_increment_uses_old_address(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![transfer(RAM_A_AR0, AA0, 1), asm::nop()]);
    memory.ram_a[0x100] = 0x5555;
    memory.ram_a[0x101] = 0x6666;

    let mut cpu = processor(
        backend,
        Settings {
            max_sequence: 1,
            ..Default::default()
        },
    )?;

    cpu.set(Reg::Ar(0), 0x100);
    cpu.run(&mut memory, 0)?;

    expect_eq("AA0", cpu.get(Reg::Aa(0)), 0x5555)?;
    expect_eq("AR0", cpu.get(Reg::Ar(0)), 0x101)
}

fn double_transfer_shared_address_register(backend: BackendKind) -> Outcome {
    // AA0 <- A[AR0++], AA1 <- B[AR0]
    let halves = asm::double(
        Half {
            store: false,
            reg: AA0,
            ar: 0,
            md: 1,
        },
        Half {
            store: false,
            reg: AA1,
            ar: 0,
            md: 0,
        },
    );

    let word = asm::single_alu(
        Format::UnitDouble2,
        asm::alu(AluOpcode::Nop, 0, 0, 0),
        halves as u64,
    );

    let mut memory = Memory::new(vec![word, asm::nop()]);
    memory.ram_a[4] = 0xA4;
    memory.ram_b[4] = 0xB4;
    memory.ram_b[5] = 0xB5;

    let mut cpu = processor(
        backend,
        Settings {
            max_sequence: 1,
            ..Default::default()
        },
    )?;

    cpu.set(Reg::Ar(0), 4);
    cpu.run(&mut memory, 0)?;

    expect_eq("AA0", cpu.get(Reg::Aa(0)), 0xA4)?;
    expect_eq("AA1", cpu.get(Reg::Aa(1)), 0xB4)?;
    expect_eq("AR0", cpu.get(Reg::Ar(0)), 5)
}

fn parameter_ring_pointers(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![
        // AA0 <- AA0 + PR(prp++)
        alu(AluOpcode::Add, 0, 0x11, 0x10),
        // AA1 <- AA1 + PR(prp--)
        alu(AluOpcode::Add, 1, 0x12, 0x11),
        // AA2 <- AA2 + PR(prp = 0)
        alu(AluOpcode::Add, 2, 0x13, 0x12),
        // PR(pwp++) <- AA0
        transfer(AA0, PR_PWP_INC, 0),
        asm::nop(),
    ]);

    let mut cpu = processor(
        backend,
        Settings {
            max_sequence: 4,
            ..Default::default()
        },
    )?;

    cpu.set(Reg::Pr(0), 7);
    cpu.set(Reg::Pr(23), 5);
    cpu.set(Reg::Prp, 23);
    cpu.set(Reg::Pwp, 23);
    cpu.set(Reg::Aa(0), 10);
    cpu.set(Reg::Aa(1), 1);
    cpu.run(&mut memory, 0)?;

    // prp: 23 -> 0 -> 23 -> 0
    expect_eq("AA0", cpu.get(Reg::Aa(0)), 15)?;
    expect_eq("AA1", cpu.get(Reg::Aa(1)), 8)?;
    expect_eq("AA2", cpu.get(Reg::Aa(2)), 5)?;
    expect_eq("PRP", cpu.get(Reg::Prp), 0)?;

    expect_eq("PR23", cpu.get(Reg::Pr(23)), 15)?;
    expect_eq("PWP", cpu.get(Reg::Pwp), 0)
}

fn external_bus_window(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![transfer(AA0, RAM_A_AR0, 0), asm::nop()]);
    let mut cpu = processor(
        backend,
        Settings {
            max_sequence: 1,
            ..Default::default()
        },
    )?;

    cpu.set(Reg::Aa(0), 0x1234_5678);
    cpu.set(Reg::Ar(0), 0x410);
    cpu.set(Reg::Eb, 0x0012_0000);
    cpu.run(&mut memory, 0)?;

    expect_eq(
        "external",
        memory.external.get(&0x0012_0410).copied(),
        Some(0x1234_5678),
    )?;
    expect_eq("RAM-A", memory.ram_a[0x10], 0)
}

fn call_and_return(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![
        branch(ControlOpcode::Dcall, 0, 6),
        asm::nop(),
        alu(AluOpcode::Add, 0, 8, 0x10),
        branch(ControlOpcode::Djmp, 0, 0),
        asm::nop(),
        asm::nop(),
        // subroutine
        alu(AluOpcode::Add, 1, 8, 0x11),
        asm::control_only(ControlOpcode::Dret, 0, 0),
        asm::nop(),
    ]);

    let mut cpu = processor(backend, Settings::default())?;
    cpu.set(Reg::Ab(0), 1);
    cpu.run(&mut memory, 100)?;

    let regs = cpu.registers();
    expect_eq("AA0", regs.aa[0], 1)?;
    expect_eq("AA1", regs.aa[1], 1)?;
    expect_eq("PCS pointer", regs.pcs_ptr, 0)?;
    expect_eq("return address", regs.pcs[0], 2)?;
    expect_eq("pc", regs.pc, 3)
}

fn call_stack_overflow(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![branch(ControlOpcode::Dcall, 0, 0), asm::nop()]);
    let mut cpu = processor(backend, Settings::default())?;

    match cpu.run(&mut memory, 100) {
        Err(Fault::PcsOverflow(0)) => (),
        other => return Err(Failed::from(format!("unexpected outcome {other:?}"))),
    }

    expect_eq("PCS pointer", cpu.registers().pcs_ptr, 4)?;
    expect_eq("pc", cpu.pc(), 0)
}

fn return_underflow(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![
        asm::nop(),
        asm::control_only(ControlOpcode::Dret, 0, 0),
        asm::nop(),
    ]);

    let mut cpu = processor(backend, Settings::default())?;
    match cpu.run(&mut memory, 100) {
        Err(Fault::PcsUnderflow(1)) => Ok(()),
        other => Err(Failed::from(format!("unexpected outcome {other:?}"))),
    }
}

fn fifo_passthrough(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![
        transfer(FIFO_IN, AA0, 0),
        transfer(AA0, FIFO_OUT0, 0),
        branch(ControlOpcode::Djmp, 0, -2),
        asm::nop(),
    ]);

    let mut cpu = processor(backend, Settings::default())?;
    for value in [1, 2, 3] {
        cpu.push_fifo_in(value)?;
    }

    match cpu.run(&mut memory, 1000) {
        Err(Fault::FifoEmpty(0)) => (),
        other => return Err(Failed::from(format!("unexpected outcome {other:?}"))),
    }

    let mut out = Vec::new();
    while let Some(value) = cpu.pop_fifo_out0() {
        out.push(value);
    }

    expect_eq("FIFO-out0", out, vec![1, 2, 3])?;
    expect_eq("FIFO-out1", cpu.fifos().out1.len(), 0)
}

fn flushing_preserves_results(backend: BackendKind) -> Outcome {
    const LEN: i32 = 1500;

    let mut program = vec![alu(AluOpcode::Add, 0, 8, 0x10); LEN as usize];
    program.push(branch(ControlOpcode::Djmp, 0, -LEN));
    program.push(asm::nop());

    let run = |cache_capacity| -> Result<(Registers, usize), Failed> {
        let mut memory = Memory::new(program.clone());
        let mut cpu = processor(
            backend,
            Settings {
                cache_capacity,
                max_sequence: 1,
                ..Default::default()
            },
        )?;

        cpu.set(Reg::Ab(0), 1);
        cpu.run(&mut memory, 5000)?;

        Ok((architectural(cpu.registers()), cpu.cached_blocks()))
    };

    let (expected, all) = run(Settings::default().cache_capacity)?;
    let (regs, cached) = run(64 * 1024)?;

    if cached >= all {
        return Err(Failed::from(format!(
            "cache was never flushed ({cached} of {all} blocks)"
        )));
    }

    expect_eq("registers", regs, expected)
}

fn patched_code_is_retranslated(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![
        alu(AluOpcode::Add, 0, 8, 0x10),
        branch(ControlOpcode::Djmp, 0, -1),
        asm::nop(),
    ]);

    let mut cpu = processor(backend, Settings::default())?;
    cpu.set(Reg::Ab(0), 1);
    cpu.run(&mut memory, 8)?;
    expect_eq("AA0", cpu.get(Reg::Aa(0)), 3)?;

    memory.write_program(0, alu(AluOpcode::Sub, 0, 8, 0x10));
    cpu.run(&mut memory, 8)?;
    expect_eq("AA0", cpu.get(Reg::Aa(0)), 0)
}

fn reset_state(backend: BackendKind) -> Outcome {
    let mut memory = Memory::new(vec![
        alu(AluOpcode::Add, 0, 8, 0x10),
        branch(ControlOpcode::Djmp, 0, -1),
        asm::nop(),
    ]);

    let mut cpu = processor(backend, Settings::default())?;
    cpu.set(Reg::Ab(0), 1);
    cpu.push_fifo_in(7)?;
    cpu.run(&mut memory, 0)?;
    expect_eq("AA0", cpu.get(Reg::Aa(0)), 1)?;

    cpu.reset();
    expect_eq("registers", cpu.registers().clone(), {
        let mut regs = Registers::default();
        regs.trap = cpu.registers().trap;
        regs
    })?;
    expect_eq("FIFO-in", cpu.fifos().input.len(), 0)?;

    cpu.run(&mut memory, 0)?;
    expect_eq("AA0", cpu.get(Reg::Aa(0)), 0)?;
    expect_eq("pc", cpu.pc(), 0)?;
    expect_eq("blocks", cpu.cached_blocks(), 1)
}

const SCENARIOS: &[(&str, fn(BackendKind) -> Outcome)] = &[
    ("nop_loop", nop_loop),
    ("counted_loop", counted_loop),
    ("parallel_reads_see_old_values", parallel_reads_see_old_values),
    ("address_register_post_increment", address_register_post_increment),
    ("post_increment_uses_old_address", post_increment_uses_old_address),
    (
        "double_transfer_shared_address_register",
        double_transfer_shared_address_register,
    ),
    ("parameter_ring_pointers", parameter_ring_pointers),
    ("external_bus_window", external_bus_window),
    ("call_and_return", call_and_return),
    ("call_stack_overflow", call_stack_overflow),
    ("return_underflow", return_underflow),
    ("fifo_passthrough", fifo_passthrough),
    ("flushing_preserves_results", flushing_preserves_results),
    ("patched_code_is_retranslated", patched_code_is_retranslated),
    ("reset_state", reset_state),
];

fn main() {
    let args = Arguments::from_args();

    let mut tests = vec![];
    for backend in [BackendKind::Interpreter, BackendKind::Cranelift] {
        for &(name, scenario) in SCENARIOS {
            tests.push(Trial::test(format!("{backend}::{name}"), move || {
                let result = std::panic::catch_unwind(move || scenario(backend));
                match result {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "panicked".to_owned());

                        Err(Failed::from(msg))
                    }
                }
            }));
        }
    }

    libtest_mimic::run(&args, tests).exit();
}
