mod decode;

use bytesize::ByteSize;
use clap::{Args, Parser, Subcommand};
use eyre_pretty::{Context, ContextCompat, Result, bail};
use std::path::{Path, PathBuf};
use tgpcore::{
    BackendKind, Memory, Processor, Settings,
    tgpx4::Reg,
};

/// Parses a number in decimal, hexadecimal (`0x`) or binary (`0b`). Underscores are ignored.
fn parse_number(text: &str) -> Result<u64> {
    let text = text.replace('_', "");
    let (digits, radix) = if let Some(digits) = text.strip_prefix("0x") {
        (digits, 16)
    } else if let Some(digits) = text.strip_prefix("0b") {
        (digits, 2)
    } else {
        (&*text, 10)
    };

    u64::from_str_radix(digits, radix).with_context(|| format!("parsing number {text:?}"))
}

fn parse_u32(text: &str) -> Result<u32> {
    let value = parse_number(text)?;
    u32::try_from(value).with_context(|| format!("{text:?} does not fit in 32 bits"))
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the program image (little-endian 64-bit bundles)
    #[arg(short, long)]
    program: PathBuf,
    /// Address of the first bundle to run
    #[arg(short, long, default_value = "0")]
    entry: String,
    /// Cycle budget
    #[arg(short, long, default_value_t = 1_000_000)]
    cycles: u32,
    /// Back end to run translated code with
    #[arg(short, long, default_value_t = BackendKind::default())]
    backend: BackendKind,
    /// Size of the translation cache
    #[arg(long, default_value = "16MiB")]
    cache: ByteSize,
    /// Maximum number of bundles per block
    #[arg(long, default_value_t = 64)]
    max_sequence: usize,
    /// Path to an image to load into RAM-A (little-endian 32-bit words)
    #[arg(long)]
    ram_a: Option<PathBuf>,
    /// Path to an image to load into RAM-B (little-endian 32-bit words)
    #[arg(long)]
    ram_b: Option<PathBuf>,
    /// Words to push into the input FIFO, comma separated
    #[arg(long, value_delimiter = ',')]
    fifo_in: Vec<String>,
    /// Initial register values, as REG=VALUE
    #[arg(long = "set")]
    assignments: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a program and print the resulting state.
    Run(RunArgs),
    /// Decode a single bundle.
    Decode { bundle: String },
}

/// A CLI to run and inspect programs of the Fujitsu MB86235 (TGPx4) DSP.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Action to take
    #[command(subcommand)]
    command: Command,
}

fn read_program(path: &Path) -> Result<Vec<u64>> {
    let bytes = std::fs::read(path).context("reading program image")?;
    if bytes.len() % 8 != 0 {
        bail!("program image length is not a multiple of 8 bytes");
    }

    let (chunks, _) = bytes.as_chunks::<8>();
    Ok(chunks.iter().map(|chunk| u64::from_le_bytes(*chunk)).collect())
}

fn load_ram(path: &Path, ram: &mut [u32]) -> Result<()> {
    let bytes = std::fs::read(path).context("reading RAM image")?;
    if bytes.len() % 4 != 0 {
        bail!("RAM image length is not a multiple of 4 bytes");
    }

    let words = bytes.len() / 4;
    if words > ram.len() {
        bail!("RAM image has {words} words, but the RAM only has {}", ram.len());
    }

    let (chunks, _) = bytes.as_chunks::<4>();
    for (word, chunk) in ram.iter_mut().zip(chunks) {
        *word = u32::from_le_bytes(*chunk);
    }

    Ok(())
}

fn print_state(cpu: &mut Processor) {
    let regs = Reg::all().filter(|reg| !matches!(reg, Reg::Flag(_)));
    let mut column = 0;
    for reg in regs {
        print!("{:>6} {:08X}  ", reg.to_string(), cpu.get(reg));
        column += 1;
        if column % 6 == 0 {
            println!();
        }
    }
    println!();

    let status = Reg::all()
        .filter_map(|reg| match reg {
            Reg::Flag(flag) => Some(format!("{flag}={}", cpu.registers().flag(flag) as u8)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ");
    println!("flags: {status}");

    for (name, pop) in [
        ("out0", Processor::pop_fifo_out0 as fn(&mut Processor) -> Option<u64>),
        ("out1", Processor::pop_fifo_out1),
    ] {
        let words = std::iter::from_fn(|| pop(cpu))
            .map(|word| format!("{word:016X}"))
            .collect::<Vec<_>>();
        println!("fifo {name}: [{}]", words.join(", "));
    }
}

fn run(args: RunArgs) -> Result<()> {
    let mut memory = Memory::new(read_program(&args.program)?);
    if let Some(path) = &args.ram_a {
        load_ram(path, &mut memory.ram_a)?;
    }

    if let Some(path) = &args.ram_b {
        load_ram(path, &mut memory.ram_b)?;
    }

    let settings = Settings {
        backend: args.backend,
        cache_capacity: args.cache.as_u64() as usize,
        max_sequence: args.max_sequence,
    };

    let mut cpu = Processor::new(settings).context("creating processor")?;
    cpu.set_pc(parse_u32(&args.entry)?);

    for assignment in &args.assignments {
        let (reg, value) = assignment
            .split_once('=')
            .context("register assignments must look like REG=VALUE")?;

        let reg: Reg = reg.trim().parse()?;
        cpu.set(reg, parse_u32(value.trim())?);
    }

    for word in &args.fifo_in {
        cpu.push_fifo_in(parse_number(word.trim())?)
            .context("pushing into the input FIFO")?;
    }

    let result = cpu.run(&mut memory, args.cycles);
    print_state(&mut cpu);

    let executed = result.context("running program")?;
    println!(
        "executed {} cycles, {} blocks cached",
        executed.cycles,
        cpu.cached_blocks()
    );

    Ok(())
}

fn main() -> Result<()> {
    eyre_pretty::install().unwrap();

    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or(EnvFilter::new("tgptool=info,tgpcore=info,tgpjit=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
        Command::Decode { bundle } => {
            let word = parse_number(&bundle).context("parsing bundle")?;
            print!("{}", decode::describe(word));

            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(parse_number("0x10").unwrap(), 16);
        assert_eq!(parse_number("0b101").unwrap(), 5);
        assert_eq!(parse_number("1_000").unwrap(), 1000);
        assert!(parse_number("0xZZ").is_err());
        assert!(parse_u32("0x1_0000_0000").is_err());
    }

    #[test]
    fn describes_slots() {
        use tgpcore::tgpx4::bundle::{ControlOpcode, asm};

        let text = decode::describe(asm::control_only(ControlOpcode::Djmp, 0, asm::relative(-3)));
        assert!(text.contains("UnitControl"));
        assert!(text.contains("Djmp cc=0 -> pc-3"));
    }
}
