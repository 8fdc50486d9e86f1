use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use psx_dynarec::snapshot::Snapshot;
use psx_dynarec::{BackendKind, DynarecConfig, RunExit, System};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    Interp,
    Native,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Interp => BackendKind::Interp,
            Backend::Native => BackendKind::Native,
        }
    }
}

/// Run a raw R3000A binary through the recompiler
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Program image (raw or gzip compressed)
    image: Option<PathBuf>,

    /// 512KB BIOS image
    #[arg(long)]
    bios: Option<PathBuf>,

    /// Virtual address the image is loaded at
    #[arg(long, value_parser = parse_addr, default_value = "0x80010000")]
    load_addr: u32,

    /// Initial pc (defaults to the load address, or the reset vector when
    /// only a BIOS is given)
    #[arg(long, value_parser = parse_addr)]
    entry: Option<u32>,

    /// 8MB of main RAM
    #[arg(long)]
    ram_8mb: bool,

    #[arg(long, value_enum, default_value = "interp")]
    backend: Backend,

    /// Guest instruction budget
    #[arg(long, default_value_t = 100_000_000)]
    max_cycles: u64,

    /// Stop when a block starts at this address
    #[arg(long, value_parser = parse_addr)]
    halt_pc: Option<u32>,

    /// Resume from a save state
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write a save state on exit
    #[arg(long)]
    save_state: Option<PathBuf>,
}

fn parse_addr(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid address {}: {}", s, e))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.image.is_none() && args.bios.is_none() && args.load_state.is_none() {
        bail!("nothing to run: give an image, --bios or --load-state");
    }

    let config = DynarecConfig {
        ram_expansion: args.ram_8mb,
        backend: args.backend.into(),
    };
    let mut system = System::new(config).context("failed to start the recompiler")?;

    if let Some(path) = &args.bios {
        let image = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        system.load_bios(&image)?;
        system.cpu.pc = psx_dynarec::cpu::RESET_VECTOR;
    }

    if let Some(path) = &args.image {
        let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let image = psx_dynarec::memory::decompress_image(raw)?;
        system.load_binary(&image, args.load_addr)?;
        system.cpu.pc = args.load_addr;
        tracing::info!("loaded {} ({} bytes) at {:#010x}", path.display(), image.len(), args.load_addr);
    }

    if let Some(path) = &args.load_state {
        let snapshot = Snapshot::load(path).with_context(|| format!("loading {}", path.display()))?;
        system.load_state(&snapshot)?;
    }

    if let Some(entry) = args.entry {
        system.cpu.pc = entry;
    }

    let exit = match args.halt_pc {
        Some(pc) => system.run_until(pc, args.max_cycles)?,
        None => system.run(args.max_cycles)?,
    };

    match exit {
        RunExit::CycleBudget => tracing::info!("cycle budget reached"),
        RunExit::HaltPc(pc) => tracing::info!("reached {:#010x}", pc),
        RunExit::Exception { pc, exception } => tracing::info!("{} at {:#010x}", exception, pc),
    }

    let stats = system.dynarec().stats();
    println!(
        "pc={:#010x} cycles={} blocks={} dispatched={} interpreted={} invalidated={}",
        system.cpu.pc,
        system.cpu.cycle,
        stats.compiled,
        stats.dispatched,
        stats.interpreted,
        stats.invalidated
    );
    for (i, chunk) in system.cpu.gpr.chunks(8).enumerate() {
        let line: Vec<String> = chunk.iter().map(|v| format!("{:08x}", v)).collect();
        println!("r{:02}: {}", i * 8, line.join(" "));
    }
    println!("hi: {:08x} lo: {:08x}", system.cpu.hi, system.cpu.lo);

    if let Some(path) = &args.save_state {
        system
            .save_state()
            .save(path)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    Ok(())
}
