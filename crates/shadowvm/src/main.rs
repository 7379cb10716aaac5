//! shadowvm - a userspace instrumentation emulator
//!
//! Usage:
//!   shadowvm <guest-program> [guest-args...]      Run a guest under emulation
//!   shadowvm --trace <guest-program>              Also print each instruction
//!
//! The guest runs on a software CPU and MMU that track the definedness of
//! every byte; uninitialised-value uses and heap defects are reported to
//! stderr with `==PID==`-prefixed lines. The emulator's exit status is the
//! guest's exit status, or 1 on a fatal emulation error.

use anyhow::{bail, Context, Result};
use clap::Parser;
use shadowvm_emulate::Emulator;
use shadowvm_formats::{looks_like_elf, Elf};
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shadowvm")]
#[command(about = "Run a 32-bit x86 guest with byte-granular definedness tracking", long_about = None)]
struct Cli {
    /// Print each instruction and a register dump as it executes
    #[arg(long)]
    trace: bool,

    /// Path to the guest program
    program: PathBuf,

    /// Arguments passed through to the guest
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let data = fs::read(&cli.program)
        .with_context(|| format!("failed to read guest program: {}", cli.program.display()))?;
    if !looks_like_elf(&data) {
        bail!("{} is not an ELF binary", cli.program.display());
    }
    let elf = Elf::parse(&data).context("failed to parse guest ELF")?;

    let mut arguments = vec![cli.program.to_string_lossy().into_owned()];
    arguments.extend(cli.args.iter().cloned());
    let environment: Vec<String> = std::env::vars()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    let mut emulator = Emulator::new(&elf, &arguments, &environment)
        .context("failed to initialize the emulator")?;
    emulator.set_trace(cli.trace);

    std::process::exit(emulator.exec());
}
