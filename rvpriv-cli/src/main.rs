use std::error::Error;
use std::num::ParseIntError;

use clap::Parser;
use log::{debug, info};
use rvpriv_core::resources::Ram;
use rvpriv_core::{Config, Hart};
use stderrlog::LogLevelNum;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// ISA string, e.g. `rv64imafdch_smepmp`.
    #[arg(short, long, default_value = "rv64imac")]
    isa: String,
    /// Implemented privilege modes.
    #[arg(short, long, default_value = "msu")]
    modes: String,
    /// Number of PMP entries.
    #[arg(short, long)]
    pmp_entries: Option<usize>,
    /// RAM size in bytes, mapped at address 0.
    #[arg(long, default_value_t = 0x10_0000)]
    ram: usize,
    /// Log verbosity, 0 (errors) to 4 (trace).
    #[arg(short, long, default_value_t = 2)]
    verbosity: usize,
    /// CSR addresses to print, in hex (`0x300`) or decimal. Prints every implemented CSR when
    /// empty.
    #[arg(value_parser = parse_address)]
    csrs: Vec<u16>,
}

fn parse_address(s: &str) -> Result<u16, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn verbosity(level: usize) -> LogLevelNum {
    match level {
        0 => LogLevelNum::Error,
        1 => LogLevelNum::Warn,
        2 => LogLevelNum::Info,
        3 => LogLevelNum::Debug,
        _ => LogLevelNum::Trace,
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    stderrlog::new()
        .verbosity(verbosity(args.verbosity))
        .modules([module_path!(), "rvpriv_core"])
        .init()?;

    let mut config = Config::from_isa_string(&args.isa, &args.modes)?;
    if let Some(entries) = args.pmp_entries {
        config.pmp_entries = entries;
    }
    debug!("{config:?}");

    let ram = Ram::new(0, args.ram).ok_or("RAM size must be non-zero")?;
    let hart = Hart::new(config, ram)?;
    info!("Hart reset in {} at pc {:#x}", hart.state(), hart.pc());

    let addresses = match args.csrs.is_empty() {
        true => hart.cs_registers().addresses(),
        false => args.csrs,
    };
    for address in addresses {
        match hart.peek_csr(address) {
            Some(value) => println!("{address:#05x} = {value:#x}"),
            None => println!("{address:#05x} not implemented"),
        }
    }

    Ok(())
}
