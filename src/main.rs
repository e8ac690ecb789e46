#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]

mod error;
mod hexdump;
mod image;
mod macho;
mod process;

use crate::process::{Process, ProcessMemory};
use anyhow::{bail, Context, Result};
use argh::FromArgs;
use env_logger::Env;
use read_process_memory::Pid;
use std::fs;
use std::path::{Path, PathBuf};

/// Plain reads are capped; a runaway size argument should fail fast instead
/// of allocating and reading gigabytes out of the target.
const MAX_READ_SIZE: u64 = 100_000_000;

/// Read bytes out of a live process, or dump the Mach-O image mapped there.
#[derive(FromArgs)]
struct Args {
    /// enable verbose logging output
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// process ID of the target process
    #[argh(option, short = 'p')]
    pid: Pid,

    /// start address, hex (0x-prefixed) or decimal
    #[argh(option, short = 'a', from_str_fn(parse_num))]
    address: Option<u64>,

    /// number of bytes to read (default: 16)
    #[argh(option, short = 's', from_str_fn(parse_num))]
    size: Option<u64>,

    /// file to write binary output to
    #[argh(option, short = 'o')]
    out: Option<PathBuf>,

    /// dump the whole Mach-O image starting at the given address
    #[argh(switch, short = 'f')]
    full: bool,

    /// locate the main executable image and dump it
    #[argh(switch, short = 'm')]
    main_image: bool,
}

fn parse_num(value: &str) -> Result<u64, String> {
    let result = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    result.map_err(|err| format!("{}: {}", value, err))
}

/// What the command line asks for, checked before any memory access so a bad
/// request never issues a single read.
#[derive(Debug, PartialEq, Eq)]
enum Request {
    Read {
        address: u64,
        size: u64,
        out: Option<PathBuf>,
    },
    DumpImage {
        address: u64,
        out: PathBuf,
    },
    DumpMain {
        out: PathBuf,
    },
}

impl Request {
    fn parse(args: &Args) -> Result<Request> {
        if args.main_image {
            let Some(out) = args.out.clone() else {
                bail!("-m requires an output filename (-o)");
            };
            return Ok(Request::DumpMain { out });
        }
        if args.full {
            let Some(address) = args.address else {
                bail!("-f requires a start address (-a)");
            };
            let Some(out) = args.out.clone() else {
                bail!("-f requires an output filename (-o)");
            };
            return Ok(Request::DumpImage { address, out });
        }
        let Some(address) = args.address else {
            bail!("a start address (-a) is required to read memory");
        };
        let size = args.size.unwrap_or(16);
        if size == 0 || size > MAX_READ_SIZE {
            bail!(
                "invalid size {:#x} (must be nonzero and at most {:#x})",
                size,
                MAX_READ_SIZE
            );
        }
        Ok(Request::Read {
            address,
            size,
            out: args.out.clone(),
        })
    }
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    env_logger::Builder::from_env(Env::default().default_filter_or(if args.verbose {
        "machdump=debug"
    } else {
        "machdump=info"
    }))
    .init();

    let request = Request::parse(&args)?;
    let process = Process::attach(args.pid)?;
    match request {
        Request::Read { address, size, out } => {
            let bytes = process.read_exact(address, size)?;
            if let Some(path) = out {
                write_dump(&path, &bytes)?;
                log::info!("memory dumped to {}", path.display());
            } else {
                let protection = process
                    .region_for(address)?
                    .map(|region| (region.protection, region.max_protection));
                hexdump::render(&mut std::io::stdout().lock(), address, &bytes, protection)?;
            }
        }
        Request::DumpImage { address, out } => dump_image(&process, address, &out)?,
        Request::DumpMain { out } => {
            let address = image::locate_main_image(&process)?;
            dump_image(&process, address, &out)?;
        }
    }
    Ok(())
}

fn dump_image(process: &Process, address: u64, out: &Path) -> Result<()> {
    let bytes = image::reconstruct(process, address)?;
    write_dump(out, &bytes)?;
    log::info!("full binary dumped to {}", out.display());
    Ok(())
}

fn write_dump(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}
