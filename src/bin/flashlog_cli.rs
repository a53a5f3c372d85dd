//! Command-line front end over a file-backed KV store. Argument shape
//! follows `pblog`'s `NVRAM_CMDLINE_APP` (list / get / set dispatch), with
//! named flags for region geometry instead of hardcoded region sizes.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use flashlog::{Error, FileFlash, Kv, RecordLog, Region};

#[derive(Parser)]
#[command(name = "flashlog-cli", about = "Inspect and edit a flashlog KV store")]
struct Cli {
    /// Path to the backing file. Created and extended if it doesn't exist
    /// or is too small for the requested region layout.
    #[arg(long, default_value = "flashlog.bin")]
    path: String,

    /// Number of erase regions.
    #[arg(long, default_value_t = 2)]
    regions: usize,

    /// Size of each erase region, in bytes.
    #[arg(long, default_value_t = 4096)]
    region_size: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every live key.
    List,
    /// Print the value for a key, or exit 1 if it is absent.
    Get { key: String },
    /// Set a key to a value.
    Set { key: String, value: String },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(status_code(&e))
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode, Error> {
    let mut kv = open_store(cli)?;

    match &cli.command {
        Command::List => {
            let mut entries = kv.list()?;
            entries.sort();
            for (key, value) in entries {
                println!("{}={}", String::from_utf8_lossy(&key), String::from_utf8_lossy(&value));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Get { key } => match kv.lookup(key.as_bytes())? {
            Some(value) => {
                println!("{}", String::from_utf8_lossy(&value));
                Ok(ExitCode::SUCCESS)
            }
            None => Ok(ExitCode::from(1)),
        },
        Command::Set { key, value } => {
            kv.set(key.as_bytes(), value.as_bytes())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(cli: &Cli) -> Result<Kv<FileFlash>, Error> {
    let mut flash = FileFlash::open(&cli.path)?;
    flash.ensure_len((cli.regions as u64) * (cli.region_size as u64))?;

    let regions = (0..cli.regions)
        .map(|i| Region::new(i as u32 * cli.region_size, cli.region_size))
        .collect();
    let log = RecordLog::mount(regions, flash)?;
    Ok(Kv::mount(log))
}

/// Mirrors `pblog`'s `enum pblog_status` numbering for readers who know the
/// original: -1 IO, -2 invalid, -3 checksum, -4 no-space.
fn status_code(err: &Error) -> u8 {
    let code: i8 = match err {
        Error::Io(_) => -1,
        Error::Invalid(_) => -2,
        Error::Checksum => -3,
        Error::NoSpace => -4,
    };
    code as u8
}
