use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod bench;
pub mod doctor;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that shared memory and named semaphores work on this host.
    Doctor(DoctorArgs),
    /// Measure call latency over an in-process owner/guest channel pair.
    Bench(BenchArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Doctor(args) => doctor::run(args, format),
        Command::Bench(args) => bench::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Number of measured calls.
    #[arg(long, default_value_t = 10_000)]
    pub calls: u32,
    /// Unmeasured calls made first.
    #[arg(long, default_value_t = 100)]
    pub warmup: u32,
    /// Payload size in bytes of each call's string argument.
    #[arg(long, default_value_t = 16)]
    pub payload: usize,
    /// Per-call deadline (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Smallest transport segment in bytes; small values exercise hand-offs.
    #[arg(long, value_name = "BYTES")]
    pub segment_size: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `500ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
