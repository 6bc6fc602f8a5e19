use chrono::NaiveDateTime;
use clap::{Parser, ValueEnum};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "generation-logbook",
    version,
    about = "Buffers plant readings and merges them into the hourly, shift and outage logs"
)]
pub struct Args {
    /// Run a single tick of one stream and exit instead of starting the daemon.
    #[arg(long, value_enum)]
    pub once: Option<OnceTarget>,
    /// Plant-local time to run the `--once` tick as, e.g. `2025-12-27 00:01`.
    #[arg(long, value_parser = parse_local_time, requires = "once")]
    pub at: Option<NaiveDateTime>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceTarget {
    Hourly,
    Shift,
    Outage,
    /// Only drain the buffers into the logs.
    Merge,
}

fn parse_local_time(raw: &str) -> Result<NaiveDateTime, String> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M"))
        .map_err(|err| format!("expected YYYY-MM-DD HH:MM[:SS]: {err}"))
}
