use crate::status::DEFAULT_HISTORY_LIMIT;
use clap::{Parser, Subcommand};

/// Longest `history --window-hours` accepted (ten years).
pub const MAX_WINDOW_HOURS: i64 = 10 * 366 * 24;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "soil-ingest",
    version,
    about = "MQTT soil-sensor ingestion with gateway status tracking"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the MQTT listener and background jobs (default).
    Run,
    /// Run a single offline sweep and print the report as JSON.
    Sweep,
    /// Print a gateway's status timeline rebuilt from its readings.
    /// `--limit` is capped at 200 periods.
    History {
        gateway_uid: String,
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
        #[arg(
            long,
            default_value_t = 24,
            value_parser = clap::value_parser!(i64).range(1..=MAX_WINDOW_HOURS)
        )]
        window_hours: i64,
    },
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}
