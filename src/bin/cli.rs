//! Operation log inspection tool

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use structural_master::oplog::{FileOperationLog, LogId};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "structural-log")]
#[command(about = "Inspect structural operation logs", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every intact entry as a JSON line
    Dump {
        /// Log file
        #[arg(long)]
        log: PathBuf,

        /// First id to print
        #[arg(long, default_value = "0")]
        from: u64,
    },

    /// Check record integrity and id ordering
    Verify {
        /// Log file
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dump { log, from } => {
            let from = LogId::new(from);
            let outcome = FileOperationLog::replay(&log, |entry| {
                if entry.id >= from {
                    let line = serde_json::to_string(&entry)
                        .map_err(|e| structural_master::Error::Codec(e.to_string()))?;
                    println!("{}", line);
                }
                Ok(())
            })?;
            if let Some(reason) = outcome.corruption {
                tracing::warn!(
                    entries = outcome.entries,
                    "Dump stopped at corrupted record: {}",
                    reason
                );
            }
        }
        Commands::Verify { log } => {
            let mut previous: Option<LogId> = None;
            let mut out_of_order = 0usize;
            let outcome = FileOperationLog::replay(&log, |entry| {
                if previous.is_some_and(|p| entry.id <= p) {
                    out_of_order += 1;
                    tracing::error!(log_id = %entry.id, previous = ?previous, "Id not increasing");
                }
                previous = Some(entry.id);
                Ok(())
            })?;

            println!("entries:      {}", outcome.entries);
            println!("valid bytes:  {}", outcome.valid_bytes);
            let last = previous
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into());
            println!("last id:      {}", last);

            if let Some(reason) = outcome.corruption {
                anyhow::bail!("log corrupted after {} entries: {}", outcome.entries, reason);
            }
            if out_of_order > 0 {
                anyhow::bail!("{} entries with non-increasing ids", out_of_order);
            }
            println!("OK");
        }
    }

    Ok(())
}
