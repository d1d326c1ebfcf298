//! Split control tool
//!
//! Inspects how a dataset is partitioned, reads partitions end to end, and
//! converts between text and RecordIO.
//!
//! # Usage
//!
//! ```bash
//! # Byte ranges of 8 workers over a directory of text files
//! splitctl partitions /data/train --world-size 8
//!
//! # Count the records of worker 3
//! splitctl count "/data/train;/data/extra.txt" --rank 3 --world-size 8
//!
//! # Pack lines into RecordIO with an index, then read them back
//! splitctl pack lines.txt lines.rec --index lines.idx
//! splitctl unpack lines.rec
//! ```

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use split_core::Runtime;

/// Partitioned input split tool
#[derive(Parser, Debug)]
#[command(name = "splitctl")]
#[command(about = "Inspect, count and pack partitioned input splits")]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the realigned byte range of every rank
    Partitions {
        /// Dataset uri
        uri: String,

        /// Number of workers
        #[arg(short, long)]
        world_size: u32,

        /// Record format (text, recordio, indexed_recordio)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Read one partition and report what it contains
    Count {
        /// Dataset uri
        uri: String,

        /// Worker rank
        #[arg(short, long, default_value = "0")]
        rank: u32,

        /// Number of workers
        #[arg(short, long, default_value = "1")]
        world_size: u32,

        /// Record format (text, recordio, indexed_recordio)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Count chunks instead of records
        #[arg(long)]
        chunks: bool,
    },

    /// Write each line of a text file as one RecordIO record
    Pack {
        /// Text input
        input: PathBuf,

        /// RecordIO output
        output: PathBuf,

        /// Also write an index of record offsets
        #[arg(long)]
        index: Option<PathBuf>,
    },

    /// Print each RecordIO record as a line
    Unpack {
        /// RecordIO input
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = match &args.config {
        Some(path) => Runtime::from_config_file(path)?,
        None => Runtime::new()?,
    };

    match args.command {
        Command::Partitions {
            uri,
            world_size,
            format,
        } => {
            let partitions = runtime.partitions(&uri, world_size, &format)?;
            for (rank, p) in partitions.iter().enumerate() {
                println!("{rank}\t{}\t{}\t{}", p.begin, p.end, p.len());
            }
        }
        Command::Count {
            uri,
            rank,
            world_size,
            format,
            chunks,
        } => {
            let mut split = runtime.create_split(&uri, rank, world_size, &format)?;
            let stats = commands::count(split.as_mut(), chunks)?;
            tracing::info!(
                rank,
                world_size,
                items = stats.items,
                bytes = stats.bytes,
                elapsed_ms = stats.elapsed.as_millis() as u64,
                "finished reading partition"
            );
            println!(
                "{} {}\t{} bytes\t{:.3}s",
                stats.items,
                if chunks { "chunks" } else { "records" },
                stats.bytes,
                stats.elapsed.as_secs_f64()
            );
        }
        Command::Pack {
            input,
            output,
            index,
        } => {
            let stats = commands::pack(&input, &output, index.as_deref())?;
            tracing::info!(
                records = stats.records,
                bytes = stats.bytes,
                magic_splits = stats.magic_splits,
                "packed records"
            );
        }
        Command::Unpack { input } => {
            let stdout = std::io::stdout();
            let records = commands::unpack(&input, &mut stdout.lock())?;
            tracing::info!(records, "unpacked records");
        }
    }

    Ok(())
}
