use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use ember_kernel::segment::SegmentInfo;
use ember_kernel::{Broker, BrokerConfig, Offset, Record};

/// Ember partition log CLI
#[derive(Parser, Debug)]
#[command(name = "ember")]
#[command(about = "Append to and fetch from Ember topic logs", long_about = None)]
struct Cli {
    /// Path to broker config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Segment size bound in bytes (overrides config)
    #[arg(long)]
    segment_max_bytes: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append a UTF-8 payload to a topic
    Produce {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        payload: String,
    },

    /// Fetch records starting at an offset
    Fetch {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        offset: Offset,

        /// Read budget in bytes (defaults to the configured value)
        #[arg(long)]
        max_bytes: Option<u32>,
    },

    /// List a topic's segments
    Segments {
        #[arg(long)]
        topic: String,
    },
}

#[derive(Debug, Serialize)]
struct ProduceOutput {
    offset: Offset,
}

#[derive(Debug, Serialize)]
struct FetchedRecord {
    offset: Offset,
    payload: String,
}

#[derive(Debug, Serialize)]
struct FetchOutput {
    records: Vec<FetchedRecord>,
}

#[derive(Debug, Serialize)]
struct SegmentsOutput {
    topic: String,
    next_offset: Offset,
    segments: Vec<SegmentInfo>,
}

impl From<Record> for FetchedRecord {
    fn from(record: Record) -> Self {
        Self {
            offset: record.offset,
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
        }
    }
}

fn load_config(cli: &Cli) -> Result<BrokerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            BrokerConfig::from_json(&data)?
        }
        None => BrokerConfig::default(),
    };

    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(bytes) = cli.segment_max_bytes {
        config.log.segment_max_bytes = bytes;
    }

    config.validate()?;
    Ok(config)
}

fn execute(broker: &Broker, command: Command) -> Result<serde_json::Value> {
    let output = match command {
        Command::Produce { topic, payload } => {
            let offset = broker.append(&topic, payload.as_bytes())?;
            serde_json::to_value(ProduceOutput { offset })?
        }

        Command::Fetch {
            topic,
            offset,
            max_bytes,
        } => {
            let max_bytes = max_bytes.unwrap_or(broker.config().default_max_bytes);
            let records = broker.read(&topic, offset, max_bytes)?;
            serde_json::to_value(FetchOutput {
                records: records.into_iter().map(FetchedRecord::from).collect(),
            })?
        }

        Command::Segments { topic } => {
            let log = broker.partition(&topic)?;
            serde_json::to_value(SegmentsOutput {
                topic,
                next_offset: log.next_offset(),
                segments: log.segments(),
            })?
        }
    };

    Ok(output)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli)?;
    let broker = Broker::new(config)?;

    let output = execute(&broker, cli.command)?;
    broker.close()?;

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
