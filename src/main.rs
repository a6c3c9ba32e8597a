//! AIS datagram collector CLI
//!
//! Listens for AIVDM/AIVDO sentences over UDP, decodes them and fans the
//! results out to capture, archive and export files.

use clap::{Parser, Subcommand};
use shipgaze::{
    archive::load_archive,
    capture::load_capture,
    decode::DecodeStage,
    export::{ExportConfig, ExportFormat},
    listener::ListenerConfig,
    pipeline::{PipelineBuilder, PipelineConfig},
    storage::KeyedStore,
    types::{now_seconds, RawFrame},
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "shipgaze")]
#[command(about = "AIS datagram collector with idempotent capture and replay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for AIS datagrams and run the pipeline
    Listen {
        /// Address to bind
        #[arg(long, env = "SHIPGAZE_BIND", default_value = "0.0.0.0")]
        bind: String,

        /// UDP port to listen on
        #[arg(short, long, env = "SHIPGAZE_PORT", default_value = "8982")]
        port: u16,

        /// Maximum datagram size in bytes
        #[arg(long, default_value_t = 20 * 85)]
        size: usize,

        /// Raw capture store
        #[arg(long)]
        raw: Option<PathBuf>,

        /// Decoded record store
        #[arg(long)]
        db: Option<PathBuf>,

        /// Sparse CSV export file
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Seconds between CSV samples of one vessel
        #[arg(long, default_value = "60")]
        dt_csv: f64,

        /// Sparse JSON-lines export file
        #[arg(long)]
        json: Option<PathBuf>,

        /// Seconds between JSON samples of one vessel
        #[arg(long, default_value = "60")]
        dt_json: f64,

        /// Capture store to replay at startup
        #[arg(long)]
        replay: Option<PathBuf>,

        /// Seconds before an incomplete multipart message is dropped
        #[arg(long, default_value = "60")]
        stale_after: f64,

        /// Stop after this many seconds
        #[arg(long)]
        dt: Option<f64>,

        /// Seconds between stats log lines
        #[arg(long, default_value = "60")]
        stats_interval: u64,
    },

    /// Show statistics of a capture or archive store
    Stats {
        /// Store file
        store: PathBuf,
    },

    /// Print the rows of a store, oldest first
    Dump {
        /// Store file
        store: PathBuf,

        /// The store is a decoded archive rather than a raw capture
        #[arg(long)]
        decoded: bool,

        /// Show only the first N rows
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Decode a file of NMEA sentences and print each record as JSON
    Decode {
        /// Text file with one sentence per line
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Listen {
            bind,
            port,
            size,
            raw,
            db,
            csv,
            dt_csv,
            json,
            dt_json,
            replay,
            stale_after,
            dt,
            stats_interval,
        } => {
            let mut exports = Vec::new();
            if let Some(path) = csv {
                exports.push(ExportConfig::new(path, ExportFormat::Csv).min_interval(dt_csv));
            }
            if let Some(path) = json {
                exports.push(ExportConfig::new(path, ExportFormat::JsonLines).min_interval(dt_json));
            }

            let config = PipelineConfig {
                listener: ListenerConfig {
                    bind,
                    port,
                    max_datagram: size,
                },
                raw_store: raw,
                decoded_store: db,
                exports,
                replay,
                stale_after_secs: stale_after,
                run_duration: dt.filter(|s| *s > 0.0).map(Duration::from_secs_f64),
                stats_interval: Duration::from_secs(stats_interval),
            };
            listen(config).await?;
        }
        Commands::Stats { store } => {
            show_stats(&store)?;
        }
        Commands::Dump {
            store,
            decoded,
            limit,
        } => {
            if decoded {
                dump_archive(&store, limit)?;
            } else {
                dump_capture(&store, limit)?;
            }
        }
        Commands::Decode { file } => {
            decode_file(&file)?;
        }
    }

    Ok(())
}

async fn listen(config: PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = PipelineBuilder::from_config(config).build()?;
    let stats = pipeline.stats();

    tracing::info!("Starting pipeline on {}", pipeline.local_addr()?);

    let result = pipeline
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Received Ctrl+C, shutting down...");
        })
        .await;

    let final_stats = stats.snapshot();
    tracing::info!("Final statistics:");
    tracing::info!("  Frames received: {}", final_stats.frames_received);
    tracing::info!("  Frames replayed: {}", final_stats.frames_replayed);
    tracing::info!("  Sentences: {}", final_stats.sentences);
    tracing::info!("  Rejected sentences: {}", final_stats.sentences_rejected);
    tracing::info!("  Records decoded: {}", final_stats.records_decoded);
    for sink in &final_stats.sinks {
        tracing::info!(
            "  {}: {} written, {} skipped, {} errors",
            sink.name,
            sink.rows_written,
            sink.rows_skipped,
            sink.errors
        );
    }

    result?;
    Ok(())
}

fn show_stats(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store at {}", path.display()).into());
    }
    let store = KeyedStore::open(path)?;
    let stats = store.stats();

    println!("Store Statistics");
    println!("================");
    println!("Rows: {}", stats.row_count);
    println!("Data size: {:.2} MB", stats.data_size_mb());
    println!("Capacity: {:.2} MB", stats.capacity_bytes as f64 / (1024.0 * 1024.0));
    println!("Utilization: {:.1}%", stats.utilization() * 100.0);

    Ok(())
}

fn dump_capture(path: &Path, limit: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let frames = load_capture(path)?;
    let shown = limit.unwrap_or(frames.len());

    for frame in frames.iter().take(shown) {
        for line in frame.lines() {
            println!(
                "{:.6} {}:{} {}",
                frame.receipt_time,
                frame.sender_host,
                frame.sender_port,
                String::from_utf8_lossy(line)
            );
        }
    }

    if frames.len() > shown {
        println!("... and {} more frames", frames.len() - shown);
    }
    Ok(())
}

fn dump_archive(path: &Path, limit: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let mut records = load_archive(path)?;
    records.sort_by(|a, b| a.receipt_time.total_cmp(&b.receipt_time));
    let shown = limit.unwrap_or(records.len());

    for record in records.iter().take(shown) {
        let vessel = record
            .vessel_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:.6} {} {}", record.receipt_time, vessel, record.json);
    }

    if records.len() > shown {
        println!("... and {} more records", records.len() - shown);
    }
    Ok(())
}

fn decode_file(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(path)?;

    tracing::info!("Decoding file: {} ({} bytes)", path.display(), data.len());

    let frame = RawFrame::new(now_seconds(), "file", 0, data);
    let (records, outcome) = DecodeStage::default().process(&frame);

    for record in &records {
        println!("{}", record.to_json()?);
    }

    eprintln!(
        "{} sentences, {} rejected, {} incomplete, {} decode failures, {} records",
        outcome.sentences,
        outcome.rejected,
        outcome.incomplete,
        outcome.decode_failures,
        records.len()
    );
    Ok(())
}
