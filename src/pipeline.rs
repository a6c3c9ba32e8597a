//! Pipeline orchestrator.
//!
//! ```text
//!  UdpListener ─┐                   ┌─▶ RawCaptureSink
//!               ├─▶ raw Distributor ┤
//!  ReplaySource ┘                   └─▶ DecodeStage ─▶ decoded Distributor ─┬─▶ DecodedPersistSink
//!                                                                           ├─▶ SparseExportSink (csv)
//!                                                                           └─▶ SparseExportSink (json)
//! ```
//!
//! Every stage is its own worker connected by channels. The pipeline owns
//! all worker handles: the first worker to fail (or panic) stops the whole
//! pipeline, as do an external stop and the optional run duration. On stop
//! the sources exit, channels close in order, and every sink drains its
//! queue before `run_until` returns.

use crate::archive::DecodedPersistSink;
use crate::assembler::DEFAULT_STALE_AFTER_SECS;
use crate::capture::{RawCaptureSink, ReplaySource};
use crate::decode::{DecodeStage, FrameOutcome};
use crate::distributor::Distributor;
use crate::export::{ExportConfig, SparseExportSink};
use crate::listener::{ListenerConfig, ListenerError, UdpListener};
use crate::sink::{run_sink, Sink, SinkError, SinkSnapshot, SinkStats};
use crate::storage::StorageError;
use crate::types::{DecodedRecord, RawFrame};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("Worker {0} exited unexpectedly")]
    WorkerExited(String),
    #[error("Worker failed: {0}")]
    WorkerPanicked(String),
}

impl From<JoinError> for PipelineError {
    fn from(e: JoinError) -> Self {
        PipelineError::WorkerPanicked(e.to_string())
    }
}

/// Statistics for the pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_replayed: AtomicU64,
    pub sentences: AtomicU64,
    pub sentences_rejected: AtomicU64,
    pub decode_failures: AtomicU64,
    pub records_decoded: AtomicU64,
    pub partials_aged_out: AtomicU64,
    pub pending_partials: AtomicU64,
    sinks: Vec<Arc<SinkStats>>,
}

impl PipelineStats {
    pub fn with_sinks(sinks: Vec<Arc<SinkStats>>) -> Self {
        Self {
            sinks,
            ..Default::default()
        }
    }

    fn record_frame(&self, outcome: &FrameOutcome, decoded: usize, pending: usize) {
        self.sentences.fetch_add(outcome.sentences, Ordering::Relaxed);
        self.sentences_rejected
            .fetch_add(outcome.rejected, Ordering::Relaxed);
        self.decode_failures
            .fetch_add(outcome.decode_failures, Ordering::Relaxed);
        self.partials_aged_out
            .fetch_add(outcome.aged_out, Ordering::Relaxed);
        self.records_decoded
            .fetch_add(decoded as u64, Ordering::Relaxed);
        self.pending_partials.store(pending as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_replayed: self.frames_replayed.load(Ordering::Relaxed),
            sentences: self.sentences.load(Ordering::Relaxed),
            sentences_rejected: self.sentences_rejected.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            records_decoded: self.records_decoded.load(Ordering::Relaxed),
            partials_aged_out: self.partials_aged_out.load(Ordering::Relaxed),
            pending_partials: self.pending_partials.load(Ordering::Relaxed),
            sinks: self.sinks.iter().map(|s| s.snapshot()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_replayed: u64,
    pub sentences: u64,
    pub sentences_rejected: u64,
    pub decode_failures: u64,
    pub records_decoded: u64,
    pub partials_aged_out: u64,
    pub pending_partials: u64,
    pub sinks: Vec<SinkSnapshot>,
}

impl StatsSnapshot {
    pub fn sink(&self, name: &str) -> Option<&SinkSnapshot> {
        self.sinks.iter().find(|s| s.name == name)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames={} replayed={} sentences={} rejected={} decoded={} decode_failures={} pending={} aged_out={}",
            self.frames_received,
            self.frames_replayed,
            self.sentences,
            self.sentences_rejected,
            self.records_decoded,
            self.decode_failures,
            self.pending_partials,
            self.partials_aged_out
        )?;
        for sink in &self.sinks {
            write!(
                f,
                " {}=[written={} skipped={} errors={}]",
                sink.name, sink.rows_written, sink.rows_skipped, sink.errors
            )?;
        }
        Ok(())
    }
}

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub listener: ListenerConfig,
    /// Raw capture store
    pub raw_store: Option<PathBuf>,
    /// Decoded record store
    pub decoded_store: Option<PathBuf>,
    pub exports: Vec<ExportConfig>,
    /// Capture store to replay once at startup
    pub replay: Option<PathBuf>,
    /// Age after which incomplete multipart messages are dropped
    pub stale_after_secs: f64,
    /// Stop after this long; runs until stopped when `None`
    pub run_duration: Option<Duration>,
    /// Interval between stats log lines
    pub stats_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            raw_store: None,
            decoded_store: None,
            exports: Vec::new(),
            replay: None,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            run_duration: None,
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// How a worker finished.
#[derive(Debug)]
enum WorkerExit {
    Replayed(usize),
    Stopped(String),
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Replayed(n) => write!(f, "replay ({} frames)", n),
            WorkerExit::Stopped(name) => write!(f, "{}", name),
        }
    }
}

type WorkerResult = Result<WorkerExit, PipelineError>;

/// A fully set-up pipeline, ready to run.
pub struct Pipeline {
    config: PipelineConfig,
    listener: UdpListener,
    raw_sinks: Vec<(Box<dyn Sink<RawFrame>>, Arc<SinkStats>)>,
    decoded_sinks: Vec<(Box<dyn Sink<DecodedRecord>>, Arc<SinkStats>)>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Get a reference to the pipeline stats.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, PipelineError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until `stop` resolves, the run duration elapses, or a worker
    /// fails. Sinks are drained before returning.
    pub async fn run_until<F>(self, stop: F) -> Result<(), PipelineError>
    where
        F: Future<Output = ()>,
    {
        let Pipeline {
            config,
            listener,
            raw_sinks,
            decoded_sinks,
            stats,
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();

        let mut decoded = Distributor::new();
        for (sink, sink_stats) in decoded_sinks {
            let rx = decoded.register(sink.name());
            spawn_sink(&mut workers, sink, rx, sink_stats);
        }

        let mut raw = Distributor::new();
        for (sink, sink_stats) in raw_sinks {
            let rx = raw.register(sink.name());
            spawn_sink(&mut workers, sink, rx, sink_stats);
        }
        let decode_rx = raw.register("decode");
        workers.spawn(decode_worker(
            decode_rx,
            DecodeStage::new(config.stale_after_secs),
            decoded,
            Arc::clone(&stats),
        ));

        if let Some(path) = config.replay.clone() {
            let raw = raw.clone();
            let shutdown = shutdown_rx.clone();
            let stats = Arc::clone(&stats);
            workers.spawn(async move {
                let replayed = ReplaySource::new(path).replay(&raw, &shutdown).await?;
                stats
                    .frames_replayed
                    .fetch_add(replayed as u64, Ordering::Relaxed);
                Ok(WorkerExit::Replayed(replayed))
            });
        }

        {
            let shutdown = shutdown_rx.clone();
            let stats = Arc::clone(&stats);
            workers.spawn(async move {
                listener.run(raw, stats, shutdown).await?;
                Ok(WorkerExit::Stopped("listener".to_string()))
            });
        }

        let reporter = tokio::spawn(report_stats(
            Arc::clone(&stats),
            config.stats_interval,
            shutdown_rx,
        ));

        let run_duration = config.run_duration;
        let deadline = async move {
            match run_duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(stop);
        tokio::pin!(deadline);

        let mut failure = loop {
            tokio::select! {
                _ = &mut stop => {
                    tracing::info!("Stop requested");
                    break None;
                }
                _ = &mut deadline => {
                    tracing::info!("Run duration elapsed");
                    break None;
                }
                Some(joined) = workers.join_next() => match flatten(joined) {
                    Ok(WorkerExit::Replayed(n)) => {
                        tracing::info!("Replay finished ({} frames)", n);
                    }
                    Ok(WorkerExit::Stopped(name)) => {
                        break Some(PipelineError::WorkerExited(name));
                    }
                    Err(e) => break Some(e),
                },
            }
        };

        if let Some(e) = &failure {
            tracing::error!("Stopping pipeline: {}", e);
        }
        let _ = shutdown_tx.send(true);

        while let Some(joined) = workers.join_next().await {
            match flatten(joined) {
                Ok(exit) => tracing::debug!("{} finished", exit),
                Err(e) => {
                    tracing::error!("Worker failed during shutdown: {}", e);
                    failure.get_or_insert(e);
                }
            }
        }
        if let Err(e) = reporter.await {
            tracing::warn!("Stats reporter failed: {}", e);
        }

        tracing::info!("Final stats: {}", stats.snapshot());

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn flatten(joined: Result<WorkerResult, JoinError>) -> WorkerResult {
    match joined {
        Ok(result) => result,
        Err(e) => Err(e.into()),
    }
}

fn spawn_sink<T: Send + Sync + 'static>(
    workers: &mut JoinSet<WorkerResult>,
    sink: Box<dyn Sink<T>>,
    rx: mpsc::UnboundedReceiver<Arc<T>>,
    stats: Arc<SinkStats>,
) {
    let name = sink.name().to_string();
    workers.spawn_blocking(move || {
        run_sink(sink, rx, stats);
        Ok(WorkerExit::Stopped(name))
    });
}

async fn decode_worker(
    mut rx: mpsc::UnboundedReceiver<Arc<RawFrame>>,
    mut stage: DecodeStage,
    decoded: Distributor<DecodedRecord>,
    stats: Arc<PipelineStats>,
) -> WorkerResult {
    while let Some(frame) = rx.recv().await {
        let (records, outcome) = stage.process(&frame);
        stats.record_frame(&outcome, records.len(), stage.pending_partials());
        for record in records {
            decoded.deliver(record);
        }
    }
    Ok(WorkerExit::Stopped("decode".to_string()))
}

async fn report_stats(
    stats: Arc<PipelineStats>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(1)));
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tracing::info!("Stats: {}", stats.snapshot());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Builder for creating a Pipeline with custom configuration.
pub struct PipelineBuilder {
    config: PipelineConfig,
    raw_sinks: Vec<Box<dyn Sink<RawFrame>>>,
    decoded_sinks: Vec<Box<dyn Sink<DecodedRecord>>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::from_config(PipelineConfig::default())
    }

    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            config,
            raw_sinks: Vec::new(),
            decoded_sinks: Vec::new(),
        }
    }

    pub fn listener(mut self, config: ListenerConfig) -> Self {
        self.config.listener = config;
        self
    }

    pub fn raw_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.raw_store = Some(path.into());
        self
    }

    pub fn decoded_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.decoded_store = Some(path.into());
        self
    }

    pub fn export(mut self, export: ExportConfig) -> Self {
        self.config.exports.push(export);
        self
    }

    pub fn replay(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.replay = Some(path.into());
        self
    }

    pub fn stale_after(mut self, secs: f64) -> Self {
        self.config.stale_after_secs = secs;
        self
    }

    pub fn run_duration(mut self, duration: Duration) -> Self {
        self.config.run_duration = Some(duration);
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    /// Add a sink for raw frames beyond the configured ones.
    pub fn raw_sink(mut self, sink: Box<dyn Sink<RawFrame>>) -> Self {
        self.raw_sinks.push(sink);
        self
    }

    /// Add a sink for decoded records beyond the configured ones.
    pub fn decoded_sink(mut self, sink: Box<dyn Sink<DecodedRecord>>) -> Self {
        self.decoded_sinks.push(sink);
        self
    }

    /// Bind the socket and open every store and export file.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let PipelineBuilder {
            config,
            raw_sinks: extra_raw,
            decoded_sinks: extra_decoded,
        } = self;

        let listener = UdpListener::bind(&config.listener)?;

        let mut raw_sinks: Vec<Box<dyn Sink<RawFrame>>> = Vec::new();
        if let Some(path) = &config.raw_store {
            raw_sinks.push(Box::new(RawCaptureSink::open(path)?));
        }
        raw_sinks.extend(extra_raw);

        let mut decoded_sinks: Vec<Box<dyn Sink<DecodedRecord>>> = Vec::new();
        if let Some(path) = &config.decoded_store {
            decoded_sinks.push(Box::new(DecodedPersistSink::open(path)?));
        }
        for export in &config.exports {
            decoded_sinks.push(Box::new(SparseExportSink::open(export)?));
        }
        decoded_sinks.extend(extra_decoded);

        let raw_sinks: Vec<_> = raw_sinks
            .into_iter()
            .map(|sink| {
                let stats = Arc::new(SinkStats::new(sink.name()));
                (sink, stats)
            })
            .collect();
        let decoded_sinks: Vec<_> = decoded_sinks
            .into_iter()
            .map(|sink| {
                let stats = Arc::new(SinkStats::new(sink.name()));
                (sink, stats)
            })
            .collect();

        let sink_stats = raw_sinks
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .chain(decoded_sinks.iter().map(|(_, s)| Arc::clone(s)))
            .collect();

        Ok(Pipeline {
            config,
            listener,
            raw_sinks,
            decoded_sinks,
            stats: Arc::new(PipelineStats::with_sinks(sink_stats)),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ais::position_report_payload;
    use crate::archive::load_archive;
    use crate::capture::load_capture;
    use crate::export::ExportFormat;
    use crate::protocol::Sentence;
    use crate::sink::SinkWrite;
    use crate::types::Mmsi;
    use tempfile::tempdir;
    use tokio::net::UdpSocket;
    use tokio::sync::oneshot;

    fn loopback() -> ListenerConfig {
        ListenerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    fn position_line(mmsi: u32) -> String {
        let (payload, fill_bits) = position_report_payload(mmsi, -91.5, 28.9, 10.0, 90.0);
        Sentence {
            own_ship: false,
            total_fragments: 1,
            fragment_number: 1,
            multipart_id: None,
            channel: Some('A'),
            payload,
            fill_bits,
        }
        .to_line()
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_live_datagrams_reach_every_sink() {
        let dir = tempdir().unwrap();
        let raw_path = dir.path().join("raw");
        let db_path = dir.path().join("db");
        let json_path = dir.path().join("sparse.json");

        let pipeline = PipelineBuilder::new()
            .listener(loopback())
            .raw_store(&raw_path)
            .decoded_store(&db_path)
            .export(ExportConfig::new(&json_path, ExportFormat::JsonLines))
            .build()
            .unwrap();
        let addr = pipeline.local_addr().unwrap();
        let stats = pipeline.stats();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let run = tokio::spawn(pipeline.run_until(async {
            let _ = stop_rx.await;
        }));

        let line = position_line(123_456_789);
        let datagram = format!("{line}\n{line}\r\nnot a sentence\n");
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(datagram.as_bytes(), addr).await.unwrap();

        wait_until(|| stats.snapshot().records_decoded == 2).await;
        stop_tx.send(()).unwrap();
        run.await.unwrap().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_received, 1);
        assert_eq!(snapshot.sentences, 3);
        assert_eq!(snapshot.sentences_rejected, 1);
        assert_eq!(snapshot.sink("raw").unwrap().rows_written, 1);
        // Same receipt time and same JSON: one archived row.
        assert_eq!(snapshot.sink("db").unwrap().rows_written, 1);
        assert_eq!(snapshot.sink("json").unwrap().rows_written, 1);

        assert_eq!(load_capture(&raw_path).unwrap().len(), 1);
        let archived = load_archive(&db_path).unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].vessel_id, Some(Mmsi::new(123_456_789)));

        let exported = std::fs::read_to_string(&json_path).unwrap();
        assert_eq!(exported.lines().count(), 1);
        assert!(exported.contains("\"mmsi\":123456789"));
    }

    #[tokio::test]
    async fn test_replay_converges() {
        let dir = tempdir().unwrap();
        let raw_path = dir.path().join("raw");
        let db_path = dir.path().join("db");

        {
            let mut capture = RawCaptureSink::open(&raw_path).unwrap();
            let frames: Vec<Arc<RawFrame>> = [(300.0, 3), (100.0, 1), (200.0, 2)]
                .into_iter()
                .map(|(t, mmsi)| {
                    let line = position_line(mmsi);
                    Arc::new(RawFrame::new(t, "10.0.0.1", 4000, line.into_bytes()))
                })
                .collect();
            assert_eq!(
                capture.write_batch(&frames).unwrap(),
                SinkWrite { written: 3, skipped: 0 }
            );
        }

        for _ in 0..2 {
            let pipeline = PipelineBuilder::new()
                .listener(loopback())
                .raw_store(&raw_path)
                .decoded_store(&db_path)
                .replay(&raw_path)
                .build()
                .unwrap();
            let stats = pipeline.stats();
            let watched = Arc::clone(&stats);

            pipeline
                .run_until(async move {
                    wait_until(|| {
                        let s = watched.snapshot();
                        s.frames_replayed == 3 && s.records_decoded == 3
                    })
                    .await;
                })
                .await
                .unwrap();

            let snapshot = stats.snapshot();
            assert_eq!(snapshot.sink("raw").unwrap().rows_skipped, 3);
            assert_eq!(load_capture(&raw_path).unwrap().len(), 3);
            let archived = load_archive(&db_path).unwrap();
            assert_eq!(archived.len(), 3);
            let times: Vec<f64> = archived.iter().map(|r| r.receipt_time).collect();
            assert_eq!(times, vec![100.0, 200.0, 300.0]);
        }
    }

    #[tokio::test]
    async fn test_run_duration_stops_cleanly() {
        let pipeline = PipelineBuilder::new()
            .listener(loopback())
            .run_duration(Duration::from_millis(50))
            .build()
            .unwrap();
        pipeline
            .run_until(std::future::pending())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_replay_store_is_fatal() {
        let dir = tempdir().unwrap();
        let pipeline = PipelineBuilder::new()
            .listener(loopback())
            .replay(dir.path().join("missing"))
            .build()
            .unwrap();
        let result = pipeline.run_until(std::future::pending()).await;
        assert!(matches!(result, Err(PipelineError::Storage(_))));
    }

    struct Explodes;

    impl Sink<DecodedRecord> for Explodes {
        fn name(&self) -> &str {
            "explodes"
        }

        fn write_batch(&mut self, _: &[Arc<DecodedRecord>]) -> Result<SinkWrite, SinkError> {
            panic!("sink blew up");
        }
    }

    #[tokio::test]
    async fn test_worker_panic_stops_pipeline() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db");
        let pipeline = PipelineBuilder::new()
            .listener(loopback())
            .decoded_store(&db_path)
            .decoded_sink(Box::new(Explodes))
            .build()
            .unwrap();
        let addr = pipeline.local_addr().unwrap();
        let run = tokio::spawn(pipeline.run_until(std::future::pending()));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(position_line(1).as_bytes(), addr)
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PipelineError::WorkerPanicked(_))));
        // The healthy sink still drained its queue.
        assert_eq!(load_archive(&db_path).unwrap().len(), 1);
    }
}
