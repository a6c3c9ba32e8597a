//! Sink abstraction and the blocking worker that drives one sink.

use crate::storage::StorageError;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Largest number of queued items handed to a sink at once.
pub const MAX_BATCH: usize = 1024;

/// What a sink did with one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkWrite {
    pub written: usize,
    /// Items accepted but not written (duplicates, decimated records)
    pub skipped: usize,
}

/// A consumer of pipeline items. Each sink owns its resources exclusively.
pub trait Sink<T>: Send {
    fn name(&self) -> &str;

    /// Write a batch atomically: either all of its new rows become visible
    /// or none do.
    fn write_batch(&mut self, items: &[Arc<T>]) -> Result<SinkWrite, SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Per-sink counters.
#[derive(Debug)]
pub struct SinkStats {
    pub name: String,
    pub rows_written: AtomicU64,
    pub rows_skipped: AtomicU64,
    pub errors: AtomicU64,
}

impl SinkStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows_written: AtomicU64::new(0),
            rows_skipped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> SinkSnapshot {
        SinkSnapshot {
            name: self.name.clone(),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSnapshot {
    pub name: String,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub errors: u64,
}

/// Drain `rx` into `sink` until every sender is gone, then flush.
///
/// Blocks the calling thread; run it under `spawn_blocking` or on a plain
/// thread. A failed batch is logged and dropped and the loop carries on.
pub fn run_sink<T>(
    mut sink: Box<dyn Sink<T>>,
    mut rx: UnboundedReceiver<Arc<T>>,
    stats: Arc<SinkStats>,
) {
    let mut batch = Vec::with_capacity(MAX_BATCH);

    while let Some(item) = rx.blocking_recv() {
        batch.push(item);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }

        match sink.write_batch(&batch) {
            Ok(write) => {
                stats
                    .rows_written
                    .fetch_add(write.written as u64, Ordering::Relaxed);
                stats
                    .rows_skipped
                    .fetch_add(write.skipped as u64, Ordering::Relaxed);
                tracing::debug!(
                    "{}: wrote {} of {} items",
                    sink.name(),
                    write.written,
                    batch.len()
                );
            }
            Err(e) => {
                tracing::error!("{}: dropped batch of {}: {}", sink.name(), batch.len(), e);
                stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        batch.clear();
    }

    if let Err(e) = sink.flush() {
        tracing::error!("{}: final flush failed: {}", sink.name(), e);
        stats.errors.fetch_add(1, Ordering::Relaxed);
    }
    tracing::info!("{} sink drained", sink.name());
}
