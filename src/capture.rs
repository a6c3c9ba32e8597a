//! Raw datagram capture and replay.
//!
//! Every received frame is stored keyed by `(receipt_time, payload)`, with
//! the sender address as the non-key column. Replay reads a capture back in
//! receipt-time order and feeds it through the same fan-out as live traffic.
//! Since both durable sinks ignore rows they already hold, a capture can be
//! replayed any number of times, or alongside live traffic, and the stores
//! end up the same.

use crate::distributor::Distributor;
use crate::sink::{Sink, SinkError, SinkWrite};
use crate::storage::{read_rows, KeyedStore, Row, StorageError};
use crate::types::RawFrame;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Frames delivered between cooperative yields during replay.
const REPLAY_YIELD_EVERY: usize = 1024;

/// Persists raw frames with insert-if-absent semantics.
pub struct RawCaptureSink {
    store: KeyedStore,
}

impl RawCaptureSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Ok(Self {
            store: KeyedStore::open(path)?,
        })
    }

    pub fn store(&self) -> &KeyedStore {
        &self.store
    }
}

impl Sink<RawFrame> for RawCaptureSink {
    fn name(&self) -> &str {
        "raw"
    }

    fn write_batch(&mut self, frames: &[Arc<RawFrame>]) -> Result<SinkWrite, SinkError> {
        let rows: Vec<Row> = frames.iter().map(|f| frame_to_row(f)).collect();
        let outcome = self.store.insert_batch(&rows)?;
        Ok(SinkWrite {
            written: outcome.inserted,
            skipped: outcome.duplicates,
        })
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(self.store.sync()?)
    }
}

fn frame_to_row(frame: &RawFrame) -> Row {
    let mut aux = Vec::with_capacity(2 + frame.sender_host.len());
    aux.extend_from_slice(&frame.sender_port.to_le_bytes());
    aux.extend_from_slice(frame.sender_host.as_bytes());
    Row::new(frame.receipt_time, frame.payload.clone(), aux)
}

fn row_to_frame(row: Row) -> Result<RawFrame, StorageError> {
    let (port, host) = match row.aux.as_slice() {
        [lo, hi, host @ ..] => (u16::from_le_bytes([*lo, *hi]), host),
        _ => return Err(StorageError::InvalidFormat),
    };
    let host = std::str::from_utf8(host).map_err(|_| StorageError::InvalidFormat)?;
    Ok(RawFrame::new(row.receipt_time, host, port, row.key))
}

/// Read every frame of a capture store, oldest first.
pub fn load_capture<P: AsRef<Path>>(path: P) -> Result<Vec<RawFrame>, StorageError> {
    let mut frames = read_rows(path)?
        .into_iter()
        .map(row_to_frame)
        .collect::<Result<Vec<_>, _>>()?;
    frames.sort_by(|a, b| a.receipt_time.total_cmp(&b.receipt_time));
    Ok(frames)
}

/// Re-injects a prior capture into the live pipeline, once.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    path: PathBuf,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deliver every captured frame in receipt-time order. Stops early when
    /// `shutdown` is raised. Returns how many frames were delivered.
    pub async fn replay(
        &self,
        raw: &Distributor<RawFrame>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<usize, StorageError> {
        let path = self.path.clone();
        let frames = tokio::task::spawn_blocking(move || load_capture(path))
            .await
            .map_err(|e| StorageError::Io(io::Error::other(e)))??;

        tracing::info!(
            "Replaying {} frames from {}",
            frames.len(),
            self.path.display()
        );

        let total = frames.len();
        for (i, frame) in frames.into_iter().enumerate() {
            if *shutdown.borrow() {
                tracing::info!("Replay interrupted after {} of {} frames", i, total);
                return Ok(i);
            }
            raw.deliver(frame.replayed());
            if i % REPLAY_YIELD_EVERY == REPLAY_YIELD_EVERY - 1 {
                tokio::task::yield_now().await;
            }
        }

        Ok(total)
    }
}
