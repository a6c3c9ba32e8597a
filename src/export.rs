//! Decimated per-vessel position export (CSV or JSON lines).
//!
//! Each vessel is exported at most once per `min_interval` seconds of
//! receipt time. Records without a vessel id and a position are skipped.
//! Values are rounded for presentation: position to 6 decimals, speed to 1,
//! course to whole degrees.

use crate::sink::{Sink, SinkError, SinkWrite};
use crate::types::{DecodedRecord, Mmsi};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default minimum seconds between exports of one vessel.
pub const DEFAULT_MIN_INTERVAL_SECS: f64 = 60.0;

const CSV_HEADER: [&str; 6] = ["t", "mmsi", "latitude", "longitude", "sog", "cog"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    JsonLines,
}

impl ExportFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::JsonLines => "json",
        }
    }
}

/// Configuration for one export file.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub path: PathBuf,
    pub format: ExportFormat,
    pub min_interval_secs: f64,
}

impl ExportConfig {
    pub fn new(path: impl Into<PathBuf>, format: ExportFormat) -> Self {
        Self {
            path: path.into(),
            format,
            min_interval_secs: DEFAULT_MIN_INTERVAL_SECS,
        }
    }

    pub fn min_interval(mut self, secs: f64) -> Self {
        self.min_interval_secs = secs;
        self
    }
}

/// One exported sample. Field order is the JSON key order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SparseRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cog: Option<i64>,
    pub mmsi: Mmsi,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sog: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    pub x: f64,
    pub y: f64,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Per-vessel rate limiter.
#[derive(Debug)]
pub struct Decimator {
    min_interval: f64,
    last_export: HashMap<Mmsi, f64>,
}

impl Decimator {
    pub fn new(min_interval_secs: f64) -> Self {
        Self {
            min_interval: min_interval_secs,
            last_export: HashMap::new(),
        }
    }

    /// Returns the row to export and advances the vessel's marker, or
    /// `None` when the record is incomplete or its vessel was exported less
    /// than `min_interval` ago.
    pub fn admit(&mut self, record: &DecodedRecord) -> Option<SparseRow> {
        let row = self.pending(record)?;
        self.mark(row.mmsi, record.receipt_time);
        Some(row)
    }

    /// Like [`admit`](Self::admit) but leaves the marker where it is.
    pub fn pending(&self, record: &DecodedRecord) -> Option<SparseRow> {
        let fields = &record.fields;
        let (mmsi, x, y) = match (fields.mmsi, fields.x, fields.y) {
            (Some(mmsi), Some(x), Some(y)) => (mmsi, x, y),
            _ => return None,
        };

        let t = record.receipt_time;
        if let Some(&last) = self.last_export.get(&mmsi) {
            if last + self.min_interval > t {
                return None;
            }
        }

        Some(SparseRow {
            cog: fields.cog.map(|c| c.round() as i64),
            mmsi,
            sog: fields.sog.map(|s| round_to(s, 1)),
            t: fields.t.clone(),
            x: round_to(x, 6),
            y: round_to(y, 6),
        })
    }

    /// Record an export of `mmsi` at `t`. Returns the previous marker.
    pub fn mark(&mut self, mmsi: Mmsi, t: f64) -> Option<f64> {
        self.last_export.insert(mmsi, t)
    }

    /// Put back a marker returned by [`mark`](Self::mark).
    pub fn restore(&mut self, mmsi: Mmsi, previous: Option<f64>) {
        match previous {
            Some(t) => self.last_export.insert(mmsi, t),
            None => self.last_export.remove(&mmsi),
        };
    }

    /// Vessels exported at least once.
    pub fn vessels(&self) -> usize {
        self.last_export.len()
    }
}

enum ExportWriter {
    Csv(csv::Writer<File>),
    JsonLines(BufWriter<File>),
}

/// Writes decimated rows to a CSV or JSON-lines file, appending.
pub struct SparseExportSink {
    name: String,
    decimator: Decimator,
    writer: ExportWriter,
}

impl SparseExportSink {
    /// Open (or create) the export file. A CSV header is written only when
    /// the file is new or empty.
    pub fn open(config: &ExportConfig) -> Result<Self, SinkError> {
        let file = open_append(&config.path)?;
        let is_empty = file.metadata()?.len() == 0;

        let writer = match config.format {
            ExportFormat::Csv => {
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(file);
                if is_empty {
                    writer.write_record(CSV_HEADER)?;
                    writer.flush()?;
                }
                ExportWriter::Csv(writer)
            }
            ExportFormat::JsonLines => ExportWriter::JsonLines(BufWriter::new(file)),
        };

        tracing::info!(
            "Exporting {} to {} every {}s per vessel",
            config.format.name(),
            config.path.display(),
            config.min_interval_secs
        );

        Ok(Self {
            name: config.format.name().to_string(),
            decimator: Decimator::new(config.min_interval_secs),
            writer,
        })
    }

    fn write_row(&mut self, row: &SparseRow) -> Result<(), SinkError> {
        match &mut self.writer {
            ExportWriter::Csv(writer) => {
                writer.serialize((
                    row.t.as_deref(),
                    row.mmsi.raw(),
                    row.y,
                    row.x,
                    row.sog,
                    row.cog,
                ))?;
            }
            ExportWriter::JsonLines(writer) => {
                serde_json::to_writer(&mut *writer, row)?;
                writer.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    /// Write and flush every admitted record. Each marker moved is pushed to
    /// `undo` with its previous value.
    fn write_admitted(
        &mut self,
        records: &[Arc<DecodedRecord>],
        undo: &mut Vec<(Mmsi, Option<f64>)>,
    ) -> Result<SinkWrite, SinkError> {
        let mut write = SinkWrite::default();
        for record in records {
            let Some(row) = self.decimator.pending(record) else {
                write.skipped += 1;
                continue;
            };
            self.write_row(&row)?;
            undo.push((row.mmsi, self.decimator.mark(row.mmsi, record.receipt_time)));
            write.written += 1;
        }
        self.flush()?;
        Ok(write)
    }
}

impl Sink<DecodedRecord> for SparseExportSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_batch(&mut self, records: &[Arc<DecodedRecord>]) -> Result<SinkWrite, SinkError> {
        let mut undo = Vec::new();
        let result = self.write_admitted(records, &mut undo);
        if result.is_err() {
            // Vessels whose rows never reached the file stay eligible.
            for (mmsi, previous) in undo.into_iter().rev() {
                self.decimator.restore(mmsi, previous);
            }
        }
        result
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        match &mut self.writer {
            ExportWriter::Csv(writer) => writer.flush()?,
            ExportWriter::JsonLines(writer) => writer.flush()?,
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, SinkError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
