//! Durable archive of decoded records.
//!
//! Rows are keyed by `(receipt_time, decoded JSON)`; the vessel id is kept
//! alongside as a nullable column. Decoding the same frame twice produces
//! the same JSON, so overlapping replays never add rows.

use crate::sink::{Sink, SinkError, SinkWrite};
use crate::storage::{read_rows, KeyedStore, Row, StorageError};
use crate::types::{DecodedRecord, Mmsi};
use std::path::Path;
use std::sync::Arc;

const NO_VESSEL: u8 = 0;
const HAS_VESSEL: u8 = 1;

/// One archived row.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedRecord {
    pub receipt_time: f64,
    pub vessel_id: Option<Mmsi>,
    pub json: String,
}

impl ArchivedRecord {
    fn from_row(row: Row) -> Result<Self, StorageError> {
        let vessel_id = match row.aux.as_slice() {
            [NO_VESSEL] => None,
            [HAS_VESSEL, id @ ..] => {
                let id = std::str::from_utf8(id)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(StorageError::InvalidFormat)?;
                Some(Mmsi::new(id))
            }
            _ => return Err(StorageError::InvalidFormat),
        };
        let json = String::from_utf8(row.key).map_err(|_| StorageError::InvalidFormat)?;
        Ok(Self {
            receipt_time: row.receipt_time,
            vessel_id,
            json,
        })
    }
}

/// Persists decoded records with insert-if-absent semantics.
pub struct DecodedPersistSink {
    store: KeyedStore,
}

impl DecodedPersistSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Ok(Self {
            store: KeyedStore::open(path)?,
        })
    }

    pub fn store(&self) -> &KeyedStore {
        &self.store
    }
}

impl Sink<DecodedRecord> for DecodedPersistSink {
    fn name(&self) -> &str {
        "db"
    }

    fn write_batch(&mut self, records: &[Arc<DecodedRecord>]) -> Result<SinkWrite, SinkError> {
        let rows = records
            .iter()
            .map(|record| -> Result<Row, serde_json::Error> {
                let aux = match record.vessel_id() {
                    Some(id) => {
                        let mut aux = vec![HAS_VESSEL];
                        aux.extend_from_slice(id.to_string().as_bytes());
                        aux
                    }
                    None => vec![NO_VESSEL],
                };
                Ok(Row::new(record.receipt_time, record.to_json()?, aux))
            })
            .collect::<Result<Vec<_>, _>>()?;

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

/// Read an archive back in file order.
pub fn load_archive<P: AsRef<Path>>(path: P) -> Result<Vec<ArchivedRecord>, StorageError> {
    read_rows(path)?
        .into_iter()
        .map(ArchivedRecord::from_row)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AisFields;
    use tempfile::tempdir;

    fn record(t: f64, mmsi: Option<u32>) -> Arc<DecodedRecord> {
        Arc::new(DecodedRecord {
            receipt_time: t,
            fields: AisFields {
                id: Some(1),
                mmsi: mmsi.map(Mmsi::new),
                x: Some(-91.5),
                y: Some(28.9),
                ..Default::default()
            },
        })
    }

    #[test]
    fn test_duplicate_decodes_are_ignored() {
        let dir = tempdir().unwrap();
        let mut sink = DecodedPersistSink::open(dir.path().join("db")).unwrap();
        let batch = vec![record(1.0, Some(123_456_789)), record(2.0, None)];

        assert_eq!(sink.write_batch(&batch).unwrap().written, 2);
        for _ in 0..4 {
            assert_eq!(
                sink.write_batch(&batch).unwrap(),
                SinkWrite { written: 0, skipped: 2 }
            );
        }
        assert_eq!(sink.store().stats().row_count, 2);
    }

    #[test]
    fn test_archive_round_trips_vessel_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let mut sink = DecodedPersistSink::open(&path).unwrap();
            sink.write_batch(&[record(5.0, Some(211_222_333)), record(6.0, None)])
                .unwrap();
            sink.flush().unwrap();
        }

        let archived = load_archive(&path).unwrap();
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[0].receipt_time, 5.0);
        assert_eq!(archived[0].vessel_id, Some(Mmsi::new(211_222_333)));
        assert_eq!(
            archived[0].json,
            r#"{"id":1,"mmsi":211222333,"x":-91.5,"y":28.9}"#
        );
        assert_eq!(archived[1].vessel_id, None);
    }
}
