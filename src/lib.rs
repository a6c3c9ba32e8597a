//! AIS datagram collector library.
//!
//! This library provides functionality to:
//! - Validate and parse AIVDM/AIVDO NMEA sentences
//! - Reassemble multipart messages and decode AIS bit payloads
//! - Capture raw datagrams and decoded records idempotently
//! - Replay captures through the live pipeline
//! - Export decimated per-vessel tracks as CSV or JSON lines
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │  Listener   │───▶│ Distributor │───▶│   Decode    │───▶│ Distributor │
//! │   (UDP)     │    │    (raw)    │    │  (Stage)    │    │  (decoded)  │
//! └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘
//!        ▲                  │                                     │
//! ┌─────────────┐    ┌─────────────┐              ┌───────────────┼───────────┐
//! │   Replay    │    │   Capture   │              ▼               ▼           ▼
//! │  (Source)   │    │   (Store)   │        ┌──────────┐   ┌──────────┐ ┌──────────┐
//! └─────────────┘    └─────────────┘        │ Archive  │   │   CSV    │ │   JSON   │
//!                                           └──────────┘   └──────────┘ └──────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use shipgaze::{
//!     export::{ExportConfig, ExportFormat},
//!     pipeline::PipelineBuilder,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = PipelineBuilder::new()
//!         .raw_store("data/raw.store")
//!         .decoded_store("data/decoded.store")
//!         .export(ExportConfig::new("data/sparse.csv", ExportFormat::Csv))
//!         .build()?;
//!
//!     // Run until Ctrl+C
//!     pipeline
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod ais;
pub mod archive;
pub mod assembler;
pub mod capture;
pub mod decode;
pub mod distributor;
pub mod export;
pub mod listener;
pub mod pipeline;
pub mod protocol;
pub mod sink;
pub mod storage;
pub mod types;

pub use ais::{AisDecoder, BitDecoder};
pub use archive::DecodedPersistSink;
pub use assembler::PartialAssembler;
pub use capture::{RawCaptureSink, ReplaySource};
pub use decode::DecodeStage;
pub use distributor::Distributor;
pub use export::{ExportConfig, ExportFormat, SparseExportSink};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineConfig, PipelineStats};
pub use protocol::{parse_sentence, Sentence};
pub use sink::Sink;
pub use storage::KeyedStore;
pub use types::{AisFields, DecodedRecord, FrameOrigin, Mmsi, RawFrame};
