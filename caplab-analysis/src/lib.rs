//! Protocol analysis for caplab capture artifacts
//!
//! The pipeline is three synchronous stages:
//!
//! 1. [`Extractor`] walks a pcap or pcapng artifact and yields one
//!    [`FieldRecord`](caplab_core::FieldRecord) per decodable frame, in capture order
//! 2. [`Aggregator`] folds the records into an [`AnalysisResult`] in a single pass
//! 3. [`report::format`] renders the result as plain text
//!
//! ```no_run
//! use caplab_analysis::{report, Aggregator, Extractor};
//! use caplab_capture::ArtifactStore;
//! use caplab_core::Projection;
//!
//! # fn run() -> caplab_core::Result<()> {
//! let artifact = ArtifactStore::default().open("/tmp/capture.pcap")?;
//! let mut records = Extractor::new().extract(&artifact, Projection::all())?;
//! let result = Aggregator::new(10).aggregate(records.by_ref());
//! let result = result.with_decode_loss(records.skipped());
//! print!("{}", report::format(&result, &[]));
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod decode;
pub mod extract;
pub mod report;

pub use aggregate::{aggregate, AnalysisResult, Aggregator, Conversation, Ranked, SizeHistogram};
pub use decode::LinkType;
pub use extract::{extract, Extraction, Extractor};
