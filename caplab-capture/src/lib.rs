//! Capture session management for caplab
//!
//! This crate runs an external capture engine (tcpdump by default) as a
//! supervised OS process and hands its output file to the analyzer.
//!
//! ## Features
//!
//! - **Filter Validation**: structural checks and normalization of BPF expressions, plus presets
//! - **Requests**: immutable capture requests with explicit count/duration bounds
//! - **Supervision**: one controller task per session racing exit, timeout and cancellation
//! - **Escalation**: SIGTERM first, SIGKILL after a grace window, plus a safety ceiling
//! - **Artifacts**: validation of finished captures, with explicit deletion
//!
//! ## Example
//!
//! ```no_run
//! use caplab_capture::{
//!     ArtifactStore, CaptureRequest, CaptureSource, Supervisor, SupervisorConfig, TcpdumpEngine,
//! };
//! use std::time::Duration;
//!
//! # async fn run() -> caplab_core::Result<()> {
//! let supervisor = Supervisor::new(TcpdumpEngine::default(), SupervisorConfig::default());
//! let request = CaptureRequest::builder(CaptureSource::Interface("eth0".into()))
//!     .filter("icmp")
//!     .packet_count(5)
//!     .duration(Duration::from_secs(10))
//!     .build()?;
//!
//! let session = supervisor.start(request).await?;
//! let outcome = supervisor.wait(&session).await?;
//! let artifact = ArtifactStore::default().finalize(&session)?;
//! println!("{} -> {} bytes", outcome.state, artifact.size());
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod config;
pub mod engine;
pub mod filters;
pub mod interface;
pub mod request;
pub mod session;
pub mod state;
pub mod supervisor;

// Re-export main types
pub use artifact::{ArtifactStore, CaptureArtifact};
pub use config::SupervisorConfig;
pub use engine::{CaptureEngine, TcpdumpEngine};
pub use filters::FilterPreset;
pub use interface::{get_interface, interface_exists, list_interfaces, InterfaceInfo};
pub use request::{CaptureBound, CaptureRequest, CaptureRequestBuilder, CaptureSource};
pub use session::CaptureSession;
pub use state::{CaptureOutcome, SessionState, TerminalState};
pub use supervisor::Supervisor;
