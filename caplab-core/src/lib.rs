//! caplab core library
//!
//! This crate provides the shared record types and the error taxonomy used
//! by the capture supervisor, the analyzer and the command-line driver.

pub mod error;
pub mod record;

// Re-export commonly used types
pub use error::{Error, Result};
pub use record::{FieldName, FieldRecord, Projection, STACK_SEPARATOR};
