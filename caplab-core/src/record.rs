//! Decoded packet records

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Separator used when joining a protocol stack into one label
pub const STACK_SEPARATOR: &str = ":";

/// One decoded packet projected onto a fixed schema
///
/// Records are produced in capture order and never modified afterwards.
/// Fields that were not requested in the extraction projection keep their
/// zero value (empty string, `None`, epoch timestamp, empty collections).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldRecord {
    /// 1-based position of the frame in the capture, counting skipped frames
    pub sequence: u64,
    /// When the frame was captured
    pub timestamp: DateTime<Utc>,
    /// Network-layer source (IP, or MAC for non-IP frames)
    pub source: String,
    /// Network-layer destination (IP, or MAC for non-IP frames)
    pub destination: String,
    /// Transport source port, absent for non-transport protocols
    pub source_port: Option<u16>,
    /// Transport destination port, absent for non-transport protocols
    pub destination_port: Option<u16>,
    /// Protocol stack, outermost first (e.g. `eth`, `ip`, `tcp`, `http`)
    pub protocols: Vec<String>,
    /// Frame length on the wire, in bytes
    pub length: u32,
    /// Protocol-specific flags such as `tcp.flags` or `dns.response`
    pub flags: BTreeMap<String, String>,
}

impl FieldRecord {
    /// Create an empty record for the given sequence number
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            ..Self::default()
        }
    }

    /// Protocol stack joined into a single hierarchy label (`eth:ip:tcp`)
    pub fn stack_label(&self) -> String {
        self.protocols.join(STACK_SEPARATOR)
    }

    /// Innermost protocol of the stack
    pub fn innermost(&self) -> Option<&str> {
        self.protocols.last().map(String::as_str)
    }

    /// Check whether the stack contains a protocol
    pub fn has_protocol(&self, name: &str) -> bool {
        self.protocols.iter().any(|p| p == name)
    }

    /// Look up a protocol flag
    pub fn flag(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(String::as_str)
    }
}

/// Field names that can be requested from the extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldName {
    Timestamp,
    Source,
    Destination,
    Ports,
    Protocols,
    Length,
    Flags,
}

impl FieldName {
    /// Every field, in schema order
    pub const ALL: [FieldName; 7] = [
        FieldName::Timestamp,
        FieldName::Source,
        FieldName::Destination,
        FieldName::Ports,
        FieldName::Protocols,
        FieldName::Length,
        FieldName::Flags,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Name used on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::Timestamp => "timestamp",
            FieldName::Source => "source",
            FieldName::Destination => "destination",
            FieldName::Ports => "ports",
            FieldName::Protocols => "protocols",
            FieldName::Length => "length",
            FieldName::Flags => "flags",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FieldName {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldName::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| crate::Error::invalid_request("projection", format!("unknown field '{}'", s)))
    }
}

/// Set of fields an extraction should populate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Projection(u8);

impl Projection {
    /// Project every field
    pub fn all() -> Self {
        Self::from_fields(&FieldName::ALL)
    }

    /// Project nothing but the sequence number
    pub fn none() -> Self {
        Self(0)
    }

    /// Build a projection from a list of field names
    pub fn from_fields(fields: &[FieldName]) -> Self {
        Self(fields.iter().fold(0, |acc, f| acc | f.bit()))
    }

    /// Check whether a field is requested
    #[inline]
    pub fn contains(&self, field: FieldName) -> bool {
        self.0 & field.bit() != 0
    }

    /// Add a field to the projection
    pub fn with(self, field: FieldName) -> Self {
        Self(self.0 | field.bit())
    }

    /// Requested fields in schema order
    pub fn fields(&self) -> Vec<FieldName> {
        FieldName::ALL
            .into_iter()
            .filter(|f| self.contains(*f))
            .collect()
    }
}

impl Default for Projection {
    fn default() -> Self {
        Self::all()
    }
}

impl From<&[FieldName]> for Projection {
    fn from(fields: &[FieldName]) -> Self {
        Self::from_fields(fields)
    }
}
