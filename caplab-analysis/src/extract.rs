//! Protocol field extraction
//!
//! An [`Extraction`] is a lazy, forward-only iterator of [`FieldRecord`]s
//! in capture order. The artifact is only ever read, so calling
//! [`Extractor::extract`] again restarts from the first frame and yields
//! the same sequence.
//!
//! Malformed or truncated frames are skipped and counted; they never end
//! the extraction early on their own.

use caplab_capture::CaptureArtifact;
use caplab_core::{Error, FieldRecord, Projection, Result};
use chrono::{DateTime, Utc};
use pcap_parser::traits::{PcapNGPacketBlock, PcapReaderIterator};
use pcap_parser::{create_reader, Block, PcapBlockOwned, PcapError};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::decode::{self, Frame, LinkType};

/// Default read buffer; must hold the largest block in the file
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 20;

/// Opens artifacts for extraction
#[derive(Debug, Clone)]
pub struct Extractor {
    buffer_size: usize,
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Extractor {
    /// Create an extractor with the default buffer size
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(64 * 1024);
        self
    }

    /// Start extracting `artifact`, populating only the `projection` fields
    ///
    /// Fails with `UnreadableArtifact` when the file is not a pcap or pcapng
    /// capture, or when its link type cannot be decoded.
    pub fn extract(&self, artifact: &CaptureArtifact, projection: Projection) -> Result<Extraction> {
        self.extract_path(artifact.path(), projection)
    }

    pub(crate) fn extract_path(&self, path: &Path, projection: Projection) -> Result<Extraction> {
        let unreadable = |reason: String| Error::UnreadableArtifact {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| unreadable(e.to_string()))?;
        let reader = create_reader(self.buffer_size, file)
            .map_err(|e| unreadable(format!("unrecognized capture format ({:?})", e)))?;

        let mut extraction = Extraction {
            reader,
            path: path.to_path_buf(),
            projection,
            links: Links::default(),
            sequence: 0,
            skipped: 0,
            yielded: 0,
            finished: false,
        };
        extraction.read_file_header().map_err(unreadable)?;

        debug!(
            path = %path.display(),
            fields = ?projection.fields(),
            "Extraction started"
        );
        Ok(extraction)
    }
}

/// Extract `artifact` with a default [`Extractor`]
pub fn extract(artifact: &CaptureArtifact, projection: Projection) -> Result<Extraction> {
    Extractor::default().extract(artifact, projection)
}

/// Per-interface decoding parameters
#[derive(Debug, Clone, Copy)]
struct Interface {
    link: Option<LinkType>,
    code: i32,
    /// Timestamp units per second
    resolution: u64,
    /// Seconds added to every timestamp
    offset: i64,
}

#[derive(Debug, Default)]
struct Links {
    legacy: Option<Interface>,
    interfaces: Vec<Interface>,
}

enum Step {
    Header,
    Record(FieldRecord),
    Skipped(String),
}

/// Lazy sequence of records from one artifact
pub struct Extraction {
    reader: Box<dyn PcapReaderIterator + Send>,
    path: PathBuf,
    projection: Projection,
    links: Links,
    sequence: u64,
    skipped: u64,
    yielded: u64,
    finished: bool,
}

impl Extraction {
    /// Frames skipped so far because they could not be decoded
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Records yielded so far
    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    /// Artifact being read
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the legacy header or the first section header
    fn read_file_header(&mut self) -> std::result::Result<(), String> {
        let mut refilled = false;
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let is_header = matches!(
                        block,
                        PcapBlockOwned::LegacyHeader(_) | PcapBlockOwned::NG(Block::SectionHeader(_))
                    );
                    if is_header {
                        handle_block(&mut self.links, block, &mut self.sequence, self.projection);
                    }
                    self.reader.consume(offset);
                    if !is_header {
                        return Err("missing file header".to_string());
                    }
                    if let Some(legacy) = self.links.legacy {
                        if legacy.link.is_none() {
                            return Err(format!("unsupported link type {}", legacy.code));
                        }
                    }
                    return Ok(());
                }
                Err(PcapError::Incomplete { .. }) if !refilled => {
                    self.reader.refill().map_err(|e| format!("{:?}", e))?;
                    refilled = true;
                }
                Err(e) => return Err(format!("{:?}", e)),
            }
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            info!(
                path = %self.path.display(),
                records = self.yielded,
                skipped = self.skipped,
                "Extraction finished"
            );
        }
    }
}

impl Iterator for Extraction {
    type Item = FieldRecord;

    fn next(&mut self) -> Option<FieldRecord> {
        if self.finished {
            return None;
        }

        let mut refilled = false;
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let step = handle_block(&mut self.links, block, &mut self.sequence, self.projection);
                    self.reader.consume(offset);
                    refilled = false;

                    match step {
                        Step::Header => continue,
                        Step::Record(record) => {
                            self.yielded += 1;
                            return Some(record);
                        }
                        Step::Skipped(reason) => {
                            self.skipped += 1;
                            debug!(sequence = self.sequence, reason = %reason, "Skipping malformed frame");
                        }
                    }
                }
                Err(PcapError::Eof) => {
                    self.finish();
                    return None;
                }
                Err(PcapError::Incomplete { .. }) => {
                    if refilled {
                        // no more bytes will arrive: the last frame was cut short
                        self.sequence += 1;
                        self.skipped += 1;
                        warn!(
                            path = %self.path.display(),
                            sequence = self.sequence,
                            "Capture ends with a truncated frame"
                        );
                        self.finish();
                        return None;
                    }
                    if let Err(e) = self.reader.refill() {
                        warn!(path = %self.path.display(), error = ?e, "Read error, ending extraction");
                        self.finish();
                        return None;
                    }
                    refilled = true;
                }
                Err(e) => {
                    // the block structure is broken; nothing after it can be trusted
                    self.sequence += 1;
                    self.skipped += 1;
                    warn!(
                        path = %self.path.display(),
                        sequence = self.sequence,
                        error = ?e,
                        "Corrupt block, ending extraction"
                    );
                    self.finish();
                    return None;
                }
            }
        }
    }
}

impl std::fmt::Debug for Extraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extraction")
            .field("path", &self.path)
            .field("sequence", &self.sequence)
            .field("skipped", &self.skipped)
            .field("finished", &self.finished)
            .finish()
    }
}

fn handle_block(
    links: &mut Links,
    block: PcapBlockOwned<'_>,
    sequence: &mut u64,
    projection: Projection,
) -> Step {
    match block {
        PcapBlockOwned::LegacyHeader(header) => {
            let resolution = if header.is_nanosecond_precision() {
                1_000_000_000
            } else {
                1_000_000
            };
            links.legacy = Some(Interface {
                link: LinkType::from_code(header.network.0),
                code: header.network.0,
                resolution,
                offset: 0,
            });
            Step::Header
        }
        PcapBlockOwned::Legacy(packet) => {
            *sequence += 1;
            let Some(iface) = links.legacy else {
                return Step::Skipped("packet before file header".to_string());
            };
            let frame = Frame {
                data: packet.data,
                timestamp: timestamp(packet.ts_sec as u64 * iface.resolution + packet.ts_usec as u64, &iface),
                length: packet.origlen,
            };
            decode_frame(&iface, &frame, *sequence, projection)
        }
        PcapBlockOwned::NG(Block::SectionHeader(_)) => {
            links.interfaces.clear();
            Step::Header
        }
        PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
            links.interfaces.push(Interface {
                link: LinkType::from_code(idb.linktype.0),
                code: idb.linktype.0,
                resolution: resolution(idb.if_tsresol),
                offset: idb.if_tsoffset as i64,
            });
            Step::Header
        }
        PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
            *sequence += 1;
            let Some(iface) = links.interfaces.get(epb.if_id as usize).copied() else {
                return Step::Skipped(format!("unknown interface {}", epb.if_id));
            };
            let ticks = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
            let frame = Frame {
                data: epb.packet_data(),
                timestamp: timestamp(ticks, &iface),
                length: epb.orig_len(),
            };
            decode_frame(&iface, &frame, *sequence, projection)
        }
        PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
            *sequence += 1;
            let Some(iface) = links.interfaces.first().copied() else {
                return Step::Skipped("simple packet without interface".to_string());
            };
            let frame = Frame {
                data: spb.packet_data(),
                timestamp: DateTime::<Utc>::default(),
                length: spb.orig_len(),
            };
            decode_frame(&iface, &frame, *sequence, projection)
        }
        // statistics, name resolution and custom blocks carry no frames
        PcapBlockOwned::NG(_) => Step::Header,
    }
}

fn decode_frame(iface: &Interface, frame: &Frame<'_>, sequence: u64, projection: Projection) -> Step {
    let Some(link) = iface.link else {
        return Step::Skipped(format!("unsupported link type {}", iface.code));
    };
    match decode::decode(link, frame, sequence, projection) {
        Ok(record) => Step::Record(record),
        Err(reason) => Step::Skipped(reason),
    }
}

/// pcapng `if_tsresol`: power of ten, or power of two when the high bit is set
fn resolution(tsresol: u8) -> u64 {
    let exponent = u32::from(tsresol & 0x7f);
    let units = if tsresol & 0x80 != 0 {
        2u64.checked_pow(exponent)
    } else {
        10u64.checked_pow(exponent)
    };
    units.filter(|u| *u > 0).unwrap_or(1_000_000)
}

fn timestamp(ticks: u64, iface: &Interface) -> DateTime<Utc> {
    let secs = (ticks / iface.resolution) as i64 + iface.offset;
    let frac = ticks % iface.resolution;
    let nanos = (frac as u128 * 1_000_000_000 / iface.resolution as u128) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}
