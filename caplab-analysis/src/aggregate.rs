//! Statistics aggregation over extracted records

use caplab_core::FieldRecord;
use chrono::{DateTime, Utc};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use tracing::debug;

/// Default number of entries kept in ranked lists
pub const DEFAULT_TOP_N: usize = 10;
/// Default size histogram bucket width, in bytes
pub const DEFAULT_BUCKET_WIDTH: u32 = 64;
/// Default number of size histogram buckets
pub const DEFAULT_BUCKET_COUNT: usize = 24;

/// A counted key in a ranking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranked<K> {
    pub key: K,
    pub count: u64,
}

/// Traffic between two addresses, regardless of direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Lower address by string order
    pub a: String,
    /// Higher address by string order
    pub b: String,
    pub packets: u64,
    pub bytes: u64,
}

impl Conversation {
    /// Canonical unordered key for a pair of addresses
    pub fn key(x: &str, y: &str) -> (String, String) {
        if x <= y {
            (x.to_string(), y.to_string())
        } else {
            (y.to_string(), x.to_string())
        }
    }
}

/// Fixed-width frame length histogram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeHistogram {
    width: u32,
    counts: Vec<u64>,
}

impl SizeHistogram {
    /// Create an empty histogram; both arguments are at least 1
    pub fn new(width: u32, buckets: usize) -> Self {
        Self {
            width: width.max(1),
            counts: vec![0; buckets.max(1)],
        }
    }

    /// Count one frame; lengths past the last bucket land in it
    pub fn add(&mut self, length: u32) {
        let last = self.counts.len() - 1;
        let index = ((length / self.width) as usize).min(last);
        self.counts[index] += 1;
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Inclusive lower bound of a bucket
    pub fn lower_bound(&self, index: usize) -> u64 {
        index as u64 * u64::from(self.width)
    }

    /// Bucket label: `0-63`, ..., `>= 1472` for the open last bucket
    pub fn label(&self, index: usize) -> String {
        let low = self.lower_bound(index);
        if index + 1 >= self.counts.len() {
            format!(">= {}", low)
        } else {
            format!("{}-{}", low, low + u64::from(self.width) - 1)
        }
    }
}

/// Everything computed by one aggregation pass
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub min_length: u32,
    pub max_length: u32,
    pub mean_length: f64,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Protocol stack labels, most frequent first
    pub protocols: Vec<Ranked<String>>,
    /// Source addresses by packets sent, at most top-N
    pub top_talkers: Vec<Ranked<String>>,
    /// Conversations by packet count, at most top-N
    pub conversations: Vec<Conversation>,
    /// Transport ports by packets seen on either side, at most top-N
    pub top_ports: Vec<Ranked<u16>>,
    pub size_histogram: SizeHistogram,
    /// TCP flag names and how many segments carried each
    pub tcp_flags: Vec<Ranked<String>>,
    pub anomalies: Vec<String>,
    /// Frames skipped during extraction
    pub decode_loss: u64,
}

impl AnalysisResult {
    /// Packet count for one protocol stack label
    pub fn protocol_count(&self, label: &str) -> u64 {
        self.protocols
            .iter()
            .find(|p| p.key == label)
            .map_or(0, |p| p.count)
    }

    /// Conversation between two addresses, in either direction
    pub fn conversation(&self, x: &str, y: &str) -> Option<&Conversation> {
        let (a, b) = Conversation::key(x, y);
        self.conversations.iter().find(|c| c.a == a && c.b == b)
    }

    /// Seconds between the first and last frame
    pub fn duration_secs(&self) -> f64 {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => (last - first).num_microseconds().unwrap_or(0) as f64 / 1e6,
            _ => 0.0,
        }
    }

    /// Share of all packets, in percent
    pub fn percentage(&self, count: u64) -> f64 {
        if self.total_packets == 0 {
            0.0
        } else {
            count as f64 * 100.0 / self.total_packets as f64
        }
    }

    /// Record the number of frames the extractor skipped
    pub fn with_decode_loss(mut self, skipped: u64) -> Self {
        self.decode_loss = skipped;
        self
    }
}

/// Counter that remembers first-seen order for tie-breaking
#[derive(Debug)]
struct OrderedCounter<K> {
    index: HashMap<K, usize>,
    entries: Vec<(K, u64)>,
}

impl<K> Default for OrderedCounter<K> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }
}

impl<K: Hash + Eq + Clone> OrderedCounter<K> {
    fn add(&mut self, key: &K) -> usize {
        let slot = match self.index.get(key) {
            Some(slot) => *slot,
            None => {
                self.entries.push((key.clone(), 0));
                self.index.insert(key.clone(), self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        self.entries[slot].1 += 1;
        slot
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Highest counts first; equal counts keep first-seen order
    fn ranked(self, limit: Option<usize>) -> Vec<Ranked<K>> {
        let mut entries = self.entries;
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, count)| Ranked { key, count })
            .collect()
    }
}

/// Single-pass statistics aggregator
#[derive(Debug, Clone)]
pub struct Aggregator {
    top_n: usize,
    bucket_width: u32,
    bucket_count: usize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            top_n: DEFAULT_TOP_N,
            bucket_width: DEFAULT_BUCKET_WIDTH,
            bucket_count: DEFAULT_BUCKET_COUNT,
        }
    }
}

impl Aggregator {
    /// Create an aggregator keeping `top_n` entries per ranking
    pub fn new(top_n: usize) -> Self {
        Self {
            top_n,
            ..Self::default()
        }
    }

    /// Set the size histogram layout
    pub fn with_buckets(mut self, width: u32, count: usize) -> Self {
        self.bucket_width = width.max(1);
        self.bucket_count = count.max(1);
        self
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }

    /// Aggregate records in capture order
    pub fn aggregate<I>(&self, records: I) -> AnalysisResult
    where
        I: IntoIterator,
        I::Item: Borrow<FieldRecord>,
    {
        let mut total_packets = 0u64;
        let mut total_bytes = 0u64;
        let mut min_length = u32::MAX;
        let mut max_length = 0u32;
        let mut first_timestamp: Option<DateTime<Utc>> = None;
        let mut last_timestamp: Option<DateTime<Utc>> = None;

        let mut protocols = OrderedCounter::<String>::default();
        let mut talkers = OrderedCounter::<String>::default();
        let mut conversations = OrderedCounter::<(String, String)>::default();
        let mut conversation_bytes: Vec<u64> = Vec::new();
        let mut ports = OrderedCounter::<u16>::default();
        let mut tcp_flags = OrderedCounter::<String>::default();
        let mut lengths: HashMap<u32, u64> = HashMap::new();
        let mut histogram = SizeHistogram::new(self.bucket_width, self.bucket_count);
        let mut rst_packets = 0u64;

        for record in records {
            let record = record.borrow();

            total_packets += 1;
            total_bytes += u64::from(record.length);
            min_length = min_length.min(record.length);
            max_length = max_length.max(record.length);
            *lengths.entry(record.length).or_insert(0) += 1;
            histogram.add(record.length);

            first_timestamp = Some(first_timestamp.map_or(record.timestamp, |t| t.min(record.timestamp)));
            last_timestamp = Some(last_timestamp.map_or(record.timestamp, |t| t.max(record.timestamp)));

            if !record.protocols.is_empty() {
                protocols.add(&record.stack_label());
            }

            if !record.source.is_empty() {
                talkers.add(&record.source);
            }

            if !record.source.is_empty() && !record.destination.is_empty() {
                let slot = conversations.add(&Conversation::key(&record.source, &record.destination));
                if slot == conversation_bytes.len() {
                    conversation_bytes.push(0);
                }
                conversation_bytes[slot] += u64::from(record.length);
            }

            for port in [record.source_port, record.destination_port].into_iter().flatten() {
                ports.add(&port);
            }

            if let Some(flags) = record.flag("tcp.flags") {
                for flag in flags.split(',').filter(|f| !f.is_empty()) {
                    tcp_flags.add(&flag.to_string());
                }
                if flags.split(',').any(|f| f == "RST") {
                    rst_packets += 1;
                }
            }
        }

        let mean_length = if total_packets == 0 {
            0.0
        } else {
            total_bytes as f64 / total_packets as f64
        };
        if total_packets == 0 {
            min_length = 0;
        }

        let mut conversation_list: Vec<Conversation> = conversations
            .entries
            .into_iter()
            .zip(conversation_bytes)
            .map(|(((a, b), packets), bytes)| Conversation { a, b, packets, bytes })
            .collect();
        conversation_list.sort_by(|x, y| y.packets.cmp(&x.packets));
        conversation_list.truncate(self.top_n);

        let large_packets: u64 = lengths
            .iter()
            .filter(|(length, _)| f64::from(**length) > mean_length * 2.0)
            .map(|(_, count)| *count)
            .sum();

        debug!(
            packets = total_packets,
            protocols = protocols.len(),
            talkers = talkers.len(),
            ports = ports.len(),
            "Aggregation finished"
        );

        let top_ports = ports.ranked(Some(self.top_n));
        let anomalies = anomalies(total_packets, rst_packets, top_ports.first(), large_packets);

        AnalysisResult {
            total_packets,
            total_bytes,
            min_length,
            max_length,
            mean_length,
            first_timestamp,
            last_timestamp,
            protocols: protocols.ranked(None),
            top_talkers: talkers.ranked(Some(self.top_n)),
            conversations: conversation_list,
            top_ports,
            size_histogram: histogram,
            tcp_flags: tcp_flags.ranked(None),
            anomalies,
            decode_loss: 0,
        }
    }
}

/// Aggregate with default histogram settings
pub fn aggregate<I>(records: I, top_n: usize) -> AnalysisResult
where
    I: IntoIterator,
    I::Item: Borrow<FieldRecord>,
{
    Aggregator::new(top_n).aggregate(records)
}

fn anomalies(total: u64, rst_packets: u64, top_port: Option<&Ranked<u16>>, large_packets: u64) -> Vec<String> {
    let mut notes = Vec::new();
    if total == 0 {
        return notes;
    }

    if rst_packets * 10 > total {
        notes.push(format!("High number of RST packets: {}", rst_packets));
    }
    if let Some(port) = top_port {
        if port.count * 2 > total {
            notes.push(format!(
                "Concentrated traffic on port {}: {} packets",
                port.key, port.count
            ));
        }
    }
    if large_packets > 0 {
        notes.push(format!("Unusually large packets detected: {}", large_packets));
    }
    notes
}
