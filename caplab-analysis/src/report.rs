//! Plain-text report rendering
//!
//! [`format`] only reads its arguments, so the same result and samples
//! always render to the same bytes.

use caplab_core::FieldRecord;
use chrono::SecondsFormat;
use std::fmt::{self, Write};

use crate::aggregate::AnalysisResult;

const RULE_WIDTH: usize = 60;
const SECTION_WIDTH: usize = 30;
/// Widest bar drawn in the size histogram
const BAR_WIDTH: u64 = 40;

/// Render an analysis result and sample records as a UTF-8 report
pub fn format(result: &AnalysisResult, samples: &[FieldRecord]) -> String {
    let mut out = String::new();
    // writing into a String cannot fail
    let _ = render(&mut out, result, samples);
    out
}

fn render(out: &mut String, result: &AnalysisResult, samples: &[FieldRecord]) -> fmt::Result {
    writeln!(out, "{}", "=".repeat(RULE_WIDTH))?;
    writeln!(out, "CAPTURE ANALYSIS REPORT")?;
    writeln!(out, "{}", "=".repeat(RULE_WIDTH))?;
    writeln!(out)?;

    section(out, "SUMMARY")?;
    writeln!(out, "Total packets: {}", result.total_packets)?;
    writeln!(out, "Total bytes:   {}", result.total_bytes)?;
    if result.total_packets > 0 {
        writeln!(
            out,
            "Frame length:  min {} / mean {:.1} / max {} bytes",
            result.min_length, result.mean_length, result.max_length
        )?;
    }
    if let (Some(first), Some(last)) = (result.first_timestamp, result.last_timestamp) {
        writeln!(out, "First packet:  {}", first.to_rfc3339_opts(SecondsFormat::Micros, true))?;
        writeln!(out, "Last packet:   {}", last.to_rfc3339_opts(SecondsFormat::Micros, true))?;
        writeln!(out, "Duration:      {:.3}s", result.duration_secs())?;
    }
    writeln!(out)?;

    section(out, "PROTOCOL HIERARCHY")?;
    if result.protocols.is_empty() {
        writeln!(out, "(none)")?;
    }
    for protocol in &result.protocols {
        writeln!(
            out,
            "{:<24} {:>8} packets ({:>5.1}%)",
            protocol.key,
            protocol.count,
            result.percentage(protocol.count)
        )?;
    }
    writeln!(out)?;

    section(out, "TOP TALKERS")?;
    if result.top_talkers.is_empty() {
        writeln!(out, "(none)")?;
    }
    for talker in &result.top_talkers {
        writeln!(out, "{:<39} {:>8} packets", talker.key, talker.count)?;
    }
    writeln!(out)?;

    section(out, "CONVERSATIONS")?;
    if result.conversations.is_empty() {
        writeln!(out, "(none)")?;
    }
    for conversation in &result.conversations {
        writeln!(
            out,
            "{} <-> {}  {} packets, {} bytes",
            conversation.a, conversation.b, conversation.packets, conversation.bytes
        )?;
    }
    writeln!(out)?;

    section(out, "TOP PORTS")?;
    if result.top_ports.is_empty() {
        writeln!(out, "(none)")?;
    }
    for port in &result.top_ports {
        writeln!(out, "Port {:<5} {:>8} packets", port.key, port.count)?;
    }
    writeln!(out)?;

    if !result.tcp_flags.is_empty() {
        section(out, "TCP FLAGS")?;
        for flag in &result.tcp_flags {
            writeln!(out, "{:<5} {:>8}", flag.key, flag.count)?;
        }
        writeln!(out)?;
    }

    section(out, "PACKET SIZES")?;
    let histogram = &result.size_histogram;
    let peak = histogram.counts().iter().copied().max().unwrap_or(0);
    for (index, count) in histogram.counts().iter().enumerate() {
        if *count == 0 {
            continue;
        }
        let bar = if peak == 0 { 0 } else { (count * BAR_WIDTH).div_ceil(peak) };
        writeln!(
            out,
            "{:>11} {:>8} {}",
            histogram.label(index),
            count,
            "#".repeat(bar as usize)
        )?;
    }
    writeln!(out)?;

    section(out, "ANOMALIES")?;
    if result.anomalies.is_empty() {
        writeln!(out, "No significant anomalies detected")?;
    }
    for anomaly in &result.anomalies {
        writeln!(out, "* {}", anomaly)?;
    }
    writeln!(out)?;

    section(out, "DECODE LOSS")?;
    if result.decode_loss == 0 {
        writeln!(out, "No frames skipped")?;
    } else {
        writeln!(out, "{} malformed or truncated frame(s) skipped", result.decode_loss)?;
    }

    if !samples.is_empty() {
        writeln!(out)?;
        section(out, "SAMPLE PACKETS")?;
        for record in samples {
            sample(out, record)?;
        }
    }

    Ok(())
}

fn section(out: &mut String, title: &str) -> fmt::Result {
    writeln!(out, "{}", title)?;
    writeln!(out, "{}", "-".repeat(SECTION_WIDTH))
}

fn endpoint(address: &str, port: Option<u16>) -> String {
    let address = if address.is_empty() { "?" } else { address };
    match port {
        Some(port) if address.contains(':') => format!("[{}]:{}", address, port),
        Some(port) => format!("{}:{}", address, port),
        None => address.to_string(),
    }
}

fn sample(out: &mut String, record: &FieldRecord) -> fmt::Result {
    write!(
        out,
        "#{:<5} {} {} -> {} {} {} bytes",
        record.sequence,
        record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        endpoint(&record.source, record.source_port),
        endpoint(&record.destination, record.destination_port),
        record.stack_label(),
        record.length
    )?;
    for (key, value) in &record.flags {
        write!(out, " {}={}", key, value)?;
    }
    writeln!(out)
}
