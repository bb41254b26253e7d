//! BPF (Berkeley Packet Filter) validation and filter builders
//!
//! The validator only checks structure. Whether an expression is valid BPF
//! is decided by the capture engine when it compiles the filter.

use caplab_core::{Error, Result};
use std::fmt;

/// Longest filter expression accepted
pub const MAX_FILTER_LEN: usize = 1024;

/// Characters that are never valid BPF and would be dangerous if the
/// expression ever reached a shell
const FORBIDDEN_CHARS: &[char] = &[';', '`', '$', '\'', '"', '{', '}'];

/// Validate and normalize a capture filter expression
///
/// Surrounding whitespace is trimmed and internal runs of whitespace are
/// collapsed to one space. A blank expression normalizes to the empty
/// string, meaning "capture everything".
pub fn validate(expression: &str) -> Result<String> {
    let normalized = expression.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalized.is_empty() {
        return Ok(String::new());
    }

    if normalized.len() > MAX_FILTER_LEN {
        return Err(Error::invalid_filter(
            truncate(&normalized),
            format!("expression longer than {} bytes", MAX_FILTER_LEN),
        ));
    }

    // split_whitespace already removed newlines and tabs, but other control
    // characters survive it
    if let Some(c) = expression.chars().find(|c| c.is_control() && !c.is_whitespace()) {
        return Err(Error::invalid_filter(
            truncate(&normalized),
            format!("control character U+{:04X}", c as u32),
        ));
    }
    if expression.contains(['\n', '\r']) {
        return Err(Error::invalid_filter(truncate(&normalized), "line break"));
    }

    if let Some(c) = normalized.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(Error::invalid_filter(
            truncate(&normalized),
            format!("forbidden character '{}'", c),
        ));
    }

    let mut depth: i32 = 0;
    for c in normalized.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::invalid_filter(
                        truncate(&normalized),
                        "unbalanced ')'",
                    ));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::invalid_filter(truncate(&normalized), "unclosed '('"));
    }

    Ok(normalized)
}

fn truncate(expression: &str) -> String {
    const SHOWN: usize = 64;
    match expression.char_indices().nth(SHOWN) {
        Some((idx, _)) => format!("{}...", &expression[..idx]),
        None => expression.to_string(),
    }
}

/// Named filters for the protocols the labs look at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterPreset {
    Icmp,
    Arp,
    Dns,
    Dhcp,
    Http,
    Tls,
    Ntp,
    Ssh,
    Tcp,
    Udp,
}

impl FilterPreset {
    /// Every preset
    pub const ALL: [FilterPreset; 10] = [
        FilterPreset::Icmp,
        FilterPreset::Arp,
        FilterPreset::Dns,
        FilterPreset::Dhcp,
        FilterPreset::Http,
        FilterPreset::Tls,
        FilterPreset::Ntp,
        FilterPreset::Ssh,
        FilterPreset::Tcp,
        FilterPreset::Udp,
    ];

    /// BPF expression for the preset
    pub fn expression(&self) -> String {
        match self {
            FilterPreset::Icmp => icmp_filter(),
            FilterPreset::Arp => arp_filter(),
            FilterPreset::Dns => dns_filter(),
            FilterPreset::Dhcp => dhcp_filter(),
            FilterPreset::Http => http_filter(),
            FilterPreset::Tls => tls_filter(),
            FilterPreset::Ntp => ntp_filter(),
            FilterPreset::Ssh => tcp_port_filter(22),
            FilterPreset::Tcp => tcp_filter(),
            FilterPreset::Udp => udp_filter(),
        }
    }

    /// Lowercase preset name
    pub fn name(&self) -> &'static str {
        match self {
            FilterPreset::Icmp => "icmp",
            FilterPreset::Arp => "arp",
            FilterPreset::Dns => "dns",
            FilterPreset::Dhcp => "dhcp",
            FilterPreset::Http => "http",
            FilterPreset::Tls => "tls",
            FilterPreset::Ntp => "ntp",
            FilterPreset::Ssh => "ssh",
            FilterPreset::Tcp => "tcp",
            FilterPreset::Udp => "udp",
        }
    }
}

impl fmt::Display for FilterPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for FilterPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FilterPreset::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::invalid_filter(s, "unknown preset"))
    }
}

/// Combine an optional preset with a free-form expression and validate the result
pub fn compose(preset: Option<FilterPreset>, expression: &str) -> Result<String> {
    let custom = validate(expression)?;
    let combined = match (preset, custom.is_empty()) {
        (None, _) => custom,
        (Some(p), true) => p.expression(),
        (Some(p), false) => combine_filters(&[&p.expression(), &custom]),
    };
    validate(&combined)
}

/// ICMP filter
pub fn icmp_filter() -> String {
    "icmp".to_string()
}

/// ARP filter
pub fn arp_filter() -> String {
    "arp".to_string()
}

/// DNS filter (UDP and TCP port 53)
pub fn dns_filter() -> String {
    "port 53".to_string()
}

/// DHCP filter (both client and server)
pub fn dhcp_filter() -> String {
    "(udp port 67 or udp port 68)".to_string()
}

/// HTTP filter
pub fn http_filter() -> String {
    "(tcp port 80 or tcp port 8080)".to_string()
}

/// TLS filter
pub fn tls_filter() -> String {
    "(tcp port 443 or tcp port 8443)".to_string()
}

/// NTP filter
pub fn ntp_filter() -> String {
    udp_port_filter(123)
}

/// TCP filter
pub fn tcp_filter() -> String {
    "tcp".to_string()
}

/// UDP filter
pub fn udp_filter() -> String {
    "udp".to_string()
}

/// Filter for specific source or destination host
pub fn host_filter(host: &str) -> String {
    format!("host {}", host)
}

/// Filter for specific TCP port (source or destination)
pub fn tcp_port_filter(port: u16) -> String {
    format!("tcp port {}", port)
}

/// Filter for specific UDP port (source or destination)
pub fn udp_port_filter(port: u16) -> String {
    format!("udp port {}", port)
}

/// Filter for port range
pub fn port_range_filter(start: u16, end: u16) -> String {
    format!("portrange {}-{}", start, end)
}

/// Combine multiple filters with AND logic
pub fn combine_filters(filters: &[&str]) -> String {
    join_filters(filters, " and ")
}

/// Combine multiple filters with OR logic
pub fn combine_filters_or(filters: &[&str]) -> String {
    join_filters(filters, " or ")
}

fn join_filters(filters: &[&str], op: &str) -> String {
    let parts: Vec<String> = filters
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .map(|f| format!("({})", f))
        .collect();
    parts.join(op)
}

/// Negate a filter
pub fn not_filter(filter: &str) -> String {
    format!("not ({})", filter)
}
