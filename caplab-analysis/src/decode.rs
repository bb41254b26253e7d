//! Frame decoding
//!
//! Turns one captured frame into a [`FieldRecord`]. Header slicing is
//! delegated to etherparse; this module only strips link headers it does
//! not handle, labels the stack and projects the requested fields.

use caplab_core::{FieldName, FieldRecord, Projection};
use chrono::{DateTime, Utc};
use etherparse::{
    EtherType, Ethernet2HeaderSlice, LaxNetSlice, LaxSlicedPacket, NetSlice, SlicedPacket,
    TransportSlice,
};
use std::fmt::Write;
use std::net::{Ipv4Addr, Ipv6Addr};

const ETHERTYPE_ARP: u16 = 0x0806;

/// Link-layer framing of the frames in a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II
    Ethernet,
    /// Bare IPv4/IPv6, no link header
    RawIp,
    /// BSD loopback, 4-byte address family header
    Null,
    /// Linux cooked capture v1 (16-byte header)
    LinuxSll,
    /// Linux cooked capture v2 (20-byte header), used by `-i any`
    LinuxSll2,
}

impl LinkType {
    /// Map a pcap LINKTYPE_/DLT_ value
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(LinkType::Ethernet),
            // LINKTYPE_RAW, DLT_RAW variants, LINKTYPE_IPV4, LINKTYPE_IPV6
            101 | 12 | 14 | 228 | 229 => Some(LinkType::RawIp),
            // LINKTYPE_NULL, LINKTYPE_LOOP
            0 | 108 => Some(LinkType::Null),
            113 => Some(LinkType::LinuxSll),
            276 => Some(LinkType::LinuxSll2),
            _ => None,
        }
    }

    fn label(&self) -> Option<&'static str> {
        match self {
            LinkType::Ethernet => Some("eth"),
            LinkType::RawIp => None,
            LinkType::Null => Some("null"),
            LinkType::LinuxSll | LinkType::LinuxSll2 => Some("sll"),
        }
    }
}

/// A captured frame borrowed from the reader's buffer
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub timestamp: DateTime<Utc>,
    /// Length on the wire, which can exceed `data.len()` for truncated captures
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addr {
    None,
    Mac([u8; 6]),
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl Addr {
    fn render(&self) -> String {
        match self {
            Addr::None => String::new(),
            Addr::Mac(mac) => format_mac(mac),
            Addr::V4(ip) => ip.to_string(),
            Addr::V6(ip) => ip.to_string(),
        }
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    let mut s = String::with_capacity(17);
    for (i, b) in mac.iter().enumerate() {
        if i > 0 {
            s.push(':');
        }
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Intermediate view of a frame before projection
#[derive(Debug, Default)]
struct Layers {
    stack: Vec<&'static str>,
    source: Option<Addr>,
    destination: Option<Addr>,
    ports: Option<(u16, u16)>,
    flags: Vec<(&'static str, String)>,
}

impl Layers {
    fn addresses(&mut self, source: Addr, destination: Addr) {
        self.source = Some(source);
        self.destination = Some(destination);
    }
}

/// Decode one frame
///
/// Returns the reason when the frame is malformed.
pub fn decode(
    link: LinkType,
    frame: &Frame<'_>,
    sequence: u64,
    projection: Projection,
) -> Result<FieldRecord, String> {
    let want_flags = projection.contains(FieldName::Flags);
    let mut layers = Layers::default();
    layers.stack.extend(link.label());

    let (ether_type, payload) = match link {
        LinkType::Ethernet => {
            let eth = Ethernet2HeaderSlice::from_slice(frame.data).map_err(|e| e.to_string())?;
            layers.addresses(Addr::Mac(eth.source()), Addr::Mac(eth.destination()));
            (Some(eth.ether_type().0), &frame.data[eth.slice().len()..])
        }
        LinkType::LinuxSll => {
            let header = frame.data.get(..16).ok_or("truncated cooked header")?;
            (Some(u16::from_be_bytes([header[14], header[15]])), &frame.data[16..])
        }
        LinkType::LinuxSll2 => {
            let header = frame.data.get(..20).ok_or("truncated cooked header")?;
            (Some(u16::from_be_bytes([header[0], header[1]])), &frame.data[20..])
        }
        LinkType::Null => {
            frame.data.get(..4).ok_or("truncated loopback header")?;
            (None, &frame.data[4..])
        }
        LinkType::RawIp => (None, frame.data),
    };

    if ether_type == Some(ETHERTYPE_ARP) {
        decode_arp(payload, &mut layers, want_flags)?;
        return Ok(project(layers, frame, sequence, projection));
    }

    let (net, transport) = match slice(link, ether_type, frame.data, payload) {
        Ok(sliced) => (network(sliced.net.as_ref()), sliced.transport),
        // cut short by the snapshot length: keep the headers that made it
        Err(e) if (frame.data.len() as u64) < u64::from(frame.length) => {
            let lax = slice_lax(link, ether_type, frame.data, payload)?;
            let net = lax_network(lax.net.as_ref()).ok_or(e)?;
            (Some(net), lax.transport)
        }
        Err(e) => return Err(e),
    };

    if let Some((label, source, destination)) = net {
        layers.stack.push(label);
        layers.addresses(source, destination);
    }

    match &transport {
        Some(TransportSlice::Tcp(tcp)) => {
            layers.stack.push("tcp");
            let ports = (tcp.source_port(), tcp.destination_port());
            layers.ports = Some(ports);
            if want_flags {
                let names = tcp_flag_names(&[
                    ("SYN", tcp.syn()),
                    ("FIN", tcp.fin()),
                    ("RST", tcp.rst()),
                    ("PSH", tcp.psh()),
                    ("ACK", tcp.ack()),
                    ("URG", tcp.urg()),
                    ("ECE", tcp.ece()),
                    ("CWR", tcp.cwr()),
                ]);
                if !names.is_empty() {
                    layers.flags.push(("tcp.flags", names));
                }
            }
            application(&mut layers, ports, tcp.payload(), 2, want_flags);
        }
        Some(TransportSlice::Udp(udp)) => {
            layers.stack.push("udp");
            let ports = (udp.source_port(), udp.destination_port());
            layers.ports = Some(ports);
            application(&mut layers, ports, udp.payload(), 0, want_flags);
        }
        Some(TransportSlice::Icmpv4(icmp)) => {
            layers.stack.push("icmp");
            if want_flags {
                layers.flags.push(("icmp.type", icmp.type_u8().to_string()));
                layers.flags.push(("icmp.code", icmp.code_u8().to_string()));
            }
        }
        Some(TransportSlice::Icmpv6(icmp)) => {
            layers.stack.push("icmpv6");
            if want_flags {
                layers.flags.push(("icmp.type", icmp.type_u8().to_string()));
                layers.flags.push(("icmp.code", icmp.code_u8().to_string()));
            }
        }
        _ => {}
    }

    Ok(project(layers, frame, sequence, projection))
}

fn slice<'a>(
    link: LinkType,
    ether_type: Option<u16>,
    data: &'a [u8],
    payload: &'a [u8],
) -> Result<SlicedPacket<'a>, String> {
    match (link, ether_type) {
        (LinkType::Ethernet, _) => SlicedPacket::from_ethernet(data),
        (_, Some(ether_type)) => SlicedPacket::from_ether_type(EtherType(ether_type), payload),
        (_, None) => SlicedPacket::from_ip(payload),
    }
    .map_err(|e| e.to_string())
}

/// Slice a frame whose lengths point past the captured bytes
fn slice_lax<'a>(
    link: LinkType,
    ether_type: Option<u16>,
    data: &'a [u8],
    payload: &'a [u8],
) -> Result<LaxSlicedPacket<'a>, String> {
    match (link, ether_type) {
        (LinkType::Ethernet, _) => LaxSlicedPacket::from_ethernet(data).map_err(|e| format!("{:?}", e)),
        (_, Some(ether_type)) => Ok(LaxSlicedPacket::from_ether_type(EtherType(ether_type), payload)),
        (_, None) => LaxSlicedPacket::from_ip(payload).map_err(|e| format!("{:?}", e)),
    }
}

type Network = (&'static str, Addr, Addr);

fn network(net: Option<&NetSlice<'_>>) -> Option<Network> {
    match net? {
        NetSlice::Ipv4(ip) => {
            let header = ip.header();
            Some(("ip", Addr::V4(header.source_addr()), Addr::V4(header.destination_addr())))
        }
        NetSlice::Ipv6(ip) => {
            let header = ip.header();
            Some(("ipv6", Addr::V6(header.source_addr()), Addr::V6(header.destination_addr())))
        }
        _ => None,
    }
}

fn lax_network(net: Option<&LaxNetSlice<'_>>) -> Option<Network> {
    match net? {
        LaxNetSlice::Ipv4(ip) => {
            let header = ip.header();
            Some(("ip", Addr::V4(header.source_addr()), Addr::V4(header.destination_addr())))
        }
        LaxNetSlice::Ipv6(ip) => {
            let header = ip.header();
            Some(("ipv6", Addr::V6(header.source_addr()), Addr::V6(header.destination_addr())))
        }
        _ => None,
    }
}

fn decode_arp(payload: &[u8], layers: &mut Layers, want_flags: bool) -> Result<(), String> {
    // htype(2) ptype(2) hlen(1) plen(1) oper(2) sha spa tha tpa
    let fixed = payload.get(..8).ok_or("truncated ARP header")?;
    let hlen = fixed[4] as usize;
    let plen = fixed[5] as usize;
    let body = payload
        .get(8..8 + 2 * (hlen + plen))
        .ok_or("truncated ARP addresses")?;

    layers.stack.push("arp");
    if hlen == 6 {
        let mut sha = [0u8; 6];
        let mut tha = [0u8; 6];
        sha.copy_from_slice(&body[..6]);
        tha.copy_from_slice(&body[6 + plen..12 + plen]);
        layers.addresses(Addr::Mac(sha), Addr::Mac(tha));
    }
    if want_flags {
        let opcode = match u16::from_be_bytes([fixed[6], fixed[7]]) {
            1 => "request".to_string(),
            2 => "reply".to_string(),
            other => other.to_string(),
        };
        layers.flags.push(("arp.opcode", opcode));
    }
    Ok(())
}

fn tcp_flag_names(flags: &[(&str, bool)]) -> String {
    flags
        .iter()
        .filter(|(_, set)| *set)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(",")
}

/// Application label by well-known port; labelling only, no dissection
pub fn well_known_port(port: u16) -> Option<&'static str> {
    match port {
        80 | 8080 => Some("http"),
        443 | 8443 => Some("tls"),
        53 => Some("dns"),
        67 | 68 => Some("dhcp"),
        123 => Some("ntp"),
        22 => Some("ssh"),
        _ => None,
    }
}

/// `dns_offset` skips the TCP length prefix
fn application(
    layers: &mut Layers,
    (source, destination): (u16, u16),
    payload: &[u8],
    dns_offset: usize,
    want_flags: bool,
) {
    let Some(app) = well_known_port(destination).or_else(|| well_known_port(source)) else {
        return;
    };
    layers.stack.push(app);

    if app == "dns" && want_flags {
        if let Some(flags) = payload.get(dns_offset + 2) {
            let response = if flags & 0x80 != 0 { "1" } else { "0" };
            layers.flags.push(("dns.response", response.to_string()));
        }
    }
}

fn project(layers: Layers, frame: &Frame<'_>, sequence: u64, projection: Projection) -> FieldRecord {
    let mut record = FieldRecord::new(sequence);

    if projection.contains(FieldName::Timestamp) {
        record.timestamp = frame.timestamp;
    }
    if projection.contains(FieldName::Source) {
        record.source = layers.source.unwrap_or(Addr::None).render();
    }
    if projection.contains(FieldName::Destination) {
        record.destination = layers.destination.unwrap_or(Addr::None).render();
    }
    if projection.contains(FieldName::Ports) {
        if let Some((src, dst)) = layers.ports {
            record.source_port = Some(src);
            record.destination_port = Some(dst);
        }
    }
    if projection.contains(FieldName::Protocols) {
        record.protocols = layers.stack.iter().map(|p| p.to_string()).collect();
    }
    if projection.contains(FieldName::Length) {
        record.length = frame.length;
    }
    if projection.contains(FieldName::Flags) {
        record.flags = layers
            .flags
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    const MAC_A: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0a];
    const MAC_B: [u8; 6] = [0x02, 0, 0, 0, 0, 0x0b];

    fn frame(data: &[u8]) -> Frame<'_> {
        Frame {
            data,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            length: data.len() as u32,
        }
    }

    fn udp_packet(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2(MAC_A, MAC_B)
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(src_port, dst_port);
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        out
    }

    #[test]
    fn test_icmp_echo() {
        let builder = PacketBuilder::ethernet2(MAC_A, MAC_B)
            .ipv4([192, 168, 1, 1], [192, 168, 1, 2], 64)
            .icmpv4_echo_request(1, 1);
        let mut data = Vec::new();
        builder.write(&mut data, &[0u8; 8]).unwrap();

        let record = decode(LinkType::Ethernet, &frame(&data), 3, Projection::all()).unwrap();
        assert_eq!(record.sequence, 3);
        assert_eq!(record.stack_label(), "eth:ip:icmp");
        assert_eq!(record.source, "192.168.1.1");
        assert_eq!(record.destination, "192.168.1.2");
        assert_eq!(record.source_port, None);
        assert_eq!(record.flag("icmp.type"), Some("8"));
        assert_eq!(record.flag("icmp.code"), Some("0"));
        assert_eq!(record.length as usize, data.len());
    }

    #[test]
    fn test_tcp_flags_and_http_label() {
        let builder = PacketBuilder::ethernet2(MAC_A, MAC_B)
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(51000, 80, 1, 1024)
            .syn()
            .ack(7);
        let mut data = Vec::new();
        builder.write(&mut data, &[]).unwrap();

        let record = decode(LinkType::Ethernet, &frame(&data), 1, Projection::all()).unwrap();
        assert_eq!(record.protocols, vec!["eth", "ip", "tcp", "http"]);
        assert_eq!(record.source_port, Some(51000));
        assert_eq!(record.destination_port, Some(80));
        assert_eq!(record.flag("tcp.flags"), Some("SYN,ACK"));
    }

    #[test]
    fn test_dns_response_bit() {
        let query = udp_packet(40000, 53, &[0x12, 0x34, 0x01, 0x00]);
        let reply = udp_packet(53, 40000, &[0x12, 0x34, 0x81, 0x80]);

        let q = decode(LinkType::Ethernet, &frame(&query), 1, Projection::all()).unwrap();
        let r = decode(LinkType::Ethernet, &frame(&reply), 2, Projection::all()).unwrap();
        assert_eq!(q.stack_label(), "eth:ip:udp:dns");
        assert_eq!(q.flag("dns.response"), Some("0"));
        assert_eq!(r.flag("dns.response"), Some("1"));
    }

    #[test]
    fn test_arp_uses_hardware_addresses() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0xff; 6]);
        data.extend_from_slice(&MAC_A);
        data.extend_from_slice(&[0x08, 0x06]);
        data.extend_from_slice(&[0, 1, 0x08, 0x00, 6, 4, 0, 1]);
        data.extend_from_slice(&MAC_A);
        data.extend_from_slice(&[10, 0, 0, 1]);
        data.extend_from_slice(&[0; 6]);
        data.extend_from_slice(&[10, 0, 0, 2]);

        let record = decode(LinkType::Ethernet, &frame(&data), 1, Projection::all()).unwrap();
        assert_eq!(record.stack_label(), "eth:arp");
        assert_eq!(record.source, "02:00:00:00:00:0a");
        assert_eq!(record.destination, "00:00:00:00:00:00");
        assert_eq!(record.flag("arp.opcode"), Some("request"));
        assert_eq!(record.source_port, None);
    }

    #[test]
    fn test_raw_ip_link() {
        let builder = PacketBuilder::ipv4([10, 1, 1, 1], [10, 1, 1, 2], 64).udp(5000, 123);
        let mut data = Vec::new();
        builder.write(&mut data, &[0u8; 48]).unwrap();

        let record = decode(LinkType::RawIp, &frame(&data), 1, Projection::all()).unwrap();
        assert_eq!(record.stack_label(), "ip:udp:ntp");
    }

    #[test]
    fn test_linux_cooked_v2() {
        let builder = PacketBuilder::ipv6([0xfe; 16], [0xfd; 16], 64).udp(68, 67);
        let mut ip = Vec::new();
        builder.write(&mut ip, &[0u8; 4]).unwrap();

        let mut data = vec![0x86, 0xdd, 0, 0, 0, 0, 0, 1, 0, 1, 0, 6];
        data.extend_from_slice(&MAC_A);
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(&ip);

        let record = decode(LinkType::LinuxSll2, &frame(&data), 1, Projection::all()).unwrap();
        assert_eq!(record.stack_label(), "sll:ipv6:udp:dhcp");
        assert!(record.source.starts_with("fefe:"));
    }

    #[test]
    fn test_malformed_ip_header() {
        let mut data = Vec::new();
        data.extend_from_slice(&MAC_B);
        data.extend_from_slice(&MAC_A);
        data.extend_from_slice(&[0x08, 0x00]);
        data.extend_from_slice(&[0x45, 0x00, 0x00]);
        assert!(decode(LinkType::Ethernet, &frame(&data), 1, Projection::all()).is_err());
        assert!(decode(LinkType::Ethernet, &frame(&data[..10]), 1, Projection::all()).is_err());
        assert!(decode(LinkType::LinuxSll, &frame(&data[..10]), 1, Projection::all()).is_err());
    }

    #[test]
    fn test_snaplen_truncated_frame_keeps_headers() {
        let data = udp_packet(5000, 6000, &[0x5a; 900]);
        assert_eq!(data.len(), 942);
        let cut = Frame {
            data: &data[..96],
            length: 942,
            ..frame(&data)
        };

        let record = decode(LinkType::Ethernet, &cut, 1, Projection::all()).unwrap();
        assert_eq!(record.stack_label(), "eth:ip:udp");
        assert_eq!(record.source, "10.0.0.1");
        assert_eq!(record.destination, "10.0.0.2");
        assert_eq!(record.source_port, Some(5000));
        assert_eq!(record.destination_port, Some(6000));
        assert_eq!(record.length, 942);

        // cut inside the IP header: nothing above the link layer survived
        let stub = Frame {
            data: &data[..20],
            length: 942,
            ..frame(&data)
        };
        assert!(decode(LinkType::Ethernet, &stub, 2, Projection::all()).is_err());
    }

    #[test]
    fn test_projection_leaves_zero_values() {
        let data = udp_packet(40000, 53, &[0x12, 0x34, 0x01, 0x00]);
        let projection = Projection::from_fields(&[FieldName::Protocols]);
        let record = decode(LinkType::Ethernet, &frame(&data), 9, projection).unwrap();

        assert_eq!(record.sequence, 9);
        assert_eq!(record.stack_label(), "eth:ip:udp:dns");
        assert_eq!(record.source, "");
        assert_eq!(record.destination, "");
        assert_eq!(record.source_port, None);
        assert_eq!(record.length, 0);
        assert!(record.flags.is_empty());
        assert_eq!(record.timestamp, DateTime::<Utc>::default());
    }

    #[test]
    fn test_link_codes() {
        assert_eq!(LinkType::from_code(1), Some(LinkType::Ethernet));
        assert_eq!(LinkType::from_code(113), Some(LinkType::LinuxSll));
        assert_eq!(LinkType::from_code(276), Some(LinkType::LinuxSll2));
        assert_eq!(LinkType::from_code(101), Some(LinkType::RawIp));
        assert_eq!(LinkType::from_code(0), Some(LinkType::Null));
        assert_eq!(LinkType::from_code(127), None);
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]), "de:ad:be:ef:00:01");
    }
}
