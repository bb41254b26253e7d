//! Capture file fixtures shared by the integration tests
#![allow(dead_code)]

use etherparse::PacketBuilder;
use std::path::{Path, PathBuf};

pub const BASE_SECS: u32 = 1_700_000_000;

/// One frame: wire bytes plus capture timestamp
pub struct Packet {
    pub data: Vec<u8>,
    pub secs: u32,
    pub micros: u32,
}

impl Packet {
    pub fn new(data: Vec<u8>, offset_ms: u32) -> Self {
        Self {
            data,
            secs: BASE_SECS + offset_ms / 1000,
            micros: (offset_ms % 1000) * 1000,
        }
    }
}

/// Write a little-endian legacy pcap file with Ethernet link type
pub fn write_pcap(path: &Path, packets: &[Packet]) -> PathBuf {
    write_pcap_snapped(path, packets, 65535)
}

/// Like [`write_pcap`], keeping at most `snaplen` bytes of each frame
pub fn write_pcap_snapped(path: &Path, packets: &[Packet], snaplen: u32) -> PathBuf {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&4u16.to_le_bytes());
    bytes.extend_from_slice(&0i32.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&snaplen.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());

    for packet in packets {
        let orig_len = packet.data.len() as u32;
        let cap_len = orig_len.min(snaplen);
        bytes.extend_from_slice(&packet.secs.to_le_bytes());
        bytes.extend_from_slice(&packet.micros.to_le_bytes());
        bytes.extend_from_slice(&cap_len.to_le_bytes());
        bytes.extend_from_slice(&orig_len.to_le_bytes());
        bytes.extend_from_slice(&packet.data[..cap_len as usize]);
    }

    std::fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

/// Write a pcapng file with one Ethernet interface and enhanced packet blocks
pub fn write_pcapng(path: &Path, packets: &[Packet]) -> PathBuf {
    let mut bytes = Vec::new();

    // section header
    bytes.extend_from_slice(&0x0a0d_0d0au32.to_le_bytes());
    bytes.extend_from_slice(&28u32.to_le_bytes());
    bytes.extend_from_slice(&0x1a2b_3c4du32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&(-1i64).to_le_bytes());
    bytes.extend_from_slice(&28u32.to_le_bytes());

    // interface description
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&20u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&65535u32.to_le_bytes());
    bytes.extend_from_slice(&20u32.to_le_bytes());

    for packet in packets {
        let len = packet.data.len();
        let padded = (len + 3) & !3;
        let total = (32 + padded) as u32;
        let ticks = u64::from(packet.secs) * 1_000_000 + u64::from(packet.micros);

        bytes.extend_from_slice(&6u32.to_le_bytes());
        bytes.extend_from_slice(&total.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&((ticks >> 32) as u32).to_le_bytes());
        bytes.extend_from_slice(&(ticks as u32).to_le_bytes());
        bytes.extend_from_slice(&(len as u32).to_le_bytes());
        bytes.extend_from_slice(&(len as u32).to_le_bytes());
        bytes.extend_from_slice(&packet.data);
        bytes.resize(bytes.len() + padded - len, 0);
        bytes.extend_from_slice(&total.to_le_bytes());
    }

    std::fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

pub fn mac(last: u8) -> [u8; 6] {
    [0x02, 0, 0, 0, 0, last]
}

pub fn icmp_echo(src: [u8; 4], dst: [u8; 4], seq: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(mac(src[3]), mac(dst[3]))
        .ipv4(src, dst, 64)
        .icmpv4_echo_request(1, seq);
    let payload = [0u8; 32];
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, &payload).unwrap();
    out
}

pub fn udp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(mac(src[3]), mac(dst[3]))
        .ipv4(src, dst, 64)
        .udp(sport, dport);
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

pub fn tcp_syn(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(mac(src[3]), mac(dst[3]))
        .ipv4(src, dst, 64)
        .tcp(sport, dport, 1000, 64240)
        .syn();
    let mut out = Vec::with_capacity(builder.size(0));
    builder.write(&mut out, &[]).unwrap();
    out
}

/// Ethernet frame announcing IPv4 with a truncated IP header
pub fn malformed_ipv4() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&mac(9));
    out.extend_from_slice(&mac(8));
    out.extend_from_slice(&[0x08, 0x00]);
    out.extend_from_slice(&[0x45, 0x00, 0x00]);
    out
}

/// Five ICMP echo requests from 10.0.0.1 to 10.0.0.2
pub fn five_pings() -> Vec<Packet> {
    (0..5)
        .map(|i| Packet::new(icmp_echo([10, 0, 0, 1], [10, 0, 0, 2], i as u16), i * 100))
        .collect()
}
