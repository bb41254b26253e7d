//! Extraction, aggregation and reporting over synthesized capture files

mod common;

use caplab_analysis::{report, Aggregator, Extractor};
use caplab_capture::{ArtifactStore, CaptureArtifact};
use caplab_core::{Error, FieldName, Projection};
use common::*;
use tempfile::TempDir;

fn artifact(path: &std::path::Path) -> CaptureArtifact {
    ArtifactStore::default().open(path).unwrap()
}

fn mixed_traffic() -> Vec<Packet> {
    vec![
        Packet::new(udp([10, 0, 0, 1], [10, 0, 0, 53], 40000, 53, &[0x12, 0x34, 0x01, 0x00]), 0),
        Packet::new(udp([10, 0, 0, 53], [10, 0, 0, 1], 53, 40000, &[0x12, 0x34, 0x81, 0x80]), 5),
        Packet::new(tcp_syn([10, 0, 0, 1], [10, 0, 0, 80], 40001, 80), 10),
        Packet::new(icmp_echo([10, 0, 0, 2], [10, 0, 0, 1], 1), 20),
        Packet::new(tcp_syn([10, 0, 0, 2], [10, 0, 0, 80], 40002, 443), 30),
    ]
}

#[test]
fn test_five_icmp_packets() {
    let dir = TempDir::new().unwrap();
    let path = write_pcap(&dir.path().join("ping.pcap"), &five_pings());

    let mut records = Extractor::new().extract(&artifact(&path), Projection::all()).unwrap();
    let collected: Vec<_> = records.by_ref().collect();
    assert_eq!(collected.len(), 5);
    assert_eq!(records.skipped(), 0);

    let sequences: Vec<_> = collected.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    assert_eq!(collected[0].source, "10.0.0.1");
    assert_eq!(collected[0].timestamp.timestamp(), i64::from(BASE_SECS));
    assert_eq!(collected[1].timestamp.timestamp_subsec_millis(), 100);

    let result = Aggregator::new(10).aggregate(&collected);
    assert_eq!(result.protocols.len(), 1);
    assert_eq!(result.protocol_count("eth:ip:icmp"), 5);
    assert_eq!(result.total_packets, 5);
}

#[test]
fn test_malformed_frame_is_skipped() {
    let dir = TempDir::new().unwrap();
    let packets = vec![
        Packet::new(icmp_echo([10, 0, 0, 1], [10, 0, 0, 2], 1), 0),
        Packet::new(malformed_ipv4(), 10),
        Packet::new(icmp_echo([10, 0, 0, 1], [10, 0, 0, 2], 2), 20),
    ];
    let path = write_pcap(&dir.path().join("broken.pcap"), &packets);

    let mut records = Extractor::new().extract(&artifact(&path), Projection::all()).unwrap();
    let collected: Vec<_> = records.by_ref().collect();
    assert_eq!(collected.len(), 2);
    assert_eq!(records.skipped(), 1);
    // the gap in sequence numbers marks the skipped frame
    assert_eq!(collected[0].sequence, 1);
    assert_eq!(collected[1].sequence, 3);

    let result = Aggregator::new(10)
        .aggregate(&collected)
        .with_decode_loss(records.skipped());
    assert_eq!(result.decode_loss, 1);
    assert!(report::format(&result, &[]).contains("1 malformed or truncated frame(s) skipped"));
}

#[test]
fn test_truncated_tail_is_skipped() {
    let dir = TempDir::new().unwrap();
    let path = write_pcap(&dir.path().join("tail.pcap"), &five_pings());
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

    let mut records = Extractor::new().extract(&artifact(&path), Projection::all()).unwrap();
    assert_eq!(records.by_ref().count(), 4);
    assert_eq!(records.skipped(), 1);
}

#[test]
fn test_snaplen_truncated_frames_are_decoded() {
    let dir = TempDir::new().unwrap();
    let packets: Vec<_> = (0..3)
        .map(|i| Packet::new(udp([10, 0, 0, 1], [10, 0, 0, 2], 5000, 6000, &[0x5a; 900]), i * 10))
        .collect();
    assert_eq!(packets[0].data.len(), 942);
    let path = write_pcap_snapped(&dir.path().join("snapped.pcap"), &packets, 96);

    let mut records = Extractor::new().extract(&artifact(&path), Projection::all()).unwrap();
    let collected: Vec<_> = records.by_ref().collect();
    assert_eq!(collected.len(), 3);
    assert_eq!(records.skipped(), 0);
    for record in &collected {
        assert_eq!(record.stack_label(), "eth:ip:udp");
        assert_eq!(record.source, "10.0.0.1");
        assert_eq!(record.destination, "10.0.0.2");
        assert_eq!(record.source_port, Some(5000));
        assert_eq!(record.destination_port, Some(6000));
        assert_eq!(record.length, 942);
    }

    let result = Aggregator::new(10).aggregate(&collected);
    assert_eq!(result.total_bytes, 3 * 942);
    assert_eq!(result.protocol_count("eth:ip:udp"), 3);
}

#[test]
fn test_extraction_is_restartable() {
    let dir = TempDir::new().unwrap();
    let path = write_pcap(&dir.path().join("mixed.pcap"), &mixed_traffic());
    let artifact = artifact(&path);
    let extractor = Extractor::new();

    let first: Vec<_> = extractor.extract(&artifact, Projection::all()).unwrap().collect();
    let second: Vec<_> = extractor.extract(&artifact, Projection::all()).unwrap().collect();
    assert_eq!(first.len(), 5);
    assert_eq!(first, second);
}

#[test]
fn test_report_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let path = write_pcap(&dir.path().join("mixed.pcap"), &mixed_traffic());
    let artifact = artifact(&path);

    let render = || {
        let records: Vec<_> = Extractor::new()
            .extract(&artifact, Projection::all())
            .unwrap()
            .collect();
        let result = Aggregator::new(3).aggregate(&records);
        report::format(&result, &records[..2])
    };

    let first = render();
    assert_eq!(first, render());
    assert!(first.contains("eth:ip:udp:dns"));
    assert!(first.contains("eth:ip:tcp:http"));
    assert!(first.contains("eth:ip:tcp:tls"));
}

#[test]
fn test_conversations_are_symmetric() {
    let dir = TempDir::new().unwrap();
    let path = write_pcap(&dir.path().join("mixed.pcap"), &mixed_traffic());
    let records: Vec<_> = Extractor::new()
        .extract(&artifact(&path), Projection::all())
        .unwrap()
        .collect();

    let result = Aggregator::new(10).aggregate(&records);
    let dns = result.conversation("10.0.0.53", "10.0.0.1").unwrap();
    assert_eq!(dns.packets, 2);
    assert_eq!(dns.a, "10.0.0.1");
    assert_eq!(result.conversation("10.0.0.1", "10.0.0.53"), Some(dns));
}

#[test]
fn test_top_talkers_tie_break_by_first_seen() {
    let dir = TempDir::new().unwrap();
    let path = write_pcap(&dir.path().join("mixed.pcap"), &mixed_traffic());
    let records: Vec<_> = Extractor::new()
        .extract(&artifact(&path), Projection::all())
        .unwrap()
        .collect();

    let result = Aggregator::new(10).aggregate(&records);
    let talkers: Vec<_> = result
        .top_talkers
        .iter()
        .map(|t| (t.key.as_str(), t.count))
        .collect();
    assert_eq!(talkers, vec![("10.0.0.1", 2), ("10.0.0.2", 2), ("10.0.0.53", 1)]);
}

#[test]
fn test_projection_limits_fields() {
    let dir = TempDir::new().unwrap();
    let path = write_pcap(&dir.path().join("mixed.pcap"), &mixed_traffic());
    let projection = Projection::from_fields(&[FieldName::Protocols]);

    let records: Vec<_> = Extractor::new()
        .extract(&artifact(&path), projection)
        .unwrap()
        .collect();
    assert_eq!(records.len(), 5);
    for record in &records {
        assert!(!record.protocols.is_empty());
        assert!(record.source.is_empty());
        assert_eq!(record.source_port, None);
        assert_eq!(record.length, 0);
        assert!(record.flags.is_empty());
    }
}

#[test]
fn test_pcapng_artifact() {
    let dir = TempDir::new().unwrap();
    let path = write_pcapng(&dir.path().join("ping.pcapng"), &five_pings());

    let mut records = Extractor::new().extract(&artifact(&path), Projection::all()).unwrap();
    let collected: Vec<_> = records.by_ref().collect();
    assert_eq!(collected.len(), 5);
    assert_eq!(records.skipped(), 0);
    assert_eq!(collected[4].sequence, 5);
    assert_eq!(collected[0].destination, "10.0.0.2");

    let result = Aggregator::new(10).aggregate(&collected);
    assert_eq!(result.protocol_count("eth:ip:icmp"), 5);
}

#[test]
fn test_unrecognized_format_is_unreadable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.pcap");
    std::fs::write(&path, "this is a text file, not a packet capture at all\n").unwrap();

    let err = Extractor::new()
        .extract(&artifact(&path), Projection::all())
        .unwrap_err();
    assert!(matches!(err, Error::UnreadableArtifact { .. }));
    assert_eq!(err.exit_code(), 6);
}

#[test]
fn test_unsupported_link_type_is_unreadable() {
    let dir = TempDir::new().unwrap();
    let path = write_pcap(&dir.path().join("ping.pcap"), &five_pings());
    let mut bytes = std::fs::read(&path).unwrap();
    // LINKTYPE_IEEE802_11
    bytes[20..24].copy_from_slice(&105u32.to_le_bytes());
    std::fs::write(&path, bytes).unwrap();

    let err = Extractor::new()
        .extract(&artifact(&path), Projection::all())
        .unwrap_err();
    assert!(matches!(err, Error::UnreadableArtifact { .. }));
}

#[cfg(unix)]
mod capture {
    use super::*;
    use caplab_capture::{
        CaptureEngine, CaptureRequest, CaptureSource, Supervisor, SupervisorConfig, TerminalState,
    };
    use std::time::Duration;
    use tokio::process::Command;

    /// Copies the replay file to the output, like a replay run that saw every packet
    struct CopyEngine;

    impl CaptureEngine for CopyEngine {
        fn name(&self) -> &str {
            "cp"
        }

        fn command(&self, request: &CaptureRequest) -> Command {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg("sleep 0.2; cp \"$2\" \"$1\"").arg("sh").arg(request.output());
            if let CaptureSource::File(path) = request.source() {
                cmd.arg(path);
            }
            cmd
        }
    }

    #[tokio::test]
    async fn test_capture_then_analyze_five_pings() {
        let dir = TempDir::new().unwrap();
        let replay = write_pcap(&dir.path().join("replay.pcap"), &five_pings());

        let supervisor = Supervisor::new(
            CopyEngine,
            SupervisorConfig::default().with_launch_probe(Duration::from_millis(50)),
        );
        let request = CaptureRequest::builder(CaptureSource::File(replay))
            .filter("icmp")
            .packet_count(5)
            .output(dir.path().join("out.pcap"))
            .build()
            .unwrap();

        let session = supervisor.start(request).await.unwrap();
        let outcome = supervisor.wait(&session).await.unwrap();
        assert_eq!(outcome.state, TerminalState::Completed);

        let artifact = ArtifactStore::default().finalize(&session).unwrap();
        let mut records = Extractor::new().extract(&artifact, Projection::all()).unwrap();
        let result = Aggregator::new(10).aggregate(records.by_ref());
        assert!(result.total_packets <= 5);
        assert_eq!(result.protocol_count("eth:ip:icmp"), 5);
        assert_eq!(records.skipped(), 0);
    }
}
