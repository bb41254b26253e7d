//! Command execution
//!
//! Drives capture, finalization, extraction, aggregation and report output.
//! Errors come back as `caplab_core::Error` so the binary can map them to
//! distinct exit codes.

use caplab_analysis::{report, Aggregator, Extractor};
use caplab_capture::{
    list_interfaces, ArtifactStore, CaptureArtifact, CaptureRequest, CaptureSession, CaptureSource,
    FilterPreset, Supervisor, TerminalState,
};
use caplab_core::{FieldName, Projection, Result};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::args::{CaptureArgs, Cli, Commands, ReportArgs};
use crate::settings::{AnalysisSettings, Settings};

/// Execute the parsed command line
pub async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Capture(args) => capture(args, &settings, cli.verbose > 0).await,
        Commands::Analyze { file, report } => {
            let artifact = ArtifactStore::default().open(&file)?;
            let options = ReportOptions::new(&report, &settings.analysis)?;
            let text = analyze(artifact, options).await?;
            emit(&text, report.report.as_deref()).await
        }
        Commands::Interfaces => {
            let interfaces = list_interfaces();
            if interfaces.is_empty() {
                println!("No interfaces found");
            }
            for iface in interfaces {
                println!("{}", iface.summary());
            }
            Ok(())
        }
        Commands::Presets => {
            for preset in FilterPreset::ALL {
                println!("{:<6} {}", preset.name(), preset.expression());
            }
            Ok(())
        }
    }
}

/// Build a capture request from command-line flags and settings
///
/// `verbose` relays engine stderr at info level instead of debug.
pub fn build_request(args: &CaptureArgs, settings: &Settings, verbose: bool) -> Result<CaptureRequest> {
    let source = match (&args.interface, &args.read) {
        (_, Some(path)) => CaptureSource::File(path.clone()),
        (Some(name), None) => CaptureSource::Interface(name.clone()),
        (None, None) => {
            return Err(caplab_core::Error::invalid_request(
                "source",
                "give an interface or a file to read",
            ))
        }
    };

    let mut builder = CaptureRequest::builder(source).filter(args.filter.as_str());
    if let Some(name) = &args.preset {
        builder = builder.preset(name.parse::<FilterPreset>()?);
    }
    if let Some(count) = args.count {
        builder = builder.packet_count(count);
    }
    if let Some(secs) = args.duration {
        builder = builder.duration(Duration::from_secs(secs));
    }
    if args.unbounded {
        builder = builder.unbounded();
    }
    if let Some(path) = &args.write {
        builder = builder.output(path);
    }
    if let Some(dir) = args.output_dir.as_ref().or(settings.output_dir.as_ref()) {
        builder = builder.output_dir(dir);
    }
    builder.verbose(verbose).build()
}

async fn capture(args: CaptureArgs, settings: &Settings, verbose: bool) -> Result<()> {
    let request = build_request(&args, settings, verbose)?;
    // options are checked before anything is started
    let options = ReportOptions::new(&args.report, &settings.analysis)?;

    let supervisor = Supervisor::new(settings.engine.engine(), settings.supervisor.clone());
    let session = launch(&supervisor, request, interrupted()).await?;
    eprintln!(
        "Capturing from {} to {} (Ctrl-C to stop)",
        session.request().source(),
        session.output().display()
    );

    let outcome = tokio::select! {
        outcome = supervisor.wait(&session) => outcome?,
        _ = interrupted() => {
            info!(session = %session.id(), "Interrupted, stopping capture");
            supervisor.shutdown();
            supervisor.wait(&session).await?
        }
    };
    eprintln!(
        "Capture {} after {:.1}s{}",
        outcome.state,
        outcome.elapsed.as_secs_f64(),
        if outcome.escalated { " (forced)" } else { "" }
    );
    if outcome.state != TerminalState::Completed {
        warn!(session = %session.id(), state = %outcome.state, "Capture ended early, analyzing what was written");
    }

    let store = ArtifactStore::default();
    let artifact = store.finalize(&session)?;
    let path = artifact.path().to_path_buf();

    if !args.no_analyze {
        let text = analyze(artifact, options).await?;
        emit(&text, args.report.report.as_deref()).await?;
    }

    if args.delete {
        store.delete(&path)?;
    } else {
        eprintln!("Capture saved to {}", path.display());
    }
    Ok(())
}

/// Start a capture, shutting the supervisor down if `interrupt` resolves
/// before the launch is confirmed
///
/// The start is awaited to the end either way, so the session comes back
/// cancelled rather than being abandoned mid-launch.
pub async fn launch<F>(supervisor: &Supervisor, request: CaptureRequest, interrupt: F) -> Result<CaptureSession>
where
    F: Future<Output = ()>,
{
    let start = supervisor.start(request);
    tokio::pin!(start);

    tokio::select! {
        session = &mut start => session,
        _ = interrupt => {
            info!("Interrupted during launch, stopping capture");
            supervisor.shutdown();
            start.await
        }
    }
}

/// Resolves on Ctrl-C; never resolves if the signal cannot be watched
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Report settings after applying command-line overrides
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub top_n: usize,
    pub samples: usize,
    pub bucket_width: u32,
    pub bucket_count: usize,
    pub projection: Projection,
}

impl ReportOptions {
    pub fn new(args: &ReportArgs, settings: &AnalysisSettings) -> Result<Self> {
        let projection = if args.fields.is_empty() {
            Projection::all()
        } else {
            let fields = args
                .fields
                .iter()
                .map(|f| f.parse::<FieldName>())
                .collect::<Result<Vec<_>>>()?;
            Projection::from_fields(&fields)
        };

        Ok(Self {
            top_n: args.top.unwrap_or(settings.top_n),
            samples: args.samples.unwrap_or(settings.samples),
            bucket_width: settings.bucket_width,
            bucket_count: settings.bucket_count,
            projection,
        })
    }
}

/// Extract, aggregate and render one artifact
pub async fn analyze(artifact: CaptureArtifact, options: ReportOptions) -> Result<String> {
    tokio::task::spawn_blocking(move || analyze_blocking(&artifact, &options))
        .await
        .map_err(|e| caplab_core::Error::Supervisor(format!("analysis task failed: {}", e)))?
}

fn analyze_blocking(artifact: &CaptureArtifact, options: &ReportOptions) -> Result<String> {
    let mut records = Extractor::new().extract(artifact, options.projection)?;
    let aggregator = Aggregator::new(options.top_n).with_buckets(options.bucket_width, options.bucket_count);

    let mut samples = Vec::with_capacity(options.samples);
    let result = aggregator.aggregate(records.by_ref().inspect(|record| {
        if samples.len() < options.samples {
            samples.push(record.clone());
        }
    }));
    let result = result.with_decode_loss(records.skipped());

    if result.decode_loss > 0 {
        warn!(
            path = %artifact.path().display(),
            skipped = result.decode_loss,
            "Some frames could not be decoded"
        );
    }
    info!(
        path = %artifact.path().display(),
        packets = result.total_packets,
        "Analysis complete"
    );
    Ok(report::format(&result, &samples))
}

async fn emit(text: &str, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            tokio::fs::write(path, text).await?;
            eprintln!("Report written to {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use caplab_capture::CaptureBound;
    use clap::Parser;

    fn capture_args(argv: &[&str]) -> CaptureArgs {
        let mut full = vec!["caplab", "capture"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Capture(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_build_request_from_flags() {
        let args = capture_args(&["-i", "any", "--preset", "dns", "-c", "10", "-t", "5", "-w", "/tmp/x.pcap"]);
        let request = build_request(&args, &Settings::default(), false).unwrap();
        assert_eq!(request.source(), &CaptureSource::Interface("any".into()));
        assert_eq!(request.filter(), FilterPreset::Dns.expression());
        assert_eq!(
            request.bound(),
            CaptureBound::Both {
                count: 10,
                duration: Duration::from_secs(5)
            }
        );
        assert_eq!(request.output(), Path::new("/tmp/x.pcap"));
    }

    #[test]
    fn test_build_request_uses_settings_output_dir() {
        let args = capture_args(&["-r", "in.pcap", "-c", "1"]);
        let settings = Settings {
            output_dir: Some("/tmp/caplab-out".into()),
            ..Settings::default()
        };
        let request = build_request(&args, &settings, false).unwrap();
        assert!(request.output().starts_with("/tmp/caplab-out"));
        assert!(request.source().is_replay());
    }

    #[test]
    fn test_build_request_rejects_bad_input() {
        let args = capture_args(&["-i", "eth0", "-c", "0"]);
        assert_eq!(build_request(&args, &Settings::default(), false).unwrap_err().exit_code(), 2);

        let args = capture_args(&["-i", "eth0", "-c", "1", "--preset", "gopher"]);
        assert_eq!(build_request(&args, &Settings::default(), false).unwrap_err().exit_code(), 2);

        let args = capture_args(&["-i", "eth0", "-c", "1", "-f", "port 53; rm -rf /"]);
        assert_eq!(build_request(&args, &Settings::default(), false).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn test_report_options() {
        let args = ReportArgs {
            top: Some(3),
            fields: vec!["protocols".into(), "length".into()],
            ..ReportArgs::default()
        };
        let options = ReportOptions::new(&args, &AnalysisSettings::default()).unwrap();
        assert_eq!(options.top_n, 3);
        assert_eq!(options.samples, 5);
        assert!(options.projection.contains(FieldName::Length));
        assert!(!options.projection.contains(FieldName::Source));

        let args = ReportArgs {
            fields: vec!["payload".into()],
            ..ReportArgs::default()
        };
        assert!(ReportOptions::new(&args, &AnalysisSettings::default()).is_err());
    }

    #[cfg(unix)]
    mod interrupt {
        use super::*;
        use caplab_capture::{CaptureEngine, SupervisorConfig};
        use std::time::Instant;
        use tokio::process::Command;

        /// Engine that never writes anything and runs until stopped
        struct IdleEngine;

        impl CaptureEngine for IdleEngine {
            fn name(&self) -> &str {
                "idle"
            }

            fn command(&self, _request: &CaptureRequest) -> Command {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg("exec sleep 30");
                cmd
            }
        }

        fn request(dir: &Path) -> CaptureRequest {
            let input = dir.join("in.pcap");
            std::fs::write(&input, b"").unwrap();
            CaptureRequest::builder(CaptureSource::File(input))
                .unbounded()
                .output(dir.join("out.pcap"))
                .build()
                .unwrap()
        }

        #[tokio::test]
        async fn test_interrupt_during_launch_cancels() {
            let dir = tempfile::tempdir().unwrap();
            let launch_window = Duration::from_secs(3);
            let config = SupervisorConfig::default()
                .with_launch_probe(launch_window)
                .with_grace_window(Duration::from_millis(300));
            let supervisor = Supervisor::new(IdleEngine, config);

            let started = Instant::now();
            let interrupt = tokio::time::sleep(Duration::from_millis(200));
            let session = launch(&supervisor, request(dir.path()), interrupt).await.unwrap();
            assert!(started.elapsed() < launch_window);
            assert!(supervisor.is_closing());

            let outcome = supervisor.wait(&session).await.unwrap();
            assert_eq!(outcome.state, TerminalState::Cancelled);

            // nothing was captured, so there is nothing to analyze
            let err = ArtifactStore::default().finalize(&session).unwrap_err();
            assert_eq!(err.exit_code(), 4);
        }

        #[tokio::test]
        async fn test_launch_without_interrupt() {
            let dir = tempfile::tempdir().unwrap();
            let config = SupervisorConfig::default().with_launch_probe(Duration::from_millis(100));
            let supervisor = Supervisor::new(IdleEngine, config);

            let session = launch(&supervisor, request(dir.path()), std::future::pending())
                .await
                .unwrap();
            assert!(!supervisor.is_closing());
            assert!(!session.is_terminal());

            supervisor.cancel(&session);
            let outcome = supervisor.wait(&session).await.unwrap();
            assert_eq!(outcome.state, TerminalState::Cancelled);
        }
    }
}
