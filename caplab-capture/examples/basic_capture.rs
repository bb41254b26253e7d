//! Example: Supervised capture bounded by count and duration
//!
//! Note: tcpdump needs capture privileges.
//!
//! Run with: sudo cargo run --example basic_capture -- eth0

use caplab_capture::{
    ArtifactStore, CaptureRequest, CaptureSource, Supervisor, SupervisorConfig, TcpdumpEngine,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let iface = std::env::args().nth(1).unwrap_or_else(|| "any".to_string());
    let store = ArtifactStore::default();

    let request = CaptureRequest::builder(CaptureSource::Interface(iface.clone()))
        .packet_count(20)
        .duration(Duration::from_secs(10))
        .output_dir(store.dir())
        .build()?;

    println!("Capturing on {} ({})", iface, request.bound());

    let supervisor = Supervisor::new(TcpdumpEngine::default(), SupervisorConfig::default());
    let session = supervisor.start(request).await?;

    // Ctrl-C cancels the capture; the engine still flushes what it saw
    let canceller = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let outcome = supervisor.wait(&session).await?;
    println!(
        "Capture {} after {:.1}s",
        outcome.state,
        outcome.elapsed.as_secs_f64()
    );

    let artifact = store.finalize(&session)?;
    println!("{} ({} bytes)", artifact.path().display(), artifact.size());

    Ok(())
}
