use clap::Parser;
use log::{error, info, warn};
use server::config::{Args, ServerConfig};
use server::demo::DemoSynthesizer;
use server::distributor::LiveDistributor;
use server::network::Server;
use server::persistence::spawn_snapshot_writer;
use std::sync::Arc;

/// Parses command-line arguments, builds the distributor and runs the
/// listeners until Ctrl+C, then flushes a final snapshot.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        println!("Tip: Set RUST_LOG=info to see server logs");
    }

    let args = Args::parse();
    let config = ServerConfig::from_args(args)?;

    let store = config.initial_store()?;
    let mut distributor = LiveDistributor::new(store, config.outbox_capacity)
        .with_seek_mode(config.seek_mode);

    let writer = if config.snapshot_every > 0 {
        let (tx, handle) = spawn_snapshot_writer(config.snapshot_path.clone(), 2);
        distributor = distributor.with_snapshots(config.snapshot_every, tx);
        Some(handle)
    } else {
        None
    };
    let distributor = Arc::new(distributor);

    let server = Server::bind(&config, Arc::clone(&distributor)).await?;
    let server_handle = tokio::spawn(server.run());

    let demo_handle = config.demo.as_ref().map(|demo| {
        DemoSynthesizer::new(demo, config.roads.clone()).spawn(Arc::clone(&distributor))
    });

    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Server stopped: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    if let Some(handle) = demo_handle {
        handle.abort();
    }

    if let Some(handle) = writer {
        let queued = distributor.flush_snapshots().await;
        match handle.await {
            Ok(true) if queued => {
                info!("Final snapshot written to {}", config.snapshot_path.display())
            }
            Ok(_) if queued => {
                error!("Final snapshot to {} failed", config.snapshot_path.display())
            }
            Ok(_) => warn!("Snapshot writer had already stopped, no final snapshot written"),
            Err(e) => error!("Snapshot writer failed: {}", e),
        }
    }

    Ok(())
}
