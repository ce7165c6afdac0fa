use clap::Parser;
use feeder::network::{self, FeedClient};
use feeder::sim::Simulation;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::roads::RoadNetwork;
use shared::DEFAULT_INGEST_PORT;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay ingest address
    #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{}", DEFAULT_INGEST_PORT))]
    server: String,

    /// Road geometry (GeoJSON lines) in simulator coordinates
    #[arg(short = 'r', long)]
    roads: Option<PathBuf>,

    /// Number of agents
    #[arg(short = 'n', long, default_value = "50")]
    agents: usize,

    /// Milliseconds between batches
    #[arg(short = 't', long, default_value = "200")]
    tick_ms: u64,

    /// Distance moved per tick before sim_speed scaling
    #[arg(long, default_value = "1.0")]
    step: f64,

    /// Refresh the simulator settings every N batches
    #[arg(long, default_value = "10")]
    settings_every: u64,

    /// Stop after this many batches
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    if args.tick_ms == 0 {
        return Err("--tick-ms must be positive".into());
    }

    let roads = match &args.roads {
        Some(path) => RoadNetwork::load(path).unwrap_or_else(|e| {
            warn!("{}: {}, using an empty road network", path.display(), e);
            RoadNetwork::empty()
        }),
        None => RoadNetwork::empty(),
    };
    info!(
        "Feeding {} agents over {} road segments to {}",
        args.agents,
        roads.segment_count(),
        args.server
    );

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut sim = Simulation::new(roads, args.agents, args.step, rng);
    let mut client = FeedClient::connect(&args.server).await?;

    network::run(
        &mut client,
        &mut sim,
        Duration::from_millis(args.tick_ms),
        args.settings_every,
        args.max_ticks,
    )
    .await?;

    info!("Feeder finished");
    Ok(())
}
