//! Command-line options and the validated configuration built from them.

use crate::distributor::SeekMode;
use crate::error::{RelayError, Result};
use crate::frame_store::FrameStore;
use crate::mapper::{Calibration, CoordinateMapper};
use crate::persistence;
use clap::Parser;
use log::{info, warn};
use shared::roads::RoadNetwork;
use shared::{DEFAULT_INGEST_PORT, DEFAULT_VIEWER_PORT};
use std::path::PathBuf;
use std::time::Duration;

/// Agents farther than this many steps from every road get respawned.
const RESPAWN_STEPS: f64 = 10.0;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Relays simulator frames to live viewers")]
pub struct Args {
    /// IP address to bind both listeners to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,
    /// Port viewers connect to
    #[clap(long, default_value_t = DEFAULT_VIEWER_PORT)]
    pub viewer_port: u16,
    /// Port the simulator streams batches to
    #[clap(long, default_value_t = DEFAULT_INGEST_PORT)]
    pub ingest_port: u16,
    /// Keep at most this many frames in memory
    #[clap(long)]
    pub retention: Option<usize>,
    /// Snapshot the history every N appends (0 disables)
    #[clap(long, default_value_t = 100)]
    pub snapshot_every: u64,
    #[clap(long, default_value = "frames.json")]
    pub snapshot_path: PathBuf,
    /// Load the snapshot file at startup
    #[clap(long)]
    pub restore: bool,
    /// JSON file with four source/target point pairs
    #[clap(long)]
    pub calibration: Option<PathBuf>,
    /// Road geometry used by the demo synthesizer
    #[clap(long)]
    pub roads: Option<PathBuf>,
    /// Frames buffered per viewer before the oldest is dropped
    #[clap(long, default_value_t = 8)]
    pub outbox_capacity: usize,
    #[clap(long, value_enum, default_value = "per-session")]
    pub seek_mode: SeekMode,
    /// Number of locally synthesized agents (0 disables the demo)
    #[clap(long, default_value_t = 0)]
    pub demo_agents: usize,
    #[clap(long, default_value_t = 200)]
    pub demo_tick_ms: u64,
    /// Distance each demo agent moves per tick
    #[clap(long, default_value_t = 1.0)]
    pub demo_step: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemoConfig {
    pub agents: usize,
    pub tick: Duration,
    pub step: f64,
    pub respawn_distance: f64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub viewer_addr: String,
    pub ingest_addr: String,
    pub retention: Option<usize>,
    pub snapshot_every: u64,
    pub snapshot_path: PathBuf,
    pub restore: bool,
    pub mapper: CoordinateMapper,
    pub roads: RoadNetwork,
    pub outbox_capacity: usize,
    pub seek_mode: SeekMode,
    pub demo: Option<DemoConfig>,
}

impl ServerConfig {
    /// Validates `args` and loads the files they point to.
    ///
    /// An unusable calibration is fatal. Missing or unreadable road geometry
    /// only degrades the demo to an empty network.
    pub fn from_args(args: Args) -> Result<Self> {
        if args.retention == Some(0) {
            return Err(RelayError::Config("--retention must be at least 1".into()));
        }
        if args.outbox_capacity == 0 {
            return Err(RelayError::Config(
                "--outbox-capacity must be at least 1".into(),
            ));
        }

        let mapper = match &args.calibration {
            Some(path) => {
                let mapper = Calibration::load(path)?.fit()?;
                info!("Loaded calibration from {}", path.display());
                mapper
            }
            None => CoordinateMapper::identity(),
        };

        let roads = match &args.roads {
            Some(path) => match RoadNetwork::load(path) {
                Ok(network) => {
                    info!(
                        "Loaded {} roads ({} segments) from {}",
                        network.roads().len(),
                        network.segment_count(),
                        path.display()
                    );
                    network
                }
                Err(e) => {
                    warn!("{}: {}, using an empty road network", path.display(), e);
                    RoadNetwork::empty()
                }
            },
            None => RoadNetwork::empty(),
        };

        let demo = if args.demo_agents > 0 {
            if args.demo_tick_ms == 0 {
                return Err(RelayError::Config("--demo-tick-ms must be positive".into()));
            }
            if !args.demo_step.is_finite() || args.demo_step < 0.0 {
                return Err(RelayError::Config(
                    "--demo-step must be a non-negative number".into(),
                ));
            }
            Some(DemoConfig {
                agents: args.demo_agents,
                tick: Duration::from_millis(args.demo_tick_ms),
                step: args.demo_step,
                respawn_distance: args.demo_step * RESPAWN_STEPS,
            })
        } else {
            None
        };

        Ok(Self {
            viewer_addr: format!("{}:{}", args.host, args.viewer_port),
            ingest_addr: format!("{}:{}", args.host, args.ingest_port),
            retention: args.retention,
            snapshot_every: args.snapshot_every,
            snapshot_path: args.snapshot_path,
            restore: args.restore,
            mapper,
            roads,
            outbox_capacity: args.outbox_capacity,
            seek_mode: args.seek_mode,
            demo,
        })
    }

    /// Loopback listeners on OS-assigned ports with snapshots disabled.
    pub fn ephemeral() -> Self {
        Self {
            viewer_addr: "127.0.0.1:0".to_string(),
            ingest_addr: "127.0.0.1:0".to_string(),
            retention: None,
            snapshot_every: 0,
            snapshot_path: PathBuf::from("frames.json"),
            restore: false,
            mapper: CoordinateMapper::identity(),
            roads: RoadNetwork::empty(),
            outbox_capacity: 8,
            seek_mode: SeekMode::PerSession,
            demo: None,
        }
    }

    /// The store to start from: the restored snapshot when requested and
    /// present, otherwise an empty history.
    pub fn initial_store(&self) -> Result<FrameStore> {
        if !self.restore {
            return Ok(FrameStore::new(self.retention));
        }
        if !self.snapshot_path.exists() {
            warn!(
                "No snapshot at {}, starting with an empty history",
                self.snapshot_path.display()
            );
            return Ok(FrameStore::new(self.retention));
        }

        let file = persistence::load_snapshot(&self.snapshot_path)?;
        let store = file.into_store(self.retention);
        info!(
            "Restored {} frames (indices {}..{}) from {}",
            store.len(),
            store.first_index(),
            store.next_index(),
            self.snapshot_path.display()
        );
        Ok(store)
    }
}
