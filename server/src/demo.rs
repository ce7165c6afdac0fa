//! Local stand-in for the external simulator.
//!
//! Drives a swarm of agents along the road network on a fixed tick and appends
//! each tick straight into the distributor. Positions are already in display
//! space, so the coordinate mapper is bypassed.

use crate::config::DemoConfig;
use crate::distributor::LiveDistributor;
use crate::frame_store::Agent;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::roads::RoadNetwork;
use shared::swarm::AgentSwarm;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub struct DemoSynthesizer {
    network: RoadNetwork,
    swarm: AgentSwarm,
    step: f64,
    tick: Duration,
    rng: StdRng,
}

impl DemoSynthesizer {
    pub fn new(config: &DemoConfig, network: RoadNetwork) -> Self {
        Self::with_rng(config, network, StdRng::from_entropy())
    }

    pub fn with_rng(config: &DemoConfig, network: RoadNetwork, mut rng: StdRng) -> Self {
        let swarm = AgentSwarm::spawn(&network, config.agents, config.respawn_distance, &mut rng);
        Self {
            network,
            swarm,
            step: config.step,
            tick: config.tick,
            rng,
        }
    }

    /// Advances every agent one tick and returns the resulting frame contents.
    pub fn next_frame(&mut self) -> Vec<Agent> {
        self.swarm
            .step(&self.network, self.step, &mut self.rng)
            .iter()
            .copied()
            .map(Agent::from)
            .collect()
    }

    /// Runs the synthesizer until the returned task is aborted.
    pub fn spawn(mut self, distributor: Arc<LiveDistributor>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Demo synthesizer running {} agents every {:?}",
                self.swarm.len(),
                self.tick
            );
            let mut ticker = interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let agents = self.next_frame();
                let frame = distributor.ingest(agents).await;
                if frame.index % 100 == 0 {
                    debug!("Demo frame {}", frame.index);
                }
            }
        })
    }
}
