use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use shared::roads::RoadNetwork;
use shared::swarm::AgentSwarm;
use shared::{AgentState, SimSettings};

/// Agents farther than this many base steps from every road get respawned.
const RESPAWN_STEPS: f64 = 10.0;

/// One tick as sent on the ingest connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub frame_id: u64,
    pub agents: Vec<AgentState>,
}

/// Road-constrained agent motion in simulator coordinates.
pub struct Simulation {
    network: RoadNetwork,
    swarm: AgentSwarm,
    base_step: f64,
    frame_id: u64,
    rng: StdRng,
}

impl Simulation {
    pub fn new(network: RoadNetwork, agents: usize, base_step: f64, mut rng: StdRng) -> Self {
        let swarm = AgentSwarm::spawn(&network, agents, base_step * RESPAWN_STEPS, &mut rng);
        Self {
            network,
            swarm,
            base_step,
            frame_id: 0,
            rng,
        }
    }

    /// Distance moved per tick: the base step scaled by `sim_speed` when the
    /// viewers have set one.
    pub fn effective_step(&self, settings: &SimSettings) -> f64 {
        if settings.sim_speed > 0.0 {
            self.base_step * settings.sim_speed
        } else {
            self.base_step
        }
    }

    pub fn tick(&mut self, settings: &SimSettings) -> Batch {
        let step = self.effective_step(settings);
        let agents = self.swarm.step(&self.network, step, &mut self.rng).to_vec();
        let batch = Batch {
            frame_id: self.frame_id,
            agents,
        };
        self.frame_id += 1;
        batch
    }

    pub fn agent_count(&self) -> usize {
        self.swarm.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use shared::Point2D;

    fn line_network() -> RoadNetwork {
        RoadNetwork::from_polylines(vec![vec![
            Point2D::new(0.0, 0.0),
            Point2D::new(1_000_000.0, 0.0),
        ]])
    }

    #[test]
    fn test_effective_step_follows_sim_speed() {
        let sim = Simulation::new(line_network(), 1, 2.0, StdRng::seed_from_u64(1));
        let mut settings = SimSettings::default();
        assert_approx_eq!(sim.effective_step(&settings), 2.0, 1e-12);

        settings.sim_speed = 3.0;
        assert_approx_eq!(sim.effective_step(&settings), 6.0, 1e-12);

        settings.sim_speed = -1.0;
        assert_approx_eq!(sim.effective_step(&settings), 2.0, 1e-12);
    }

    #[test]
    fn test_tick_numbers_batches() {
        let mut sim = Simulation::new(line_network(), 4, 1.0, StdRng::seed_from_u64(2));
        let settings = SimSettings::default();

        let first = sim.tick(&settings);
        let second = sim.tick(&settings);
        assert_eq!(first.frame_id, 0);
        assert_eq!(second.frame_id, 1);
        assert_eq!(second.agents.len(), 4);
        assert_eq!(sim.agent_count(), 4);
    }

    #[test]
    fn test_agents_move_by_at_most_one_step() {
        let mut sim = Simulation::new(line_network(), 3, 1.5, StdRng::seed_from_u64(3));
        let settings = SimSettings::default();

        let mut previous = sim.tick(&settings).agents;
        for _ in 0..20 {
            let next = sim.tick(&settings).agents;
            for (a, b) in previous.iter().zip(&next) {
                assert!(a.position().distance(&b.position()) <= 1.5 + 1e-9);
                assert_approx_eq!(b.y, 0.0, 1e-9);
            }
            previous = next;
        }
    }

    #[test]
    fn test_batch_json_shape() {
        let batch = Batch {
            frame_id: 7,
            agents: vec![AgentState::new(1, Point2D::new(2.0, 3.0))],
        };
        let json = serde_json::to_value(&batch).unwrap();

        assert_eq!(json["frame_id"], 7);
        assert_eq!(json["agents"][0]["id"], 1);
        assert_eq!(json["agents"][0]["y"], 3.0);
    }
}
