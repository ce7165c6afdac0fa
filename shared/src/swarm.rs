//! Locally synthesized agents that drive along a [`RoadNetwork`].

use crate::roads::RoadNetwork;
use crate::{AgentState, Point2D};
use rand::Rng;

/// A fixed-size group of demo agents with road-snapped motion.
#[derive(Debug, Clone)]
pub struct AgentSwarm {
    agents: Vec<AgentState>,
    /// Agents farther than this from every road are respawned on the network.
    respawn_distance: f64,
}

impl AgentSwarm {
    /// Places `count` agents at random points on the network, with ids `0..count`.
    pub fn spawn<R: Rng + ?Sized>(
        network: &RoadNetwork,
        count: usize,
        respawn_distance: f64,
        rng: &mut R,
    ) -> Self {
        let agents = (0..count)
            .map(|i| AgentState::new(i as u32, network.random_point(rng)))
            .collect();
        Self {
            agents,
            respawn_distance,
        }
    }

    pub fn agents(&self) -> &[AgentState] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Advances every agent by `step` and returns the new positions.
    pub fn step<R: Rng + ?Sized>(
        &mut self,
        network: &RoadNetwork,
        step: f64,
        rng: &mut R,
    ) -> &[AgentState] {
        let respawn_distance = self.respawn_distance;
        for agent in &mut self.agents {
            let next = network.advance(agent.position(), step, rng);
            let position = if drifted(network, &next, respawn_distance) {
                network.random_point(rng)
            } else {
                next
            };
            *agent = AgentState::new(agent.id, position);
        }
        &self.agents
    }
}

fn drifted(network: &RoadNetwork, point: &Point2D, limit: f64) -> bool {
    network
        .nearest(point)
        .map_or(false, |n| n.distance > limit)
}
