//! # Feeder Library
//!
//! Stand-in for the external agent simulator. It moves a swarm of agents
//! along a road network in simulator coordinates and streams one JSON batch
//! per tick to the relay's ingest port.
//!
//! ## Module Organization
//!
//! ### Simulation Module (`sim`)
//! Owns the road network and the swarm:
//! - Road-snapped motion via `RoadNetwork::advance`
//! - Respawning of agents that drift off the network
//! - Step size scaled by the viewer-controlled `sim_speed`
//!
//! ### Network Module (`network`)
//! JSON-lines client for the ingest endpoint:
//! - Sending batches and reading the per-line reply
//! - Polling the simulator settings with `{"command": "get_settings"}`
//! - The fixed-rate feed loop

pub mod network;
pub mod sim;
