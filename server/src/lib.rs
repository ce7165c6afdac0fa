//! # Frame Relay Server Library
//!
//! This library sits between an external agent simulator and any number of
//! live viewers. It records every simulation tick as an immutable frame, keeps
//! the full history addressable by index, and fans new frames out to viewers as
//! they arrive.
//!
//! ## Core Responsibilities
//!
//! ### Ingest
//! The simulator streams one JSON batch of `{id, x, y}` entries per tick. Each
//! batch is validated entry by entry, mapped from simulator coordinates into
//! display coordinates through a fixed projective transform, and appended to
//! the history as one frame.
//!
//! ### History
//! Frames carry dense, absolute indices. Viewers may request any retained
//! frame at any time; an optional retention limit evicts the oldest frames
//! without renumbering the rest. The history is periodically snapshotted to a
//! JSON file and can be restored from it at startup.
//!
//! ### Live Distribution
//! Every new frame is pushed to every subscribed viewer unless playback is
//! paused. A viewer joining late receives only the latest frame, never a
//! backlog. Pause and resume are global and are announced to all viewers.
//!
//! ## Architecture Design
//!
//! ### One Lock Around Shared State
//! The frame history, the session registry and the simulator settings live
//! behind a single `tokio::sync::RwLock` inside [`distributor::LiveDistributor`].
//! Appends and pause changes take the write half together, so no frame is ever
//! delivered to some viewers under a stale pause flag.
//!
//! ### Non-Blocking Delivery
//! Each viewer has a bounded outbox drained by its own writer task. Pushing
//! never waits; when a slow viewer's outbox is full the oldest queued frame is
//! dropped. The simulator is never slowed down by a viewer.
//!
//! ### TCP Transport
//! Viewers speak length-prefixed bincode packets (see [`shared::Packet`]);
//! the simulator speaks newline-delimited JSON and gets one JSON reply per line.
//!
//! ## Module Organization
//!
//! ### Mapper (`mapper`)
//! Fits and applies the 4-point homography between simulator and display space.
//!
//! ### Frame Store (`frame_store`)
//! Append-only history with cursor, pause flag and retention.
//!
//! ### Sessions (`session_manager`)
//! Viewer registry and the per-session drop-oldest outbox.
//!
//! ### Distributor (`distributor`)
//! Connect, ingest, seek, pause/resume, subscribe and settings operations.
//!
//! ### Ingest (`ingest`)
//! Schema validation of simulator batches and the reply protocol.
//!
//! ### Persistence (`persistence`)
//! Atomic JSON snapshots written by a background task.
//!
//! ### Network (`network`)
//! TCP listeners and per-connection tasks.
//!
//! ### Demo (`demo`)
//! Optional local synthesizer that drives agents along a road network.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::distributor::LiveDistributor;
//! use server::network::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::ephemeral();
//!     let distributor = Arc::new(LiveDistributor::new(
//!         config.initial_store()?,
//!         config.outbox_capacity,
//!     ));
//!
//!     let server = Server::bind(&config, distributor).await?;
//!     println!("viewers: {}", server.viewer_addr()?);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod demo;
pub mod distributor;
pub mod error;
pub mod frame_store;
pub mod ingest;
pub mod mapper;
pub mod network;
pub mod persistence;
pub mod session_manager;
