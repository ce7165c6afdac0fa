//! Types shared between the relay server, the feeder and viewer tools.
//!
//! The viewer protocol is a stream of length-prefixed bincode [`Packet`]s over a
//! persistent TCP connection. Geometry helpers ([`Point2D`], [`roads`]) and the
//! road-constrained demo motion ([`swarm`]) live here so that both the server's
//! local synthesizer and the external feeder use the same algorithm.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod roads;
pub mod swarm;

/// Upper bound for a single framed packet body.
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;
pub const DEFAULT_VIEWER_PORT: u16 = 8080;
pub const DEFAULT_INGEST_PORT: u16 = 8081;

/// A position in a planar coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn add(&self, other: &Point2D) -> Point2D {
        Point2D::new(self.x + other.x, self.y + other.y)
    }

    pub fn sub(&self, other: &Point2D) -> Point2D {
        Point2D::new(self.x - other.x, self.y - other.y)
    }

    pub fn scale(&self, scalar: f64) -> Point2D {
        Point2D::new(self.x * scalar, self.y * scalar)
    }

    pub fn dot(&self, other: &Point2D) -> f64 {
        self.x * other.x + self.y * other.y
    }

    pub fn length(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn distance(&self, other: &Point2D) -> f64 {
        self.sub(other).length()
    }

    /// Point at parameter `t` on the segment from `self` to `other`.
    pub fn lerp(&self, other: &Point2D, t: f64) -> Point2D {
        self.add(&other.sub(self).scale(t))
    }

    /// Unit vector in the same direction, or `None` for a (near) zero vector.
    pub fn normalized(&self) -> Option<Point2D> {
        let len = self.length();
        if len <= f64::EPSILON {
            None
        } else {
            Some(self.scale(1.0 / len))
        }
    }
}

/// One agent as it travels over the wire and in snapshot files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: u32,
    pub x: f64,
    pub y: f64,
}

impl AgentState {
    pub fn new(id: u32, position: Point2D) -> Self {
        Self {
            id,
            x: position.x,
            y: position.y,
        }
    }

    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }
}

/// Push event carrying one frame to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameUpdate {
    pub frame_index: u64,
    pub total_frames: u64,
    pub agents: Vec<AgentState>,
}

/// Broadcast to every viewer whenever the pause state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub is_paused: bool,
    /// -1 while the history is empty.
    pub current_frame: i64,
    pub total_frames: u64,
}

/// Knobs the viewers tune and the simulator polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimSettings {
    pub car_size: u32,
    pub sim_speed: f64,
    pub policies: BTreeMap<String, bool>,
    pub heatmap: bool,
}

impl Default for SimSettings {
    fn default() -> Self {
        let policies = (1..=4).map(|i| (format!("switch{}", i), false)).collect();
        Self {
            car_size: 6,
            sim_speed: 0.0,
            policies,
            heatmap: false,
        }
    }
}

/// Why one entry of an ingest batch was skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Position of the entry within the batch.
    pub position: usize,
    pub reason: String,
}

/// One JSON line sent back on the ingest connection for every request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestReply {
    Success {
        frame: u64,
        accepted: usize,
        rejected: Vec<Rejection>,
    },
    Error {
        message: String,
        rejected: Vec<Rejection>,
    },
    Settings {
        settings: SimSettings,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    // viewer -> server
    Subscribe,
    Unsubscribe,
    RequestFrame { index: i64 },
    Pause,
    Resume,
    UpdateSettings(SimSettings),
    Disconnect,

    // server -> viewer
    Frame(FrameUpdate),
    Playback(PlaybackStatus),
    Settings(SimSettings),
    Error { reason: String },
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Packet of {0} bytes exceeds the size limit")]
    TooLarge(u32),
}

/// Writes one packet as a big-endian `u32` length followed by the bincode body.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(packet)?;
    let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
    if len > MAX_PACKET_SIZE {
        return Err(WireError::TooLarge(len));
    }
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one packet. Returns `Ok(None)` when the peer closed the stream cleanly
/// between packets.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_PACKET_SIZE {
        return Err(WireError::TooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(u64::MAX as u128) as u64
}
