//! Server network layer: viewer and ingest TCP listeners

use crate::config::ServerConfig;
use crate::distributor::LiveDistributor;
use crate::error::Result;
use crate::ingest;
use crate::mapper::CoordinateMapper;
use crate::session_manager::Outbox;
use log::{debug, error, info, warn};
use shared::{read_packet, write_packet, Packet, MAX_PACKET_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Accepts viewers and simulators and wires them to the distributor
pub struct Server {
    viewer_listener: TcpListener,
    ingest_listener: TcpListener,
    distributor: Arc<LiveDistributor>,
    mapper: CoordinateMapper,
}

impl Server {
    pub async fn bind(config: &ServerConfig, distributor: Arc<LiveDistributor>) -> Result<Self> {
        let viewer_listener = TcpListener::bind(&config.viewer_addr).await?;
        let ingest_listener = TcpListener::bind(&config.ingest_addr).await?;
        info!("Viewers listening on {}", viewer_listener.local_addr()?);
        info!("Ingest listening on {}", ingest_listener.local_addr()?);

        Ok(Server {
            viewer_listener,
            ingest_listener,
            distributor,
            mapper: config.mapper,
        })
    }

    pub fn viewer_addr(&self) -> Result<SocketAddr> {
        Ok(self.viewer_listener.local_addr()?)
    }

    pub fn ingest_addr(&self) -> Result<SocketAddr> {
        Ok(self.ingest_listener.local_addr()?)
    }

    pub fn distributor(&self) -> &Arc<LiveDistributor> {
        &self.distributor
    }

    /// Accept loop. Every connection gets its own task; this never returns
    /// unless the surrounding task is dropped.
    pub async fn run(self) -> Result<()> {
        info!("Server started successfully");

        loop {
            tokio::select! {
                accepted = self.viewer_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let distributor = Arc::clone(&self.distributor);
                        tokio::spawn(handle_viewer(stream, addr, distributor));
                    }
                    Err(e) => error!("Failed to accept viewer: {}", e),
                },

                accepted = self.ingest_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let distributor = Arc::clone(&self.distributor);
                        let mapper = self.mapper;
                        tokio::spawn(handle_ingest(stream, addr, distributor, mapper));
                    }
                    Err(e) => error!("Failed to accept simulator: {}", e),
                },
            }
        }
    }
}

async fn handle_viewer(stream: TcpStream, addr: SocketAddr, distributor: Arc<LiveDistributor>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", addr, e);
    }
    let (reader, writer) = stream.into_split();

    let (id, outbox) = distributor.connect().await;
    info!("Viewer {} connected as session {}", addr, id);
    let writer_task = tokio::spawn(drain_outbox(writer, Arc::clone(&outbox), id));

    if let Err(e) = read_viewer_packets(reader, id, &distributor).await {
        warn!("Session {} read error: {}", id, e);
    }

    distributor.disconnect(id).await;
    if let Err(e) = writer_task.await {
        error!("Session {} writer task failed: {}", id, e);
    }
}

/// Writes queued items until the outbox is closed and empty or the socket fails.
async fn drain_outbox(mut writer: OwnedWriteHalf, outbox: Arc<Outbox>, id: u32) {
    while let Some(item) = outbox.recv().await {
        if let Err(e) = write_packet(&mut writer, &item.into_packet()).await {
            debug!("Session {} write failed: {}", id, e);
            outbox.close();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_viewer_packets(
    reader: OwnedReadHalf,
    id: u32,
    distributor: &LiveDistributor,
) -> std::result::Result<(), shared::WireError> {
    let mut reader = BufReader::new(reader);

    while let Some(packet) = read_packet(&mut reader).await? {
        if !handle_viewer_packet(packet, id, distributor).await {
            break;
        }
    }
    Ok(())
}

/// Applies one control packet. Returns false when the viewer asked to leave.
async fn handle_viewer_packet(packet: Packet, id: u32, distributor: &LiveDistributor) -> bool {
    match packet {
        Packet::Subscribe => {
            if let Err(e) = distributor.subscribe(id).await {
                warn!("{}", e);
            }
        }
        Packet::Unsubscribe => {
            if let Err(e) = distributor.unsubscribe(id).await {
                warn!("{}", e);
            }
        }
        Packet::RequestFrame { index } => {
            if let Err(e) = distributor.seek(id, index).await {
                debug!("Session {} seek to {} refused: {}", id, index, e);
            }
        }
        Packet::Pause => {
            distributor.set_paused(true).await;
        }
        Packet::Resume => {
            distributor.set_paused(false).await;
        }
        Packet::UpdateSettings(settings) => {
            distributor.update_settings(settings).await;
        }
        Packet::Disconnect => return false,

        other => {
            warn!("Unexpected packet from session {}: {:?}", id, other);
            distributor
                .send_to(
                    id,
                    Packet::Error {
                        reason: "unexpected packet".to_string(),
                    },
                )
                .await;
        }
    }
    true
}

async fn handle_ingest(
    stream: TcpStream,
    addr: SocketAddr,
    distributor: Arc<LiveDistributor>,
    mapper: CoordinateMapper,
) {
    info!("Simulator connected from {}", addr);
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        let max = MAX_PACKET_SIZE as usize;
        let line = match read_line_capped(&mut reader, &mut buf, max).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Ingest read error from {}: {}", addr, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = ingest::handle_line(&line, &distributor, &mapper).await;
        let mut encoded = match serde_json::to_vec(&reply) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode ingest reply: {}", e);
                break;
            }
        };
        encoded.push(b'\n');
        if let Err(e) = writer.write_all(&encoded).await {
            warn!("Failed to reply to simulator {}: {}", addr, e);
            break;
        }
    }
    info!("Simulator {} disconnected", addr);
}

/// Reads one line of at most `max` bytes, excluding the terminator.
/// Returns `None` at end of stream; a longer line is an `InvalidData` error.
async fn read_line_capped<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = max as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > max {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("ingest line exceeds {} bytes", max),
        ));
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf.clone())
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
