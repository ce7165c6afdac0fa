use crate::sim::{Batch, Simulation};
use log::{debug, info, warn};
use serde::Serialize;
use shared::{IngestReply, SimSettings};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{interval, MissedTickBehavior};

/// JSON-lines connection to the relay's ingest port.
pub struct FeedClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FeedClient {
    pub async fn connect(addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        info!("Connected to ingest endpoint {}", addr);
        let (reader, writer) = stream.into_split();
        Ok(FeedClient {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn request<T: Serialize>(
        &mut self,
        payload: &T,
    ) -> Result<IngestReply, Box<dyn std::error::Error>> {
        let mut line = serde_json::to_vec(payload)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;

        match self.lines.next_line().await? {
            Some(reply) => Ok(serde_json::from_str(&reply)?),
            None => Err("relay closed the ingest connection".into()),
        }
    }

    /// Sends one batch and waits for the relay's reply line.
    pub async fn send_batch(
        &mut self,
        batch: &Batch,
    ) -> Result<IngestReply, Box<dyn std::error::Error>> {
        self.request(batch).await
    }

    pub async fn fetch_settings(&mut self) -> Result<SimSettings, Box<dyn std::error::Error>> {
        match self
            .request(&serde_json::json!({ "command": "get_settings" }))
            .await?
        {
            IngestReply::Settings { settings } => Ok(settings),
            IngestReply::Error { message, .. } => Err(message.into()),
            other => Err(format!("unexpected reply to get_settings: {:?}", other).into()),
        }
    }
}

/// Streams one batch per tick, refreshing the settings every
/// `settings_every` ticks. Stops after `max_ticks` batches when given.
pub async fn run(
    client: &mut FeedClient,
    sim: &mut Simulation,
    tick: Duration,
    settings_every: u64,
    max_ticks: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = client.fetch_settings().await?;
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sent = 0u64;

    while max_ticks.map_or(true, |max| sent < max) {
        ticker.tick().await;

        if settings_every > 0 && sent > 0 && sent % settings_every == 0 {
            match client.fetch_settings().await {
                Ok(fresh) => {
                    if fresh != settings {
                        info!("Settings changed, sim_speed now {}", fresh.sim_speed);
                    }
                    settings = fresh;
                }
                Err(e) => warn!("Failed to refresh settings: {}", e),
            }
        }

        let batch = sim.tick(&settings);
        match client.send_batch(&batch).await? {
            IngestReply::Success {
                frame,
                accepted,
                rejected,
            } => {
                debug!("Batch {} stored as frame {} ({} agents)", batch.frame_id, frame, accepted);
                if !rejected.is_empty() {
                    warn!("Relay skipped {} entries of batch {}", rejected.len(), batch.frame_id);
                }
            }
            IngestReply::Error { message, .. } => {
                warn!("Relay refused batch {}: {}", batch.frame_id, message)
            }
            IngestReply::Settings { .. } => warn!("Unexpected settings reply to a batch"),
        }
        sent += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shared::roads::RoadNetwork;
    use shared::Point2D;
    use tokio::net::TcpListener;

    /// Minimal relay stand-in: answers `get_settings` and acknowledges batches.
    async fn fake_relay(settings: SimSettings) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let mut received = Vec::new();
            let mut frame = 0;

            while let Ok(Some(line)) = lines.next_line().await {
                let reply = if line.contains("get_settings") {
                    IngestReply::Settings {
                        settings: settings.clone(),
                    }
                } else {
                    frame += 1;
                    IngestReply::Success {
                        frame: frame - 1,
                        accepted: 1,
                        rejected: Vec::new(),
                    }
                };
                received.push(line);
                let mut out = serde_json::to_vec(&reply).unwrap();
                out.push(b'\n');
                writer.write_all(&out).await.unwrap();
            }
            received
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_fetch_settings() {
        let mut settings = SimSettings::default();
        settings.sim_speed = 2.0;
        let (addr, _relay) = fake_relay(settings.clone()).await;

        let mut client = FeedClient::connect(&addr).await.unwrap();
        let fetched = tokio_test::assert_ok!(client.fetch_settings().await);
        assert_eq!(fetched, settings);
    }

    #[tokio::test]
    async fn test_run_sends_batches_and_polls_settings() {
        let (addr, relay) = fake_relay(SimSettings::default()).await;
        let network = RoadNetwork::from_polylines(vec![vec![
            Point2D::new(0.0, 0.0),
            Point2D::new(100.0, 0.0),
        ]]);
        let mut sim = Simulation::new(network, 2, 1.0, StdRng::seed_from_u64(5));

        let mut client = FeedClient::connect(&addr).await.unwrap();
        run(&mut client, &mut sim, Duration::from_millis(1), 2, Some(4))
            .await
            .unwrap();
        drop(client);

        let received = relay.await.unwrap();
        let settings_polls = received.iter().filter(|l| l.contains("get_settings")).count();
        let batches: Vec<Batch> = received
            .iter()
            .filter(|l| !l.contains("get_settings"))
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        // initial fetch plus one refresh before the third batch
        assert_eq!(settings_polls, 2);
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[3].frame_id, 3);
        assert_eq!(batches[0].agents.len(), 2);
    }
}
