//! Live fan-out of frames to viewer sessions.
//!
//! The frame history, the session registry and the simulator settings sit
//! behind one `RwLock`. Every state change (append, pause, connect, shared
//! seek) takes the write half, so an append always sees the current pause flag
//! and delivers to a consistent set of sessions. Per-session seeks only read
//! the history and take the read half, so they never queue behind each other.
//!
//! Delivery itself never waits: frames are pushed into bounded per-session
//! outboxes which are drained by each connection's writer task.

use crate::error::{RelayError, Result};
use crate::frame_store::{Agent, Frame, FrameStore};
use crate::persistence::Snapshot;
use crate::session_manager::{Outbox, SessionManager};
use log::{debug, info, warn};
use shared::{Packet, PlaybackStatus, SimSettings};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

/// Whether a seek request moves only the requesting viewer or everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SeekMode {
    /// The sought frame goes to the requester only; the global cursor stays.
    #[default]
    PerSession,
    /// The global cursor moves and every subscribed viewer gets the frame.
    Shared,
}

#[derive(Debug)]
struct HubState {
    store: FrameStore,
    sessions: SessionManager,
    settings: SimSettings,
    appends: u64,
    snapshots: Option<mpsc::Sender<Snapshot>>,
}

impl HubState {
    fn playback_status(&self) -> PlaybackStatus {
        PlaybackStatus {
            is_paused: self.store.is_paused(),
            current_frame: self.store.cursor(),
            total_frames: self.store.next_index(),
        }
    }
}

pub struct LiveDistributor {
    state: RwLock<HubState>,
    seek_mode: SeekMode,
    snapshot_every: u64,
}

impl LiveDistributor {
    /// Creates a distributor over `store` with per-session seek and no snapshots.
    pub fn new(store: FrameStore, outbox_capacity: usize) -> Self {
        Self {
            state: RwLock::new(HubState {
                store,
                sessions: SessionManager::new(outbox_capacity),
                settings: SimSettings::default(),
                appends: 0,
                snapshots: None,
            }),
            seek_mode: SeekMode::default(),
            snapshot_every: 0,
        }
    }

    /// Selects how `seek` treats the global cursor.
    pub fn with_seek_mode(mut self, seek_mode: SeekMode) -> Self {
        self.seek_mode = seek_mode;
        self
    }

    /// Hands a copy of the history to `sink` after every `every` appends.
    /// An interval of zero disables snapshots.
    pub fn with_snapshots(mut self, every: u64, sink: mpsc::Sender<Snapshot>) -> Self {
        self.snapshot_every = every;
        self.state.get_mut().snapshots = if every > 0 { Some(sink) } else { None };
        self
    }

    /// Registers a viewer. If any frame exists, the latest one is queued for
    /// this viewer only; earlier frames are not replayed.
    pub async fn connect(&self) -> (u32, Arc<Outbox>) {
        let mut state = self.state.write().await;
        let (id, outbox) = state.sessions.add_session();

        if let Ok(frame) = state.store.latest() {
            let total = state.store.next_index();
            if let Some(session) = state.sessions.get(id) {
                session.deliver_frame(&frame, total);
                debug!("Session {} caught up to frame {}", id, frame.index);
            }
        }
        (id, outbox)
    }

    /// Removes a viewer and closes its outbox. History is untouched.
    pub async fn disconnect(&self, id: u32) -> bool {
        self.state.write().await.sessions.remove_session(id)
    }

    /// Stores a frame and, unless playback is paused, pushes it to every
    /// subscribed viewer.
    pub async fn ingest(&self, agents: Vec<Agent>) -> Arc<Frame> {
        let mut state = self.state.write().await;
        let frame = state.store.append(agents);
        let total = state.store.next_index();

        if state.store.is_paused() {
            debug!("Paused, frame {} stored without delivery", frame.index);
        } else {
            let delivered = state.sessions.broadcast_frame(&frame, total);
            debug!("Frame {} delivered to {} sessions", frame.index, delivered);
        }

        state.appends += 1;
        if self.snapshot_every > 0 && state.appends % self.snapshot_every == 0 {
            schedule_snapshot(&state);
        }
        frame
    }

    /// Detaches the snapshot sink after queueing one last snapshot. Once the
    /// sink is dropped the writer task finishes the queue and exits.
    pub async fn flush_snapshots(&self) -> bool {
        let mut state = self.state.write().await;
        let Some(sink) = state.snapshots.take() else {
            return false;
        };
        let snapshot = Snapshot::of(&state.store);
        drop(state);
        sink.send(snapshot).await.is_ok()
    }

    /// Answers a viewer's request for a specific frame.
    ///
    /// On failure the viewer is sent an `Error` packet and nothing else
    /// changes.
    pub async fn seek(&self, id: u32, index: i64) -> Result<Arc<Frame>> {
        match self.seek_mode {
            SeekMode::PerSession => self.seek_for_session(id, index).await,
            SeekMode::Shared => self.seek_shared(id, index).await,
        }
    }

    async fn seek_for_session(&self, id: u32, index: i64) -> Result<Arc<Frame>> {
        let state = self.state.read().await;
        let session = state.sessions.get(id).ok_or(RelayError::UnknownSession(id))?;

        match state.store.read(index) {
            Ok(frame) => {
                session.deliver_frame(&frame, state.store.next_index());
                Ok(frame)
            }
            Err(e) => {
                session.send(Packet::Error {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn seek_shared(&self, id: u32, index: i64) -> Result<Arc<Frame>> {
        let mut state = self.state.write().await;
        if state.sessions.get(id).is_none() {
            return Err(RelayError::UnknownSession(id));
        }

        let frame = match state.store.seek(index).and_then(|_| state.store.read(index)) {
            Ok(frame) => frame,
            Err(e) => {
                if let Some(session) = state.sessions.get(id) {
                    session.send(Packet::Error {
                        reason: e.to_string(),
                    });
                }
                return Err(e);
            }
        };

        let total = state.store.next_index();
        let delivered = state.sessions.broadcast_frame(&frame, total);
        if let Some(session) = state.sessions.get(id).filter(|s| !s.subscribed) {
            session.deliver_frame(&frame, total);
        }
        info!(
            "Session {} moved the shared cursor to frame {} ({} sessions)",
            id, frame.index, delivered
        );
        Ok(frame)
    }

    /// Sets the pause flag and tells every viewer about the new state.
    pub async fn set_paused(&self, paused: bool) -> PlaybackStatus {
        let mut state = self.state.write().await;
        state.store.set_paused(paused);

        let status = state.playback_status();
        state.sessions.broadcast(&Packet::Playback(status));
        info!(
            "Playback {} at frame {}",
            if paused { "paused" } else { "resumed" },
            status.current_frame
        );
        status
    }

    /// Re-attaches a viewer to live delivery and sends it the latest frame.
    /// While paused nothing is pushed; the viewer stays on its last frame
    /// until playback resumes or it seeks.
    pub async fn subscribe(&self, id: u32) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.sessions.set_subscribed(id, true) {
            return Err(RelayError::UnknownSession(id));
        }
        if state.store.is_paused() {
            return Ok(());
        }

        let total = state.store.next_index();
        if let (Ok(frame), Some(session)) = (state.store.latest(), state.sessions.get(id)) {
            session.deliver_frame(&frame, total);
        }
        Ok(())
    }

    /// Stops live pushes to a viewer; control replies still reach it.
    pub async fn unsubscribe(&self, id: u32) -> Result<()> {
        let mut state = self.state.write().await;
        if state.sessions.set_subscribed(id, false) {
            Ok(())
        } else {
            Err(RelayError::UnknownSession(id))
        }
    }

    /// Replaces the simulator settings and broadcasts them to every viewer.
    pub async fn update_settings(&self, settings: SimSettings) {
        let mut state = self.state.write().await;
        state.settings = settings.clone();
        let reached = state.sessions.broadcast(&Packet::Settings(settings));
        debug!("Settings updated, {} sessions notified", reached);
    }

    pub async fn settings(&self) -> SimSettings {
        self.state.read().await.settings.clone()
    }

    /// Queues a control packet for one viewer.
    pub async fn send_to(&self, id: u32, packet: Packet) -> bool {
        let state = self.state.read().await;
        match state.sessions.get(id) {
            Some(session) => session.send(packet),
            None => false,
        }
    }

    /// Current pause flag, cursor and frame count.
    pub async fn playback_status(&self) -> PlaybackStatus {
        self.state.read().await.playback_status()
    }

    pub async fn latest(&self) -> Result<Arc<Frame>> {
        self.state.read().await.store.latest()
    }

    pub async fn read(&self, index: i64) -> Result<Arc<Frame>> {
        self.state.read().await.store.read(index)
    }

    /// Count of frames ever appended.
    pub async fn total_frames(&self) -> u64 {
        self.state.read().await.store.next_index()
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Index of the last frame queued for a session.
    pub async fn last_sent_index(&self, id: u32) -> Option<i64> {
        let state = self.state.read().await;
        state.sessions.get(id).map(|s| s.last_sent_index())
    }

    /// Copy of the current history, e.g. for a final flush at shutdown.
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot::of(&self.state.read().await.store)
    }
}

fn schedule_snapshot(state: &HubState) {
    let Some(sink) = &state.snapshots else {
        return;
    };
    match sink.try_send(Snapshot::of(&state.store)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!("Snapshot writer busy, skipping this snapshot")
        }
        Err(TrySendError::Closed(_)) => warn!("Snapshot writer has stopped"),
    }
}
