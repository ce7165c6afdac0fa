//! Viewer session tracking and per-session outbound buffering
//!
//! This module handles the server-side bookkeeping for connected viewers:
//! - Session lifecycle (connect, disconnect)
//! - Live-subscription flag and the last frame index delivered to each viewer
//! - A bounded outbox per session, drained by that session's writer task
//!
//! Pushing into an outbox never blocks. When a slow viewer lets its outbox fill
//! up, the oldest queued frame is discarded: positions supersede each other, so
//! a viewer only ever needs the freshest state.

use crate::frame_store::Frame;
use log::{info, warn};
use shared::Packet;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;

/// An item waiting to be written to a viewer.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame { frame: Arc<Frame>, total_frames: u64 },
    Packet(Packet),
}

impl Outbound {
    pub fn is_frame(&self) -> bool {
        matches!(self, Outbound::Frame { .. })
    }

    /// Converts a queued item into the packet written to the socket.
    pub fn into_packet(self) -> Packet {
        match self {
            Outbound::Frame {
                frame,
                total_frames,
            } => Packet::Frame(frame.to_update(total_frames)),
            Outbound::Packet(packet) => packet,
        }
    }
}

/// Bounded, drop-oldest queue between the distributor and one writer task.
#[derive(Debug)]
pub struct Outbox {
    queue: Mutex<VecDeque<Outbound>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Outbox {
    /// Creates an open outbox holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queues `item`. Returns false if the outbox has been closed.
    pub fn push(&self, item: Outbound) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                // Prefer discarding a stale frame over a control packet.
                let victim = queue.iter().position(Outbound::is_frame).unwrap_or(0);
                queue.remove(victim);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Waits for the next item. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<Outbound> {
        loop {
            let notified = self.notify.notified();
            let next = self.lock().pop_front();
            if let Some(item) = next {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Pops the next item without waiting.
    pub fn try_recv(&self) -> Option<Outbound> {
        self.lock().pop_front()
    }

    /// Closes the outbox and wakes the writer so it can finish.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of items discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Outbound>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A connected viewer.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier assigned by the server
    pub id: u32,
    /// Whether live appends are pushed to this viewer
    pub subscribed: bool,
    pub connected_at: Instant,
    /// Index of the last frame queued for this viewer, -1 if none
    last_sent_index: AtomicI64,
    outbox: Arc<Outbox>,
}

impl Session {
    pub fn new(id: u32, outbox: Arc<Outbox>) -> Self {
        Self {
            id,
            subscribed: true,
            connected_at: Instant::now(),
            last_sent_index: AtomicI64::new(-1),
            outbox,
        }
    }

    /// Index of the last frame queued for this viewer, or -1.
    pub fn last_sent_index(&self) -> i64 {
        self.last_sent_index.load(Ordering::Acquire)
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Queues a frame and records it as the last one sent.
    pub fn deliver_frame(&self, frame: &Arc<Frame>, total_frames: u64) -> bool {
        let queued = self.outbox.push(Outbound::Frame {
            frame: Arc::clone(frame),
            total_frames,
        });
        if queued {
            self.last_sent_index.store(frame.index as i64, Ordering::Release);
        } else {
            warn!("Session {} outbox closed, frame {} not delivered", self.id, frame.index);
        }
        queued
    }

    /// Queues a control packet. Returns false once the outbox is closed.
    pub fn send(&self, packet: Packet) -> bool {
        let queued = self.outbox.push(Outbound::Packet(packet));
        if !queued {
            warn!("Session {} outbox closed, packet not delivered", self.id);
        }
        queued
    }
}

/// Registry of all connected viewers.
#[derive(Debug)]
pub struct SessionManager {
    /// Connected sessions indexed by their unique ID
    sessions: HashMap<u32, Session>,
    /// Next available session ID
    next_session_id: u32,
    /// Outbox capacity for new sessions
    outbox_capacity: usize,
}

impl SessionManager {
    /// Session IDs start from 1 and increment for each new connection.
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_session_id: 1,
            outbox_capacity,
        }
    }

    /// Registers a new session and returns its id and outbox.
    pub fn add_session(&mut self) -> (u32, Arc<Outbox>) {
        let id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1).max(1);

        let outbox = Arc::new(Outbox::new(self.outbox_capacity));
        self.sessions.insert(id, Session::new(id, Arc::clone(&outbox)));
        info!("Session {} connected ({} total)", id, self.sessions.len());
        (id, outbox)
    }

    /// Removes a session and closes its outbox. Returns false if it was
    /// already gone.
    pub fn remove_session(&mut self, id: u32) -> bool {
        if let Some(session) = self.sessions.remove(&id) {
            session.outbox.close();
            info!(
                "Session {} disconnected after {:.1}s",
                id,
                session.connected_at.elapsed().as_secs_f32()
            );
            true
        } else {
            false
        }
    }

    /// Looks up a session by id.
    pub fn get(&self, id: u32) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Returns false when no session has this id.
    pub fn set_subscribed(&mut self, id: u32, subscribed: bool) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.subscribed = subscribed;
                true
            }
            None => false,
        }
    }

    /// Queues `frame` for every subscribed session. Returns how many accepted it.
    pub fn broadcast_frame(&self, frame: &Arc<Frame>, total_frames: u64) -> usize {
        self.sessions
            .values()
            .filter(|s| s.subscribed)
            .filter(|s| s.deliver_frame(frame, total_frames))
            .count()
    }

    /// Queues `packet` for every session, subscribed or not.
    pub fn broadcast(&self, packet: &Packet) -> usize {
        self.sessions
            .values()
            .filter(|s| s.send(packet.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
