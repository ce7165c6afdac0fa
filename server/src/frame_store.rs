//! Append-only, randomly addressable frame history.
//!
//! Frames carry absolute indices that are never reassigned. With a retention
//! limit, the oldest frames are evicted and `first_index` moves forward, so a
//! given index always names the same frame for as long as it is retained.

use crate::error::{RelayError, Result};
use shared::{AgentState, FrameUpdate, Point2D};
use std::collections::VecDeque;
use std::sync::Arc;

/// An agent placed in a frame, in display coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Agent {
    pub id: u32,
    pub position: Point2D,
}

impl Agent {
    pub fn new(id: u32, position: Point2D) -> Self {
        Self { id, position }
    }
}

impl From<Agent> for AgentState {
    fn from(agent: Agent) -> Self {
        AgentState::new(agent.id, agent.position)
    }
}

impl From<AgentState> for Agent {
    fn from(state: AgentState) -> Self {
        Agent::new(state.id, state.position())
    }
}

/// Immutable snapshot of all agents at one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: u64,
    pub agents: Vec<Agent>,
    /// Milliseconds since the Unix epoch at which the frame was recorded.
    pub timestamp: Option<u64>,
}

impl Frame {
    /// Agent positions in wire form, in frame order.
    pub fn agent_states(&self) -> Vec<AgentState> {
        self.agents.iter().copied().map(AgentState::from).collect()
    }

    /// Builds the push sent to viewers for this frame.
    pub fn to_update(&self, total_frames: u64) -> FrameUpdate {
        FrameUpdate {
            frame_index: self.index,
            total_frames,
            agents: self.agent_states(),
        }
    }
}

#[derive(Debug)]
pub struct FrameStore {
    frames: VecDeque<Arc<Frame>>,
    first_index: u64,
    cursor: i64,
    paused: bool,
    retention_limit: Option<usize>,
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl FrameStore {
    /// A `retention_limit` of zero is treated as unlimited.
    pub fn new(retention_limit: Option<usize>) -> Self {
        Self {
            frames: VecDeque::new(),
            first_index: 0,
            cursor: -1,
            paused: false,
            retention_limit: retention_limit.filter(|&limit| limit > 0),
        }
    }

    /// Starts a store whose first frame will carry `first_index`, used when
    /// restoring a snapshot of an evicted history.
    pub fn starting_at(first_index: u64, retention_limit: Option<usize>) -> Self {
        Self {
            first_index,
            ..Self::new(retention_limit)
        }
    }

    /// Appends a frame stamped with the current time and moves the cursor to it.
    pub fn append(&mut self, agents: Vec<Agent>) -> Arc<Frame> {
        self.append_at(agents, Some(shared::get_timestamp()))
    }

    /// Appends a frame and moves the cursor onto it. Evicts the oldest frame
    /// when the retention limit is exceeded.
    pub fn append_at(&mut self, agents: Vec<Agent>, timestamp: Option<u64>) -> Arc<Frame> {
        let frame = Arc::new(Frame {
            index: self.next_index(),
            agents,
            timestamp,
        });
        self.frames.push_back(Arc::clone(&frame));
        self.cursor = frame.index as i64;

        if let Some(limit) = self.retention_limit {
            while self.frames.len() > limit {
                self.frames.pop_front();
                self.first_index += 1;
            }
        }
        frame
    }

    /// Returns the retained frame at absolute `index`.
    pub fn read(&self, index: i64) -> Result<Arc<Frame>> {
        let offset = self.offset_of(index)?;
        Ok(Arc::clone(&self.frames[offset]))
    }

    /// Moves the cursor without touching the history.
    pub fn seek(&mut self, index: i64) -> Result<()> {
        self.offset_of(index)?;
        self.cursor = index;
        Ok(())
    }

    /// Most recent frame, or `EmptyHistory`.
    pub fn latest(&self) -> Result<Arc<Frame>> {
        self.frames.back().cloned().ok_or(RelayError::EmptyHistory)
    }

    /// Frame under the cursor, if any.
    pub fn current(&self) -> Option<Arc<Frame>> {
        self.read(self.cursor).ok()
    }

    /// Toggles the pause flag. Appends and reads are unaffected.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// -1 when the history is empty.
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Number of retained frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Absolute index of the oldest retained frame.
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Index the next appended frame will get; also the count of frames ever
    /// appended (including restored and evicted ones).
    pub fn next_index(&self) -> u64 {
        self.first_index + self.frames.len() as u64
    }

    pub fn retention_limit(&self) -> Option<usize> {
        self.retention_limit
    }

    /// Cheap copy of the retained history, oldest first.
    pub fn frames(&self) -> Vec<Arc<Frame>> {
        self.frames.iter().cloned().collect()
    }

    fn offset_of(&self, index: i64) -> Result<usize> {
        let out_of_range = || RelayError::IndexOutOfRange {
            index,
            first: self.first_index,
            end: self.next_index(),
        };
        if index < 0 {
            return Err(out_of_range());
        }
        let index = index as u64;
        if index < self.first_index || index >= self.next_index() {
            return Err(out_of_range());
        }
        Ok((index - self.first_index) as usize)
    }
}
