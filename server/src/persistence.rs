//! Periodic JSON snapshots of the frame history.
//!
//! Snapshots are written off the hot path by a dedicated task. Each write goes
//! to a sibling temp file which is then renamed over the target, so readers
//! never observe a half-written file.

use crate::error::{RelayError, Result};
use crate::frame_store::{Agent, Frame, FrameStore};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use shared::AgentState;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// On-disk layout: one array of agents per retained frame, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub total_frames: usize,
    /// Index of `frames[0]`; zero unless old frames were evicted.
    #[serde(default)]
    pub first_index: u64,
    pub frames: Vec<Vec<AgentState>>,
}

impl SnapshotFile {
    /// Rebuilds a store holding the snapshot's frames at their original indices.
    pub fn into_store(self, retention_limit: Option<usize>) -> FrameStore {
        let mut store = FrameStore::starting_at(self.first_index, retention_limit);
        for agents in self.frames {
            store.append_at(agents.into_iter().map(Agent::from).collect(), None);
        }
        store
    }
}

/// In-memory copy of the history handed to the writer task.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub first_index: u64,
    pub frames: Vec<Arc<Frame>>,
}

impl Snapshot {
    pub fn of(store: &FrameStore) -> Self {
        Self {
            first_index: store.first_index(),
            frames: store.frames(),
        }
    }

    pub fn to_file(&self) -> SnapshotFile {
        SnapshotFile {
            total_frames: self.frames.len(),
            first_index: self.first_index,
            frames: self.frames.iter().map(|f| f.agent_states()).collect(),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Writes `snapshot` to `path` via write-to-temp-then-rename.
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let tmp = temp_path(path);
    let write = || -> std::io::Result<()> {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &snapshot.to_file())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    };

    write().map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        RelayError::PersistenceFailure(format!("{}: {}", path.display(), e))
    })
}

pub fn load_snapshot(path: &Path) -> Result<SnapshotFile> {
    let text = std::fs::read_to_string(path)?;
    let file: SnapshotFile = serde_json::from_str(&text)?;
    if file.total_frames != file.frames.len() {
        return Err(RelayError::Config(format!(
            "snapshot {} claims {} frames but holds {}",
            path.display(),
            file.total_frames,
            file.frames.len()
        )));
    }
    Ok(file)
}

/// Spawns the task that drains snapshot requests and writes them to `path`.
///
/// A failed write is logged and otherwise ignored; the next scheduled snapshot
/// simply tries again. The task resolves to whether its last write succeeded.
pub fn spawn_snapshot_writer(
    path: PathBuf,
    queue: usize,
) -> (mpsc::Sender<Snapshot>, JoinHandle<bool>) {
    let (tx, mut rx) = mpsc::channel::<Snapshot>(queue.max(1));

    let handle = tokio::spawn(async move {
        let mut last_ok = true;
        while let Some(snapshot) = rx.recv().await {
            let target = path.clone();
            let frames = snapshot.frames.len();
            let result =
                tokio::task::spawn_blocking(move || write_snapshot(&target, &snapshot)).await;

            last_ok = match result {
                Ok(Ok(())) => {
                    debug!("Snapshot of {} frames written to {}", frames, path.display());
                    true
                }
                Ok(Err(e)) => {
                    error!("{}", e);
                    false
                }
                Err(e) => {
                    error!("Snapshot task panicked: {}", e);
                    false
                }
            };
        }
        info!("Snapshot writer stopped");
        last_ok
    });

    (tx, handle)
}
