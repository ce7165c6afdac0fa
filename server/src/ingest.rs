//! Schema validation for simulator batches.
//!
//! Every line on the ingest connection is one JSON document: either a batch of
//! agent updates or a command. A batch is a bare array of `{id, x, y}` entries
//! or an object holding such an array under `agents`. Each entry is validated
//! on its own; bad entries are reported and skipped, good ones are mapped into
//! display space. Only a batch where every entry failed is refused outright.

use crate::distributor::LiveDistributor;
use crate::error::{RelayError, Result};
use crate::frame_store::Agent;
use crate::mapper::CoordinateMapper;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use shared::{AgentState, IngestReply, Rejection};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
pub enum IngestRequest {
    Batch(Value),
    GetSettings,
}

/// Parses one line into a request.
pub fn parse_request(line: &str) -> Result<IngestRequest> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| RelayError::invalid_frame(format!("malformed JSON: {}", e)))?;

    match value.get("command") {
        None => Ok(IngestRequest::Batch(value)),
        Some(Value::String(command)) if command == "get_settings" => Ok(IngestRequest::GetSettings),
        Some(other) => Err(RelayError::invalid_frame(format!(
            "unknown command {}",
            other
        ))),
    }
}

/// A validated batch: the agents to store and the entries that were skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestBatch {
    pub agents: Vec<Agent>,
    pub rejections: Vec<Rejection>,
}

impl IngestBatch {
    /// Number of entries the simulator sent.
    pub fn submitted(&self) -> usize {
        self.agents.len() + self.rejections.len()
    }

    /// A batch is refused only when it had entries and none survived; an empty
    /// array is a legitimate "no agents this tick".
    pub fn check(&self) -> Result<()> {
        if self.agents.is_empty() && !self.rejections.is_empty() {
            return Err(RelayError::invalid_frame(format!(
                "all {} entries rejected",
                self.rejections.len()
            )));
        }
        Ok(())
    }
}

/// Validates `payload` entry by entry and maps positions through `mapper`.
pub fn parse_batch(payload: &Value, mapper: &CoordinateMapper) -> Result<IngestBatch> {
    let entries = match payload {
        Value::Array(entries) => entries,
        Value::Object(map) => match map.get("agents") {
            Some(Value::Array(entries)) => entries,
            Some(_) => return Err(RelayError::invalid_frame("`agents` is not an array")),
            None => return Err(RelayError::invalid_frame("missing `agents` array")),
        },
        _ => {
            return Err(RelayError::invalid_frame(
                "batch must be an array or an object with `agents`",
            ))
        }
    };

    let mut batch = IngestBatch::default();
    let mut seen = HashSet::new();
    for (position, entry) in entries.iter().enumerate() {
        match parse_entry(entry, mapper, &mut seen) {
            Ok(agent) => batch.agents.push(agent),
            Err(reason) => batch.rejections.push(Rejection { position, reason }),
        }
    }
    Ok(batch)
}

fn parse_entry(
    entry: &Value,
    mapper: &CoordinateMapper,
    seen: &mut HashSet<u32>,
) -> std::result::Result<Agent, String> {
    if !entry.is_object() {
        return Err(format!("entry is not an object: {}", entry));
    }
    let raw = AgentState::deserialize(entry).map_err(|e| e.to_string())?;
    if !seen.insert(raw.id) {
        return Err(format!("duplicate id {}", raw.id));
    }
    let position = mapper.apply(raw.position()).map_err(|e| e.to_string())?;
    Ok(Agent::new(raw.id, position))
}

/// Runs one ingest line end to end and builds the reply for the simulator.
///
/// Nothing is stored unless the batch produced a frame.
pub async fn handle_line(
    line: &str,
    distributor: &LiveDistributor,
    mapper: &CoordinateMapper,
) -> IngestReply {
    let payload = match parse_request(line) {
        Ok(IngestRequest::GetSettings) => {
            return IngestReply::Settings {
                settings: distributor.settings().await,
            }
        }
        Ok(IngestRequest::Batch(payload)) => payload,
        Err(e) => {
            warn!("{}", e);
            return IngestReply::Error {
                message: e.to_string(),
                rejected: Vec::new(),
            };
        }
    };

    let batch = match parse_batch(&payload, mapper) {
        Ok(batch) => batch,
        Err(e) => {
            warn!("{}", e);
            return IngestReply::Error {
                message: e.to_string(),
                rejected: Vec::new(),
            };
        }
    };

    for rejection in &batch.rejections {
        warn!("Skipping entry {}: {}", rejection.position, rejection.reason);
    }
    if let Err(e) = batch.check() {
        warn!("{}", e);
        return IngestReply::Error {
            message: e.to_string(),
            rejected: batch.rejections,
        };
    }

    let accepted = batch.agents.len();
    let frame = distributor.ingest(batch.agents).await;
    debug!("Stored frame {} with {} agents", frame.index, accepted);
    IngestReply::Success {
        frame: frame.index,
        accepted,
        rejected: batch.rejections,
    }
}
