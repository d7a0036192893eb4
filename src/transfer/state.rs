//! Transfer state and pause/resume snapshots

use super::part::{plan_parts, PartDescriptor, PartState};
use super::progress::TransferDirection;
use super::source::SourceDescriptor;
use crate::error::{Result, StratusError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Snapshot format written by this version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Where a transfer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Active,
    Completed,
    Aborted,
}

/// Live state of one multipart transfer
///
/// Owned by exactly one coordinator call at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferState {
    pub direction: TransferDirection,
    /// Provider upload id; empty for downloads
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub part_size: u64,
    pub object_size: u64,
    /// ETag of the object being downloaded
    pub object_etag: Option<String>,
    pub parts: Vec<PartDescriptor>,
    pub source: SourceDescriptor,
    pub phase: TransferPhase,
    completed_bytes: u64,
}

impl TransferState {
    pub fn new(
        direction: TransferDirection,
        upload_id: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        part_size: u64,
        source: SourceDescriptor,
        object_etag: Option<String>,
    ) -> Self {
        let object_size = source.size();
        Self {
            direction,
            upload_id: upload_id.into(),
            bucket: bucket.into(),
            key: key.into(),
            part_size,
            object_size,
            object_etag,
            parts: plan_parts(object_size, part_size),
            source,
            phase: TransferPhase::Active,
            completed_bytes: 0,
        }
    }

    /// Identifier used in logs and progress events
    pub fn transfer_id(&self) -> String {
        if self.upload_id.is_empty() {
            format!("{}/{}", self.bucket, self.key)
        } else {
            self.upload_id.clone()
        }
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes
    }

    pub fn part(&self, part_number: u32) -> Option<&PartDescriptor> {
        self.parts.iter().find(|p| p.part_number == part_number)
    }

    pub fn part_mut(&mut self, part_number: u32) -> Option<&mut PartDescriptor> {
        self.parts.iter_mut().find(|p| p.part_number == part_number)
    }

    /// Parts a run should transfer, in part order
    pub fn outstanding_parts(&self) -> Vec<PartDescriptor> {
        self.parts
            .iter()
            .filter(|p| p.is_outstanding())
            .cloned()
            .collect()
    }

    pub fn completed_parts(&self) -> u32 {
        self.parts.iter().filter(|p| p.is_completed()).count() as u32
    }

    pub fn failed_part_numbers(&self) -> Vec<u32> {
        self.parts
            .iter()
            .filter(|p| p.state == PartState::Failed)
            .map(|p| p.part_number)
            .collect()
    }

    /// Whether every part is `Completed`
    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(PartDescriptor::is_completed)
    }

    pub fn set_state(&mut self, part_number: u32, state: PartState) {
        if let Some(part) = self.part_mut(part_number) {
            part.state = state;
        }
        self.recount();
    }

    pub fn mark_completed(&mut self, part_number: u32, etag: String) {
        if let Some(part) = self.part_mut(part_number) {
            part.complete(etag);
        }
        self.recount();
    }

    /// Forget a part's progress, including its ETag
    pub fn reset_part(&mut self, part_number: u32) {
        if let Some(part) = self.part_mut(part_number) {
            part.reset();
        }
        self.recount();
    }

    /// `(part_number, etag)` of every part in ascending part order
    ///
    /// Fails unless every part is `Completed`.
    pub fn ordered_etags(&self) -> Result<Vec<(u32, String)>> {
        let mut etags = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            match (&part.state, &part.etag) {
                (PartState::Completed, Some(etag)) => etags.push((part.part_number, etag.clone())),
                _ => {
                    return Err(StratusError::InvalidTransferState(format!(
                        "part {} of {} is not completed",
                        part.part_number,
                        self.transfer_id()
                    )))
                }
            }
        }
        etags.sort_by_key(|(part_number, _)| *part_number);
        Ok(etags)
    }

    /// Treat parts that were in flight as never started
    pub fn settle_in_flight(&mut self) {
        for part in &mut self.parts {
            if part.state == PartState::InFlight {
                part.reset();
            }
        }
        self.recount();
    }

    /// Persistable snapshot; parts not yet completed are left out and will
    /// be transferred again on resume
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            version: SNAPSHOT_VERSION,
            direction: self.direction,
            upload_id: self.upload_id.clone(),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            part_size: self.part_size,
            object_etag: self.object_etag.clone(),
            parts: self
                .parts
                .iter()
                .filter_map(|part| match (&part.state, &part.etag) {
                    (PartState::Completed, Some(etag)) => Some(SnapshotPart {
                        part_number: part.part_number,
                        etag: etag.clone(),
                        length: part.length,
                    }),
                    _ => None,
                })
                .collect(),
            source: self.source.clone(),
        }
    }

    fn recount(&mut self) {
        self.completed_bytes = self
            .parts
            .iter()
            .filter(|p| p.is_completed())
            .map(|p| p.length)
            .sum();
    }
}

/// Completed part as recorded in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPart {
    pub part_number: u32,
    pub etag: String,
    pub length: u64,
}

/// Versioned, persistable capture of a paused transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub version: u32,
    pub direction: TransferDirection,
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub part_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_etag: Option<String>,
    pub parts: Vec<SnapshotPart>,
    pub source: SourceDescriptor,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl TransferSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a snapshot, rejecting formats newer than this version
    pub fn from_json(json: &str) -> Result<Self> {
        let probe: VersionProbe = serde_json::from_str(json)?;
        if probe.version == 0 || probe.version > SNAPSHOT_VERSION {
            return Err(StratusError::UnsupportedSnapshotVersion {
                found: probe.version,
                supported: SNAPSHOT_VERSION,
            });
        }
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Rebuild the transfer state; recorded parts come back `Completed`,
    /// everything else `Pending`
    pub fn into_state(self) -> Result<TransferState> {
        if self.part_size == 0 && self.source.size() > 0 {
            return Err(StratusError::Serialization(
                "snapshot has a zero part size".to_string(),
            ));
        }
        let mut state = TransferState::new(
            self.direction,
            self.upload_id,
            self.bucket,
            self.key,
            self.part_size,
            self.source,
            self.object_etag,
        );

        for recorded in self.parts {
            let Some(part) = state.part_mut(recorded.part_number) else {
                return Err(StratusError::Serialization(format!(
                    "snapshot names part {} which is outside the object",
                    recorded.part_number
                )));
            };
            if part.length != recorded.length {
                return Err(StratusError::Serialization(format!(
                    "snapshot part {} is {} bytes, expected {}",
                    recorded.part_number, recorded.length, part.length
                )));
            }
            part.complete(recorded.etag);
        }
        state.recount();
        Ok(state)
    }
}
