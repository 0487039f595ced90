//! Job persistence
//!
//! One JSON file per job under `{root}/jobs/{job_id}.json`, replaced
//! atomically, plus an optional result blob at `{job_id}.result`.
//! Records survive restarts; the manager reconciles statuses on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use crate::error::{HarvestError, HarvestResult};

/// Job lifecycle states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl JobStatus {
    /// Ordering rank; transitions must not decrease it.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired => 2,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// Persistent job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub kind: String,
    pub params: serde_json::Value,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Fraction complete in `[0, 1]`.
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl JobRecord {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new(data_dir: &std::path::Path) -> HarvestResult<Self> {
        let dir = data_dir.join("jobs");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    fn result_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.result"))
    }

    /// Atomically persist a record.
    pub fn save(&self, record: &JobRecord) -> HarvestResult<()> {
        let path = self.record_path(&record.job_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(&self, job_id: &str) -> Option<JobRecord> {
        let raw = fs::read(self.record_path(job_id)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// All records on disk; corrupt files are skipped with a warning.
    pub fn load_all(&self) -> Vec<JobRecord> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match fs::read(&path).map(|raw| serde_json::from_slice::<JobRecord>(&raw)) {
                Ok(Ok(record)) => records.push(record),
                Ok(Err(e)) => warn!(path = %path.display(), error = %e, "corrupt job record"),
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable job record"),
            }
        }
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn write_result(&self, job_id: &str, result: &serde_json::Value) -> HarvestResult<()> {
        let path = self.result_path(job_id);
        let tmp = path.with_extension("result.tmp");
        fs::write(&tmp, serde_json::to_vec(result)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read_result(&self, job_id: &str) -> HarvestResult<serde_json::Value> {
        let raw = fs::read(self.result_path(job_id))
            .map_err(|_| HarvestError::JobNotFound(job_id.to_string()))?;
        serde_json::from_slice(&raw)
            .map_err(|_| HarvestError::CorruptArtifact(format!("result for {job_id}")))
    }

    /// Remove the record and its result blob.
    pub fn purge(&self, job_id: &str) {
        let _ = fs::remove_file(self.record_path(job_id));
        let _ = fs::remove_file(self.result_path(job_id));
    }
}
