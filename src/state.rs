//! Per-watch snapshot persistence: one JSON file per watch id.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// The persisted record for one watch.
///
/// `data` always holds the snapshot of the last *successful* run; a failed
/// run only refreshes `timestamp` and `last_error`, so the next successful
/// run still has a baseline to diff against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchState {
    pub data: Option<Map<String, Value>>,
    /// ISO-8601 instant of the most recent run (successful or not)
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, watch_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", watch_id))
    }

    /// Returns None when the file is missing or unreadable as JSON.
    pub fn load(&self, watch_id: &str) -> Option<WatchState> {
        let content = std::fs::read_to_string(self.path_for(watch_id)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Write-then-rename so a crashed write never corrupts the snapshot.
    pub fn save(&self, watch_id: &str, state: &WatchState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(watch_id);
        let tmp = self.dir.join(format!("{}.json.tmp", watch_id));
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Record a successful run: the snapshot replaces `data`, errors clear.
    pub fn record_success(&self, watch_id: &str, data: Map<String, Value>) -> Result<()> {
        self.save(
            watch_id,
            &WatchState {
                data: Some(data),
                timestamp: now_iso(),
                last_error: None,
            },
        )
    }

    /// Record a failed run, keeping the last successful snapshot intact.
    pub fn record_failure(&self, watch_id: &str, error: &str) -> Result<()> {
        let data = self.load(watch_id).and_then(|s| s.data);
        self.save(
            watch_id,
            &WatchState {
                data,
                timestamp: now_iso(),
                last_error: Some(error.to_string()),
            },
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
