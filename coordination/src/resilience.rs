//! Resilience — the `MemoryStore` boundary
//!
//! The core depends on a narrow `MemoryStore` trait for persisting and
//! recalling per-subtask insights; the knowledge-graph-backed implementation
//! lives outside this crate, with a file-based fallback defined here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// MemoryStore — narrow boundary to the embedded semantic-memory store
// ---------------------------------------------------------------------------

/// One session's takeaway, written after a subtask finishes (successfully or
/// not — a failed session still teaches something about what doesn't work).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub subtask_id: String,
    pub session_id: String,
    pub summary: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// The core depends only on this contract: a `MemoryStore` interface is
/// defined, its internal schema is not. The knowledge-graph-backed
/// implementation is an external collaborator; only the file-based
/// fallback lives here.
pub trait MemoryStore: Send + Sync {
    fn save_insight(&self, insight: &Insight) -> Result<(), String>;
    fn recent_insights(&self, subtask_id: &str, limit: usize) -> Result<Vec<Insight>, String>;
}

/// File-based fallback living under a build's
/// `.auto-claude/specs/<name>/memory/` directory, used when no graph-backed
/// `MemoryStore` is configured (or when one is configured but reports
/// `MemoryProviderUnavailable`).
pub struct FileMemoryStore {
    dir: std::path::PathBuf,
}

impl FileMemoryStore {
    pub fn new(dir: std::path::PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, subtask_id: &str) -> std::path::PathBuf {
        let safe: String = subtask_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }
}

impl MemoryStore for FileMemoryStore {
    fn save_insight(&self, insight: &Insight) -> Result<(), String> {
        std::fs::create_dir_all(&self.dir).map_err(|e| e.to_string())?;
        let line = serde_json::to_string(insight).map_err(|e| e.to_string())?;
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&insight.subtask_id))
            .map_err(|e| e.to_string())?;
        writeln!(file, "{line}").map_err(|e| e.to_string())
    }

    fn recent_insights(&self, subtask_id: &str, limit: usize) -> Result<Vec<Insight>, String> {
        let path = self.path_for(subtask_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
        let mut insights: Vec<Insight> = text
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        if insights.len() > limit {
            insights = insights.split_off(insights.len() - limit);
        }
        Ok(insights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_memory_store_round_trips_recent_insights() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryStore::new(dir.path().to_path_buf());
        for i in 0..3 {
            store
                .save_insight(&Insight {
                    subtask_id: "t1".into(),
                    session_id: format!("s{i}"),
                    summary: format!("tried approach {i}"),
                    success: i == 2,
                    timestamp: Utc::now(),
                })
                .unwrap();
        }
        let recent = store.recent_insights("t1", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].session_id, "s2");
        assert!(store.recent_insights("unknown", 5).unwrap().is_empty());
    }
}
