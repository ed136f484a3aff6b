//! Core data types shared across the safepoint library

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One snapshot as presented by history listing
///
/// The stored message has the form `description [rfc3339-timestamp]`;
/// listing splits it back apart. Records written before that convention
/// carry the whole message in both fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot identifier (lowercase hex)
    pub id: String,
    /// Timestamp segment parsed from the stored message
    pub timestamp: String,
    /// Human-readable description
    pub message: String,
    /// Metadata payload recorded at creation time
    pub metadata: serde_json::Value,
}

/// Result of a restore operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    /// ID of the snapshot that was restored
    pub snapshot_id: String,
    /// Number of files written or overwritten
    pub files_restored: usize,
    /// Number of live files deleted because the snapshot lacked them
    pub files_deleted: usize,
    /// Total bytes written
    pub bytes_written: u64,
    /// Whether this was a dry run (nothing was mutated)
    pub dry_run: bool,
    /// Per-file problems that did not abort the restore
    pub warnings: Vec<String>,
}

/// Changed paths between the live tree and a snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
    /// Paths present live but not in the snapshot
    pub added: Vec<String>,
    /// Paths present in both with differing content
    pub modified: Vec<String>,
    /// Paths present in the snapshot but not live
    pub deleted: Vec<String>,
}

impl ChangeSummary {
    /// Whether any path differs
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.modified.is_empty() || !self.deleted.is_empty()
    }

    /// Total number of differing paths
    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// Render a diff-stat style text summary
    pub fn render(&self) -> String {
        let mut out = String::new();
        for path in &self.added {
            out.push_str(&format!(" A {}\n", path));
        }
        for path in &self.modified {
            out.push_str(&format!(" M {}\n", path));
        }
        for path in &self.deleted {
            out.push_str(&format!(" D {}\n", path));
        }
        out.push_str(&format!(
            " {} files changed ({} added, {} modified, {} deleted)\n",
            self.total(),
            self.added.len(),
            self.modified.len(),
            self.deleted.len()
        ));
        out
    }
}

/// Result of pruning snapshot storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneReport {
    /// Snapshot records removed from history
    pub snapshots_removed: usize,
    /// Unreferenced objects deleted
    pub objects_removed: usize,
    /// Bytes reclaimed from the object store
    pub bytes_reclaimed: u64,
}

/// Aggregate checkpoint statistics for one project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectStats {
    /// Total number of checkpoint records
    pub total: usize,
    /// Records finalized as success
    pub successful: usize,
    /// Records finalized as failed
    pub failed: usize,
    /// Records never finalized
    pub pending: usize,
    /// Top files by how many checkpoints touched them, most frequent first
    pub most_modified_files: Vec<(String, usize)>,
    /// Timestamp of the newest record
    pub latest: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_summary() {
        let mut summary = ChangeSummary::default();
        assert!(!summary.has_changes());

        summary.added.push("new.txt".to_string());
        summary.deleted.push("old.txt".to_string());
        assert!(summary.has_changes());
        assert_eq!(summary.total(), 2);

        let text = summary.render();
        assert!(text.contains(" A new.txt"));
        assert!(text.contains(" D old.txt"));
        assert!(text.contains("2 files changed"));
    }
}
