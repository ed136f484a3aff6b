//! Checkpoint metadata store
//!
//! One JSON document maps project identity → snapshot identity → checkpoint
//! record. Every mutating operation takes the cooperative lock file, reads
//! the document, applies the change, and writes the whole document back
//! atomically (temp file in the same directory, then rename), so a crash
//! mid-write never leaves an unparseable file behind. A corrupted document
//! degrades to "no metadata" instead of failing: new writes simply replace
//! the corrupted state.
//!
//! Reads are lock-free; listings tolerate slightly stale data.

use crate::error::Result;
use crate::lock::{lock_path_for, LockFile};
use crate::types::ProjectStats;
use crate::utils::atomic_write;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Hard cap on any serialized payload stored in a record
pub const PAYLOAD_SIZE_LIMIT: usize = 1024 * 1024;

/// How many records `cleanup` keeps by default
pub const DEFAULT_KEEP_COUNT: usize = 50;

/// Lifecycle state of a checkpoint record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    /// Created at snapshot time; the originating operation has not finished
    Pending,
    /// The originating operation completed successfully
    Success,
    /// The originating operation failed
    Failed,
}

/// Metadata describing why and when one snapshot was taken
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Creation instant
    pub timestamp: DateTime<Utc>,
    /// Name of the tool that triggered the checkpoint
    pub tool_name: String,
    /// Raw tool input payload as received from the hook
    pub tool_input: Value,
    /// Session the tool invocation belonged to
    pub session_id: String,
    /// Lifecycle status
    pub status: CheckpointStatus,
    /// File paths the tool reported it would touch
    pub files_affected: Vec<String>,
    /// When the status last transitioned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_updated: Option<DateTime<Utc>>,
    /// The tool's response payload, once known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<Value>,
}

/// A record paired with its snapshot id, as returned by listings
#[derive(Debug, Clone)]
pub struct ListedCheckpoint {
    /// Snapshot identifier the record is keyed by
    pub id: String,
    /// The record itself
    pub record: CheckpointRecord,
}

type MetadataDoc = BTreeMap<String, BTreeMap<String, CheckpointRecord>>;

/// Durable store for checkpoint records
#[derive(Debug)]
pub struct MetadataStore {
    base: PathBuf,
    metadata_file: PathBuf,
    lock: LockFile,
}

impl MetadataStore {
    /// Open the store rooted at the given base directory
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let metadata_file = base.join("metadata.json");
        let lock = LockFile::new(lock_path_for(&metadata_file));
        Self {
            base,
            metadata_file,
            lock,
        }
    }

    /// Create a new `pending` record for a freshly taken snapshot
    ///
    /// Safe to call concurrently from independent processes; the whole
    /// read-modify-write runs under the metadata lock.
    pub fn add(
        &self,
        project_id: &str,
        snapshot_id: &str,
        tool_name: &str,
        tool_input: &Value,
        session_id: &str,
    ) -> Result<CheckpointRecord> {
        let record = CheckpointRecord {
            timestamp: Utc::now(),
            tool_name: tool_name.to_string(),
            tool_input: cap_payload(tool_input.clone()),
            session_id: session_id.to_string(),
            status: CheckpointStatus::Pending,
            files_affected: extract_files(tool_name, tool_input),
            status_updated: None,
            tool_response: None,
        };

        let stored = record.clone();
        self.with_lock(|doc| {
            doc.entry(project_id.to_string())
                .or_default()
                .insert(snapshot_id.to_string(), stored);
        })?;

        Ok(record)
    }

    /// Transition a record's status; no-op when the record does not exist
    pub fn update_status(
        &self,
        project_id: &str,
        snapshot_id: &str,
        status: CheckpointStatus,
        tool_response: Option<Value>,
    ) -> Result<()> {
        self.with_lock(|doc| {
            if let Some(record) = doc
                .get_mut(project_id)
                .and_then(|project| project.get_mut(snapshot_id))
            {
                record.status = status;
                record.status_updated = Some(Utc::now());
                if let Some(response) = tool_response {
                    record.tool_response = Some(cap_payload(response));
                }
            }
        })
    }

    /// Fetch one record, or `None` when absent
    pub fn get(&self, project_id: &str, snapshot_id: &str) -> Option<CheckpointRecord> {
        self.load()
            .get(project_id)
            .and_then(|project| project.get(snapshot_id))
            .cloned()
    }

    /// All records for a project, newest timestamp first
    pub fn list(&self, project_id: &str) -> Vec<ListedCheckpoint> {
        let mut checkpoints: Vec<ListedCheckpoint> = self
            .load()
            .get(project_id)
            .map(|project| {
                project
                    .iter()
                    .map(|(id, record)| ListedCheckpoint {
                        id: id.clone(),
                        record: record.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        checkpoints.sort_by(|a, b| {
            b.record
                .timestamp
                .cmp(&a.record.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });
        checkpoints
    }

    /// Records whose `files_affected` contains the given path
    pub fn find_by_file(&self, project_id: &str, file_path: &str) -> Vec<ListedCheckpoint> {
        self.list(project_id)
            .into_iter()
            .filter(|cp| cp.record.files_affected.iter().any(|f| f == file_path))
            .collect()
    }

    /// Every project id present in the document
    pub fn project_ids(&self) -> Vec<String> {
        self.load().keys().cloned().collect()
    }

    /// Aggregate statistics for one project
    pub fn stats(&self, project_id: &str) -> ProjectStats {
        let checkpoints = self.list(project_id);
        if checkpoints.is_empty() {
            return ProjectStats::default();
        }

        let mut file_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for cp in &checkpoints {
            for file in &cp.record.files_affected {
                *file_counts.entry(file.as_str()).or_default() += 1;
            }
        }
        let mut most_modified: Vec<(String, usize)> = file_counts
            .into_iter()
            .map(|(file, count)| (file.to_string(), count))
            .collect();
        most_modified.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_modified.truncate(5);

        let count_status = |status: CheckpointStatus| {
            checkpoints
                .iter()
                .filter(|cp| cp.record.status == status)
                .count()
        };

        ProjectStats {
            total: checkpoints.len(),
            successful: count_status(CheckpointStatus::Success),
            failed: count_status(CheckpointStatus::Failed),
            pending: count_status(CheckpointStatus::Pending),
            most_modified_files: most_modified,
            latest: checkpoints.first().map(|cp| cp.record.timestamp),
        }
    }

    /// Keep only the `keep_count` newest records for a project
    ///
    /// Returns the snapshot ids that were dropped, so the caller can prune
    /// the matching snapshot storage.
    pub fn cleanup(&self, project_id: &str, keep_count: usize) -> Result<Vec<String>> {
        self.with_lock(|doc| {
            let Some(project) = doc.get_mut(project_id) else {
                return Vec::new();
            };

            let mut ordered: Vec<(String, DateTime<Utc>)> = project
                .iter()
                .map(|(id, record)| (id.clone(), record.timestamp))
                .collect();
            ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

            let removed: Vec<String> = ordered
                .into_iter()
                .skip(keep_count)
                .map(|(id, _)| id)
                .collect();
            for id in &removed {
                project.remove(id);
            }
            removed
        })
    }

    /// Remove records older than the retention cutoff
    ///
    /// Limited to one project when `project_id` is given, otherwise applied
    /// across all projects. Returns removed ids keyed by project.
    pub fn cleanup_by_age(
        &self,
        project_id: Option<&str>,
        retention_days: u32,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));

        self.with_lock(|doc| {
            let mut removed: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (project, records) in doc.iter_mut() {
                if let Some(only) = project_id {
                    if project != only {
                        continue;
                    }
                }
                let expired: Vec<String> = records
                    .iter()
                    .filter(|(_, record)| record.timestamp < cutoff)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in &expired {
                    records.remove(id);
                }
                if !expired.is_empty() {
                    removed.insert(project.clone(), expired);
                }
            }
            doc.retain(|_, records| !records.is_empty());
            removed
        })
    }

    fn load(&self) -> MetadataDoc {
        let raw = match fs::read_to_string(&self.metadata_file) {
            Ok(raw) => raw,
            Err(_) => return MetadataDoc::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    "Metadata file {:?} is corrupted ({}); treating as empty",
                    self.metadata_file, e
                );
                MetadataDoc::new()
            }
        }
    }

    fn save(&self, doc: &MetadataDoc) -> Result<()> {
        fs::create_dir_all(&self.base)?;
        let serialized = serde_json::to_vec_pretty(doc)?;
        atomic_write(&self.metadata_file, &serialized)?;
        debug!("Wrote metadata ({} projects)", doc.len());
        Ok(())
    }

    fn with_lock<T>(&self, apply: impl FnOnce(&mut MetadataDoc) -> T) -> Result<T> {
        fs::create_dir_all(&self.base)?;
        let _guard = self.lock.acquire()?;
        let mut doc = self.load();
        let out = apply(&mut doc);
        self.save(&doc)?;
        Ok(out)
    }
}

/// Extract affected file paths from a tool input payload
pub fn extract_files(tool_name: &str, tool_input: &Value) -> Vec<String> {
    let mut files = Vec::new();

    if matches!(tool_name, "Write" | "Edit" | "MultiEdit") {
        if let Some(path) = tool_input.get("file_path").and_then(Value::as_str) {
            files.push(path.to_string());
        } else if let Some(edits) = tool_input.get("edits").and_then(Value::as_array) {
            for edit in edits {
                if let Some(path) = edit.get("file_path").and_then(Value::as_str) {
                    files.push(path.to_string());
                }
            }
        }
    }

    files
}

/// Replace a payload with a stub when its serialized form exceeds the cap
fn cap_payload(payload: Value) -> Value {
    let size = serde_json::to_vec(&payload).map(|v| v.len()).unwrap_or(0);
    if size <= PAYLOAD_SIZE_LIMIT {
        return payload;
    }
    warn!("Payload of {} bytes exceeds cap, truncating", size);
    json!({ "truncated": true, "original_bytes": size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, MetadataStore) {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_add_creates_pending_record() {
        let (_dir, store) = store();
        let input = json!({ "file_path": "/p/main.py" });
        let record = store
            .add("proj", "a1b2c3", "Write", &input, "sess-1")
            .unwrap();

        assert_eq!(record.status, CheckpointStatus::Pending);
        assert_eq!(record.files_affected, vec!["/p/main.py"]);

        let fetched = store.get("proj", "a1b2c3").unwrap();
        assert_eq!(fetched.tool_name, "Write");
        assert_eq!(fetched.session_id, "sess-1");
    }

    #[test]
    fn test_update_status_transitions_once_known() {
        let (_dir, store) = store();
        let input = json!({ "file_path": "/p/a.py" });
        store.add("proj", "aa11", "Edit", &input, "s").unwrap();

        store
            .update_status(
                "proj",
                "aa11",
                CheckpointStatus::Success,
                Some(json!({ "success": true })),
            )
            .unwrap();

        let record = store.get("proj", "aa11").unwrap();
        assert_eq!(record.status, CheckpointStatus::Success);
        assert!(record.status_updated.is_some());
        assert_eq!(record.tool_response, Some(json!({ "success": true })));
    }

    #[test]
    fn test_update_status_missing_record_is_noop() {
        let (_dir, store) = store();
        store
            .update_status("proj", "ffff", CheckpointStatus::Failed, None)
            .unwrap();
        assert!(store.get("proj", "ffff").is_none());
    }

    #[test]
    fn test_list_orders_newest_first() {
        let (_dir, store) = store();
        for i in 0..4 {
            let input = json!({ "file_path": format!("/p/f{}.py", i) });
            store
                .add("proj", &format!("{:04x}", i), "Write", &input, "s")
                .unwrap();
        }

        let listed = store.list("proj");
        assert_eq!(listed.len(), 4);
        for pair in listed.windows(2) {
            assert!(pair[0].record.timestamp >= pair[1].record.timestamp);
        }
        // The newest record is the most recently added one
        assert_eq!(listed[0].record.files_affected, vec!["/p/f3.py"]);
    }

    #[test]
    fn test_extract_files_multiedit() {
        let input = json!({
            "edits": [
                { "file_path": "/p/a.py" },
                { "file_path": "/p/b.py" }
            ]
        });
        assert_eq!(
            extract_files("MultiEdit", &input),
            vec!["/p/a.py", "/p/b.py"]
        );
        assert!(extract_files("Bash", &input).is_empty());
    }

    #[test]
    fn test_cleanup_keeps_newest() {
        let (_dir, store) = store();
        for i in 0..10 {
            let input = json!({ "file_path": format!("/p/f{}.py", i) });
            store
                .add("proj", &format!("{:04x}", i), "Write", &input, "s")
                .unwrap();
        }

        let removed = store.cleanup("proj", 5).unwrap();
        assert_eq!(removed.len(), 5);

        let remaining = store.list("proj");
        assert_eq!(remaining.len(), 5);
        // The five newest survive
        assert_eq!(remaining[0].record.files_affected, vec!["/p/f9.py"]);
        assert_eq!(remaining[4].record.files_affected, vec!["/p/f5.py"]);
    }

    #[test]
    fn test_cleanup_by_age() {
        let (_dir, store) = store();
        let input = json!({ "file_path": "/p/a.py" });
        store.add("proj", "aa11", "Write", &input, "s").unwrap();

        // Nothing is old enough to expire
        let removed = store.cleanup_by_age(Some("proj"), 7).unwrap();
        assert!(removed.is_empty());
        assert_eq!(store.list("proj").len(), 1);
    }

    #[test]
    fn test_corrupted_file_reads_as_empty() {
        let (dir, store) = store();
        fs::write(dir.path().join("metadata.json"), "{ broken").unwrap();

        assert!(store.list("proj").is_empty());

        // New writes succeed and replace the corrupted state
        let input = json!({ "file_path": "/p/a.py" });
        store.add("proj", "aa11", "Write", &input, "s").unwrap();
        assert_eq!(store.list("proj").len(), 1);
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = store();
        let input = json!({ "file_path": "/p/hot.py" });
        store.add("proj", "aa01", "Write", &input, "s").unwrap();
        store.add("proj", "aa02", "Edit", &input, "s").unwrap();
        let other = json!({ "file_path": "/p/cold.py" });
        store.add("proj", "aa03", "Edit", &other, "s").unwrap();
        store
            .update_status("proj", "aa01", CheckpointStatus::Success, None)
            .unwrap();
        store
            .update_status("proj", "aa02", CheckpointStatus::Failed, None)
            .unwrap();

        let stats = store.stats("proj");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.most_modified_files[0], ("/p/hot.py".to_string(), 2));
        assert!(stats.latest.is_some());
    }

    #[test]
    fn test_payload_cap() {
        let big = json!({ "content": "x".repeat(PAYLOAD_SIZE_LIMIT + 1) });
        let capped = cap_payload(big);
        assert_eq!(capped.get("truncated"), Some(&json!(true)));

        let small = json!({ "content": "small" });
        assert_eq!(cap_payload(small.clone()), small);
    }
}
