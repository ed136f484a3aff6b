//! Snapshot creation, listing, restoration, and pruning
//!
//! Each project gets its own storage area under the checkpoint base,
//! named by the project identity:
//!
//! ```text
//! <base>/<project_id>/
//! ├── history.json        # linear creation order + head pointer
//! ├── snapshots/<id>.json # one manifest per snapshot
//! └── objects/            # content-addressable blobs (see storage)
//! ```
//!
//! Snapshots are immutable once written; history is strictly linear. The
//! [`SnapshotEngine`] trait is the seam the rest of the system talks
//! through — [`SnapshotStore`] is the bundled content-addressed
//! implementation, but nothing outside this module depends on that choice.

use crate::config::CheckpointConfig;
use crate::error::{Result, SafepointError};
use crate::lock::LockFile;
use crate::patterns::ExclusionSet;
use crate::storage::ObjectStore;
use crate::types::{ChangeSummary, PruneReport, RestoreReport, SnapshotInfo};
use crate::utils;
use chrono::{DateTime, SecondsFormat, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Maximum length of a snapshot id in hex characters
pub const SNAPSHOT_ID_LEN: usize = 40;

const SYNC_BATCH_SIZE: usize = 100;
const PROGRESS_EVERY: usize = 500;

/// Validate the shape of a caller-supplied snapshot id
///
/// IDs are 1-40 lowercase hex characters. Anything else is rejected here,
/// before the id is ever used in a filesystem operation, so malformed input
/// can never turn into a path traversal.
pub fn validate_snapshot_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= SNAPSHOT_ID_LEN
        && id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
    if valid {
        Ok(())
    } else {
        Err(SafepointError::InvalidSnapshotId(id.to_string()))
    }
}

/// One file captured in a snapshot manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the project root, `/`-separated
    pub path: String,
    /// SHA-256 of the file content
    pub hash: String,
    /// Size in bytes
    pub size: u64,
    /// Unix mode bits
    pub mode: u32,
}

/// Immutable record of one snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Snapshot identifier
    pub id: String,
    /// Full stored message: `description [rfc3339-timestamp]`
    pub message: String,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Metadata payload supplied at creation
    pub metadata: Value,
    /// Every captured file
    pub files: Vec<FileRecord>,
    /// Sum of file sizes in bytes
    pub total_size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HistoryState {
    /// Snapshot ids in creation order, oldest first
    entries: Vec<String>,
    /// Pointer used for sequential snapshotting
    head: Option<String>,
}

/// Contract between the checkpoint orchestrator and snapshot storage
///
/// An implementation may be backed by anything that can materialize and
/// reproduce project trees — the bundled [`SnapshotStore`], an external
/// version-control binary, or a test double.
pub trait SnapshotEngine {
    /// Idempotently provision storage; returns whether it is usable
    fn ensure_initialized(&self) -> bool;

    /// Capture the current non-excluded project tree as a new snapshot
    ///
    /// Observation-only with respect to the live tree. Returns the new
    /// snapshot id.
    fn create(&self, message: &str, metadata: &Value) -> Result<String>;

    /// All snapshots, newest first
    fn list(&self) -> Vec<SnapshotInfo>;

    /// Text summary of changed paths between the live tree and a snapshot
    /// (the most recent one when `snapshot_id` is `None`)
    fn diff_stat(&self, snapshot_id: Option<&str>) -> Result<String>;

    /// Reproduce a snapshot's tree onto the live project, including
    /// deleting files created after it was taken
    fn restore(&self, snapshot_id: &str, dry_run: bool) -> Result<RestoreReport>;
}

/// Bundled content-addressed snapshot storage for one project
#[derive(Debug)]
pub struct SnapshotStore {
    project_path: PathBuf,
    project_id: String,
    base: PathBuf,
    root: PathBuf,
    objects: ObjectStore,
    exclusions: ExclusionSet,
}

impl SnapshotStore {
    /// Bind a store to a project and checkpoint base directory
    pub fn new(project_path: impl Into<PathBuf>, base: impl Into<PathBuf>, config: &CheckpointConfig) -> Self {
        let project_path: PathBuf = project_path.into();
        let project_path = project_path
            .canonicalize()
            .unwrap_or(project_path);
        let base = base.into();
        let project_id = utils::project_id(&project_path);
        let root = base.join(&project_id);
        let objects = ObjectStore::new(root.join("objects"));
        let exclusions = ExclusionSet::new(
            config.exclude_patterns.iter(),
            config.max_file_size_bytes(),
        )
        .with_root(project_path.clone());

        Self {
            project_path,
            project_id,
            base,
            root,
            objects,
            exclusions,
        }
    }

    /// Open a storage-only handle for a project known just by identity
    ///
    /// Listing, manifest access, and pruning work on such a handle; tree
    /// operations (`create`, `restore`, `diff_stat`) need the project-bound
    /// [`SnapshotStore::new`] constructor instead. Used by cleanup passes
    /// that walk the storage base without knowing the original paths.
    pub fn open_existing(base: impl Into<PathBuf>, project_id: &str, config: &CheckpointConfig) -> Self {
        let base = base.into();
        let root = base.join(project_id);
        let objects = ObjectStore::new(root.join("objects"));
        let exclusions = ExclusionSet::new(
            config.exclude_patterns.iter(),
            config.max_file_size_bytes(),
        );

        Self {
            project_path: PathBuf::new(),
            project_id: project_id.to_string(),
            base,
            root,
            objects,
            exclusions,
        }
    }

    /// Stable identity of the bound project
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Storage directory for this project
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an exact id or unambiguous prefix to a full snapshot id
    pub fn resolve(&self, prefix: &str) -> Result<String> {
        validate_snapshot_id(prefix)?;
        let history = self.load_history();

        if history.entries.iter().any(|id| id == prefix) {
            return Ok(prefix.to_string());
        }

        let matches: Vec<&String> = history
            .entries
            .iter()
            .filter(|id| id.starts_with(prefix))
            .collect();
        match matches.len() {
            0 => Err(SafepointError::SnapshotNotFound(prefix.to_string())),
            1 => Ok(matches[0].clone()),
            n => Err(SafepointError::AmbiguousSnapshotId {
                prefix: prefix.to_string(),
                matches: n,
            }),
        }
    }

    /// Id of the most recently created snapshot, if any
    pub fn latest(&self) -> Option<String> {
        self.load_history().entries.last().cloned()
    }

    /// Load the manifest for a fully resolved snapshot id
    pub fn manifest(&self, id: &str) -> Result<SnapshotManifest> {
        validate_snapshot_id(id)?;
        let path = self.manifest_path(id);
        let raw = fs::read_to_string(&path)
            .map_err(|_| SafepointError::SnapshotNotFound(id.to_string()))?;
        serde_json::from_str(&raw)
            .map_err(|e| SafepointError::storage(format!("manifest {} unreadable: {}", id, e)))
    }

    /// Changed paths between the live tree and a snapshot manifest
    pub fn changes_against(&self, manifest: &SnapshotManifest) -> Result<ChangeSummary> {
        let live = self.scan_tree()?;
        let live_map: BTreeMap<&str, &Path> = live
            .iter()
            .map(|(rel, abs)| (rel.as_str(), abs.as_path()))
            .collect();
        let want: BTreeMap<&str, &FileRecord> = manifest
            .files
            .iter()
            .map(|record| (record.path.as_str(), record))
            .collect();

        let mut summary = ChangeSummary::default();

        for (rel, abs) in &live_map {
            match want.get(rel) {
                None => summary.added.push(rel.to_string()),
                Some(record) => {
                    let live_hash = utils::hash_file_content(abs).unwrap_or_default();
                    if live_hash != record.hash {
                        summary.modified.push(rel.to_string());
                    }
                }
            }
        }
        for rel in want.keys() {
            if !live_map.contains_key(rel) {
                summary.deleted.push(rel.to_string());
            }
        }

        Ok(summary)
    }

    /// Drop every snapshot whose id is not in `keep`, then garbage-collect
    /// objects no surviving manifest references
    pub fn prune(&self, keep: &HashSet<String>) -> Result<PruneReport> {
        let mut history = self.load_history();
        let dropped: Vec<String> = history
            .entries
            .iter()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        if dropped.is_empty() {
            return Ok(PruneReport::default());
        }

        let mut report = PruneReport::default();
        for id in &dropped {
            if fs::remove_file(self.manifest_path(id)).is_ok() {
                report.snapshots_removed += 1;
            }
        }

        history.entries.retain(|id| keep.contains(id));
        history.head = history.entries.last().cloned();
        self.save_history(&history)?;

        let mut referenced = HashSet::new();
        for id in &history.entries {
            match self.manifest(id) {
                Ok(manifest) => referenced.extend(manifest.files.into_iter().map(|f| f.hash)),
                Err(e) => warn!("Skipping unreadable manifest {} during prune: {}", id, e),
            }
        }
        let (objects_removed, bytes_reclaimed) = self.objects.retain(&referenced)?;
        report.objects_removed = objects_removed;
        report.bytes_reclaimed = bytes_reclaimed;

        info!(
            "Pruned {} snapshots, {} objects ({})",
            report.snapshots_removed,
            report.objects_removed,
            utils::format_bytes(report.bytes_reclaimed)
        );
        Ok(report)
    }

    /// Enumerate the non-excluded live tree as (relative, absolute) pairs
    ///
    /// Honors a local `.gitignore` whether or not the project is a git
    /// repository; hidden files are skipped except the ignore file itself.
    fn scan_tree(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();

        let walker = WalkBuilder::new(&self.project_path)
            .hidden(true)
            .git_ignore(true)
            .git_global(false)
            .require_git(false)
            .sort_by_file_path(|a, b| a.cmp(b))
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry during scan: {}", e);
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let abs = entry.path();
            // Never descend into our own storage area
            if abs.starts_with(&self.base) {
                continue;
            }
            if self.exclusions.excluded(abs) {
                debug!("Excluded from snapshot: {:?}", abs);
                continue;
            }
            let Ok(rel) = abs.strip_prefix(&self.project_path) else {
                continue;
            };
            files.push((rel.to_string_lossy().replace('\\', "/"), abs.to_path_buf()));
        }

        // The ignore file itself is captured even though it is hidden
        let ignore_file = self.project_path.join(".gitignore");
        if ignore_file.is_file() {
            files.push((".gitignore".to_string(), ignore_file));
        }

        Ok(files)
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.root.join("snapshots").join(format!("{}.json", id))
    }

    fn history_path(&self) -> PathBuf {
        self.root.join("history.json")
    }

    fn load_history(&self) -> HistoryState {
        let raw = match fs::read_to_string(self.history_path()) {
            Ok(raw) => raw,
            Err(_) => return HistoryState::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!("History file for {} is corrupted ({}); starting empty", self.project_id, e);
                HistoryState::default()
            }
        }
    }

    fn save_history(&self, state: &HistoryState) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(state)?;
        utils::atomic_write(&self.history_path(), &serialized)
    }
}

impl SnapshotEngine for SnapshotStore {
    fn ensure_initialized(&self) -> bool {
        let provision = || -> Result<()> {
            fs::create_dir_all(self.root.join("snapshots"))?;
            self.objects.ensure_layout()?;
            if !self.history_path().exists() {
                self.save_history(&HistoryState::default())?;
            }
            Ok(())
        };
        match provision() {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not provision snapshot storage at {:?}: {}", self.root, e);
                false
            }
        }
    }

    fn create(&self, message: &str, metadata: &Value) -> Result<String> {
        if !self.ensure_initialized() {
            return Err(SafepointError::StorageNotInitialized(self.root.clone()));
        }

        // Two simultaneous creates into the same storage area would race
        let creation_lock = LockFile::new(self.root.join(".create.lock"));
        let _guard = creation_lock.acquire()?;

        let files = self.scan_tree()?;
        let total = files.len();
        if total > 100 {
            info!("Capturing {} files into snapshot", total);
        }

        let created_at = Utc::now();
        let mut records = Vec::with_capacity(total);
        let mut total_size = 0u64;
        let mut processed = 0usize;

        for batch in files.chunks(SYNC_BATCH_SIZE.max(1)) {
            for (rel, abs) in batch {
                let content = match fs::read(abs) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!("Failed to read {:?}: {}", abs, e);
                        continue;
                    }
                };
                let hash = self.objects.store(&content)?;
                let mode = fs::metadata(abs).map(|m| utils::file_mode(&m)).unwrap_or(0o644);
                total_size += content.len() as u64;
                records.push(FileRecord {
                    path: rel.clone(),
                    hash,
                    size: content.len() as u64,
                    mode,
                });
            }
            processed += batch.len();
            if total > 100 && processed % PROGRESS_EVERY == 0 {
                info!("Progress: {}/{} files", processed, total);
            }
        }

        let history = self.load_history();
        let timestamp = created_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        let id = {
            let mut basis = timestamp.clone();
            if let Some(head) = &history.head {
                basis.push_str(head);
            }
            for record in &records {
                basis.push_str(&record.hash);
                basis.push('\0');
                basis.push_str(&record.path);
            }
            let mut id = utils::hash_data(basis.as_bytes());
            id.truncate(SNAPSHOT_ID_LEN);
            id
        };

        let manifest = SnapshotManifest {
            id: id.clone(),
            message: format!("{} [{}]", message, timestamp),
            created_at,
            metadata: cap_metadata(metadata),
            files: records,
            total_size,
        };
        utils::atomic_write(&self.manifest_path(&id), &serde_json::to_vec_pretty(&manifest)?)?;

        let mut history = history;
        history.entries.push(id.clone());
        history.head = Some(id.clone());
        self.save_history(&history)?;

        info!("Created snapshot {} ({} files)", &id[..8], total);
        Ok(id)
    }

    fn list(&self) -> Vec<SnapshotInfo> {
        let history = self.load_history();
        let mut snapshots = Vec::with_capacity(history.entries.len());

        for id in history.entries.iter().rev() {
            let manifest = match self.manifest(id) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("Skipping unreadable snapshot {}: {}", id, e);
                    continue;
                }
            };
            let (message, timestamp) = parse_message(&manifest.message);
            snapshots.push(SnapshotInfo {
                id: id.clone(),
                timestamp,
                message,
                metadata: manifest.metadata,
            });
        }

        snapshots
    }

    fn diff_stat(&self, snapshot_id: Option<&str>) -> Result<String> {
        let target = match snapshot_id {
            Some(id) => self.resolve(id)?,
            None => self
                .latest()
                .ok_or_else(|| SafepointError::SnapshotNotFound("(latest)".to_string()))?,
        };

        let manifest = self.manifest(&target)?;
        let changes = self.changes_against(&manifest)?;

        if !changes.has_changes() {
            return Ok(format!("No changes since snapshot {}.\n", &target[..8.min(target.len())]));
        }
        Ok(changes.render())
    }

    fn restore(&self, snapshot_id: &str, dry_run: bool) -> Result<RestoreReport> {
        // Shape check comes first: malformed input never reaches the disk
        validate_snapshot_id(snapshot_id)?;
        let target = self.resolve(snapshot_id)?;
        let manifest = self.manifest(&target)?;

        let want: BTreeMap<&str, &FileRecord> = manifest
            .files
            .iter()
            .map(|record| (record.path.as_str(), record))
            .collect();
        let live = self.scan_tree()?;
        let live_map: BTreeMap<&str, &Path> = live
            .iter()
            .map(|(rel, abs)| (rel.as_str(), abs.as_path()))
            .collect();

        let mut to_write: Vec<&FileRecord> = Vec::new();
        for (rel, record) in &want {
            match live_map.get(rel) {
                None => to_write.push(record),
                Some(abs) => {
                    let live_hash = utils::hash_file_content(abs).unwrap_or_default();
                    if live_hash != record.hash {
                        to_write.push(record);
                    }
                }
            }
        }
        let to_delete: Vec<&Path> = live_map
            .iter()
            .filter(|(rel, _)| !want.contains_key(*rel))
            .map(|(_, abs)| *abs)
            .collect();

        let mut report = RestoreReport {
            snapshot_id: target.clone(),
            files_restored: to_write.len(),
            files_deleted: to_delete.len(),
            bytes_written: to_write.iter().map(|r| r.size).sum(),
            dry_run,
            warnings: Vec::new(),
        };
        if dry_run {
            return Ok(report);
        }

        // From here on the report reflects what actually happened, not the plan
        report.files_restored = 0;
        report.files_deleted = 0;
        report.bytes_written = 0;
        let total = to_write.len();
        let mut processed = 0usize;
        for batch in to_write.chunks(SYNC_BATCH_SIZE.max(1)) {
            for record in batch {
                match self.restore_file(record) {
                    Ok(bytes) => {
                        report.files_restored += 1;
                        report.bytes_written += bytes;
                    }
                    Err(e) => {
                        report.warnings.push(format!("{}: {}", record.path, e));
                        warn!("Failed to restore {}: {}", record.path, e);
                    }
                }
            }
            processed += batch.len();
            if total > 100 && processed % PROGRESS_EVERY == 0 {
                info!("Progress: {}/{} files", processed, total);
            }
        }

        for abs in to_delete {
            if let Err(e) = fs::remove_file(abs) {
                report.warnings.push(format!("{}: {}", abs.display(), e));
                continue;
            }
            report.files_deleted += 1;
            info!("Removed file not in snapshot: {:?}", abs);
            if let Some(parent) = abs.parent() {
                utils::remove_empty_parents(parent, &self.project_path);
            }
        }

        // Keep the sequential pointer at the newest entry so the next
        // create appends to history rather than forking it
        let mut history = self.load_history();
        history.head = history.entries.last().cloned();
        self.save_history(&history)?;

        info!(
            "Restored snapshot {}: {} files written, {} deleted",
            &target[..8],
            report.files_restored,
            report.files_deleted
        );
        Ok(report)
    }
}

impl SnapshotStore {
    fn restore_file(&self, record: &FileRecord) -> Result<u64> {
        let content = self.objects.load(&record.hash)?;
        let abs = self.project_path.join(&record.path);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&abs, &content)?;
        if let Err(e) = utils::set_permissions(&abs, record.mode) {
            debug!("Could not set mode on {:?}: {}", abs, e);
        }
        Ok(content.len() as u64)
    }
}

/// Split a stored message into (description, timestamp)
///
/// Messages have the form `description [rfc3339-timestamp]`. A message
/// without the bracketed segment predates that convention; it serves as
/// both description and timestamp.
pub fn parse_message(message: &str) -> (String, String) {
    if let Some(idx) = message.rfind(" [") {
        if let Some(timestamp) = message[idx + 2..].strip_suffix(']') {
            return (message[..idx].to_string(), timestamp.to_string());
        }
    }
    (message.to_string(), message.to_string())
}

/// Reduce an oversized metadata payload to its essential fields
fn cap_metadata(metadata: &Value) -> Value {
    let size = serde_json::to_vec(metadata).map(|v| v.len()).unwrap_or(0);
    if size <= crate::metadata::PAYLOAD_SIZE_LIMIT {
        return metadata.clone();
    }
    warn!("Snapshot metadata of {} bytes exceeds cap, truncating", size);

    let files: Vec<Value> = metadata
        .get("files")
        .and_then(Value::as_array)
        .map(|files| files.iter().take(10).cloned().collect())
        .unwrap_or_default();
    json!({
        "tool_name": metadata.get("tool_name").cloned().unwrap_or(Value::Null),
        "session_id": metadata.get("session_id").cloned().unwrap_or(Value::Null),
        "files": files,
    })
}
