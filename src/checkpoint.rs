//! Checkpoint orchestration
//!
//! Ties configuration, exclusion rules, the snapshot engine, and the
//! metadata store together around one rule: checkpointing is best-effort
//! and must never block the host tool's operation. Every failure on the
//! pre-operation path is downgraded to a logged warning and a non-blocking
//! outcome; only the explicit, user-initiated commands surface errors.
//!
//! The orchestrator holds no persistent state of its own — one is
//! constructed fresh for each hook invocation.

use crate::config::CheckpointConfig;
use crate::error::Result;
use crate::hook::{HookPayload, ToolInvocation};
use crate::metadata::{extract_files, CheckpointStatus, MetadataStore, DEFAULT_KEEP_COUNT};
use crate::patterns::ExclusionSet;
use crate::snapshot::{SnapshotEngine, SnapshotStore};
use crate::types::ProjectStats;
use chrono::{Duration, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// What happened when a hook invocation was considered for checkpointing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// A snapshot was taken and recorded
    Created {
        /// Id of the new snapshot
        snapshot_id: String,
    },
    /// Nothing needed to happen; the host operation proceeds
    Skipped(SkipReason),
    /// A snapshot was attempted but could not be completed
    Failed,
}

/// Why a hook invocation did not produce a checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Checkpointing is disabled in configuration
    Disabled,
    /// The tool does not modify files
    NonTriggeringTool,
    /// The target path is excluded by pattern or size
    ExcludedPath(PathBuf),
    /// Snapshot storage could not be provisioned
    StorageUnavailable,
}

/// Per-invocation coordinator for the checkpoint lifecycle
#[derive(Debug)]
pub struct Checkpointer {
    project_path: PathBuf,
    base: PathBuf,
    config: CheckpointConfig,
    metadata: MetadataStore,
}

impl Checkpointer {
    /// Bind a checkpointer to a project and checkpoint base directory
    pub fn new(
        project_path: impl Into<PathBuf>,
        config: CheckpointConfig,
        base: impl Into<PathBuf>,
    ) -> Self {
        let project_path: PathBuf = project_path.into();
        let project_path = project_path.canonicalize().unwrap_or(project_path);
        let base = base.into();
        let metadata = MetadataStore::new(&base);
        Self {
            project_path,
            base,
            config,
            metadata,
        }
    }

    /// Identity of the bound project
    pub fn project_id(&self) -> String {
        crate::utils::project_id(&self.project_path)
    }

    /// The metadata store backing this checkpointer
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Snapshot engine bound to this project
    pub fn engine(&self) -> SnapshotStore {
        SnapshotStore::new(&self.project_path, &self.base, &self.config)
    }

    /// Consider taking a checkpoint for a pre-operation hook payload
    ///
    /// Never returns an error: whatever goes wrong, the host operation is
    /// allowed to proceed and the problem is logged.
    pub fn maybe_checkpoint(&self, payload: &HookPayload) -> CheckpointOutcome {
        if !self.config.enabled {
            return CheckpointOutcome::Skipped(SkipReason::Disabled);
        }

        let invocation = payload.invocation();
        if !self.triggers(&invocation) {
            debug!("Tool {:?} does not trigger checkpoints", payload.tool_name);
            return CheckpointOutcome::Skipped(SkipReason::NonTriggeringTool);
        }

        if let Some(path) = invocation.file_path() {
            let exclusions = ExclusionSet::new(
                self.config.exclude_patterns.iter(),
                self.config.max_file_size_bytes(),
            )
            .with_root(&self.project_path);
            if exclusions.excluded(path) {
                warn!("Skipping checkpoint for excluded file: {:?}", path);
                return CheckpointOutcome::Skipped(SkipReason::ExcludedPath(path.to_path_buf()));
            }
        }

        let engine = self.engine();
        if !engine.ensure_initialized() {
            warn!("Could not provision snapshot storage; operation proceeds without checkpoint");
            return CheckpointOutcome::Skipped(SkipReason::StorageUnavailable);
        }

        let message = invocation.message();
        let snapshot_metadata = json!({
            "tool_name": payload.tool_name,
            "session_id": payload.session_id,
            "files": extract_files(&payload.tool_name, &payload.tool_input),
        });

        let snapshot_id = match engine.create(&message, &snapshot_metadata) {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not create checkpoint: {}", e);
                return CheckpointOutcome::Failed;
            }
        };

        if let Err(e) = self.metadata.add(
            &self.project_id(),
            &snapshot_id,
            &payload.tool_name,
            &payload.tool_input,
            &payload.session_id,
        ) {
            // The snapshot exists and is restorable; only its record is lost
            warn!("Snapshot {} created but metadata write failed: {}", &snapshot_id[..8], e);
        }

        if self.config.auto_cleanup {
            self.auto_cleanup(&engine);
        }

        info!("Created checkpoint {}", &snapshot_id[..8]);
        CheckpointOutcome::Created { snapshot_id }
    }

    /// Finalize the most recent checkpoint from a post-operation payload
    ///
    /// Only file-modifying tools participate; the newest record for the
    /// project transitions to success or failed exactly once.
    pub fn finalize(&self, payload: &HookPayload) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if !matches!(
            payload.invocation(),
            ToolInvocation::Write { .. } | ToolInvocation::Edit { .. } | ToolInvocation::MultiEdit { .. }
        ) {
            return Ok(());
        }

        let project_id = self.project_id();
        let Some(latest) = self.metadata.list(&project_id).into_iter().next() else {
            return Ok(());
        };

        let status = if payload.response_success() {
            CheckpointStatus::Success
        } else {
            CheckpointStatus::Failed
        };
        self.metadata.update_status(
            &project_id,
            &latest.id,
            status,
            payload.tool_response.clone(),
        )
    }

    /// Aggregate statistics for the bound project
    pub fn stats(&self) -> ProjectStats {
        self.metadata.stats(&self.project_id())
    }

    fn triggers(&self, invocation: &ToolInvocation) -> bool {
        if invocation.modifies_files() {
            return true;
        }
        matches!(invocation, ToolInvocation::Other(name) if name == "Stop")
            && self.config.checkpoint_on_stop
    }

    /// Best-effort retention pass after a successful checkpoint
    ///
    /// Applies both the age-based retention window and the record-count
    /// cap, then prunes the snapshots whose records went away.
    fn auto_cleanup(&self, engine: &SnapshotStore) {
        let project_id = self.project_id();
        let mut expired: HashSet<String> = HashSet::new();

        match self
            .metadata
            .cleanup_by_age(Some(&project_id), self.config.retention_days)
        {
            Ok(mut removed) => {
                if let Some(ids) = removed.remove(&project_id) {
                    expired.extend(ids);
                }
            }
            Err(e) => {
                warn!("Auto-cleanup skipped: {}", e);
                return;
            }
        }
        match self.metadata.cleanup(&project_id, DEFAULT_KEEP_COUNT) {
            Ok(ids) => expired.extend(ids),
            Err(e) => warn!("Count-based cleanup failed: {}", e),
        }
        if expired.is_empty() {
            return;
        }

        let keep: HashSet<String> = engine
            .list()
            .into_iter()
            .map(|snapshot| snapshot.id)
            .filter(|id| !expired.contains(id))
            .collect();
        if let Err(e) = engine.prune(&keep) {
            warn!("Auto-cleanup prune failed: {}", e);
        }
    }
}

/// Result of an explicit cleanup run
#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    /// Metadata records removed (or that would be, in a dry run)
    pub records_removed: usize,
    /// Snapshot manifests removed from storage
    pub snapshots_removed: usize,
    /// Unreferenced objects deleted
    pub objects_removed: usize,
}

/// Remove expired records and snapshots for the projects in `project_ids`
///
/// Applies the age-based retention window, plus a record-count cap when
/// `keep_count` is given. With `dry_run` nothing is mutated; the outcome
/// reports what would go.
pub fn cleanup_projects(
    base: &Path,
    config: &CheckpointConfig,
    project_ids: &[String],
    keep_count: Option<usize>,
    dry_run: bool,
) -> Result<CleanupOutcome> {
    let metadata = MetadataStore::new(base);
    let cutoff = Utc::now() - Duration::days(i64::from(config.retention_days));
    let mut outcome = CleanupOutcome::default();

    if dry_run {
        for project_id in project_ids {
            let records = metadata.list(project_id);
            let by_age = records
                .iter()
                .filter(|cp| cp.record.timestamp < cutoff)
                .count();
            let by_count = keep_count
                .map(|keep| records.len().saturating_sub(keep))
                .unwrap_or(0);
            outcome.records_removed += by_age.max(by_count);
        }
        return Ok(outcome);
    }

    for project_id in project_ids {
        let mut expired: HashSet<String> = HashSet::new();
        let mut removed = metadata.cleanup_by_age(Some(project_id), config.retention_days)?;
        if let Some(ids) = removed.remove(project_id) {
            expired.extend(ids);
        }
        if let Some(keep) = keep_count {
            expired.extend(metadata.cleanup(project_id, keep)?);
        }
        if expired.is_empty() {
            continue;
        }
        outcome.records_removed += expired.len();

        let engine = SnapshotStore::open_existing(base, project_id, config);
        let keep: HashSet<String> = engine
            .list()
            .into_iter()
            .map(|snapshot| snapshot.id)
            .filter(|id| !expired.contains(id))
            .collect();
        match engine.prune(&keep) {
            Ok(report) => {
                outcome.snapshots_removed += report.snapshots_removed;
                outcome.objects_removed += report.objects_removed;
            }
            Err(e) => warn!("Prune failed for project {}: {}", project_id, e),
        }
    }

    Ok(outcome)
}

/// Remove orphaned per-project storage directories
///
/// A directory is orphaned iff its name has no records in the metadata
/// document and it has not been touched for longer than the retention
/// window. Age alone never qualifies a directory.
pub fn reclaim_orphans(
    base: &Path,
    config: &CheckpointConfig,
    dry_run: bool,
) -> Result<Vec<String>> {
    let metadata = MetadataStore::new(base);
    let known: HashSet<String> = metadata.project_ids().into_iter().collect();
    let max_age = std::time::Duration::from_secs(u64::from(config.retention_days) * 24 * 3600);

    let mut orphans = Vec::new();
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(_) => return Ok(orphans),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let looks_like_project = name.len() == crate::utils::PROJECT_ID_LEN
            && name.chars().all(|c| c.is_ascii_hexdigit());
        if !looks_like_project || known.contains(&name) {
            continue;
        }

        let old_enough = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if !old_enough {
            continue;
        }

        if dry_run {
            orphans.push(name);
        } else if fs::remove_dir_all(&path).is_ok() {
            info!("Reclaimed orphaned snapshot storage {}", name);
            orphans.push(name);
        }
    }

    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn payload(tool_name: &str, tool_input: serde_json::Value) -> HookPayload {
        HookPayload {
            tool_name: tool_name.to_string(),
            tool_input,
            session_id: "sess-1".to_string(),
            tool_response: None,
        }
    }

    fn checkpointer(project: &TempDir, base: &TempDir, config: CheckpointConfig) -> Checkpointer {
        Checkpointer::new(project.path(), config, base.path())
    }

    #[test]
    fn test_disabled_skips() {
        let project = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        let config = CheckpointConfig {
            enabled: false,
            ..CheckpointConfig::default()
        };
        let cp = checkpointer(&project, &base, config);

        let outcome = cp.maybe_checkpoint(&payload("Write", json!({ "file_path": "/p/x.py" })));
        assert_eq!(outcome, CheckpointOutcome::Skipped(SkipReason::Disabled));
    }

    #[test]
    fn test_non_triggering_tool_skips() {
        let project = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        let cp = checkpointer(&project, &base, CheckpointConfig::default());

        let outcome = cp.maybe_checkpoint(&payload("Bash", json!({ "command": "ls" })));
        assert_eq!(
            outcome,
            CheckpointOutcome::Skipped(SkipReason::NonTriggeringTool)
        );
    }

    #[test]
    fn test_excluded_path_skips() {
        let project = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        let cp = checkpointer(&project, &base, CheckpointConfig::default());

        let log = project.path().join("debug.log");
        std::fs::write(&log, "noise").unwrap();

        let outcome = cp.maybe_checkpoint(&payload(
            "Write",
            json!({ "file_path": log.to_string_lossy() }),
        ));
        assert!(matches!(
            outcome,
            CheckpointOutcome::Skipped(SkipReason::ExcludedPath(_))
        ));
        // No snapshot was created
        assert!(cp.engine().list().is_empty());
    }

    #[test]
    fn test_checkpoint_created_and_recorded() {
        let project = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        std::fs::write(project.path().join("main.py"), "print()").unwrap();
        let cp = checkpointer(&project, &base, CheckpointConfig::default());

        let outcome = cp.maybe_checkpoint(&payload(
            "Write",
            json!({ "file_path": project.path().join("main.py").to_string_lossy() }),
        ));
        let CheckpointOutcome::Created { snapshot_id } = outcome else {
            panic!("expected a created checkpoint, got {:?}", outcome);
        };

        let record = cp.metadata().get(&cp.project_id(), &snapshot_id).unwrap();
        assert_eq!(record.status, CheckpointStatus::Pending);
        assert_eq!(record.tool_name, "Write");

        let listed = cp.engine().list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message, "Before creating main.py");
    }

    #[test]
    fn test_manual_checkpoint() {
        let project = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        std::fs::write(project.path().join("a.txt"), "x").unwrap();
        let cp = checkpointer(&project, &base, CheckpointConfig::default());

        let outcome =
            cp.maybe_checkpoint(&payload("Manual", json!({ "message": "before refactor" })));
        assert!(matches!(outcome, CheckpointOutcome::Created { .. }));
        assert_eq!(cp.engine().list()[0].message, "before refactor");
    }

    #[test]
    fn test_stop_requires_config_flag() {
        let project = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        std::fs::write(project.path().join("a.txt"), "x").unwrap();

        let cp = checkpointer(&project, &base, CheckpointConfig::default());
        let outcome = cp.maybe_checkpoint(&payload("Stop", json!({})));
        assert_eq!(
            outcome,
            CheckpointOutcome::Skipped(SkipReason::NonTriggeringTool)
        );

        let config = CheckpointConfig {
            checkpoint_on_stop: true,
            ..CheckpointConfig::default()
        };
        let cp = checkpointer(&project, &base, config);
        let outcome = cp.maybe_checkpoint(&payload("Stop", json!({})));
        assert!(matches!(outcome, CheckpointOutcome::Created { .. }));
    }

    #[test]
    fn test_finalize_transitions_latest() {
        let project = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        std::fs::write(project.path().join("main.py"), "print()").unwrap();
        let cp = checkpointer(&project, &base, CheckpointConfig::default());

        let input = json!({ "file_path": project.path().join("main.py").to_string_lossy() });
        let outcome = cp.maybe_checkpoint(&payload("Write", input.clone()));
        let CheckpointOutcome::Created { snapshot_id } = outcome else {
            panic!("expected created");
        };

        let mut post = payload("Write", input);
        post.tool_response = Some(json!({ "success": false }));
        cp.finalize(&post).unwrap();

        let record = cp.metadata().get(&cp.project_id(), &snapshot_id).unwrap();
        assert_eq!(record.status, CheckpointStatus::Failed);
    }

    #[test]
    fn test_finalize_ignores_non_modifying_tools() {
        let project = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        let cp = checkpointer(&project, &base, CheckpointConfig::default());

        let mut post = payload("Bash", json!({}));
        post.tool_response = Some(json!({ "success": true }));
        cp.finalize(&post).unwrap();
    }

    #[test]
    fn test_reclaim_orphans_requires_absence_and_age() {
        let base = TempDir::new().unwrap();
        let config = CheckpointConfig::default();

        // Fresh unknown directory: not old enough, stays
        let fresh = base.path().join("aaaabbbbcccc");
        std::fs::create_dir_all(&fresh).unwrap();

        let removed = reclaim_orphans(base.path(), &config, false).unwrap();
        assert!(removed.is_empty());
        assert!(fresh.exists());
    }
}
