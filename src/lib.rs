//! # Safepoint - automatic pre-edit checkpoints
//!
//! Safepoint snapshots a project's file tree before a code-editing
//! assistant modifies it, so any operation can be undone. It is designed
//! to run as a short-lived hook process around each tool invocation:
//! decide whether a checkpoint is warranted, capture the tree durably,
//! record why the snapshot was taken, and later mark whether the
//! operation succeeded.
//!
//! ## Architecture
//!
//! - **Content-addressable storage**: file blobs are stored by SHA-256
//!   hash, deduplicated across snapshots and lz4-compressed
//! - **Linear history**: snapshots per project form a strict creation
//!   order; restore targets any entry, including deleted files
//! - **Durable metadata**: one atomically-rewritten JSON document records
//!   each checkpoint's origin and outcome, guarded by a cooperative lock
//!   file so overlapping hook invocations cannot corrupt it
//! - **Best-effort by design**: nothing on the checkpoint-creation path
//!   may block the host tool; failures degrade to logged warnings
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use safepoint::{CheckpointConfig, SnapshotEngine, SnapshotStore};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CheckpointConfig::default();
//! let store = SnapshotStore::new(
//!     PathBuf::from("./my_project"),
//!     PathBuf::from("./checkpoints"),
//!     &config,
//! );
//!
//! let id = store.create("Before editing main.py", &serde_json::json!({}))?;
//!
//! // Make some changes to your files...
//!
//! let report = store.restore(&id, false)?;
//! println!("Restored {} files", report.files_restored);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module organization
//!
//! - [`checkpoint`]: orchestration of the checkpoint lifecycle
//! - [`config`]: tolerant configuration loading
//! - [`hook`]: hook protocol payloads and tool-input decoding
//! - [`metadata`]: durable checkpoint records
//! - [`patterns`]: exclusion pattern matching
//! - [`snapshot`]: snapshot creation, listing, restore, pruning
//! - [`storage`]: content-addressable object storage
//! - [`error`]: error types and handling

// Public API modules
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hook;
pub mod lock;
pub mod metadata;
pub mod patterns;
pub mod snapshot;
pub mod storage;
pub mod types;

// Internal helpers (not part of the public API)
mod utils;

// Re-export main types for convenience
pub use checkpoint::{CheckpointOutcome, Checkpointer, SkipReason};
pub use config::CheckpointConfig;
pub use error::{Result, SafepointError};
pub use hook::{HookPayload, ToolInvocation};
pub use metadata::{CheckpointRecord, CheckpointStatus, MetadataStore};
pub use patterns::ExclusionSet;
pub use snapshot::{SnapshotEngine, SnapshotStore};
pub use types::*;
pub use utils::{format_bytes, project_id};
