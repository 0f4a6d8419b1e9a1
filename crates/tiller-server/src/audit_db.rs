//! Log-structured action audit store backed by redb.
//!
//! # Table design
//!
//! A single `action_audit` table uses a 24-byte composite key:
//! ```text
//! [ log_timestamp_ms: u64 big-endian (8 bytes) | action uuid: 16 bytes ]
//! ```
//!
//! Because the timestamp occupies the high bytes in big-endian encoding,
//! byte ordering equals append-time ordering. Startup replay is a single
//! range scan from `window_lower_bound(now - backfill)`; records for
//! clusters this process doesn't manage are skipped. An action logged more
//! than once (re-audited after an update) replays last-write-wins, since the
//! tracked map is keyed by the action id.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use tiller_core::action::audit::{ActionAuditor, ActionRecord};
use tiller_core::action::Action;
use tiller_core::error::{Result, TillerError};
use tiller_core::ids::TimeId;
use tiller_core::manager::ClusterManager;

/// Key: 24-byte composite (log_timestamp_ms big-endian ++ uuid bytes)
/// Value: JSON-encoded AuditEntry
const AUDIT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("action_audit");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn audit_key(ts: DateTime<Utc>, uuid: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(uuid.as_bytes());
    key
}

/// Lower bound for the replay range scan: everything logged at or after
/// `start` sorts at or above this key (uuid bytes all zero).
fn window_lower_bound(start: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = start.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key
}

// ---------------------------------------------------------------------------
// RedbActionAuditor
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct AuditEntry {
    cluster_id: String,
    record: ActionRecord,
}

/// Reference `ActionAuditor` persisting denormalized action snapshots keyed
/// by cluster id, replaying a bounded recent window on startup.
pub struct RedbActionAuditor {
    db: Database,
    backfill: Duration,
}

fn db_err(e: impl std::fmt::Display) -> TillerError {
    TillerError::Audit(e.to_string())
}

impl RedbActionAuditor {
    /// Open or create the audit database at `path`.
    pub fn open(path: &Path, backfill_secs: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(AUDIT).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(RedbActionAuditor {
            db,
            backfill: Duration::seconds(backfill_secs as i64),
        })
    }

    fn append(&self, entry: &AuditEntry, logged_at: DateTime<Utc>) -> Result<()> {
        let id = TimeId::from_str(&entry.record.uuid)?;
        let key = audit_key(logged_at, id.uuid());
        let value = serde_json::to_vec(entry)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(AUDIT).map_err(db_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// All entries logged within the backfill window ending at `now`, in
    /// append order.
    fn replay_window(&self, now: DateTime<Utc>) -> Result<Vec<AuditEntry>> {
        let lower = window_lower_bound(now - self.backfill);
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(AUDIT).map_err(db_err)?;

        let mut entries = Vec::new();
        for item in table.range(lower.as_slice()..).map_err(db_err)? {
            let (_, value) = item.map_err(db_err)?;
            match serde_json::from_slice::<AuditEntry>(value.value()) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "skipping unreadable audit entry"),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl ActionAuditor for RedbActionAuditor {
    fn name(&self) -> String {
        "redb-action-auditor".into()
    }

    async fn log_action(&self, cluster_id: &str, record: &ActionRecord) -> Result<()> {
        let entry = AuditEntry {
            cluster_id: cluster_id.to_string(),
            record: record.clone(),
        };
        self.append(&entry, Utc::now())?;
        info!(
            cluster = cluster_id,
            action = entry.record.uuid,
            "action logged to audit store"
        );
        Ok(())
    }

    async fn load_actions(&self, manager: &ClusterManager) -> Result<()> {
        let entries = self.replay_window(Utc::now())?;
        let mut restored = 0usize;
        for entry in &entries {
            let Some(managed) = manager.get(&entry.cluster_id) else {
                continue;
            };
            match Action::from_record(&entry.record) {
                Ok(action) => {
                    managed.engine().restore(action);
                    restored += 1;
                }
                Err(e) => warn!(
                    cluster = entry.cluster_id,
                    action = entry.record.uuid,
                    error = %e,
                    "skipping unreplayable audit record"
                ),
            }
        }
        info!(restored, "backfilled actions from audit store");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
