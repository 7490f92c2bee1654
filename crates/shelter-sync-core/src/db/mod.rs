// ============================================================================
// QueueJournal — Embedded Database (redb)
// ============================================================================
// Persists the pending action queue and the tracked entities so offline edits
// survive a restart. Every ledger mutation rewrites the snapshot in a single
// write transaction; a crash leaves either the old or the new snapshot.
// Default path: ~/.shelter/sync.redb (override via SHELTER_SYNC_DB_PATH)
// ============================================================================

pub mod types;

pub use types::{JournalStats, LedgerSnapshot};

use anyhow::{anyhow, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::store::TrackedEntity;
use crate::types::PendingAction;

// Table definitions
const ACTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("actions");
const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_ACTION_ID: &str = "next_action_id";

/// Durable mirror of a ledger
pub struct QueueJournal {
    db: Database,
    path: PathBuf,
}

impl QueueJournal {
    /// Open (or create) the journal at the given path.
    /// If `path` is None, uses SHELTER_SYNC_DB_PATH or ~/.shelter/sync.redb
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            p.to_path_buf()
        } else if let Ok(env_path) = std::env::var("SHELTER_SYNC_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            home.join(".shelter").join("sync.redb")
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }

        info!("Opening queue journal at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open journal: {}", e))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn.open_table(ACTIONS).map_err(|e| anyhow!("Failed to create actions table: {}", e))?;
            let _ = write_txn.open_table(ENTITIES).map_err(|e| anyhow!("Failed to create entities table: {}", e))?;
            let _ = write_txn.open_table(META).map_err(|e| anyhow!("Failed to create meta table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        Ok(Self { db, path: db_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Snapshot Operations
    // ========================================================================

    /// Replace the stored snapshot with `snapshot`
    pub fn write_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            write_txn.delete_table(ACTIONS)
                .map_err(|e| anyhow!("Failed to reset actions table: {}", e))?;
            let mut actions = write_txn.open_table(ACTIONS)
                .map_err(|e| anyhow!("Failed to open actions table: {}", e))?;
            for action in &snapshot.actions {
                let value = serde_json::to_vec(action)
                    .map_err(|e| anyhow!("Failed to serialize action {}: {}", action.id, e))?;
                actions.insert(action.id.0, value.as_slice())
                    .map_err(|e| anyhow!("Failed to insert action: {}", e))?;
            }

            write_txn.delete_table(ENTITIES)
                .map_err(|e| anyhow!("Failed to reset entities table: {}", e))?;
            let mut entities = write_txn.open_table(ENTITIES)
                .map_err(|e| anyhow!("Failed to open entities table: {}", e))?;
            for entity in &snapshot.entities {
                let value = serde_json::to_vec(entity)
                    .map_err(|e| anyhow!("Failed to serialize entity {}: {}", entity.id, e))?;
                entities.insert(entity.id.as_str(), value.as_slice())
                    .map_err(|e| anyhow!("Failed to insert entity: {}", e))?;
            }

            let mut meta = write_txn.open_table(META)
                .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;
            meta.insert(NEXT_ACTION_ID, snapshot.next_action_id)
                .map_err(|e| anyhow!("Failed to store next action id: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!(
            "Journaled {} actions, {} entities",
            snapshot.actions.len(),
            snapshot.entities.len()
        );
        Ok(())
    }

    /// Read the stored snapshot; an empty journal yields an empty ledger
    pub fn load(&self) -> Result<LedgerSnapshot> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;

        let actions_table = read_txn.open_table(ACTIONS)
            .map_err(|e| anyhow!("Failed to open actions table: {}", e))?;
        let mut actions = Vec::new();
        for entry in actions_table.iter().map_err(|e| anyhow!("Failed to iterate actions: {}", e))? {
            let (_, value) = entry.map_err(|e| anyhow!("Failed to read action: {}", e))?;
            let action: PendingAction = serde_json::from_slice(value.value())
                .map_err(|e| anyhow!("Failed to deserialize action: {}", e))?;
            actions.push(action);
        }

        let entities_table = read_txn.open_table(ENTITIES)
            .map_err(|e| anyhow!("Failed to open entities table: {}", e))?;
        let mut entities = Vec::new();
        for entry in entities_table.iter().map_err(|e| anyhow!("Failed to iterate entities: {}", e))? {
            let (_, value) = entry.map_err(|e| anyhow!("Failed to read entity: {}", e))?;
            let entity: TrackedEntity = serde_json::from_slice(value.value())
                .map_err(|e| anyhow!("Failed to deserialize entity: {}", e))?;
            entities.push(entity);
        }

        let meta = read_txn.open_table(META)
            .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;
        let stored_next = meta.get(NEXT_ACTION_ID)
            .map_err(|e| anyhow!("Failed to read next action id: {}", e))?
            .map(|v| v.value());

        // Keys are u64 so the table already iterates in FIFO order
        let after_last = actions.last().map(|a| a.id.0 + 1).unwrap_or(1);
        let next_action_id = stored_next.unwrap_or(1).max(after_last);

        Ok(LedgerSnapshot {
            next_action_id,
            actions,
            entities,
        })
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    pub fn stats(&self) -> Result<JournalStats> {
        let snapshot = self.load()?;

        let mut pending_by_kind = HashMap::new();
        for action in &snapshot.actions {
            *pending_by_kind.entry(action.kind.as_str().to_string()).or_insert(0usize) += 1;
        }

        Ok(JournalStats {
            pending_actions: snapshot.actions.len(),
            tracked_entities: snapshot.entities.len(),
            conflicted_entities: snapshot.entities.iter().filter(|e| e.conflicted).count(),
            pending_by_kind,
        })
    }

    /// Drop every journaled action and entity. Action ids keep counting up.
    pub fn clear(&self) -> Result<usize> {
        let snapshot = self.load()?;
        let removed = snapshot.actions.len();
        self.write_snapshot(&LedgerSnapshot {
            next_action_id: snapshot.next_action_id,
            actions: Vec::new(),
            entities: Vec::new(),
        })?;

        info!("Cleared journal ({} pending actions dropped)", removed);
        Ok(removed)
    }
}
