//! ============================================================================
//! Optimistic State Store - speculative entity state with rollback
//! ============================================================================
//! Every tracked entity keeps the last server-confirmed value and the ordered
//! list of local mutations not yet confirmed. The speculative value is always
//! the replay of those mutations onto the committed value.
//!
//! Mutations are JSON merge patches (RFC 7386): objects merge recursively,
//! `null` removes a key, anything else replaces.
//! ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::types::{EntityId, SyncError};

/// JSON view of an entity (rescue request, driver availability, ...)
pub type EntityState = Value;

/// Apply an RFC 7386 merge patch in place
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Some(map) = target.as_object_mut() {
        for (key, value) in patch_map {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// A local mutation that the server has not confirmed yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub version: u64,
    pub mutation: Value,
    /// Speculative value just before this mutation was applied
    pub prior: EntityState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// No unconfirmed edits remain; speculative equals the server state
    Settled,
    /// Newer local edits were replayed on top of the new committed state
    Rebased { pending: usize },
    /// Older than a commit already applied; ignored
    Outdated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub id: EntityId,
    /// Local revision, incremented on every optimistic mutation
    pub version: u64,
    /// Local revision the committed value corresponds to
    pub committed_version: u64,
    pub committed: EntityState,
    pub speculative: EntityState,
    pub pending: Vec<MutationRecord>,
    pub conflicted: bool,
}

impl TrackedEntity {
    pub fn new(id: impl Into<EntityId>, baseline: EntityState) -> Self {
        Self {
            id: id.into(),
            version: 0,
            committed_version: 0,
            committed: baseline.clone(),
            speculative: baseline,
            pending: Vec::new(),
            conflicted: false,
        }
    }

    /// Replay the pending mutations onto the committed value without mutating
    pub fn replayed(&self) -> EntityState {
        let mut state = self.committed.clone();
        for record in &self.pending {
            apply_merge_patch(&mut state, &record.mutation);
        }
        state
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Recompute priors and the speculative value from `committed`
    fn rebuild(&mut self) {
        let mut state = self.committed.clone();
        for record in &mut self.pending {
            record.prior = state.clone();
            apply_merge_patch(&mut state, &record.mutation);
        }
        self.speculative = state;
    }

    fn settle(&mut self, server_state: EntityState, as_of_version: u64) -> CommitOutcome {
        if as_of_version < self.committed_version {
            debug!(
                "Ignoring outdated commit v{} for {} (committed v{})",
                as_of_version, self.id, self.committed_version
            );
            return CommitOutcome::Outdated;
        }

        self.pending.retain(|r| r.version > as_of_version);
        self.committed = server_state;
        self.committed_version = as_of_version;

        if self.pending.is_empty() {
            self.speculative = self.committed.clone();
            CommitOutcome::Settled
        } else {
            self.rebuild();
            CommitOutcome::Rebased {
                pending: self.pending.len(),
            }
        }
    }

    fn take_record(&mut self, version: u64) -> Result<(usize, MutationRecord), SyncError> {
        let index = self
            .pending
            .iter()
            .position(|r| r.version == version)
            .ok_or_else(|| SyncError::UnknownMutation {
                entity: self.id.clone(),
                version,
            })?;
        Ok((index, self.pending.remove(index)))
    }
}

/// Client-side view of mutable entities
#[derive(Debug, Clone, Default)]
pub struct OptimisticStateStore {
    entities: HashMap<EntityId, TrackedEntity>,
}

impl OptimisticStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(entities: Vec<TrackedEntity>) -> Self {
        Self {
            entities: entities.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    /// Record the latest fetched value for an entity.
    /// Unconfirmed local edits are kept and replayed on top.
    pub fn track(&mut self, entity_id: &str, fetched: EntityState) {
        match self.entities.get_mut(entity_id) {
            Some(entity) => {
                entity.committed = fetched;
                entity.rebuild();
            }
            None => {
                self.entities
                    .insert(entity_id.to_string(), TrackedEntity::new(entity_id, fetched));
            }
        }
    }

    /// Apply a mutation speculatively and return the new local version.
    /// Unknown entities are seeded from `baseline`.
    pub fn apply_optimistic<F>(&mut self, entity_id: &str, mutation: Value, baseline: F) -> u64
    where
        F: FnOnce() -> EntityState,
    {
        let entity = self
            .entities
            .entry(entity_id.to_string())
            .or_insert_with(|| TrackedEntity::new(entity_id, baseline()));

        entity.version += 1;
        let prior = entity.speculative.clone();
        apply_merge_patch(&mut entity.speculative, &mutation);
        entity.pending.push(MutationRecord {
            version: entity.version,
            mutation,
            prior,
        });

        debug!("Optimistic v{} applied to {}", entity.version, entity_id);
        entity.version
    }

    /// Server confirmed the entity as of `as_of_version`
    pub fn commit(&mut self, entity_id: &str, server_state: EntityState, as_of_version: u64) -> CommitOutcome {
        match self.entities.get_mut(entity_id) {
            Some(entity) => {
                let outcome = entity.settle(server_state, as_of_version);
                if let CommitOutcome::Rebased { pending } = outcome {
                    debug!(
                        "Stale commit v{} for {}: {} newer edits kept",
                        as_of_version, entity_id, pending
                    );
                }
                outcome
            }
            None => {
                let mut entity = TrackedEntity::new(entity_id, server_state);
                entity.version = as_of_version;
                entity.committed_version = as_of_version;
                self.entities.insert(entity_id.to_string(), entity);
                CommitOutcome::Settled
            }
        }
    }

    /// Server accepted mutation `version` but returned no entity body
    pub fn confirm(&mut self, entity_id: &str, version: u64) -> Result<CommitOutcome, SyncError> {
        let entity = self
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| SyncError::UnknownEntity(entity_id.to_string()))?;

        if version <= entity.committed_version {
            return Ok(CommitOutcome::Outdated);
        }
        if !entity.pending.iter().any(|r| r.version == version) {
            return Err(SyncError::UnknownMutation {
                entity: entity_id.to_string(),
                version,
            });
        }

        let mut confirmed = entity.committed.clone();
        for record in entity.pending.iter().filter(|r| r.version <= version) {
            apply_merge_patch(&mut confirmed, &record.mutation);
        }
        Ok(entity.settle(confirmed, version))
    }

    /// Server rejected mutation `version`: revert it and flag the entity.
    /// Newer local edits are replayed on top of the restored value.
    pub fn rollback(&mut self, entity_id: &str, version: u64) -> Result<&EntityState, SyncError> {
        let entity = self
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| SyncError::UnknownEntity(entity_id.to_string()))?;

        let (index, rejected) = entity.take_record(version)?;
        let mut state = rejected.prior;
        for record in &mut entity.pending[index..] {
            record.prior = state.clone();
            apply_merge_patch(&mut state, &record.mutation);
        }
        entity.speculative = state;
        entity.conflicted = true;

        warn!("Rolled back v{} on {}; entity marked conflicted", version, entity_id);
        Ok(&entity.speculative)
    }

    /// Drop an unsent mutation without flagging a conflict
    pub fn forget(&mut self, entity_id: &str, version: u64) -> Result<(), SyncError> {
        let entity = self
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| SyncError::UnknownEntity(entity_id.to_string()))?;
        entity.take_record(version)?;
        entity.rebuild();
        debug!("Forgot v{} on {}", version, entity_id);
        Ok(())
    }

    pub fn get(&self, entity_id: &str) -> Option<&TrackedEntity> {
        self.entities.get(entity_id)
    }

    pub fn speculative(&self, entity_id: &str) -> Option<&EntityState> {
        self.entities.get(entity_id).map(|e| &e.speculative)
    }

    pub fn committed(&self, entity_id: &str) -> Option<&EntityState> {
        self.entities.get(entity_id).map(|e| &e.committed)
    }

    /// Committed value with every unconfirmed mutation replayed on top.
    /// Always equal to the speculative value.
    pub fn replayed(&self, entity_id: &str) -> Option<EntityState> {
        self.entities.get(entity_id).map(TrackedEntity::replayed)
    }

    /// Entities whose edits were rejected, sorted by id
    pub fn conflicted(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.conflicted)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// User dismissed the conflict
    pub fn clear_conflict(&mut self, entity_id: &str) -> bool {
        match self.entities.get_mut(entity_id) {
            Some(entity) if entity.conflicted => {
                entity.conflicted = false;
                info!("Conflict cleared for {}", entity_id);
                true
            }
            _ => false,
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(status: &str) -> Value {
        json!({ "id": "req-42", "status": status, "dog": { "name": "Biscuit" } })
    }

    fn assert_replay_matches(store: &OptimisticStateStore, id: &str) {
        let entity = store.get(id).unwrap();
        assert_eq!(entity.replayed(), entity.speculative, "replay diverged for {}", id);
        assert_eq!(store.replayed(id).as_ref(), store.speculative(id));
    }

    #[test]
    fn test_merge_patch_semantics() {
        let mut state = json!({ "status": "Pending", "dog": { "name": "Biscuit", "age": 3 }, "notes": "x" });
        apply_merge_patch(
            &mut state,
            &json!({ "status": "Rescued", "dog": { "age": 4 }, "notes": null }),
        );
        assert_eq!(state, json!({ "status": "Rescued", "dog": { "name": "Biscuit", "age": 4 } }));

        let mut scalar = json!("old");
        apply_merge_patch(&mut scalar, &json!({ "a": 1 }));
        assert_eq!(scalar, json!({ "a": 1 }));
    }

    #[test]
    fn test_unknown_entity_seeded_from_baseline() {
        let mut store = OptimisticStateStore::new();
        let version = store.apply_optimistic("req-42", json!({ "status": "En Route" }), || request("Pending"));

        assert_eq!(version, 1);
        let entity = store.get("req-42").unwrap();
        assert_eq!(entity.committed, request("Pending"));
        assert_eq!(entity.speculative["status"], "En Route");
        assert_eq!(entity.pending[0].prior, request("Pending"));
    }

    #[test]
    fn test_baseline_ignored_for_known_entity() {
        let mut store = OptimisticStateStore::new();
        store.track("req-42", request("Pending"));
        store.apply_optimistic("req-42", json!({ "status": "En Route" }), || {
            panic!("baseline must not be used for a tracked entity")
        });
        assert_eq!(store.speculative("req-42").unwrap()["status"], "En Route");
    }

    #[test]
    fn test_replay_determinism_across_operations() {
        let mut store = OptimisticStateStore::new();
        store.track("req-42", request("Pending"));

        let v1 = store.apply_optimistic("req-42", json!({ "status": "En Route" }), Value::default);
        assert_replay_matches(&store, "req-42");
        let v2 = store.apply_optimistic("req-42", json!({ "dog": { "age": 5 } }), Value::default);
        assert_replay_matches(&store, "req-42");
        let v3 = store.apply_optimistic("req-42", json!({ "status": "Rescued", "photo": "p.jpg" }), Value::default);
        assert_replay_matches(&store, "req-42");

        store.commit("req-42", request("En Route"), v1);
        assert_replay_matches(&store, "req-42");
        store.rollback("req-42", v2).unwrap();
        assert_replay_matches(&store, "req-42");
        store.confirm("req-42", v3).unwrap();
        assert_replay_matches(&store, "req-42");
        assert!(!store.get("req-42").unwrap().has_pending());
    }

    #[test]
    fn test_commit_latest_version_collapses() {
        let mut store = OptimisticStateStore::new();
        store.track("req-42", request("Pending"));
        let v = store.apply_optimistic("req-42", json!({ "status": "Rescued" }), Value::default);

        let server = json!({ "id": "req-42", "status": "Rescued" });
        assert_eq!(store.commit("req-42", server.clone(), v), CommitOutcome::Settled);

        let entity = store.get("req-42").unwrap();
        assert_eq!(entity.committed, server);
        assert_eq!(entity.speculative, server);
        assert!(entity.pending.is_empty());
    }

    #[test]
    fn test_stale_commit_keeps_newer_edits() {
        let mut store = OptimisticStateStore::new();
        store.track("req-42", request("Pending"));
        let v1 = store.apply_optimistic("req-42", json!({ "status": "En Route" }), Value::default);
        store.apply_optimistic("req-42", json!({ "status": "Rescued" }), Value::default);

        let server = json!({ "id": "req-42", "status": "En Route", "eta": 12 });
        let outcome = store.commit("req-42", server.clone(), v1);
        assert_eq!(outcome, CommitOutcome::Rebased { pending: 1 });

        let entity = store.get("req-42").unwrap();
        assert_eq!(entity.committed, server);
        assert_eq!(entity.speculative, json!({ "id": "req-42", "status": "Rescued", "eta": 12 }));
        assert_eq!(entity.pending[0].prior, server);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let mut store = OptimisticStateStore::new();
        store.track("req-42", request("Pending"));
        let v1 = store.apply_optimistic("req-42", json!({ "status": "En Route" }), Value::default);
        store.apply_optimistic("req-42", json!({ "status": "Rescued" }), Value::default);

        let server = request("En Route");
        store.commit("req-42", server.clone(), v1);
        let once = store.get("req-42").unwrap().clone();
        store.commit("req-42", server, v1);
        assert_eq!(store.get("req-42").unwrap(), &once);
    }

    #[test]
    fn test_outdated_commit_ignored() {
        let mut store = OptimisticStateStore::new();
        store.track("req-42", request("Pending"));
        let v1 = store.apply_optimistic("req-42", json!({ "status": "En Route" }), Value::default);
        let v2 = store.apply_optimistic("req-42", json!({ "status": "Rescued" }), Value::default);

        store.commit("req-42", request("Rescued"), v2);
        assert_eq!(store.commit("req-42", request("En Route"), v1), CommitOutcome::Outdated);
        assert_eq!(store.committed("req-42").unwrap()["status"], "Rescued");
    }

    #[test]
    fn test_n_mutations_committed_in_order() {
        let mut store = OptimisticStateStore::new();
        let baseline = request("Pending");
        store.track("req-42", baseline.clone());

        let mutations = vec![
            json!({ "status": "Assigned" }),
            json!({ "status": "En Route", "eta": 20 }),
            json!({ "eta": 5 }),
            json!({ "status": "Rescued", "eta": null }),
        ];
        let versions: Vec<u64> = mutations
            .iter()
            .map(|m| store.apply_optimistic("req-42", m.clone(), Value::default))
            .collect();

        let mut expected = baseline;
        for (mutation, version) in mutations.iter().zip(&versions) {
            apply_merge_patch(&mut expected, mutation);
            store.commit("req-42", expected.clone(), *version);
        }

        let entity = store.get("req-42").unwrap();
        assert_eq!(entity.committed, expected);
        assert_eq!(entity.committed["status"], "Rescued");
        assert!(entity.committed.get("eta").is_none());
        assert!(entity.pending.is_empty());
    }

    #[test]
    fn test_rollback_restores_prior_and_flags_conflict() {
        let mut store = OptimisticStateStore::new();
        store.track("req-42", request("Pending"));
        let v1 = store.apply_optimistic("req-42", json!({ "status": "Rescued" }), Value::default);

        let restored = store.rollback("req-42", v1).unwrap().clone();
        assert_eq!(restored, request("Pending"));
        assert_eq!(store.conflicted(), vec!["req-42".to_string()]);

        assert!(store.clear_conflict("req-42"));
        assert!(!store.clear_conflict("req-42"));
        assert!(store.conflicted().is_empty());
    }

    #[test]
    fn test_rollback_keeps_later_edits() {
        let mut store = OptimisticStateStore::new();
        store.track("req-42", request("Pending"));
        let v1 = store.apply_optimistic("req-42", json!({ "status": "Rescued" }), Value::default);
        store.apply_optimistic("req-42", json!({ "photo": "dog.jpg" }), Value::default);

        store.rollback("req-42", v1).unwrap();
        let speculative = store.speculative("req-42").unwrap();
        assert_eq!(speculative["status"], "Pending");
        assert_eq!(speculative["photo"], "dog.jpg");
    }

    #[test]
    fn test_rollback_errors() {
        let mut store = OptimisticStateStore::new();
        assert_eq!(
            store.rollback("ghost", 1).unwrap_err(),
            SyncError::UnknownEntity("ghost".into())
        );
        store.track("req-42", request("Pending"));
        assert_eq!(
            store.rollback("req-42", 9).unwrap_err(),
            SyncError::UnknownMutation { entity: "req-42".into(), version: 9 }
        );
    }

    #[test]
    fn test_forget_does_not_flag_conflict() {
        let mut store = OptimisticStateStore::new();
        store.track("driver-7", json!({ "available": true }));
        let v = store.apply_optimistic("driver-7", json!({ "available": false }), Value::default);

        store.forget("driver-7", v).unwrap();
        assert_eq!(store.speculative("driver-7").unwrap(), &json!({ "available": true }));
        assert!(store.conflicted().is_empty());
    }

    #[test]
    fn test_track_refresh_replays_pending() {
        let mut store = OptimisticStateStore::new();
        store.track("req-42", request("Pending"));
        store.apply_optimistic("req-42", json!({ "status": "Rescued" }), Value::default);

        store.track("req-42", json!({ "id": "req-42", "status": "Pending", "priority": "high" }));
        let entity = store.get("req-42").unwrap();
        assert_eq!(entity.speculative["status"], "Rescued");
        assert_eq!(entity.speculative["priority"], "high");
    }
}
