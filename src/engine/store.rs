use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedHolderState = Arc<RwLock<HolderState>>;

/// Row set for one tenant. Each row sits behind its own lock; no business
/// rules live here.
pub struct InMemoryStore {
    resources: DashMap<Ulid, SharedResourceState>,
    holders: DashMap<Ulid, SharedHolderState>,
    /// Unique contact key → holder id.
    contacts: DashMap<String, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            holders: DashMap::new(),
            contacts: DashMap::new(),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn insert_resource(&self, state: ResourceState) {
        self.resources.insert(state.id, Arc::new(RwLock::new(state)));
    }

    /// Resource ids in ascending order.
    pub fn resource_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Holders ──────────────────────────────────────────────

    pub fn holder_count(&self) -> usize {
        self.holders.len()
    }

    pub fn contains_holder(&self, id: &Ulid) -> bool {
        self.holders.contains_key(id)
    }

    pub fn get_holder(&self, id: &Ulid) -> Option<SharedHolderState> {
        self.holders.get(id).map(|e| e.value().clone())
    }

    pub fn holder_for_contact(&self, contact: &str) -> Option<Ulid> {
        self.contacts.get(contact).map(|e| *e.value())
    }

    pub fn insert_holder(&self, state: HolderState) {
        self.contacts.insert(state.contact.clone(), state.id);
        self.holders.insert(state.id, Arc::new(RwLock::new(state)));
    }

    /// Holder ids in ascending order.
    pub fn holder_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.holders.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Locked reads for update ──────────────────────────────

    pub async fn lock_resource(
        &self,
        id: Ulid,
        timeout: Duration,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let row = self.get_resource(&id).ok_or(EngineError::ResourceNotFound(id))?;
        write_with_timeout(row, timeout).await
    }

    pub async fn lock_holder(
        &self,
        id: Ulid,
        timeout: Duration,
    ) -> Result<OwnedRwLockWriteGuard<HolderState>, EngineError> {
        let row = self
            .get_holder(&id)
            .ok_or_else(|| EngineError::HolderNotFound(id.to_string()))?;
        write_with_timeout(row, timeout).await
    }
}

/// Exclusive row lock with a bounded wait. A wait past `timeout` is `StoreBusy`.
async fn write_with_timeout<T>(
    row: Arc<RwLock<T>>,
    timeout: Duration,
) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
    let started = Instant::now();
    let guard = tokio::time::timeout(timeout, row.write_owned())
        .await
        .map_err(|_| EngineError::StoreBusy)?;
    metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
        .record(started.elapsed().as_secs_f64());
    Ok(guard)
}
