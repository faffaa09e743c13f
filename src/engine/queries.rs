use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Resource with the highest popularity; ties go to the smallest id.
    ///
    /// Takes one shared row lock at a time, so the answer reflects some recent
    /// committed state rather than a single snapshot. Popularity only grows,
    /// which keeps that answer meaningful.
    pub async fn top_resource(&self) -> Result<ResourceInfo, EngineError> {
        let mut best: Option<ResourceInfo> = None;
        for info in self.snapshot_resources().await {
            // Ids arrive ascending, so strict > keeps the smallest id on ties.
            if best.as_ref().is_none_or(|b| info.popularity > b.popularity) {
                best = Some(info);
            }
        }
        best.ok_or(EngineError::NoResources)
    }

    pub async fn get_resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let row = self
            .store
            .get_resource(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = row.read().await;
        Ok(guard.info())
    }

    /// Every resource, ordered by id.
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        self.snapshot_resources().await
    }

    /// Resources with at least one unit on the shelf, ordered by id.
    pub async fn available_resources(&self) -> Vec<ResourceInfo> {
        let mut all = self.snapshot_resources().await;
        all.retain(|r| r.stock > 0);
        all
    }

    /// Resources with fewer than `threshold` units left, ordered by id.
    pub async fn low_stock(&self, threshold: u32) -> Vec<ResourceInfo> {
        let mut all = self.snapshot_resources().await;
        all.retain(|r| r.stock < threshold);
        all
    }

    pub fn resolve_holder(&self, contact: &str) -> Result<Ulid, EngineError> {
        self.store
            .holder_for_contact(contact.trim())
            .ok_or_else(|| EngineError::HolderNotFound(contact.to_string()))
    }

    pub async fn get_holder_info(&self, id: Ulid) -> Result<HolderInfo, EngineError> {
        let row = self
            .store
            .get_holder(&id)
            .ok_or_else(|| EngineError::HolderNotFound(id.to_string()))?;
        let guard = row.read().await;
        Ok(guard.info())
    }

    /// Full claim history of a holder, oldest first.
    pub async fn claims_for_holder(&self, holder_id: Ulid) -> Result<Vec<Claim>, EngineError> {
        let row = self
            .store
            .get_holder(&holder_id)
            .ok_or_else(|| EngineError::HolderNotFound(holder_id.to_string()))?;
        let guard = row.read().await;
        Ok(guard.claims.clone())
    }

    pub async fn open_claim(&self, holder_id: Ulid) -> Result<Option<Claim>, EngineError> {
        let row = self
            .store
            .get_holder(&holder_id)
            .ok_or_else(|| EngineError::HolderNotFound(holder_id.to_string()))?;
        let guard = row.read().await;
        Ok(guard.open_claim().cloned())
    }

    async fn snapshot_resources(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::with_capacity(self.store.resource_count());
        for id in self.store.resource_ids() {
            if let Some(row) = self.store.get_resource(&id) {
                out.push(row.read().await.info());
            }
        }
        out
    }
}
