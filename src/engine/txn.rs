use tokio::sync::{mpsc, OwnedRwLockWriteGuard};

use crate::model::*;

use super::ledger::apply_claim;
use super::{append_event, EngineError, WalCommand};

/// One reserve/release unit of work.
///
/// Owns exclusive guards on the holder row and the resource row it touches,
/// taken in that order. Nothing reaches the rows until `commit`; dropping the
/// transaction on any other path releases both locks with the rows untouched.
pub(super) struct Txn {
    holder: OwnedRwLockWriteGuard<HolderState>,
    resource: OwnedRwLockWriteGuard<ResourceState>,
}

impl Txn {
    pub(super) fn new(
        holder: OwnedRwLockWriteGuard<HolderState>,
        resource: OwnedRwLockWriteGuard<ResourceState>,
    ) -> Self {
        Self { holder, resource }
    }

    pub(super) fn holder(&self) -> &HolderState {
        &self.holder
    }

    pub(super) fn resource(&self) -> &ResourceState {
        &self.resource
    }

    /// Make `event` durable, then apply it to both rows.
    ///
    /// Runs on its own task: once the record is handed to the WAL writer the
    /// apply must happen even if the caller's future is dropped, otherwise
    /// memory and log would disagree until the next restart.
    pub(super) async fn commit(
        self,
        wal_tx: mpsc::Sender<WalCommand>,
        event: Event,
    ) -> Result<ResourceInfo, EngineError> {
        tokio::spawn(async move {
            let mut txn = self;
            append_event(&wal_tx, &event).await?;
            apply_claim(&mut txn.holder, &mut txn.resource, &event);
            Ok(txn.resource.info())
        })
        .await
        .map_err(|e| EngineError::StoreUnavailable(format!("commit task failed: {e}")))?
    }
}
