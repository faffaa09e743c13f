use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{RELEASES_TOTAL, RESERVATIONS_TOTAL};

use super::ledger::{check_in_stock, check_no_open_claim, find_open_claim, now_ms};
use super::txn::Txn;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Claim one unit of `resource_id` for `holder_id`.
    ///
    /// Exactly one stock decrement, one popularity increment and one ledger
    /// insert happen atomically, or none do. Returns the updated resource.
    pub async fn reserve(&self, holder_id: Ulid, resource_id: Ulid) -> Result<ResourceInfo, EngineError> {
        let result = self.try_reserve(holder_id, resource_id).await;
        record_outcome(RESERVATIONS_TOTAL, "reserve", holder_id, resource_id, &result);
        result
    }

    async fn try_reserve(&self, holder_id: Ulid, resource_id: Ulid) -> Result<ResourceInfo, EngineError> {
        let txn = self.begin(holder_id, resource_id).await?;

        check_in_stock(txn.resource())?;
        check_no_open_claim(txn.holder())?;

        let event = Event::ClaimOpened {
            id: Ulid::new(),
            holder_id,
            resource_id,
            claimed_at: now_ms(),
        };
        txn.commit(self.wal_tx.clone(), event).await
    }

    /// Close `holder_id`'s open claim on `resource_id` and return the unit to stock.
    /// Popularity is untouched.
    pub async fn release(&self, holder_id: Ulid, resource_id: Ulid) -> Result<(), EngineError> {
        let result = self.try_release(holder_id, resource_id).await;
        record_outcome(RELEASES_TOTAL, "release", holder_id, resource_id, &result);
        result.map(|_| ())
    }

    async fn try_release(&self, holder_id: Ulid, resource_id: Ulid) -> Result<ResourceInfo, EngineError> {
        let txn = self.begin(holder_id, resource_id).await?;

        let claim_id = find_open_claim(txn.holder(), resource_id)?.id;

        let event = Event::ClaimClosed {
            id: claim_id,
            holder_id,
            resource_id,
            released_at: now_ms(),
        };
        txn.commit(self.wal_tx.clone(), event).await
    }

    /// Lock holder then resource. Every transaction uses this order.
    /// Both waits together stay within one `lock_timeout`.
    async fn begin(&self, holder_id: Ulid, resource_id: Ulid) -> Result<Txn, EngineError> {
        let deadline = Instant::now() + self.lock_timeout;
        let holder = self.store.lock_holder(holder_id, self.lock_timeout).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let resource = self.store.lock_resource(resource_id, remaining).await?;
        Ok(Txn::new(holder, resource))
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;

        // Shared guards on every row, holders before resources like transactions,
        // held until the new log is swapped in so no claim commits in between.
        let mut holders = Vec::new();
        for id in self.store.holder_ids() {
            if let Some(row) = self.store.get_holder(&id) {
                holders.push(row.read_owned().await);
            }
        }
        let mut resources = Vec::new();
        for id in self.store.resource_ids() {
            if let Some(row) = self.store.get_resource(&id) {
                resources.push(row.read_owned().await);
            }
        }

        let mut events = Vec::with_capacity(resources.len() + holders.len());
        for rs in &resources {
            events.push(Event::ResourceCreated {
                id: rs.id,
                name: rs.name.clone(),
                description: rs.description.clone(),
                stock: rs.initial_stock,
            });
        }
        for h in &holders {
            events.push(Event::HolderCreated {
                id: h.id,
                contact: h.contact.clone(),
            });
        }
        // Each holder's history in its own order, so replay rebuilds it as is
        events.extend(
            holders
                .iter()
                .flat_map(|h| h.claims.iter())
                .map(|c| Event::ClaimRecorded { claim: c.clone() }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(format!("WAL compaction failed: {e}")))?;
        info!("wal compacted to {count} records");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn record_outcome<T>(
    metric: &'static str,
    op: &'static str,
    holder_id: Ulid,
    resource_id: Ulid,
    result: &Result<T, EngineError>,
) {
    let outcome = match result {
        Ok(_) => {
            debug!("{op} ok: holder {holder_id} resource {resource_id}");
            "ok"
        }
        Err(e @ EngineError::StoreBusy) => {
            warn!("{op} holder {holder_id} resource {resource_id}: {e}");
            e.kind()
        }
        Err(e @ EngineError::StoreUnavailable(_)) => {
            error!("{op} holder {holder_id} resource {resource_id}: {e}");
            e.kind()
        }
        Err(e) => {
            debug!("{op} rejected: {e}");
            e.kind()
        }
    };
    metrics::counter!(metric, "outcome" => outcome).increment(1);
}
