mod error;
mod ledger;
mod mutations;
mod provision;
mod queries;
mod store;
mod txn;

pub use error::EngineError;
pub use store::{InMemoryStore, SharedHolderState, SharedResourceState};

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use crate::model::*;
use crate::wal::Wal;

use ledger::{apply_claim, check_replayable, claim_rows};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have before compacting or reporting counters
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("wal flush of {} records failed: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            // The whole batch fails, so none of it may reach the file
            wal.discard_pending();
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Hand one event to the WAL writer and wait until it is durable.
pub(super) async fn append_event(
    wal_tx: &mpsc::Sender<WalCommand>,
    event: &Event,
) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::StoreUnavailable(format!("WAL append failed: {e}")))
}

/// The reservation engine for one tenant: rows, ledger, and the WAL they persist to.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Upper bound on any single row-lock wait.
    pub(super) lock_timeout: Duration,
    /// Serializes provisioning and compaction, which touch the row set itself.
    pub(super) catalog_lock: Mutex<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// from inside a tokio runtime.
    pub fn new(wal_path: PathBuf, lock_timeout: Duration) -> io::Result<Self> {
        let (wal, events) = Wal::open_and_replay(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            lock_timeout,
            catalog_lock: Mutex::new(()),
        };
        for event in &events {
            engine.replay_event(event);
        }
        Ok(engine)
    }

    // We're the sole owner of every row during replay, so try_write always
    // succeeds. Never block here: this may run inside an async context.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::ResourceCreated {
                id,
                name,
                description,
                stock,
            } => {
                self.store
                    .insert_resource(ResourceState::new(*id, name.clone(), description.clone(), *stock));
            }
            Event::HolderCreated { id, contact } => {
                self.store.insert_holder(HolderState::new(*id, contact.clone()));
            }
            other => {
                let Some((holder_id, resource_id)) = claim_rows(other) else {
                    return;
                };
                let (Some(holder), Some(resource)) = (
                    self.store.get_holder(&holder_id),
                    self.store.get_resource(&resource_id),
                ) else {
                    warn!("replay: claim event for unknown rows {holder_id}/{resource_id}, skipped");
                    return;
                };
                match (holder.try_write(), resource.try_write()) {
                    (Ok(mut h), Ok(mut r)) => match check_replayable(&h, &r, other) {
                        Ok(()) => apply_claim(&mut h, &mut r, other),
                        Err(e) => warn!("replay: claim on {holder_id}/{resource_id} skipped: {e}"),
                    },
                    _ => warn!("replay: rows {holder_id}/{resource_id} unexpectedly locked"),
                }
            }
        }
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}
