mod error;
mod guard;
mod mutations;
mod queries;
mod rank;
mod store;

pub use error::{Constraint, EngineError, StoreError};
pub use rank::{plan_insert, plan_move, InsertPlan, Shift};
pub use store::{SlotTable, Txn};
pub(crate) use guard::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// Scheduler knobs, per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Ceiling on active slots overlapping a candidate's window.
    pub max_active: usize,
    /// Rank given to the first slot of an empty table.
    pub seed_rank: Rank,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_active: 8,
            seed_rank: 100,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Commit,
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
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => {
                            batch.push((commit, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty: flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Commit, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
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
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The featured slot scheduler of one tenant.
///
/// Every mutation runs under the table's write lock, so the three façade
/// operations are serializable with respect to each other; readers only see
/// committed state.
pub struct Engine {
    pub(super) table: RwLock<SlotTable>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub settings: Settings,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, settings: Settings) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let dropped = Wal::truncate_torn_tail(&wal_path, replay.valid_len)?;
        if dropped > 0 {
            warn!(
                "dropped {dropped} bytes of torn WAL tail from {}",
                wal_path.display()
            );
        }
        let commits = replay.commits;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut table = SlotTable::new();
        for commit in &commits {
            for event in &commit.events {
                table.apply(event);
            }
        }
        debug!(
            "replayed {} commits from {}: {} slots",
            commits.len(),
            wal_path.display(),
            table.len()
        );

        Ok(Self {
            table: RwLock::new(table),
            wal_tx,
            notify,
            settings,
        })
    }

    /// Send one commit through the background group-commit writer.
    async fn wal_append(&self, commit: Commit) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Deferred constraints → WAL fsync → publish. Any failure drops `txn`,
    /// which rolls the table back.
    pub(super) async fn commit(&self, txn: Txn<'_>) -> Result<Vec<Event>, EngineError> {
        txn.check_deferred()?;
        if !txn.events().is_empty() {
            self.wal_append(Commit {
                events: txn.events().to_vec(),
            })
            .await?;
        }
        let events = txn.finish();
        for event in &events {
            self.notify.send(event);
        }
        Ok(events)
    }

    /// Rewrite the WAL as a snapshot of the current table.
    ///
    /// Holds the read lock across the swap: commits need the write lock, so
    /// none can land in the old file after the snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let table = self.table.read().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                snapshot: table.snapshot(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
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
