mod allocator;
mod error;
mod mutations;
mod queries;

pub use allocator::{plan_allocation, SlotOrdering};
pub use error::LedgerError;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::model::*;
use crate::wal::Wal;

pub type SharedSlot = Arc<RwLock<SlotRecord>>;

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

/// Owns the WAL. Appends that queue up while a flush is running are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
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

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so the partial bytes don't ride along with the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
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
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Persistent per-slot stock.
///
/// Lock order: `structure` → `barrier` → slot locks in ascending slot id.
pub struct Ledger {
    pub(super) slots: DashMap<SlotId, SharedSlot>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes slot creation and removal.
    pub(super) structure: Mutex<()>,
    /// Every WAL append holds this for read; compaction holds it for write so
    /// the snapshot it writes cannot miss an in-flight event.
    pub(super) barrier: RwLock<()>,
    pub(super) ordering: SlotOrdering,
    /// Source of slot generations; unique for the life of the process.
    pub(super) generations: AtomicU64,
}

/// Apply the part of `event` that concerns `rec`. Caller holds the slot lock.
pub(super) fn apply_to_slot(rec: &mut SlotRecord, event: &Event) {
    match event {
        Event::SlotStocked { product_id, quantity, at, .. } => {
            rec.product_id = product_id.clone();
            rec.available = *quantity;
            rec.last_updated = *at;
        }
        Event::StockAllocated { entries, at, .. } => {
            for entry in entries.iter().filter(|e| e.slot_id == rec.slot_id) {
                rec.available = rec.available.saturating_sub(entry.quantity);
            }
            rec.last_updated = *at;
        }
        Event::StockRestored { quantity, at, .. } => {
            rec.available = rec.available.saturating_add(*quantity);
            rec.last_updated = *at;
        }
        Event::SlotRemoved { .. } => {}
    }
    rec.version += 1;
}

impl Ledger {
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        Self::open_with(wal_path, SlotOrdering::default())
    }

    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open_with(wal_path: PathBuf, ordering: SlotOrdering) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = Self {
            slots: DashMap::new(),
            wal_tx,
            structure: Mutex::new(()),
            barrier: RwLock::new(()),
            ordering,
            generations: AtomicU64::new(0),
        };
        for event in &events {
            ledger.replay_event(event);
        }
        tracing::info!(path = %wal_path.display(), events = events.len(), slots = ledger.slots.len(), "ledger replayed");
        Ok(ledger)
    }

    // We own every Arc during replay, so try_write cannot contend.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::SlotStocked { slot_id, product_id, quantity, at } => {
                if let Some(slot) = self.get_shared(slot_id) {
                    if let Ok(mut rec) = slot.try_write() {
                        apply_to_slot(&mut rec, event);
                        rec.generation = self.next_generation();
                    }
                } else {
                    let rec = SlotRecord {
                        slot_id: slot_id.clone(),
                        product_id: product_id.clone(),
                        available: *quantity,
                        last_updated: *at,
                        version: 1,
                        generation: self.next_generation(),
                    };
                    self.slots.insert(slot_id.clone(), Arc::new(RwLock::new(rec)));
                }
            }
            Event::SlotRemoved { slot_id, .. } => {
                self.slots.remove(slot_id);
            }
            Event::StockAllocated { entries, .. } => {
                for entry in entries {
                    if let Some(slot) = self.get_shared(&entry.slot_id)
                        && let Ok(mut rec) = slot.try_write()
                    {
                        apply_to_slot(&mut rec, event);
                    }
                }
            }
            Event::StockRestored { slot_id, .. } => {
                if let Some(slot) = self.get_shared(slot_id)
                    && let Ok(mut rec) = slot.try_write()
                {
                    apply_to_slot(&mut rec, event);
                }
            }
        }
    }

    pub(super) fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(super) fn get_shared(&self, slot_id: &SlotId) -> Option<SharedSlot> {
        self.slots.get(slot_id).map(|e| e.value().clone())
    }

    /// Send one event to the group-commit writer and wait until it is durable.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| LedgerError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> Result<u64, LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| LedgerError::Wal("WAL writer shut down".into()))?;
        rx.await.map_err(|_| LedgerError::Wal("WAL writer dropped response".into()))
    }

    /// Rewrite the WAL as one `SlotStocked` per live slot. Returns the number of slots written.
    pub async fn compact(&self) -> Result<usize, LedgerError> {
        let _barrier = self.barrier.write().await;
        let mut events = Vec::new();
        for slot in self.all_shared() {
            let rec = slot.read().await;
            events.push(Event::SlotStocked {
                slot_id: rec.slot_id.clone(),
                product_id: rec.product_id.clone(),
                quantity: rec.available,
                at: rec.last_updated,
            });
        }
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| LedgerError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::Wal(e.to_string()))?;
        Ok(count)
    }

    /// Clone out every slot handle, sorted by slot id.
    pub(super) fn all_shared(&self) -> Vec<SharedSlot> {
        let mut entries: Vec<(SlotId, SharedSlot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, s)| s).collect()
    }
}
