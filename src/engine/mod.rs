mod clock;
mod compact;
mod directory;
mod error;
mod lifecycle;
mod lock;
mod overlap;
mod queries;
mod reserve;
mod validate;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::EngineError;
pub use lifecycle::LifecycleAction;
pub use lock::PropertyTxn;
pub use overlap::Conflict;
pub use validate::{horizon, validate_range, RangeViolation};

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;
pub type GuestTable = HashMap<Ulid, GuestInfo>;

/// Default ceiling on how long a caller waits for a property lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(5000);

// ── Group-commit WAL channel ─────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: Ack },
    Control(WalControl),
}

pub(super) enum WalControl {
    Compact { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the WAL. Appends that are already queued when the first one arrives
/// share a single fsync; control commands flush the pending batch first.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            WalCommand::Control(control) => {
                handle_control(&mut wal, control);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                WalCommand::Control(control) => {
                    deferred = Some(control);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(control) = deferred {
            handle_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Ack)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    // Every caller in the batch hears an error, so none of it may stay on disk.
    if let Err(e) = &result {
        warn!("WAL batch of {} failed, rolling back: {e}", batch.len());
        if let Err(e) = wal.rollback() {
            error!("WAL rollback failed, refusing further appends: {e}");
        }
    }

    for (_, ack) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(reply);
    }
}

fn handle_control(wal: &mut Wal, control: WalControl) {
    match control {
        WalControl::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event,
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

// ── In-memory apply ──────────────────────────────────────

fn retain_guest(refs: &DashMap<Ulid, usize>, guest_id: Ulid) {
    *refs.entry(guest_id).or_insert(0) += 1;
}

fn release_guest(refs: &DashMap<Ulid, usize>, guest_id: Ulid) {
    if let Some(mut count) = refs.get_mut(&guest_id) {
        *count = count.saturating_sub(1);
    }
    refs.remove_if(&guest_id, |_, count| *count == 0);
}

/// Apply an event to one property's state. Caller holds the write lock.
fn apply_to_property(
    ps: &mut PropertyState,
    event: &Event,
    index: &DashMap<Ulid, Ulid>,
    guest_refs: &DashMap<Ulid, usize>,
) {
    match event {
        Event::PropertyCreated { name, kind, .. } => {
            ps.name = name.clone();
            ps.kind = kind.clone();
            ps.live = true;
        }
        Event::PropertyUpdated { name, kind, .. } => {
            ps.name = name.clone();
            ps.kind = kind.clone();
        }
        Event::PropertyDeleted { .. } => {
            ps.live = false;
        }
        Event::BookingCreated {
            id,
            property_id,
            guest_id,
            range,
            status,
        } => {
            ps.insert_interval(Interval {
                id: *id,
                range: *range,
                kind: IntervalKind::Booking {
                    guest_id: *guest_id,
                    status: *status,
                },
            });
            index.insert(*id, *property_id);
            retain_guest(guest_refs, *guest_id);
        }
        Event::BookingUpdated {
            id,
            guest_id,
            range,
            ..
        } => {
            let Some(old) = ps.remove_interval(*id) else { return };
            let IntervalKind::Booking {
                guest_id: old_guest,
                status,
            } = old.kind
            else {
                ps.insert_interval(old);
                return;
            };
            ps.insert_interval(Interval {
                id: *id,
                range: *range,
                kind: IntervalKind::Booking {
                    guest_id: *guest_id,
                    status,
                },
            });
            if old_guest != *guest_id {
                release_guest(guest_refs, old_guest);
                retain_guest(guest_refs, *guest_id);
            }
        }
        Event::BookingCancelled { id, .. } => set_status(ps, *id, BookingStatus::Cancelled),
        Event::BookingReactivated { id, .. } => set_status(ps, *id, BookingStatus::Reactivated),
        Event::BookingDeleted { id, .. } => {
            if let Some(Interval {
                kind: IntervalKind::Booking { guest_id, .. },
                ..
            }) = ps.remove_interval(*id)
            {
                release_guest(guest_refs, guest_id);
            }
            index.remove(id);
        }
        Event::BlockCreated {
            id,
            property_id,
            range,
            reason,
        } => {
            ps.insert_interval(Interval {
                id: *id,
                range: *range,
                kind: IntervalKind::Block {
                    reason: reason.clone(),
                },
            });
            index.insert(*id, *property_id);
        }
        Event::BlockUpdated {
            id, range, reason, ..
        } => {
            ps.remove_interval(*id);
            ps.insert_interval(Interval {
                id: *id,
                range: *range,
                kind: IntervalKind::Block {
                    reason: reason.clone(),
                },
            });
        }
        Event::BlockDeleted { id, .. } => {
            ps.remove_interval(*id);
            index.remove(id);
        }
        Event::GuestCreated { .. } | Event::GuestUpdated { .. } | Event::GuestDeleted { .. } => {}
    }
}

fn set_status(ps: &mut PropertyState, id: Ulid, to: BookingStatus) {
    if let Some(Interval {
        kind: IntervalKind::Booking { status, .. },
        ..
    }) = ps.get_mut(id)
    {
        *status = to;
    }
}

/// Apply a guest event to the guest table. Caller holds the write lock.
fn apply_to_guests(guests: &mut GuestTable, event: &Event) {
    match event {
        Event::GuestCreated { id, name, email } | Event::GuestUpdated { id, name, email } => {
            guests.insert(
                *id,
                GuestInfo {
                    id: *id,
                    name: name.clone(),
                    email: email.clone(),
                },
            );
        }
        Event::GuestDeleted { id } => {
            guests.remove(id);
        }
        _ => {}
    }
}

// ── Engine ───────────────────────────────────────────────

/// Runtime knobs for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub clock: Arc<dyn Clock>,
    pub lock_wait: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }
}

impl EngineOptions {
    /// Options whose clock is pinned to `today`.
    pub fn fixed_today(today: NaiveDate) -> Self {
        Self {
            clock: Arc::new(FixedClock(today)),
            ..Self::default()
        }
    }
}

pub struct Engine {
    pub(super) properties: Arc<DashMap<Ulid, SharedPropertyState>>,
    pub(super) guests: Arc<RwLock<GuestTable>>,
    /// Number of bookings (any status) naming each guest.
    pub(super) guest_refs: Arc<DashMap<Ulid, usize>>,
    /// Reverse lookup: booking/block id → property id.
    pub(super) entity_to_property: Arc<DashMap<Ulid, Ulid>>,
    /// Mutations hold the read side from lock acquisition to apply; compaction
    /// takes the write side to see a quiescent state.
    pub(super) gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    clock: Arc<dyn Clock>,
    lock_wait: Duration,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task.
    /// Must be called from within a Tokio runtime.
    pub fn new(wal_path: &Path, options: EngineOptions) -> io::Result<Self> {
        let (wal, events) = Wal::recover(wal_path)?;

        let index = DashMap::new();
        let guest_refs = DashMap::new();
        let mut properties: HashMap<Ulid, PropertyState> = HashMap::new();
        let mut guests = GuestTable::new();

        for event in &events {
            match event {
                Event::PropertyCreated { id, .. } => {
                    let ps = properties
                        .entry(*id)
                        .or_insert_with(|| PropertyState::new(*id));
                    apply_to_property(ps, event, &index, &guest_refs);
                }
                Event::PropertyDeleted { id } => {
                    properties.remove(id);
                }
                Event::GuestCreated { .. }
                | Event::GuestUpdated { .. }
                | Event::GuestDeleted { .. } => apply_to_guests(&mut guests, event),
                other => {
                    if let Some(pid) = other.property_id()
                        && let Some(ps) = properties.get_mut(&pid)
                    {
                        apply_to_property(ps, other, &index, &guest_refs);
                    }
                }
            }
        }

        info!(
            "replayed {} events from {}: {} properties, {} guests, {} reservations",
            events.len(),
            wal_path.display(),
            properties.len(),
            guests.len(),
            index.len()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            properties: Arc::new(
                properties
                    .into_iter()
                    .map(|(id, ps)| (id, Arc::new(RwLock::new(ps))))
                    .collect(),
            ),
            guests: Arc::new(RwLock::new(guests)),
            guest_refs: Arc::new(guest_refs),
            entity_to_property: Arc::new(index),
            gate: Arc::new(RwLock::new(())),
            wal_tx,
            clock: options.clock,
            lock_wait: options.lock_wait,
        })
    }

    /// Today's date according to the engine clock.
    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn lock_wait(&self) -> Duration {
        self.lock_wait
    }

    pub(super) fn shared_property(&self, id: &Ulid) -> Option<SharedPropertyState> {
        self.properties.get(id).map(|e| e.value().clone())
    }

    pub fn property_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_property.get(entity_id).map(|e| *e.value())
    }

    /// Make `event` durable, then run `apply`. Both happen on a detached task
    /// so a caller dropping its future cannot separate the log from memory.
    /// `apply` owns whatever guards must stay held until the event is visible.
    pub(super) async fn commit_detached<F>(&self, event: Event, apply: F) -> Result<(), EngineError>
    where
        F: FnOnce(&Event) + Send + 'static,
    {
        let wal_tx = self.wal_tx.clone();
        let task = tokio::spawn(async move {
            wal_append(&wal_tx, event.clone()).await?;
            apply(&event);
            Ok(())
        });
        task.await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    /// Commit a guest event while holding the guest table write lock.
    pub(super) async fn commit_guest_event(
        &self,
        mut guests: tokio::sync::OwnedRwLockWriteGuard<GuestTable>,
        gate: tokio::sync::OwnedRwLockReadGuard<()>,
        event: Event,
    ) -> Result<(), EngineError> {
        self.commit_detached(event, move |event| {
            apply_to_guests(&mut guests, event);
            drop(gate);
        })
        .await
    }
}
