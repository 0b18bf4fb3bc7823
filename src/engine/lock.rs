use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{LOCK_TIMEOUTS_TOTAL, LOCK_WAIT_SECONDS, RESERVATION_CONFLICTS_TOTAL};

use super::overlap::{find_booking_overlap, find_block_overlap, find_occupying_overlap, Conflict};
use super::{apply_to_property, Engine, EngineError, GuestTable, SharedPropertyState};

/// Exclusive hold on one property for the span of a single reservation
/// decision. Dropping it without [`PropertyTxn::commit`] releases the lock
/// with nothing written.
pub struct PropertyTxn {
    property_id: Ulid,
    shared: SharedPropertyState,
    properties: std::sync::Arc<DashMap<Ulid, SharedPropertyState>>,
    guard: OwnedRwLockWriteGuard<PropertyState>,
    guests: Option<OwnedRwLockReadGuard<GuestTable>>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl PropertyTxn {
    pub(super) fn new(
        engine: &Engine,
        shared: SharedPropertyState,
        guard: OwnedRwLockWriteGuard<PropertyState>,
        gate: OwnedRwLockReadGuard<()>,
    ) -> Self {
        Self {
            property_id: guard.id,
            shared,
            properties: engine.properties.clone(),
            guard,
            guests: None,
            _gate: gate,
        }
    }

    pub fn property_id(&self) -> Ulid {
        self.property_id
    }

    /// The locked property. Stable until the transaction ends.
    pub fn state(&self) -> &PropertyState {
        &self.guard
    }

    pub fn booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        self.guard
            .get(id)
            .and_then(|i| BookingInfo::from_interval(self.property_id, i))
            .ok_or(EngineError::BookingNotFound(id))
    }

    pub fn block(&self, id: Ulid) -> Result<BlockInfo, EngineError> {
        self.guard
            .get(id)
            .and_then(|i| BlockInfo::from_interval(self.property_id, i))
            .ok_or(EngineError::BlockNotFound(id))
    }

    /// Reject `range` if an occupying booking or a block holds any of it.
    pub fn ensure_vacant(
        &self,
        range: &DateRange,
        exclude_booking: Option<Ulid>,
        exclude_block: Option<Ulid>,
    ) -> Result<(), EngineError> {
        match find_occupying_overlap(&self.guard, range, exclude_booking, exclude_block) {
            None => Ok(()),
            Some(conflict) => Err(self.refuse("booking", range, conflict)),
        }
    }

    /// Block variant: every occupying booking counts, only the block itself is skipped.
    pub fn ensure_vacant_for_block(
        &self,
        range: &DateRange,
        exclude_block: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if let Some(id) = find_booking_overlap(&self.guard, range, None) {
            return Err(self.refuse("block", range, Conflict::Booked(id)));
        }
        if let Some(id) = find_block_overlap(&self.guard, range, exclude_block) {
            return Err(self.refuse("block", range, Conflict::Blocked(id)));
        }
        Ok(())
    }

    fn refuse(&self, kind: &'static str, range: &DateRange, conflict: Conflict) -> EngineError {
        metrics::counter!(RESERVATION_CONFLICTS_TOTAL, "kind" => kind).increment(1);
        warn!(
            "property {}: {kind} {range} refused: {conflict}",
            self.property_id
        );
        EngineError::DateAlreadyReserved(conflict)
    }

    /// Check that `guest_id` exists and keep it from being deleted until commit.
    pub async fn attach_guest(&mut self, engine: &Engine, guest_id: Ulid) -> Result<(), EngineError> {
        let guests = match self.guests.take() {
            Some(held) => held,
            None => engine.guests.clone().read_owned().await,
        };
        let found = guests.contains_key(&guest_id);
        self.guests = Some(guests);
        if found {
            Ok(())
        } else {
            Err(EngineError::GuestNotFound(guest_id))
        }
    }

    /// Append `event` to the WAL and apply it to the locked state.
    /// The lock is released once the event is visible.
    pub async fn commit(self, engine: &Engine, event: Event) -> Result<(), EngineError> {
        let index = engine.entity_to_property.clone();
        let refs = engine.guest_refs.clone();
        engine
            .commit_detached(event, move |event| {
                let mut txn = self;
                apply_to_property(&mut txn.guard, event, &index, &refs);
            })
            .await
    }
}

impl Drop for PropertyTxn {
    fn drop(&mut self) {
        // A property that is not live here is either a placeholder whose
        // creation never committed or one that was just deleted.
        if !self.guard.live {
            self.properties
                .remove_if(&self.property_id, |_, v| std::sync::Arc::ptr_eq(v, &self.shared));
        }
    }
}

impl Engine {
    /// Take the exclusive lock for `id`. Waits at most `lock_wait`.
    pub async fn lock_property(&self, id: Ulid) -> Result<PropertyTxn, EngineError> {
        let shared = self
            .shared_property(&id)
            .ok_or(EngineError::PropertyNotFound(id))?;

        let started = Instant::now();
        let gate = self.gate.clone();
        let acquired = tokio::time::timeout(self.lock_wait(), async {
            let gate = gate.read_owned().await;
            let guard = shared.clone().write_owned().await;
            (gate, guard)
        })
        .await;
        let waited = started.elapsed();
        metrics::histogram!(LOCK_WAIT_SECONDS).record(waited.as_secs_f64());

        let Ok((gate, guard)) = acquired else {
            metrics::counter!(LOCK_TIMEOUTS_TOTAL).increment(1);
            warn!("property {id}: lock wait exceeded {:?}", self.lock_wait());
            return Err(EngineError::LockTimeout(id));
        };
        debug!("property {id}: locked after {waited:?}");

        let txn = PropertyTxn::new(self, shared, guard, gate);
        if !txn.state().live {
            return Err(EngineError::PropertyNotFound(id));
        }
        Ok(txn)
    }

    /// Lock whichever property owns the booking or block `entity_id`.
    /// `not_found` builds the error for an unknown entity.
    pub(super) async fn lock_owner(
        &self,
        entity_id: Ulid,
        not_found: fn(Ulid) -> EngineError,
    ) -> Result<PropertyTxn, EngineError> {
        let property_id = self
            .property_for_entity(&entity_id)
            .ok_or_else(|| not_found(entity_id))?;
        match self.lock_property(property_id).await {
            Ok(txn) => Ok(txn),
            Err(EngineError::PropertyNotFound(_)) => Err(not_found(entity_id)),
            Err(e) => Err(e),
        }
    }

    /// Run `decide` against the locked property and commit the event it returns.
    pub async fn with_property_lock<T, F>(&self, id: Ulid, decide: F) -> Result<T, EngineError>
    where
        F: FnOnce(&PropertyTxn) -> Result<(Event, T), EngineError>,
    {
        let txn = self.lock_property(id).await?;
        let (event, out) = decide(&txn)?;
        txn.commit(self, event).await?;
        Ok(out)
    }
}
