use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::validate_range;
use super::{Engine, EngineError, PropertyTxn};

fn check_reason(reason: &Option<String>) -> Result<(), EngineError> {
    match reason {
        Some(r) if r.len() > MAX_REASON_LEN => Err(EngineError::LimitExceeded("block reason too long")),
        _ => Ok(()),
    }
}

fn check_capacity(txn: &PropertyTxn) -> Result<(), EngineError> {
    if txn.state().intervals.len() >= MAX_INTERVALS_PER_PROPERTY {
        return Err(EngineError::LimitExceeded("too many reservations on property"));
    }
    Ok(())
}

impl Engine {
    fn ensure_new_entity(&self, id: Ulid) -> Result<(), EngineError> {
        if self.entity_to_property.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(
        &self,
        id: Ulid,
        property_id: Ulid,
        guest_id: Ulid,
        range: DateRange,
    ) -> Result<BookingInfo, EngineError> {
        let mut txn = self.lock_property(property_id).await?;
        self.ensure_new_entity(id)?;
        check_capacity(&txn)?;
        validate_range(&range, self.today())?;
        txn.ensure_vacant(&range, None, None)?;
        txn.attach_guest(self, guest_id).await?;

        let status = BookingStatus::Active;
        let event = Event::BookingCreated {
            id,
            property_id,
            guest_id,
            range,
            status,
        };
        txn.commit(self, event).await?;
        info!("booking {id} created on property {property_id} for {range}");
        Ok(BookingInfo {
            id,
            property_id,
            guest_id,
            range,
            status,
        })
    }

    /// Replace guest and dates. Status is left as it was.
    pub async fn update_booking(
        &self,
        id: Ulid,
        guest_id: Ulid,
        range: DateRange,
    ) -> Result<BookingInfo, EngineError> {
        let mut txn = self.lock_owner(id, EngineError::BookingNotFound).await?;
        let current = txn.booking(id)?;
        current.status.ensure_updatable(id)?;
        validate_range(&range, self.today())?;
        txn.ensure_vacant(&range, Some(id), None)?;
        txn.attach_guest(self, guest_id).await?;

        let property_id = txn.property_id();
        let event = Event::BookingUpdated {
            id,
            property_id,
            guest_id,
            range,
        };
        txn.commit(self, event).await?;
        info!("booking {id} moved to {range}");
        Ok(BookingInfo {
            guest_id,
            range,
            ..current
        })
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let txn = self.lock_owner(id, EngineError::BookingNotFound).await?;
        let current = txn.booking(id)?;
        let status = current.status.cancel(id)?;

        let event = Event::BookingCancelled {
            id,
            property_id: txn.property_id(),
        };
        txn.commit(self, event).await?;
        info!("booking {id} cancelled");
        Ok(BookingInfo { status, ..current })
    }

    /// Cancelled → Reactivated, provided the stored dates are still valid and free.
    pub async fn reactivate_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let txn = self.lock_owner(id, EngineError::BookingNotFound).await?;
        let current = txn.booking(id)?;
        let status = current.status.reactivate(id)?;
        validate_range(&current.range, self.today())?;
        txn.ensure_vacant(&current.range, Some(id), None)?;

        let event = Event::BookingReactivated {
            id,
            property_id: txn.property_id(),
        };
        txn.commit(self, event).await?;
        info!("booking {id} reactivated");
        Ok(BookingInfo { status, ..current })
    }

    /// Administrative removal, allowed in any status.
    pub async fn delete_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let txn = self.lock_owner(id, EngineError::BookingNotFound).await?;
        let current = txn.booking(id)?;

        let event = Event::BookingDeleted {
            id,
            property_id: txn.property_id(),
        };
        txn.commit(self, event).await?;
        info!("booking {id} deleted");
        Ok(current)
    }

    // ── Blocks ───────────────────────────────────────────────

    pub async fn create_block(
        &self,
        id: Ulid,
        property_id: Ulid,
        range: DateRange,
        reason: Option<String>,
    ) -> Result<BlockInfo, EngineError> {
        check_reason(&reason)?;
        let today = self.today();
        let block = self
            .with_property_lock(property_id, |txn| {
                self.ensure_new_entity(id)?;
                check_capacity(txn)?;
                validate_range(&range, today)?;
                txn.ensure_vacant_for_block(&range, None)?;
                let event = Event::BlockCreated {
                    id,
                    property_id,
                    range,
                    reason: reason.clone(),
                };
                Ok((
                    event,
                    BlockInfo {
                        id,
                        property_id,
                        range,
                        reason,
                    },
                ))
            })
            .await?;
        info!("block {id} created on property {property_id} for {range}");
        Ok(block)
    }

    pub async fn update_block(
        &self,
        id: Ulid,
        range: DateRange,
        reason: Option<String>,
    ) -> Result<BlockInfo, EngineError> {
        check_reason(&reason)?;
        let txn = self.lock_owner(id, EngineError::BlockNotFound).await?;
        let current = txn.block(id)?;
        validate_range(&range, self.today())?;
        txn.ensure_vacant_for_block(&range, Some(id))?;

        let event = Event::BlockUpdated {
            id,
            property_id: current.property_id,
            range,
            reason: reason.clone(),
        };
        txn.commit(self, event).await?;
        info!("block {id} moved to {range}");
        Ok(BlockInfo {
            range,
            reason,
            ..current
        })
    }

    pub async fn delete_block(&self, id: Ulid) -> Result<BlockInfo, EngineError> {
        let txn = self.lock_owner(id, EngineError::BlockNotFound).await?;
        let current = txn.block(id)?;

        let event = Event::BlockDeleted {
            id,
            property_id: txn.property_id(),
        };
        txn.commit(self, event).await?;
        info!("block {id} deleted");
        Ok(current)
    }
}
