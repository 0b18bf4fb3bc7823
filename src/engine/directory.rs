use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, PropertyTxn};

fn check_property_fields(name: &str, kind: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("property name too long"));
    }
    if kind.len() > MAX_KIND_LEN {
        return Err(EngineError::LimitExceeded("property kind too long"));
    }
    Ok(())
}

fn check_guest_fields(name: &str, email: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("guest name too long"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("guest email too long"));
    }
    Ok(())
}

impl Engine {
    // ── Properties ───────────────────────────────────────────

    pub async fn create_property(
        &self,
        id: Ulid,
        name: String,
        kind: String,
    ) -> Result<PropertyInfo, EngineError> {
        check_property_fields(&name, &kind)?;
        if self.properties.len() >= MAX_PROPERTIES {
            return Err(EngineError::LimitExceeded("too many properties"));
        }

        let gate = self.gate.clone().read_owned().await;
        let shared = Arc::new(RwLock::new(PropertyState::new(id)));
        let guard = shared
            .clone()
            .try_write_owned()
            .map_err(|_| EngineError::LockTimeout(id))?;
        match self.properties.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared.clone());
            }
        }

        // Placeholder is not live until the event commits; a failed commit removes it.
        let txn = PropertyTxn::new(self, shared, guard, gate);
        let event = Event::PropertyCreated {
            id,
            name: name.clone(),
            kind: kind.clone(),
        };
        txn.commit(self, event).await?;
        info!("property {id} created");
        Ok(PropertyInfo { id, name, kind })
    }

    pub async fn update_property(
        &self,
        id: Ulid,
        name: String,
        kind: String,
    ) -> Result<PropertyInfo, EngineError> {
        check_property_fields(&name, &kind)?;
        let info = self
            .with_property_lock(id, |_| {
                let event = Event::PropertyUpdated {
                    id,
                    name: name.clone(),
                    kind: kind.clone(),
                };
                Ok((event, PropertyInfo { id, name, kind }))
            })
            .await?;
        info!("property {id} updated");
        Ok(info)
    }

    /// Refused while any booking or block, cancelled ones included, remains.
    pub async fn delete_property(&self, id: Ulid) -> Result<(), EngineError> {
        self.with_property_lock(id, |txn| {
            if txn.state().has_reservations() {
                return Err(EngineError::HasReservations(id));
            }
            Ok((Event::PropertyDeleted { id }, ()))
        })
        .await?;
        info!("property {id} deleted");
        Ok(())
    }

    // ── Guests ───────────────────────────────────────────────

    pub async fn create_guest(
        &self,
        id: Ulid,
        name: String,
        email: String,
    ) -> Result<GuestInfo, EngineError> {
        check_guest_fields(&name, &email)?;
        let gate = self.gate.clone().read_owned().await;
        let guests = self.guests.clone().write_owned().await;
        if guests.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guests.len() >= MAX_GUESTS {
            return Err(EngineError::LimitExceeded("too many guests"));
        }

        let event = Event::GuestCreated {
            id,
            name: name.clone(),
            email: email.clone(),
        };
        self.commit_guest_event(guests, gate, event).await?;
        info!("guest {id} created");
        Ok(GuestInfo { id, name, email })
    }

    pub async fn update_guest(
        &self,
        id: Ulid,
        name: String,
        email: String,
    ) -> Result<GuestInfo, EngineError> {
        check_guest_fields(&name, &email)?;
        let gate = self.gate.clone().read_owned().await;
        let guests = self.guests.clone().write_owned().await;
        if !guests.contains_key(&id) {
            return Err(EngineError::GuestNotFound(id));
        }

        let event = Event::GuestUpdated {
            id,
            name: name.clone(),
            email: email.clone(),
        };
        self.commit_guest_event(guests, gate, event).await?;
        info!("guest {id} updated");
        Ok(GuestInfo { id, name, email })
    }

    /// Refused while any booking, in any status, names the guest.
    pub async fn delete_guest(&self, id: Ulid) -> Result<(), EngineError> {
        let gate = self.gate.clone().read_owned().await;
        let guests = self.guests.clone().write_owned().await;
        if !guests.contains_key(&id) {
            return Err(EngineError::GuestNotFound(id));
        }
        // Booking commits hold the guest table read lock, so this count is stable.
        if self.guest_refs.get(&id).is_some_and(|n| *n > 0) {
            return Err(EngineError::GuestInUse(id));
        }

        self.commit_guest_event(guests, gate, Event::GuestDeleted { id })
            .await?;
        info!("guest {id} deleted");
        Ok(())
    }
}
