use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

// Reads take the read side of a property lock. They never block reservations
// for long and their answers are advisory: only a locked writer decides.

impl Engine {
    pub async fn get_property(&self, id: Ulid) -> Result<PropertyInfo, EngineError> {
        let shared = self
            .shared_property(&id)
            .ok_or(EngineError::PropertyNotFound(id))?;
        let ps = shared.read().await;
        if !ps.live {
            return Err(EngineError::PropertyNotFound(id));
        }
        Ok(PropertyInfo {
            id,
            name: ps.name.clone(),
            kind: ps.kind.clone(),
        })
    }

    /// All live properties, ordered by id.
    pub async fn list_properties(&self) -> Vec<PropertyInfo> {
        let mut ids: Vec<Ulid> = self.properties.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(info) = self.get_property(id).await {
                out.push(info);
            }
        }
        out
    }

    pub async fn get_guest(&self, id: Ulid) -> Result<GuestInfo, EngineError> {
        self.guests
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::GuestNotFound(id))
    }

    /// All guests, ordered by id.
    pub async fn list_guests(&self) -> Vec<GuestInfo> {
        let mut out: Vec<GuestInfo> = self.guests.read().await.values().cloned().collect();
        out.sort_by_key(|g| g.id);
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let property_id = self
            .property_for_entity(&id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let shared = self
            .shared_property(&property_id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let ps = shared.read().await;
        ps.get(id)
            .and_then(|i| BookingInfo::from_interval(property_id, i))
            .ok_or(EngineError::BookingNotFound(id))
    }

    /// Every booking on the property, cancelled ones included, ordered by start date.
    pub async fn list_bookings(&self, property_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let shared = self
            .shared_property(&property_id)
            .ok_or(EngineError::PropertyNotFound(property_id))?;
        let ps = shared.read().await;
        if !ps.live {
            return Err(EngineError::PropertyNotFound(property_id));
        }
        Ok(ps
            .intervals
            .iter()
            .filter_map(|i| BookingInfo::from_interval(property_id, i))
            .collect())
    }

    /// Bookings on every live property, ordered by property id then start date.
    pub async fn list_all_bookings(&self) -> Vec<BookingInfo> {
        let mut out = Vec::new();
        for property in self.list_properties().await {
            if let Ok(bookings) = self.list_bookings(property.id).await {
                out.extend(bookings);
            }
        }
        out
    }

    pub async fn get_block(&self, id: Ulid) -> Result<BlockInfo, EngineError> {
        let property_id = self
            .property_for_entity(&id)
            .ok_or(EngineError::BlockNotFound(id))?;
        let shared = self
            .shared_property(&property_id)
            .ok_or(EngineError::BlockNotFound(id))?;
        let ps = shared.read().await;
        ps.get(id)
            .and_then(|i| BlockInfo::from_interval(property_id, i))
            .ok_or(EngineError::BlockNotFound(id))
    }

    /// Blocks on the property ordered by start date.
    pub async fn list_blocks(&self, property_id: Ulid) -> Result<Vec<BlockInfo>, EngineError> {
        let shared = self
            .shared_property(&property_id)
            .ok_or(EngineError::PropertyNotFound(property_id))?;
        let ps = shared.read().await;
        if !ps.live {
            return Err(EngineError::PropertyNotFound(property_id));
        }
        Ok(ps
            .intervals
            .iter()
            .filter_map(|i| BlockInfo::from_interval(property_id, i))
            .collect())
    }

    /// Blocks on every live property, ordered by property id then start date.
    pub async fn list_all_blocks(&self) -> Vec<BlockInfo> {
        let mut out = Vec::new();
        for property in self.list_properties().await {
            if let Ok(blocks) = self.list_blocks(property.id).await {
                out.extend(blocks);
            }
        }
        out
    }

    /// Whether `range` is currently free on the property. Advisory only.
    pub async fn is_vacant(&self, property_id: Ulid, range: DateRange) -> Result<bool, EngineError> {
        let shared = self
            .shared_property(&property_id)
            .ok_or(EngineError::PropertyNotFound(property_id))?;
        let ps = shared.read().await;
        if !ps.live {
            return Err(EngineError::PropertyNotFound(property_id));
        }
        Ok(super::overlap::find_occupying_overlap(&ps, &range, None, None).is_none())
    }
}
