use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability::COMPACTIONS_TOTAL;

use super::{Engine, EngineError, WalCommand, WalControl};

impl Engine {
    /// Rewrite the WAL as the smallest event set that recreates current state.
    /// Commits are paused for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _quiesced = self.gate.write().await;

        let mut events = Vec::new();

        let mut guests: Vec<GuestInfo> = self.guests.read().await.values().cloned().collect();
        guests.sort_by_key(|g| g.id);
        events.extend(guests.into_iter().map(|g| Event::GuestCreated {
            id: g.id,
            name: g.name,
            email: g.email,
        }));

        let mut property_ids: Vec<Ulid> = self.properties.iter().map(|e| *e.key()).collect();
        property_ids.sort();
        let mut live = 0usize;
        for id in property_ids {
            let Some(shared) = self.shared_property(&id) else { continue };
            let ps = shared.read().await;
            if !ps.live {
                continue;
            }
            live += 1;
            events.push(Event::PropertyCreated {
                id,
                name: ps.name.clone(),
                kind: ps.kind.clone(),
            });
            for interval in &ps.intervals {
                events.push(match &interval.kind {
                    IntervalKind::Booking { guest_id, status } => Event::BookingCreated {
                        id: interval.id,
                        property_id: id,
                        guest_id: *guest_id,
                        range: interval.range,
                        status: *status,
                    },
                    IntervalKind::Block { reason } => Event::BlockCreated {
                        id: interval.id,
                        property_id: id,
                        range: interval.range,
                        reason: reason.clone(),
                    },
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(WalControl::Compact {
                events,
                response: tx,
            }))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(COMPACTIONS_TOTAL).increment(1);
        info!("WAL compacted to {count} events ({live} properties)");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Control(WalControl::AppendsSinceCompact { response: tx }))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
