use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, DateRange};

use super::lifecycle::LifecycleAction;
use super::overlap::Conflict;
use super::validate::RangeViolation;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("property not found: {0}")]
    PropertyNotFound(Ulid),
    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),
    #[error("block not found: {0}")]
    BlockNotFound(Ulid),
    #[error("guest not found: {0}")]
    GuestNotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid date range {range}: {violation}")]
    InvalidDateRange {
        range: DateRange,
        violation: RangeViolation,
    },
    #[error("{0}")]
    DateAlreadyReserved(Conflict),
    #[error("cannot {action} booking {id}: status is {from}")]
    InvalidLifecycleTransition {
        id: Ulid,
        from: BookingStatus,
        action: LifecycleAction,
    },
    #[error("property {0} still has bookings or blocks")]
    HasReservations(Ulid),
    #[error("guest {0} is referenced by bookings")]
    GuestInUse(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("timed out waiting for lock on property {0}")]
    LockTimeout(Ulid),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Only lock-wait expiry is worth retrying; everything else fails the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LockTimeout(_))
    }
}
