use std::fmt;

use ulid::Ulid;

use crate::model::BookingStatus;

use super::EngineError;

/// Operations gated by a booking's status. Delete is not here: it is always allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Cancel,
    Reactivate,
    Update,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleAction::Cancel => "cancel",
            LifecycleAction::Reactivate => "reactivate",
            LifecycleAction::Update => "update",
        })
    }
}

impl BookingStatus {
    /// Active | Reactivated → Cancelled.
    pub fn cancel(self, id: Ulid) -> Result<BookingStatus, EngineError> {
        match self {
            BookingStatus::Active | BookingStatus::Reactivated => Ok(BookingStatus::Cancelled),
            BookingStatus::Cancelled => Err(self.refuse(id, LifecycleAction::Cancel)),
        }
    }

    /// Cancelled → Reactivated. The caller still owes a date and overlap re-check.
    pub fn reactivate(self, id: Ulid) -> Result<BookingStatus, EngineError> {
        match self {
            BookingStatus::Cancelled => Ok(BookingStatus::Reactivated),
            BookingStatus::Active | BookingStatus::Reactivated => {
                Err(self.refuse(id, LifecycleAction::Reactivate))
            }
        }
    }

    /// Updates keep the current status; a Reactivated booking stays Reactivated.
    pub fn ensure_updatable(self, id: Ulid) -> Result<(), EngineError> {
        match self {
            BookingStatus::Active | BookingStatus::Reactivated => Ok(()),
            BookingStatus::Cancelled => Err(self.refuse(id, LifecycleAction::Update)),
        }
    }

    fn refuse(self, id: Ulid, action: LifecycleAction) -> EngineError {
        EngineError::InvalidLifecycleTransition {
            id,
            from: self,
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused(result: Result<BookingStatus, EngineError>, expected: LifecycleAction) -> bool {
        matches!(
            result,
            Err(EngineError::InvalidLifecycleTransition { action, .. }) if action == expected
        )
    }

    #[test]
    fn cancel_from_occupying_states() {
        let id = Ulid::new();
        assert_eq!(BookingStatus::Active.cancel(id).unwrap(), BookingStatus::Cancelled);
        assert_eq!(BookingStatus::Reactivated.cancel(id).unwrap(), BookingStatus::Cancelled);
    }

    #[test]
    fn double_cancel_refused() {
        assert!(refused(
            BookingStatus::Cancelled.cancel(Ulid::new()),
            LifecycleAction::Cancel
        ));
    }

    #[test]
    fn reactivate_only_from_cancelled() {
        let id = Ulid::new();
        assert_eq!(
            BookingStatus::Cancelled.reactivate(id).unwrap(),
            BookingStatus::Reactivated
        );
        assert!(refused(BookingStatus::Active.reactivate(id), LifecycleAction::Reactivate));
        assert!(refused(
            BookingStatus::Reactivated.reactivate(id),
            LifecycleAction::Reactivate
        ));
    }

    #[test]
    fn update_refused_only_when_cancelled() {
        let id = Ulid::new();
        assert!(BookingStatus::Active.ensure_updatable(id).is_ok());
        assert!(BookingStatus::Reactivated.ensure_updatable(id).is_ok());
        let err = BookingStatus::Cancelled.ensure_updatable(id).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("cannot update booking {id}: status is cancelled")
        );
    }
}
