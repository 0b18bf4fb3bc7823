use std::fmt;

use chrono::{Months, NaiveDate};

use crate::limits::MAX_HORIZON_MONTHS;
use crate::model::DateRange;

use super::EngineError;

/// Which date rule a candidate range broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeViolation {
    StartNotBeforeEnd,
    StartInPast,
    BeyondHorizon { latest_end: NaiveDate },
}

impl fmt::Display for RangeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeViolation::StartNotBeforeEnd => f.write_str("start must precede end"),
            RangeViolation::StartInPast => f.write_str("start cannot be in the past"),
            RangeViolation::BeyondHorizon { latest_end } => {
                write!(f, "end exceeds maximum horizon ({latest_end})")
            }
        }
    }
}

/// Last permitted end date for a reservation made on `today`.
/// Month arithmetic clamps Feb 29 to Feb 28.
pub fn horizon(today: NaiveDate) -> NaiveDate {
    today
        .checked_add_months(Months::new(MAX_HORIZON_MONTHS))
        .unwrap_or(NaiveDate::MAX)
}

/// Check a candidate range against the calendar rules. First failing rule wins.
pub fn validate_range(range: &DateRange, today: NaiveDate) -> Result<(), EngineError> {
    let violation = if !range.is_valid_ordering() {
        RangeViolation::StartNotBeforeEnd
    } else if range.start < today {
        RangeViolation::StartInPast
    } else if range.end > horizon(today) {
        RangeViolation::BeyondHorizon {
            latest_end: horizon(today),
        }
    } else {
        return Ok(());
    };
    Err(EngineError::InvalidDateRange {
        range: *range,
        violation,
    })
}
