use std::fmt;

use ulid::Ulid;

use crate::model::{DateRange, IntervalKind, PropertyState};

/// The record that already holds some of the requested dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    Booked(Ulid),
    Blocked(Ulid),
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::Booked(id) => write!(f, "dates already booked (booking {id})"),
            Conflict::Blocked(id) => write!(f, "dates are blocked (block {id})"),
        }
    }
}

/// First occupying booking overlapping `range`, skipping `exclude`.
pub(super) fn find_booking_overlap(
    state: &PropertyState,
    range: &DateRange,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    state
        .overlapping(range)
        .filter(|i| Some(i.id) != exclude)
        .find(|i| {
            matches!(i.kind, IntervalKind::Booking { status, .. } if status.is_occupying())
        })
        .map(|i| i.id)
}

/// First block overlapping `range`, skipping `exclude`.
pub(super) fn find_block_overlap(
    state: &PropertyState,
    range: &DateRange,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    state
        .overlapping(range)
        .filter(|i| Some(i.id) != exclude)
        .find(|i| i.is_block())
        .map(|i| i.id)
}

/// Bookings are checked before blocks, so a range hitting both reports the booking.
pub(super) fn find_occupying_overlap(
    state: &PropertyState,
    range: &DateRange,
    exclude_booking: Option<Ulid>,
    exclude_block: Option<Ulid>,
) -> Option<Conflict> {
    if let Some(id) = find_booking_overlap(state, range, exclude_booking) {
        return Some(Conflict::Booked(id));
    }
    find_block_overlap(state, range, exclude_block).map(Conflict::Blocked)
}

#[cfg(test)]
pub(super) fn has_occupying_overlap(
    state: &PropertyState,
    range: &DateRange,
    exclude_booking: Option<Ulid>,
    exclude_block: Option<Ulid>,
) -> bool {
    find_occupying_overlap(state, range, exclude_booking, exclude_block).is_some()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::model::{BookingStatus, Interval};

    fn r(start: u32, end: u32) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2027, 7, start).unwrap(),
            NaiveDate::from_ymd_opt(2027, 7, end).unwrap(),
        )
    }

    fn add_booking(ps: &mut PropertyState, start: u32, end: u32, status: BookingStatus) -> Ulid {
        let id = Ulid::new();
        ps.insert_interval(Interval {
            id,
            range: r(start, end),
            kind: IntervalKind::Booking {
                guest_id: Ulid::new(),
                status,
            },
        });
        id
    }

    fn add_block(ps: &mut PropertyState, start: u32, end: u32) -> Ulid {
        let id = Ulid::new();
        ps.insert_interval(Interval {
            id,
            range: r(start, end),
            kind: IntervalKind::Block {
                reason: Some("maintenance".into()),
            },
        });
        id
    }

    #[test]
    fn empty_property_has_no_overlap() {
        let ps = PropertyState::new(Ulid::new());
        assert_eq!(find_occupying_overlap(&ps, &r(1, 5), None, None), None);
    }

    #[test]
    fn active_booking_conflicts() {
        let mut ps = PropertyState::new(Ulid::new());
        let id = add_booking(&mut ps, 10, 15, BookingStatus::Active);
        assert_eq!(
            find_occupying_overlap(&ps, &r(12, 18), None, None),
            Some(Conflict::Booked(id))
        );
    }

    #[test]
    fn reactivated_booking_conflicts() {
        let mut ps = PropertyState::new(Ulid::new());
        add_booking(&mut ps, 10, 15, BookingStatus::Reactivated);
        assert!(has_occupying_overlap(&ps, &r(14, 16), None, None));
    }

    #[test]
    fn cancelled_booking_is_vacant() {
        let mut ps = PropertyState::new(Ulid::new());
        add_booking(&mut ps, 10, 15, BookingStatus::Cancelled);
        assert!(!has_occupying_overlap(&ps, &r(10, 15), None, None));
    }

    #[test]
    fn adjacent_ranges_do_not_conflict() {
        let mut ps = PropertyState::new(Ulid::new());
        add_booking(&mut ps, 10, 15, BookingStatus::Active);
        add_block(&mut ps, 20, 22);
        assert!(!has_occupying_overlap(&ps, &r(15, 20), None, None));
        assert!(!has_occupying_overlap(&ps, &r(5, 10), None, None));
    }

    #[test]
    fn block_conflicts() {
        let mut ps = PropertyState::new(Ulid::new());
        let id = add_block(&mut ps, 3, 8);
        assert_eq!(
            find_occupying_overlap(&ps, &r(1, 4), None, None),
            Some(Conflict::Blocked(id))
        );
    }

    #[test]
    fn bookings_reported_before_blocks() {
        let mut ps = PropertyState::new(Ulid::new());
        add_block(&mut ps, 1, 5);
        let bk = add_booking(&mut ps, 6, 9, BookingStatus::Active);
        assert_eq!(
            find_occupying_overlap(&ps, &r(1, 9), None, None),
            Some(Conflict::Booked(bk))
        );
    }

    #[test]
    fn exclusion_skips_self() {
        let mut ps = PropertyState::new(Ulid::new());
        let bk = add_booking(&mut ps, 10, 15, BookingStatus::Active);
        let bl = add_block(&mut ps, 20, 25);
        assert!(!has_occupying_overlap(&ps, &r(11, 14), Some(bk), None));
        assert!(!has_occupying_overlap(&ps, &r(21, 24), None, Some(bl)));
        // Excluding a block does not hide a booking with the same dates.
        assert!(has_occupying_overlap(&ps, &r(11, 14), None, Some(bl)));
    }

    #[test]
    fn long_interval_found_from_later_query() {
        let mut ps = PropertyState::new(Ulid::new());
        add_block(&mut ps, 1, 30);
        add_booking(&mut ps, 2, 3, BookingStatus::Cancelled);
        assert!(has_occupying_overlap(&ps, &r(28, 29), None, None));
    }

    #[test]
    fn conflict_message() {
        let id = Ulid::new();
        assert_eq!(
            Conflict::Booked(id).to_string(),
            format!("dates already booked (booking {id})")
        );
    }
}
