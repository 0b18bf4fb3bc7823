use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open date range `[start, end)`. `end` is the checkout day and is not occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Builds a range without checking ordering; see `engine::validate_range`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_valid_ordering(&self) -> bool {
        self.start < self.end
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    #[cfg(test)]
    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Lifecycle state of a booking. Transitions live in `engine::lifecycle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Cancelled,
    Reactivated,
}

impl BookingStatus {
    /// Whether a booking in this state holds its dates against other reservations.
    pub fn is_occupying(self) -> bool {
        match self {
            BookingStatus::Active | BookingStatus::Reactivated => true,
            BookingStatus::Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Reactivated => "reactivated",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an interval on a property's timeline represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    Booking { guest_id: Ulid, status: BookingStatus },
    /// Administrative closure. Always occupying.
    Block { reason: Option<String> },
}

/// A single interval on a property: bookings and blocks share one sorted timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub range: DateRange,
    pub kind: IntervalKind,
}

impl Interval {
    pub fn is_booking(&self) -> bool {
        matches!(self.kind, IntervalKind::Booking { .. })
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, IntervalKind::Block { .. })
    }

    pub fn is_occupying(&self) -> bool {
        match &self.kind {
            IntervalKind::Booking { status, .. } => status.is_occupying(),
            IntervalKind::Block { .. } => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyState {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
    /// False until the creating event is committed, and again once deleted.
    /// Lock holders must treat a non-live property as missing.
    pub live: bool,
    /// All bookings and blocks, sorted by `range.start`.
    pub intervals: Vec<Interval>,
}

impl PropertyState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            name: String::new(),
            kind: String::new(),
            live: false,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by range.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.range.start, |i| i.range.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Interval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Interval> {
        self.intervals.iter_mut().find(|i| i.id == id)
    }

    /// Return only intervals whose range overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.range.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.range.end > query.start)
    }

    pub fn has_reservations(&self) -> bool {
        !self.intervals.is_empty()
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PropertyCreated {
        id: Ulid,
        name: String,
        kind: String,
    },
    PropertyUpdated {
        id: Ulid,
        name: String,
        kind: String,
    },
    PropertyDeleted {
        id: Ulid,
    },
    GuestCreated {
        id: Ulid,
        name: String,
        email: String,
    },
    GuestUpdated {
        id: Ulid,
        name: String,
        email: String,
    },
    GuestDeleted {
        id: Ulid,
    },
    /// Carries the status so compaction can re-emit cancelled and reactivated bookings.
    BookingCreated {
        id: Ulid,
        property_id: Ulid,
        guest_id: Ulid,
        range: DateRange,
        status: BookingStatus,
    },
    BookingUpdated {
        id: Ulid,
        property_id: Ulid,
        guest_id: Ulid,
        range: DateRange,
    },
    BookingCancelled {
        id: Ulid,
        property_id: Ulid,
    },
    BookingReactivated {
        id: Ulid,
        property_id: Ulid,
    },
    BookingDeleted {
        id: Ulid,
        property_id: Ulid,
    },
    BlockCreated {
        id: Ulid,
        property_id: Ulid,
        range: DateRange,
        reason: Option<String>,
    },
    BlockUpdated {
        id: Ulid,
        property_id: Ulid,
        range: DateRange,
        reason: Option<String>,
    },
    BlockDeleted {
        id: Ulid,
        property_id: Ulid,
    },
}

impl Event {
    /// The property whose timeline this event mutates, if any.
    pub fn property_id(&self) -> Option<Ulid> {
        match self {
            Event::PropertyCreated { id, .. }
            | Event::PropertyUpdated { id, .. }
            | Event::PropertyDeleted { id } => Some(*id),
            Event::BookingCreated { property_id, .. }
            | Event::BookingUpdated { property_id, .. }
            | Event::BookingCancelled { property_id, .. }
            | Event::BookingReactivated { property_id, .. }
            | Event::BookingDeleted { property_id, .. }
            | Event::BlockCreated { property_id, .. }
            | Event::BlockUpdated { property_id, .. }
            | Event::BlockDeleted { property_id, .. } => Some(*property_id),
            Event::GuestCreated { .. } | Event::GuestUpdated { .. } | Event::GuestDeleted { .. } => {
                None
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInfo {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub property_id: Ulid,
    pub guest_id: Ulid,
    pub range: DateRange,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: Ulid,
    pub property_id: Ulid,
    pub range: DateRange,
    pub reason: Option<String>,
}

impl BookingInfo {
    pub(crate) fn from_interval(property_id: Ulid, interval: &Interval) -> Option<Self> {
        match &interval.kind {
            IntervalKind::Booking { guest_id, status } => Some(BookingInfo {
                id: interval.id,
                property_id,
                guest_id: *guest_id,
                range: interval.range,
                status: *status,
            }),
            IntervalKind::Block { .. } => None,
        }
    }
}

impl BlockInfo {
    pub(crate) fn from_interval(property_id: Ulid, interval: &Interval) -> Option<Self> {
        match &interval.kind {
            IntervalKind::Block { reason } => Some(BlockInfo {
                id: interval.id,
                property_id,
                range: interval.range,
                reason: reason.clone(),
            }),
            IntervalKind::Booking { .. } => None,
        }
    }
}
