//! Hard caps that keep a single engine's memory and WAL bounded.

pub const MAX_PROPERTIES: usize = 100_000;
pub const MAX_GUESTS: usize = 1_000_000;
/// Bookings (any status) plus blocks on one property.
pub const MAX_INTERVALS_PER_PROPERTY: usize = 50_000;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_KIND_LEN: usize = 50;
pub const MAX_EMAIL_LEN: usize = 255;
pub const MAX_REASON_LEN: usize = 255;

/// Furthest a reservation may end, counted from today.
pub const MAX_HORIZON_MONTHS: u32 = 24;
