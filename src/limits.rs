//! Hard limits on what a single store will accept.

pub const MAX_HOTELS: usize = 10_000;
pub const MAX_ROOMS_PER_HOTEL: usize = 2_000;
/// Cancelled bookings count too; they are kept for history.
pub const MAX_BOOKINGS_PER_ROOM: usize = 50_000;
pub const MAX_PAYMENTS_PER_BOOKING: usize = 32;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4_096;
pub const MAX_AMENITIES: usize = 64;

pub const MAX_STAY_NIGHTS: i64 = 365;
pub const MAX_GUESTS_PER_ROOM: u32 = 32;
pub const MAX_RATING: f32 = 5.0;

/// Stays must fall between these years (inclusive).
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2200;
