use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, Stay};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("invalid date range {0}: check-out must be after check-in")]
    InvalidDateRange(Stay),

    #[error("room {room_id} holds at most {max} guests, {requested} requested")]
    OccupancyExceeded {
        room_id: Ulid,
        requested: u32,
        max: u32,
    },

    #[error("invalid value: {0}")]
    Invalid(&'static str),

    /// `conflict` names the booking holding the nights, if any.
    #[error("room {room_id} is not available for {stay}")]
    RoomUnavailable {
        room_id: Ulid,
        stay: Stay,
        conflict: Option<Ulid>,
    },

    #[error("payment {payment_id} for booking {booking_id} failed; booking remains pending")]
    PaymentFailed { booking_id: Ulid, payment_id: Ulid },

    #[error("payment already in progress for booking {0}")]
    PaymentInProgress(Ulid),

    #[error("booking {id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("cannot delete hotel {0}: it still has rooms")]
    HasRooms(Ulid),

    #[error("cannot delete room {0}: it has active bookings")]
    HasActiveBookings(Ulid),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngineError {
    /// Bad input from the caller. Never worth retrying unchanged.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidDateRange(_)
                | EngineError::OccupancyExceeded { .. }
                | EngineError::Invalid(_)
        )
    }
}
