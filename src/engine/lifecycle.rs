use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

impl BookingStatus {
    /// Booking state machine:
    ///
    /// ```text
    /// PENDING ──► CONFIRMED ──► COMPLETED
    ///    │            │
    ///    └──► CANCELLED ◄┘
    /// ```
    ///
    /// CANCELLED and COMPLETED are terminal.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }
}

impl Engine {
    /// PENDING → CONFIRMED. Called by the reservation workflow once payment succeeds.
    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Confirmed).await
    }

    /// PENDING or CONFIRMED → CANCELLED. The nights are released as soon as
    /// this returns; no refund is issued.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Cancelled).await
    }

    /// CONFIRMED → COMPLETED, for a stay-completion job.
    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition_booking(id, BookingStatus::Completed).await
    }

    pub(super) async fn transition_booking(
        &self,
        id: Ulid,
        to: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let from = guard
            .booking(&id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(id))?;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidStateTransition { id, from, to });
        }
        // The gateway may still take the guest's money; the charge settles it.
        if from == BookingStatus::Pending
            && to == BookingStatus::Cancelled
            && self.payments_in_flight.contains_key(&id)
        {
            return Err(EngineError::PaymentInProgress(id));
        }

        let event = Event::BookingStatusChanged {
            id,
            room_id,
            status: to,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("booking {id}: {from} -> {to}");

        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}
