use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{PAYMENTS_TOTAL, RESERVATIONS_TOTAL, RESERVATION_DURATION_SECONDS};
use crate::payment::ChargeOutcome;

use super::conflict::{check_no_conflict, now_ms, validate_stay};
use super::{Engine, EngineError, RoomWriteGuard};

/// Everything needed to book one room for one stay.
///
/// `id` is chosen by the caller, so resubmitting the same request can never
/// produce a second booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub id: Ulid,
    pub user_id: Ulid,
    pub hotel_id: Ulid,
    pub room_id: Ulid,
    pub stay: Stay,
    pub guest: GuestInfo,
    pub method: PaymentMethod,
}

/// A confirmed booking and the payment that confirmed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub booking: Booking,
    pub payment: Payment,
}

/// Marks a booking as having a payment attempt awaiting the gateway.
/// Cleared on drop, so an abandoned request never wedges the booking.
struct PaymentSlot<'a> {
    in_flight: &'a DashMap<Ulid, Ulid>,
    booking_id: Ulid,
}

impl<'a> PaymentSlot<'a> {
    fn claim(
        in_flight: &'a DashMap<Ulid, Ulid>,
        booking_id: Ulid,
        payment_id: Ulid,
    ) -> Result<Self, EngineError> {
        match in_flight.entry(booking_id) {
            Entry::Occupied(_) => Err(EngineError::PaymentInProgress(booking_id)),
            Entry::Vacant(slot) => {
                slot.insert(payment_id);
                Ok(Self {
                    in_flight,
                    booking_id,
                })
            }
        }
    }
}

impl Drop for PaymentSlot<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.booking_id);
    }
}

fn validate_guest(guest: &GuestInfo) -> Result<(), EngineError> {
    if guest.name.trim().is_empty() {
        return Err(EngineError::Invalid("guest name is required"));
    }
    if !guest.email.contains('@') {
        return Err(EngineError::Invalid("guest email is malformed"));
    }
    if guest.name.len() > MAX_NAME_LEN || guest.email.len() > MAX_NAME_LEN || guest.phone.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("guest contact field too long"));
    }
    if guest.special_requests.as_ref().is_some_and(|s| s.len() > MAX_TEXT_LEN) {
        return Err(EngineError::LimitExceeded("special requests too long"));
    }
    if guest.count == 0 {
        return Err(EngineError::Invalid("guest count must be at least 1"));
    }
    Ok(())
}

fn outcome_label(result: &Result<Reservation, EngineError>) -> &'static str {
    match result {
        Ok(_) => "confirmed",
        Err(EngineError::RoomUnavailable { .. }) => "unavailable",
        Err(EngineError::PaymentFailed { .. }) => "payment_failed",
        Err(e) if e.is_validation() => "invalid",
        Err(_) => "error",
    }
}

impl Engine {
    /// Validate, take the nights, charge, confirm.
    ///
    /// The overlap check and the booking insert run under the room's write
    /// lock together with the WAL append, so of two overlapping concurrent
    /// requests exactly one gets the room. Payment happens after the lock is
    /// released. A declined payment leaves the booking PENDING (still holding
    /// its nights) and fails with `PaymentFailed`; see `retry_payment`.
    pub async fn reserve(&self, req: ReserveRequest) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.reserve_inner(req).await;
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        metrics::histogram!(RESERVATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn reserve_inner(&self, req: ReserveRequest) -> Result<Reservation, EngineError> {
        validate_stay(&req.stay)?;
        validate_guest(&req.guest)?;

        let (booking, payment, slot) = self.place_booking(&req).await?;
        info!(
            "booking {} placed on room {} for {} ({} nights, total {})",
            booking.id, booking.room_id, booking.stay, booking.nights, booking.total_amount
        );

        self.settle_payment(booking, payment, slot).await
    }

    /// Conflict check + insert as one critical section on the room. The first
    /// payment attempt is opened before the lock is released.
    async fn place_booking(
        &self,
        req: &ReserveRequest,
    ) -> Result<(Booking, Payment, PaymentSlot<'_>), EngineError> {
        let mut guard = self.lock_room_write(&req.room_id).await?;

        if guard.room.hotel_id != req.hotel_id {
            return Err(EngineError::NotFound(req.room_id));
        }
        // Booking ids are global, but only this room is locked: claim the id
        // in the index itself so a request for another room can't take it too.
        match self.booking_to_room.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            Entry::Vacant(slot) => {
                slot.insert(req.room_id);
            }
        }
        let placed = self.insert_booking(&mut guard, req).await;
        if placed.is_err() {
            self.booking_to_room.remove(&req.id);
        }
        let booking = placed?;

        self.open_payment(&guard, booking.id, req.method).await
    }

    async fn insert_booking(
        &self,
        guard: &mut RoomWriteGuard,
        req: &ReserveRequest,
    ) -> Result<Booking, EngineError> {
        if req.guest.count > guard.room.max_occupancy {
            return Err(EngineError::OccupancyExceeded {
                room_id: req.room_id,
                requested: req.guest.count,
                max: guard.room.max_occupancy,
            });
        }
        if !guard.room.is_available {
            return Err(EngineError::RoomUnavailable {
                room_id: req.room_id,
                stay: req.stay,
                conflict: None,
            });
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }

        check_no_conflict(guard, &req.stay)?;

        // Price is captured here; later room edits never touch this booking.
        let nights = req.stay.nights();
        let total_amount = nights
            .checked_mul(guard.room.price_per_night)
            .ok_or(EngineError::LimitExceeded("booking total overflows"))?;
        let now = now_ms();
        let booking = Booking {
            id: req.id,
            user_id: req.user_id,
            room_id: req.room_id,
            hotel_id: req.hotel_id,
            stay: req.stay,
            nights: nights as u32,
            total_amount,
            guest: req.guest.clone(),
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(guard, &event).await?;
        Ok(booking)
    }

    /// Charge again for a booking whose earlier payment failed. The booking
    /// must still be PENDING.
    pub async fn retry_payment(
        &self,
        booking_id: Ulid,
        method: PaymentMethod,
    ) -> Result<Reservation, EngineError> {
        let (_, guard) = self.resolve_booking_write(&booking_id).await?;
        let (booking, payment, slot) = self.open_payment(&guard, booking_id, method).await?;
        drop(guard);

        info!("retrying payment for booking {booking_id}");
        self.settle_payment(booking, payment, slot).await
    }

    /// Record a PENDING payment attempt and mark it in flight. Runs under the
    /// booking's room lock, so the status check and the claim are one step
    /// and a cancel can't slip in before the gateway is called.
    async fn open_payment(
        &self,
        room: &RoomWriteGuard,
        booking_id: Ulid,
        method: PaymentMethod,
    ) -> Result<(Booking, Payment, PaymentSlot<'_>), EngineError> {
        let booking = room
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidStateTransition {
                id: booking_id,
                from: booking.status,
                to: BookingStatus::Confirmed,
            });
        }
        let attempts = self
            .booking_payments
            .get(&booking_id)
            .map_or(0, |ids| ids.len());
        if attempts >= MAX_PAYMENTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many payment attempts"));
        }

        let payment_id = Ulid::new();
        let slot = PaymentSlot::claim(&self.payments_in_flight, booking_id, payment_id)?;

        let payment = Payment {
            id: payment_id,
            booking_id,
            amount: booking.total_amount,
            method,
            status: PaymentStatus::Pending,
            transaction_id: None,
            created_at: now_ms(),
        };
        let created = Event::PaymentCreated {
            payment: payment.clone(),
        };
        self.wal_append(&created).await?;
        self.apply_payment(&created);
        Ok((booking, payment, slot))
    }

    /// Call the gateway for an opened attempt and record the outcome. The
    /// slot is held until the booking is confirmed.
    async fn settle_payment(
        &self,
        booking: Booking,
        payment: Payment,
        _slot: PaymentSlot<'_>,
    ) -> Result<Reservation, EngineError> {
        let payment_id = payment.id;
        let method = payment.method;
        let charge = self.gateway.charge(booking.id, payment.amount, method);
        let outcome = match tokio::time::timeout(self.payment_timeout, charge).await {
            Ok(outcome) => outcome,
            Err(_) => ChargeOutcome::Declined {
                reason: format!("gateway timed out after {:?}", self.payment_timeout),
            },
        };

        let (status, transaction_id) = match &outcome {
            ChargeOutcome::Approved { transaction_id } => {
                (PaymentStatus::Success, Some(transaction_id.clone()))
            }
            ChargeOutcome::Declined { .. } => (PaymentStatus::Failed, None),
        };
        let settled = Event::PaymentSettled {
            id: payment_id,
            booking_id: booking.id,
            status,
            transaction_id: transaction_id.clone(),
        };
        {
            let _wal = self.enter_wal().await;
            self.wal_append(&settled).await?;
            self.apply_payment(&settled);
        }
        metrics::counter!(PAYMENTS_TOTAL, "status" => status.as_str()).increment(1);

        let payment = Payment {
            status,
            transaction_id,
            ..payment
        };

        match outcome {
            ChargeOutcome::Declined { reason } => {
                warn!("payment {payment_id} for booking {} declined: {reason}", booking.id);
                Err(EngineError::PaymentFailed {
                    booking_id: booking.id,
                    payment_id,
                })
            }
            ChargeOutcome::Approved { .. } => {
                let booking = self.confirm_booking(booking.id).await.inspect_err(|e| {
                    warn!("payment {payment_id} succeeded but booking could not be confirmed: {e}");
                })?;
                info!("booking {} confirmed by payment {payment_id}", booking.id);
                Ok(Reservation { booking, payment })
            }
        }
    }
}
