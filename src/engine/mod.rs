mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod reservation;
#[cfg(test)]
mod tests;

pub use availability::room_is_free;
pub use conflict::{now_ms, overlaps};
pub use error::EngineError;
pub use mutations::{NewHotel, NewRoom, RoomUpdate};
pub use reservation::{Reservation, ReserveRequest};

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{
    mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard,
};
use tracing::error;
use ulid::Ulid;

use crate::model::*;
use crate::payment::PaymentGateway;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            commit_batch(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    commit_batch(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!("WAL flush failed for {} events: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        // Appends are always consumed by the batching loop.
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside batch")));
        }
    }
}

/// The hotel store. All inventory lives in memory, every change is made
/// durable through the WAL before it becomes visible.
pub struct Engine {
    pub(super) hotels: DashMap<Ulid, Hotel>,
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    /// Hotel → rooms index.
    pub(super) hotel_rooms: DashMap<Ulid, Vec<Ulid>>,
    /// Reverse lookup: booking id → room id.
    pub(super) booking_to_room: DashMap<Ulid, Ulid>,
    pub(super) user_bookings: DashMap<Ulid, Vec<Ulid>>,
    pub(super) payments: DashMap<Ulid, Payment>,
    pub(super) booking_payments: DashMap<Ulid, Vec<Ulid>>,
    /// Booking id → payment id of the attempt currently awaiting the gateway.
    pub(super) payments_in_flight: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every WAL append together with its in-memory apply,
    /// and exclusively by compaction from snapshot to swap.
    pub(super) wal_gate: Arc<RwLock<()>>,
    pub(super) gateway: Arc<dyn PaymentGateway>,
    pub(super) payment_timeout: Duration,
}

/// Apply a room-scoped event. Caller holds the room's write lock.
fn apply_to_room(
    rs: &mut RoomState,
    event: &Event,
    booking_index: &DashMap<Ulid, Ulid>,
    user_index: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::RoomUpdated { room } => {
            rs.room = room.clone();
        }
        Event::BookingCreated { booking } => {
            booking_index.insert(booking.id, booking.room_id);
            user_index.entry(booking.user_id).or_default().push(booking.id);
            rs.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged { id, status, at, .. } => {
            if let Some(b) = rs.booking_mut(id) {
                b.status = *status;
                b.updated_at = *at;
            }
        }
        // Hotel, room lifecycle and payment events are handled at the map level
        Event::HotelCreated { .. }
        | Event::HotelUpdated { .. }
        | Event::HotelDeleted { .. }
        | Event::RoomCreated { .. }
        | Event::RoomDeleted { .. }
        | Event::PaymentCreated { .. }
        | Event::PaymentSettled { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        gateway: Arc<dyn PaymentGateway>,
        payment_timeout: Duration,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            hotels: DashMap::new(),
            rooms: DashMap::new(),
            hotel_rooms: DashMap::new(),
            booking_to_room: DashMap::new(),
            user_bookings: DashMap::new(),
            payments: DashMap::new(),
            booking_payments: DashMap::new(),
            payments_in_flight: DashMap::new(),
            wal_tx,
            wal_gate: Arc::new(RwLock::new(())),
            gateway,
            payment_timeout,
        };

        // We're the sole owner of every room Arc here, so try_write always
        // succeeds. Never block: this may run inside an async context.
        for event in &events {
            engine.replay_event(event);
        }
        tracing::debug!(
            "replayed {} events: {} hotels, {} rooms",
            events.len(),
            engine.hotels.len(),
            engine.rooms.len()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::HotelCreated { hotel } | Event::HotelUpdated { hotel } => {
                self.hotels.insert(hotel.id, hotel.clone());
            }
            Event::HotelDeleted { id } => {
                self.hotels.remove(id);
                self.hotel_rooms.remove(id);
            }
            Event::RoomCreated { room } => {
                self.insert_room_state(room.clone());
            }
            Event::RoomDeleted { id, hotel_id } => {
                if let Some((_, rs)) = self.rooms.remove(id)
                    && let Ok(guard) = rs.try_read()
                {
                    self.unindex_room(*id, *hotel_id, &guard);
                }
            }
            Event::PaymentCreated { .. } | Event::PaymentSettled { .. } => {
                self.apply_payment(event);
            }
            other => {
                let Some(room_id) = event_room_id(other) else { return };
                let Some(rs) = self.get_room(&room_id) else { return };
                match rs.try_write() {
                    Ok(mut guard) => {
                        apply_to_room(&mut guard, other, &self.booking_to_room, &self.user_bookings);
                    }
                    Err(_) => error!("replay: room {room_id} unexpectedly locked"),
                }
            }
        }
    }

    pub(super) fn insert_room_state(&self, room: Room) {
        let (id, hotel_id) = (room.id, room.hotel_id);
        self.rooms.insert(id, Arc::new(RwLock::new(RoomState::new(room))));
        self.hotel_rooms.entry(hotel_id).or_default().push(id);
    }

    /// Drop index entries pointing at a removed room and its bookings.
    pub(super) fn unindex_room(&self, room_id: Ulid, hotel_id: Ulid, rs: &RoomState) {
        if let Some(mut ids) = self.hotel_rooms.get_mut(&hotel_id) {
            ids.retain(|r| *r != room_id);
        }
        for b in &rs.bookings {
            self.booking_to_room.remove(&b.id);
            if let Some(mut ids) = self.user_bookings.get_mut(&b.user_id) {
                ids.retain(|id| *id != b.id);
            }
        }
    }

    pub(super) fn apply_payment(&self, event: &Event) {
        match event {
            Event::PaymentCreated { payment } => {
                self.booking_payments
                    .entry(payment.booking_id)
                    .or_default()
                    .push(payment.id);
                self.payments.insert(payment.id, payment.clone());
            }
            Event::PaymentSettled {
                id,
                status,
                transaction_id,
                ..
            } => {
                if let Some(mut p) = self.payments.get_mut(id) {
                    p.status = *status;
                    p.transaction_id = transaction_id.clone();
                }
            }
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn get_room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call, under the caller's room write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.booking_to_room, &self.user_bookings);
        Ok(())
    }

    /// Shared hold on the WAL gate for a mutation that appends outside a
    /// room lock. Take it before any room lock, never while holding one.
    pub(super) async fn enter_wal(&self) -> RwLockReadGuard<'_, ()> {
        self.wal_gate.read().await
    }

    /// Acquire a room's write lock. Re-checks the room is still in the store
    /// once the lock is held, since `delete_room` removes it under that lock.
    pub(super) async fn lock_room_write(&self, room_id: &Ulid) -> Result<RoomWriteGuard, EngineError> {
        let gate = self.wal_gate.clone().read_owned().await;
        let rs = self
            .get_room(room_id)
            .ok_or(EngineError::NotFound(*room_id))?;
        let lock = rs.write_owned().await;
        if !self.rooms.contains_key(room_id) {
            return Err(EngineError::NotFound(*room_id));
        }
        Ok(RoomWriteGuard { lock, _gate: gate })
    }

    /// Lookup booking → room, acquire the room's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, RoomWriteGuard), EngineError> {
        let room_id = self
            .get_room_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = self.lock_room_write(&room_id).await?;
        Ok((room_id, guard))
    }
}

/// A room's write lock plus a shared hold on the WAL gate, so compaction
/// never snapshots between a room event's append and its apply.
pub(super) struct RoomWriteGuard {
    lock: OwnedRwLockWriteGuard<RoomState>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Deref for RoomWriteGuard {
    type Target = RoomState;

    fn deref(&self) -> &RoomState {
        &self.lock
    }
}

impl DerefMut for RoomWriteGuard {
    fn deref_mut(&mut self) -> &mut RoomState {
        &mut self.lock
    }
}

/// The room a room-scoped event belongs to.
fn event_room_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RoomUpdated { room } => Some(room.id),
        Event::BookingCreated { booking } => Some(booking.room_id),
        Event::BookingStatusChanged { room_id, .. } => Some(*room_id),
        Event::HotelCreated { .. }
        | Event::HotelUpdated { .. }
        | Event::HotelDeleted { .. }
        | Event::RoomCreated { .. }
        | Event::RoomDeleted { .. }
        | Event::PaymentCreated { .. }
        | Event::PaymentSettled { .. } => None,
    }
}
