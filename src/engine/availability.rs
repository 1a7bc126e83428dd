use ulid::Ulid;

use crate::model::*;

use super::conflict::{find_conflict, validate_stay};
use super::{Engine, EngineError};

/// A room is free for `stay` when it is listed and no blocking booking
/// overlaps it.
pub fn room_is_free(rs: &RoomState, stay: &Stay) -> bool {
    rs.room.is_available && find_conflict(rs, stay).is_none()
}

/// Cheapest first; equal prices fall back to room id so the order is stable.
pub(super) fn sort_by_price(rooms: &mut [Room]) {
    rooms.sort_by(|a, b| {
        a.price_per_night
            .cmp(&b.price_per_night)
            .then_with(|| a.id.cmp(&b.id))
    });
}

impl Engine {
    /// Rooms of `hotel_id` that can be booked for the whole stay.
    ///
    /// Each room is inspected under its own read lock, one at a time. The
    /// answer is a snapshot: a concurrent reservation can still take a room
    /// after it is returned, which `reserve` then reports as `RoomUnavailable`.
    pub async fn find_available_rooms(
        &self,
        hotel_id: Ulid,
        stay: Stay,
    ) -> Result<Vec<Room>, EngineError> {
        validate_stay(&stay)?;

        let mut free = Vec::new();
        for room_id in self.room_ids_for_hotel(&hotel_id) {
            let Some(rs) = self.get_room(&room_id) else { continue };
            let guard = rs.read().await;
            if room_is_free(&guard, &stay) {
                free.push(guard.room.clone());
            }
        }

        sort_by_price(&mut free);
        Ok(free)
    }

    pub(super) fn room_ids_for_hotel(&self, hotel_id: &Ulid) -> Vec<Ulid> {
        self.hotel_rooms
            .get(hotel_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}
