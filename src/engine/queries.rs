use std::cmp::Ordering;

use ulid::Ulid;

use crate::model::*;

use super::availability::sort_by_price;
use super::Engine;

/// Best rated first, then alphabetical.
fn by_rating(a: &Hotel, b: &Hotel) -> Ordering {
    b.rating
        .total_cmp(&a.rating)
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.id.cmp(&b.id))
}

impl Engine {
    pub fn get_hotel(&self, id: &Ulid) -> Option<Hotel> {
        self.hotels.get(id).map(|e| e.value().clone())
    }

    pub fn list_hotels(&self) -> Vec<Hotel> {
        let mut hotels: Vec<Hotel> = self.hotels.iter().map(|e| e.value().clone()).collect();
        hotels.sort_by(by_rating);
        hotels
    }

    /// Case-insensitive substring match on the city name.
    pub fn search_hotels_by_city(&self, city: &str) -> Vec<Hotel> {
        let needle = city.trim().to_lowercase();
        let mut hotels: Vec<Hotel> = self
            .hotels
            .iter()
            .filter(|e| e.value().city.to_lowercase().contains(&needle))
            .map(|e| e.value().clone())
            .collect();
        hotels.sort_by(by_rating);
        hotels
    }

    pub async fn get_room_info(&self, id: &Ulid) -> Option<Room> {
        let rs = self.get_room(id)?;
        let guard = rs.read().await;
        Some(guard.room.clone())
    }

    /// Every room of the hotel, listed or not, cheapest first.
    pub async fn list_rooms_for_hotel(&self, hotel_id: &Ulid) -> Vec<Room> {
        let mut rooms = Vec::new();
        for room_id in self.room_ids_for_hotel(hotel_id) {
            if let Some(room) = self.get_room_info(&room_id).await {
                rooms.push(room);
            }
        }
        sort_by_price(&mut rooms);
        rooms
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let room_id = self.get_room_for_booking(&id)?;
        let rs = self.get_room(&room_id)?;
        let guard = rs.read().await;
        guard.booking(&id).cloned()
    }

    /// A user's bookings, newest first.
    pub async fn list_user_bookings(&self, user_id: &Ulid) -> Vec<Booking> {
        let ids = self
            .user_bookings
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut bookings = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(b) = self.get_booking(id).await {
                bookings.push(b);
            }
        }
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        bookings
    }

    /// Bookings on a room in check-in order, cancelled ones included.
    pub async fn list_room_bookings(&self, room_id: &Ulid) -> Vec<Booking> {
        let Some(rs) = self.get_room(room_id) else {
            return vec![];
        };
        let guard = rs.read().await;
        guard.bookings.clone()
    }

    /// Payment attempts for a booking, oldest first.
    pub fn get_payments_for_booking(&self, booking_id: &Ulid) -> Vec<Payment> {
        let ids = self
            .booking_payments
            .get(booking_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.payments.get(id).map(|p| p.value().clone()))
            .collect()
    }
}
