use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, WalCommand};

/// Input for `create_hotel` and `update_hotel`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHotel {
    pub id: Ulid,
    pub name: String,
    pub city: String,
    pub address: String,
    pub description: Option<String>,
    pub rating: f32,
    pub amenities: Vec<String>,
    pub image_url: Option<String>,
    pub created_by: Option<Ulid>,
}

/// Input for `create_room`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub id: Ulid,
    pub hotel_id: Ulid,
    pub room_number: String,
    pub room_type: String,
    pub description: Option<String>,
    pub price_per_night: Amount,
    pub max_occupancy: u32,
    pub image_url: Option<String>,
    pub is_available: bool,
}

/// Partial room edit. `None` keeps the current value. Existing bookings keep
/// the price they were made at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomUpdate {
    pub room_type: Option<String>,
    pub description: Option<String>,
    pub price_per_night: Option<Amount>,
    pub max_occupancy: Option<u32>,
    pub image_url: Option<String>,
    pub is_available: Option<bool>,
}

fn required(field: &str, what: &'static str) -> Result<(), EngineError> {
    if field.trim().is_empty() {
        return Err(EngineError::Invalid(what));
    }
    if field.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("field too long"));
    }
    Ok(())
}

fn optional_text(field: &Option<String>) -> Result<(), EngineError> {
    if field.as_ref().is_some_and(|s| s.len() > MAX_TEXT_LEN) {
        return Err(EngineError::LimitExceeded("text too long"));
    }
    Ok(())
}

/// Trimmed, empties dropped, duplicates removed keeping first occurrence.
fn normalize_amenities(amenities: Vec<String>) -> Result<Vec<String>, EngineError> {
    let mut out: Vec<String> = Vec::with_capacity(amenities.len());
    for a in amenities {
        let a = a.trim();
        if a.is_empty() || out.iter().any(|seen| seen.eq_ignore_ascii_case(a)) {
            continue;
        }
        if a.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("amenity too long"));
        }
        out.push(a.to_string());
    }
    if out.len() > MAX_AMENITIES {
        return Err(EngineError::LimitExceeded("too many amenities"));
    }
    Ok(out)
}

fn validate_hotel(h: &NewHotel) -> Result<(), EngineError> {
    required(&h.name, "hotel name is required")?;
    required(&h.city, "hotel city is required")?;
    required(&h.address, "hotel address is required")?;
    optional_text(&h.description)?;
    optional_text(&h.image_url)?;
    if !h.rating.is_finite() || !(0.0..=MAX_RATING).contains(&h.rating) {
        return Err(EngineError::Invalid("rating must be between 0 and 5"));
    }
    Ok(())
}

fn validate_room(room: &Room) -> Result<(), EngineError> {
    required(&room.room_number, "room number is required")?;
    required(&room.room_type, "room type is required")?;
    optional_text(&room.description)?;
    optional_text(&room.image_url)?;
    if room.price_per_night < 0 {
        return Err(EngineError::Invalid("price per night must not be negative"));
    }
    if room.max_occupancy == 0 {
        return Err(EngineError::Invalid("max occupancy must be at least 1"));
    }
    if room.max_occupancy > MAX_GUESTS_PER_ROOM {
        return Err(EngineError::LimitExceeded("max occupancy too large"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_hotel(&self, new: NewHotel) -> Result<Hotel, EngineError> {
        validate_hotel(&new)?;
        if self.hotels.len() >= MAX_HOTELS {
            return Err(EngineError::LimitExceeded("too many hotels"));
        }
        if self.hotels.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }

        let hotel = Hotel {
            id: new.id,
            name: new.name.trim().to_string(),
            city: new.city.trim().to_string(),
            address: new.address,
            description: new.description,
            rating: new.rating,
            amenities: normalize_amenities(new.amenities)?,
            image_url: new.image_url,
            created_by: new.created_by,
            created_at: now_ms(),
        };
        let event = Event::HotelCreated {
            hotel: hotel.clone(),
        };
        let _wal = self.enter_wal().await;
        self.wal_append(&event).await?;
        self.hotels.insert(hotel.id, hotel.clone());
        info!("hotel {} created: {} ({})", hotel.id, hotel.name, hotel.city);
        Ok(hotel)
    }

    /// Replace a hotel's descriptive fields. Id, creator and creation time
    /// are kept.
    pub async fn update_hotel(&self, changes: NewHotel) -> Result<Hotel, EngineError> {
        validate_hotel(&changes)?;
        let current = self
            .hotels
            .get(&changes.id)
            .map(|h| h.value().clone())
            .ok_or(EngineError::NotFound(changes.id))?;

        let hotel = Hotel {
            name: changes.name.trim().to_string(),
            city: changes.city.trim().to_string(),
            address: changes.address,
            description: changes.description,
            rating: changes.rating,
            amenities: normalize_amenities(changes.amenities)?,
            image_url: changes.image_url,
            ..current
        };
        let event = Event::HotelUpdated {
            hotel: hotel.clone(),
        };
        let _wal = self.enter_wal().await;
        self.wal_append(&event).await?;
        self.hotels.insert(hotel.id, hotel.clone());
        Ok(hotel)
    }

    /// Refused while the hotel still has rooms; delete those first.
    pub async fn delete_hotel(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.hotels.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if let Some(rooms) = self.hotel_rooms.get(&id)
            && !rooms.is_empty()
        {
            return Err(EngineError::HasRooms(id));
        }

        let event = Event::HotelDeleted { id };
        let _wal = self.enter_wal().await;
        self.wal_append(&event).await?;
        self.hotels.remove(&id);
        self.hotel_rooms.remove(&id);
        info!("hotel {id} deleted");
        Ok(())
    }

    pub async fn create_room(&self, new: NewRoom) -> Result<Room, EngineError> {
        let room = Room {
            id: new.id,
            hotel_id: new.hotel_id,
            room_number: new.room_number.trim().to_string(),
            room_type: new.room_type,
            description: new.description,
            price_per_night: new.price_per_night,
            max_occupancy: new.max_occupancy,
            image_url: new.image_url,
            is_available: new.is_available,
        };
        validate_room(&room)?;
        if !self.hotels.contains_key(&room.hotel_id) {
            return Err(EngineError::NotFound(room.hotel_id));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }

        let siblings = self.room_ids_for_hotel(&room.hotel_id);
        if siblings.len() >= MAX_ROOMS_PER_HOTEL {
            return Err(EngineError::LimitExceeded("too many rooms in hotel"));
        }
        for sibling_id in siblings {
            let Some(rs) = self.get_room(&sibling_id) else { continue };
            if rs.read().await.room.room_number == room.room_number {
                return Err(EngineError::AlreadyExists(sibling_id));
            }
        }

        let event = Event::RoomCreated { room: room.clone() };
        let _wal = self.enter_wal().await;
        self.wal_append(&event).await?;
        self.insert_room_state(room.clone());
        info!(
            "room {} ({}) added to hotel {}",
            room.id, room.room_number, room.hotel_id
        );
        Ok(room)
    }

    pub async fn update_room(&self, id: Ulid, update: RoomUpdate) -> Result<Room, EngineError> {
        let mut guard = self.lock_room_write(&id).await?;

        let current = &guard.room;
        let room = Room {
            room_type: update.room_type.unwrap_or_else(|| current.room_type.clone()),
            description: update.description.or_else(|| current.description.clone()),
            price_per_night: update.price_per_night.unwrap_or(current.price_per_night),
            max_occupancy: update.max_occupancy.unwrap_or(current.max_occupancy),
            image_url: update.image_url.or_else(|| current.image_url.clone()),
            is_available: update.is_available.unwrap_or(current.is_available),
            ..current.clone()
        };
        validate_room(&room)?;

        let event = Event::RoomUpdated { room: room.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room)
    }

    /// Refused while any booking on the room still holds nights.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.lock_room_write(&id).await?;
        if guard.has_blocking_bookings() {
            return Err(EngineError::HasActiveBookings(id));
        }

        let hotel_id = guard.room.hotel_id;
        let event = Event::RoomDeleted { id, hotel_id };
        self.wal_append(&event).await?;
        // Removed while the lock is held so waiters see it gone.
        self.rooms.remove(&id);
        self.unindex_room(id, hotel_id, &guard);
        info!("room {id} deleted from hotel {hotel_id}");
        Ok(())
    }

    /// PENDING bookings created at or before `now - ttl_ms` whose payment is
    /// not currently in flight, as `(booking_id, room_id)`.
    pub fn collect_expired_pending(&self, now: Ms, ttl_ms: Ms) -> Vec<(Ulid, Ulid)> {
        let cutoff = now.saturating_sub(ttl_ms);
        let mut expired = Vec::new();
        for entry in self.rooms.iter() {
            let rs = entry.value().clone();
            let Ok(guard) = rs.try_read() else { continue };
            for b in &guard.bookings {
                if b.status == BookingStatus::Pending
                    && b.created_at <= cutoff
                    && !self.payments_in_flight.contains_key(&b.id)
                {
                    expired.push((b.id, guard.room.id));
                }
            }
        }
        expired
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    /// Appends wait on the gate from the snapshot until the swap completes,
    /// so nothing acknowledged in between is left in the discarded file.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.wal_gate.write().await;
        let mut events: Vec<Event> = self
            .hotels
            .iter()
            .map(|h| Event::HotelCreated {
                hotel: h.value().clone(),
            })
            .collect();

        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for rs in rooms {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }

        events.extend(self.payments.iter().map(|p| Event::PaymentCreated {
            payment: p.value().clone(),
        }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
