use std::collections::VecDeque;
use std::sync::Mutex;

use super::*;
use crate::limits::*;
use crate::model::date;
use crate::payment::{ChargeOutcome, SimulatedGateway};

// ── Helpers ──────────────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("staybook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Approves or declines in the scripted order, approving once the script runs out.
struct ScriptedGateway {
    script: Mutex<VecDeque<bool>>,
}

impl ScriptedGateway {
    fn new(script: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
        })
    }
}

#[async_trait::async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, booking_id: Ulid, _amount: Amount, _method: PaymentMethod) -> ChargeOutcome {
        let approve = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if approve {
            ChargeOutcome::Approved {
                transaction_id: format!("TXN-{booking_id}"),
            }
        } else {
            ChargeOutcome::Declined {
                reason: "card declined".into(),
            }
        }
    }
}

/// Approves after `delay`.
struct SlowGateway {
    delay: Duration,
}

#[async_trait::async_trait]
impl PaymentGateway for SlowGateway {
    async fn charge(&self, _booking_id: Ulid, _amount: Amount, _method: PaymentMethod) -> ChargeOutcome {
        tokio::time::sleep(self.delay).await;
        ChargeOutcome::Approved {
            transaction_id: "TXN-slow".into(),
        }
    }
}

fn approving() -> Arc<dyn PaymentGateway> {
    Arc::new(SimulatedGateway::new(1.0, Duration::ZERO))
}

fn declining() -> Arc<dyn PaymentGateway> {
    Arc::new(SimulatedGateway::new(0.0, Duration::ZERO))
}

fn new_engine(name: &str, gateway: Arc<dyn PaymentGateway>) -> Engine {
    Engine::new(test_wal_path(name), gateway, Duration::from_secs(5)).unwrap()
}

fn new_hotel(city: &str, rating: f32) -> NewHotel {
    NewHotel {
        id: Ulid::new(),
        name: format!("{city} Residency"),
        city: city.into(),
        address: "MG Road".into(),
        description: None,
        rating,
        amenities: vec!["WiFi".into()],
        image_url: None,
        created_by: None,
    }
}

fn new_room(hotel_id: Ulid, number: &str, price: Amount) -> NewRoom {
    NewRoom {
        id: Ulid::new(),
        hotel_id,
        room_number: number.into(),
        room_type: "Deluxe".into(),
        description: None,
        price_per_night: price,
        max_occupancy: 2,
        image_url: None,
        is_available: true,
    }
}

/// Hotel with one ₹2000/night room.
async fn hotel_with_room(engine: &Engine) -> (Ulid, Ulid) {
    let hotel = engine.create_hotel(new_hotel("Jaipur", 4.2)).await.unwrap();
    let room = engine
        .create_room(new_room(hotel.id, "101", 200_000))
        .await
        .unwrap();
    (hotel.id, room.id)
}

fn stay(a: &str, b: &str) -> Stay {
    Stay::new(date(a), date(b))
}

fn request(hotel_id: Ulid, room_id: Ulid, s: Stay) -> ReserveRequest {
    ReserveRequest {
        id: Ulid::new(),
        user_id: Ulid::new(),
        hotel_id,
        room_id,
        stay: s,
        guest: GuestInfo {
            name: "Priya Sharma".into(),
            email: "priya@example.com".into(),
            phone: "9812345678".into(),
            count: 2,
            special_requests: None,
        },
        method: PaymentMethod::Card,
    }
}

async fn blocking_bookings(engine: &Engine, room_id: &Ulid) -> Vec<Booking> {
    engine
        .list_room_bookings(room_id)
        .await
        .into_iter()
        .filter(|b| b.status.blocks_inventory())
        .collect()
}

// ── Reservation workflow ─────────────────────────────────

#[tokio::test]
async fn three_nights_at_2000_costs_6000() {
    let engine = new_engine("price_total.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;

    let r = engine
        .reserve(request(hotel_id, room_id, stay("2024-06-01", "2024-06-04")))
        .await
        .unwrap();

    assert_eq!(r.booking.nights, 3);
    assert_eq!(r.booking.total_amount, 600_000);
    assert_eq!(r.booking.status, BookingStatus::Confirmed);
    assert_eq!(r.payment.amount, 600_000);
    assert_eq!(r.payment.status, PaymentStatus::Success);
    assert!(r.payment.transaction_id.as_deref().is_some_and(|t| t.starts_with("TXN")));

    let stored = engine.get_booking(r.booking.id).await.unwrap();
    assert_eq!(stored, r.booking);
    assert_eq!(engine.get_payments_for_booking(&r.booking.id), vec![r.payment]);
}

#[tokio::test]
async fn overlapping_request_is_rejected() {
    let engine = new_engine("overlap_rejected.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;

    let first = engine
        .reserve(request(hotel_id, room_id, stay("2024-06-01", "2024-06-05")))
        .await
        .unwrap();

    let err = engine
        .reserve(request(hotel_id, room_id, stay("2024-06-03", "2024-06-06")))
        .await
        .unwrap_err();
    match err {
        EngineError::RoomUnavailable { conflict, .. } => assert_eq!(conflict, Some(first.booking.id)),
        other => panic!("expected RoomUnavailable, got {other:?}"),
    }

    // Enclosing and enclosed stays conflict too.
    for s in [stay("2024-05-30", "2024-06-10"), stay("2024-06-02", "2024-06-03")] {
        assert!(matches!(
            engine.reserve(request(hotel_id, room_id, s)).await,
            Err(EngineError::RoomUnavailable { .. })
        ));
    }
    assert_eq!(blocking_bookings(&engine, &room_id).await.len(), 1);
}

#[tokio::test]
async fn back_to_back_turnover_is_accepted() {
    let engine = new_engine("back_to_back.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;

    engine
        .reserve(request(hotel_id, room_id, stay("2024-06-01", "2024-06-05")))
        .await
        .unwrap();
    engine
        .reserve(request(hotel_id, room_id, stay("2024-06-05", "2024-06-07")))
        .await
        .unwrap();
    engine
        .reserve(request(hotel_id, room_id, stay("2024-05-29", "2024-06-01")))
        .await
        .unwrap();

    assert_eq!(blocking_bookings(&engine, &room_id).await.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_reservations_yield_one_booking() {
    let engine = Arc::new(new_engine("concurrent_identical.wal", approving()));
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let s = stay("2024-12-24", "2024-12-27");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.reserve(request(hotel_id, room_id, s)).await
        }));
    }

    let mut confirmed = 0;
    let mut unavailable = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => confirmed += 1,
            Err(EngineError::RoomUnavailable { .. }) => unavailable += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(confirmed, 1);
    assert_eq!(unavailable, 15);
    assert_eq!(blocking_bookings(&engine, &room_id).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn booking_id_is_taken_once_across_rooms() {
    let engine = Arc::new(new_engine("booking_id_across_rooms.wal", approving()));
    let (hotel_id, first_room) = hotel_with_room(&engine).await;
    let second_room = engine
        .create_room(new_room(hotel_id, "102", 250_000))
        .await
        .unwrap()
        .id;
    let id = Ulid::new();
    let s = stay("2024-08-01", "2024-08-03");

    let mut handles = Vec::new();
    for room_id in [first_room, second_room] {
        let engine = engine.clone();
        let req = ReserveRequest {
            id,
            ..request(hotel_id, room_id, s)
        };
        handles.push(tokio::spawn(async move { engine.reserve(req).await }));
    }

    let mut winners = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            Ok(r) => winners.push(r.booking.room_id),
            Err(EngineError::AlreadyExists(dup)) => assert_eq!(dup, id),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners.len(), 1);
    let winner = winners[0];
    let loser = if winner == first_room { second_room } else { first_room };
    assert_eq!(engine.get_room_for_booking(&id), Some(winner));
    assert_eq!(engine.get_booking(id).await.unwrap().room_id, winner);
    assert!(engine.list_room_bookings(&loser).await.is_empty());
}

#[tokio::test]
async fn rejected_booking_releases_its_id() {
    let engine = new_engine("rejected_id.wal", approving());
    let (hotel_id, first_room) = hotel_with_room(&engine).await;
    let second_room = engine
        .create_room(new_room(hotel_id, "102", 250_000))
        .await
        .unwrap()
        .id;
    let s = stay("2024-08-01", "2024-08-03");
    engine.reserve(request(hotel_id, first_room, s)).await.unwrap();

    let retry = request(hotel_id, first_room, s);
    let id = retry.id;
    assert!(matches!(
        engine.reserve(retry).await,
        Err(EngineError::RoomUnavailable { .. })
    ));
    assert_eq!(engine.get_room_for_booking(&id), None);

    let moved = engine
        .reserve(ReserveRequest {
            id,
            ..request(hotel_id, second_room, s)
        })
        .await
        .unwrap();
    assert_eq!(moved.booking.room_id, second_room);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_random_stays_never_overlap() {
    use rand::Rng;

    let engine = Arc::new(new_engine("concurrent_random.wal", approving()));
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let base = date("2025-03-01");

    let mut handles = Vec::new();
    for _ in 0..64 {
        let (offset, nights) = {
            let mut rng = rand::rng();
            (rng.random_range(0..30i64), rng.random_range(1..5i64))
        };
        let check_in = base + chrono::Duration::days(offset);
        let s = Stay::new(check_in, check_in + chrono::Duration::days(nights));
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.reserve(request(hotel_id, room_id, s)).await
        }));
    }
    for h in handles {
        match h.await.unwrap() {
            Ok(_) | Err(EngineError::RoomUnavailable { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let booked = blocking_bookings(&engine, &room_id).await;
    assert!(!booked.is_empty());
    for (i, a) in booked.iter().enumerate() {
        for b in &booked[i + 1..] {
            assert!(!overlaps(&a.stay, &b.stay), "{} overlaps {}", a.stay, b.stay);
        }
    }
}

#[tokio::test]
async fn failed_payment_keeps_booking_pending_then_retry_confirms() {
    let engine = new_engine("payment_retry.wal", ScriptedGateway::new(&[false, true]));
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let req = request(hotel_id, room_id, stay("2024-07-10", "2024-07-12"));
    let booking_id = req.id;

    match engine.reserve(req).await {
        Err(EngineError::PaymentFailed { booking_id: b, .. }) => assert_eq!(b, booking_id),
        other => panic!("expected PaymentFailed, got {other:?}"),
    }
    let pending = engine.get_booking(booking_id).await.unwrap();
    assert_eq!(pending.status, BookingStatus::Pending);
    let payments = engine.get_payments_for_booking(&booking_id);
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert_eq!(payments[0].transaction_id, None);

    // The pending booking still holds its nights.
    assert!(matches!(
        engine
            .reserve(request(hotel_id, room_id, stay("2024-07-11", "2024-07-13")))
            .await,
        Err(EngineError::RoomUnavailable { .. })
    ));

    let r = engine.retry_payment(booking_id, PaymentMethod::Upi).await.unwrap();
    assert_eq!(r.booking.status, BookingStatus::Confirmed);
    assert_eq!(r.payment.method, PaymentMethod::Upi);
    assert_eq!(r.payment.status, PaymentStatus::Success);

    let statuses: Vec<_> = engine
        .get_payments_for_booking(&booking_id)
        .iter()
        .map(|p| p.status)
        .collect();
    assert_eq!(statuses, vec![PaymentStatus::Failed, PaymentStatus::Success]);

    // Already confirmed: no further charge.
    assert!(matches!(
        engine.retry_payment(booking_id, PaymentMethod::Card).await,
        Err(EngineError::InvalidStateTransition { from: BookingStatus::Confirmed, .. })
    ));
}

#[tokio::test]
async fn retry_after_unavailable_never_double_books() {
    let engine = new_engine("retry_no_double.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let s = stay("2024-08-01", "2024-08-03");

    let winner = request(hotel_id, room_id, s);
    engine.reserve(winner.clone()).await.unwrap();

    let loser = request(hotel_id, room_id, s);
    for _ in 0..3 {
        assert!(matches!(
            engine.reserve(loser.clone()).await,
            Err(EngineError::RoomUnavailable { .. })
        ));
    }

    // Resubmitting the winning request is not a second booking.
    assert!(matches!(
        engine.reserve(winner.clone()).await,
        Err(EngineError::AlreadyExists(id)) if id == winner.id
    ));
    assert_eq!(engine.list_room_bookings(&room_id).await.len(), 1);
}

#[tokio::test]
async fn cancel_makes_room_reappear() {
    let engine = new_engine("cancel_reappear.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let s = stay("2024-09-05", "2024-09-08");

    let r = engine.reserve(request(hotel_id, room_id, s)).await.unwrap();
    assert!(engine.find_available_rooms(hotel_id, s).await.unwrap().is_empty());

    let cancelled = engine.cancel_booking(r.booking.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert!(cancelled.updated_at >= r.booking.updated_at);

    let free = engine.find_available_rooms(hotel_id, s).await.unwrap();
    assert_eq!(free.iter().map(|r| r.id).collect::<Vec<_>>(), vec![room_id]);

    // No refund is issued on cancel.
    assert_eq!(
        engine.get_payments_for_booking(&r.booking.id)[0].status,
        PaymentStatus::Success
    );

    engine.reserve(request(hotel_id, room_id, s)).await.unwrap();
}

#[tokio::test]
async fn price_is_captured_at_booking_time() {
    let engine = new_engine("price_captured.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;

    let early = engine
        .reserve(request(hotel_id, room_id, stay("2024-10-01", "2024-10-03")))
        .await
        .unwrap();

    let updated = engine
        .update_room(
            room_id,
            RoomUpdate {
                price_per_night: Some(350_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.price_per_night, 350_000);
    assert_eq!(updated.room_number, "101");

    let late = engine
        .reserve(request(hotel_id, room_id, stay("2024-10-05", "2024-10-07")))
        .await
        .unwrap();

    assert_eq!(engine.get_booking(early.booking.id).await.unwrap().total_amount, 400_000);
    assert_eq!(late.booking.total_amount, 700_000);
}

#[tokio::test]
async fn free_rooms_are_cheapest_first() {
    let engine = new_engine("available_sorted.wal", approving());
    let hotel = engine.create_hotel(new_hotel("Goa", 4.0)).await.unwrap();
    let suite = engine.create_room(new_room(hotel.id, "301", 900_000)).await.unwrap();
    let standard = engine.create_room(new_room(hotel.id, "101", 250_000)).await.unwrap();
    let deluxe = engine.create_room(new_room(hotel.id, "201", 400_000)).await.unwrap();
    let mut unlisted = new_room(hotel.id, "001", 100_000);
    unlisted.is_available = false;
    engine.create_room(unlisted).await.unwrap();

    let s = stay("2024-11-01", "2024-11-04");
    engine.reserve(request(hotel.id, deluxe.id, s)).await.unwrap();

    let free = engine.find_available_rooms(hotel.id, s).await.unwrap();
    let ids: Vec<_> = free.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![standard.id, suite.id]);

    // Unknown hotel: nothing to offer.
    assert!(engine.find_available_rooms(Ulid::new(), s).await.unwrap().is_empty());
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn malformed_stays_are_rejected_before_booking() {
    let engine = new_engine("bad_dates.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;

    for s in [stay("2024-06-05", "2024-06-05"), stay("2024-06-05", "2024-06-01")] {
        assert!(matches!(
            engine.reserve(request(hotel_id, room_id, s)).await,
            Err(EngineError::InvalidDateRange(_))
        ));
        assert!(matches!(
            engine.find_available_rooms(hotel_id, s).await,
            Err(EngineError::InvalidDateRange(_))
        ));
    }

    let too_long = Stay::new(
        date("2024-01-01"),
        date("2024-01-01") + chrono::Duration::days(MAX_STAY_NIGHTS + 1),
    );
    assert!(matches!(
        engine.reserve(request(hotel_id, room_id, too_long)).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(engine.list_room_bookings(&room_id).await.is_empty());
}

#[tokio::test]
async fn guest_checks() {
    let engine = new_engine("guest_checks.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let s = stay("2024-06-01", "2024-06-02");

    let mut crowd = request(hotel_id, room_id, s);
    crowd.guest.count = 3;
    assert!(matches!(
        engine.reserve(crowd).await,
        Err(EngineError::OccupancyExceeded { requested: 3, max: 2, .. })
    ));

    let mut nobody = request(hotel_id, room_id, s);
    nobody.guest.count = 0;
    assert!(matches!(engine.reserve(nobody).await, Err(EngineError::Invalid(_))));

    let mut bad_email = request(hotel_id, room_id, s);
    bad_email.guest.email = "not-an-email".into();
    assert!(matches!(engine.reserve(bad_email).await, Err(EngineError::Invalid(_))));
}

#[tokio::test]
async fn unlisted_or_foreign_rooms_cannot_be_booked() {
    let engine = new_engine("unlisted.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let s = stay("2024-06-01", "2024-06-03");

    engine
        .update_room(
            room_id,
            RoomUpdate {
                is_available: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(
        engine.reserve(request(hotel_id, room_id, s)).await,
        Err(EngineError::RoomUnavailable { conflict: None, .. })
    ));

    let other_hotel = engine.create_hotel(new_hotel("Pune", 3.5)).await.unwrap();
    assert!(matches!(
        engine.reserve(request(other_hotel.id, room_id, s)).await,
        Err(EngineError::NotFound(id)) if id == room_id
    ));
    assert!(matches!(
        engine.reserve(request(hotel_id, Ulid::new(), s)).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Payments ─────────────────────────────────────────────

#[tokio::test]
async fn gateway_timeout_counts_as_failure() {
    let gateway = Arc::new(SlowGateway {
        delay: Duration::from_millis(500),
    });
    let engine =
        Engine::new(test_wal_path("gateway_timeout.wal"), gateway, Duration::from_millis(20)).unwrap();
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let req = request(hotel_id, room_id, stay("2024-06-01", "2024-06-02"));
    let booking_id = req.id;

    assert!(matches!(
        engine.reserve(req).await,
        Err(EngineError::PaymentFailed { .. })
    ));
    assert_eq!(
        engine.get_booking(booking_id).await.unwrap().status,
        BookingStatus::Pending
    );
    assert_eq!(
        engine.get_payments_for_booking(&booking_id)[0].status,
        PaymentStatus::Failed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_payment_in_flight_per_booking() {
    let gateway = Arc::new(SlowGateway {
        delay: Duration::from_millis(300),
    });
    let engine = Arc::new(
        Engine::new(test_wal_path("in_flight.wal"), gateway, Duration::from_secs(5)).unwrap(),
    );
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let req = request(hotel_id, room_id, stay("2024-06-01", "2024-06-02"));
    let booking_id = req.id;

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.reserve(req).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(
        engine.retry_payment(booking_id, PaymentMethod::Card).await,
        Err(EngineError::PaymentInProgress(id)) if id == booking_id
    ));
    // The expiry sweep leaves it alone while the charge is out.
    assert!(engine.collect_expired_pending(now_ms() + 1, 0).is_empty());

    let r = first.await.unwrap().unwrap();
    assert_eq!(r.booking.status, BookingStatus::Confirmed);
    assert!(engine.payments_in_flight.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn booking_cannot_be_cancelled_while_being_charged() {
    let gateway = Arc::new(SlowGateway {
        delay: Duration::from_millis(300),
    });
    let engine = Arc::new(
        Engine::new(test_wal_path("cancel_mid_charge.wal"), gateway, Duration::from_secs(5)).unwrap(),
    );
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let req = request(hotel_id, room_id, stay("2024-06-01", "2024-06-02"));
    let booking_id = req.id;

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.reserve(req).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(
        engine.cancel_booking(booking_id).await,
        Err(EngineError::PaymentInProgress(id)) if id == booking_id
    ));
    assert_eq!(crate::reaper::reap_expired_pending(&engine, Duration::ZERO).await, 0);
    assert_eq!(
        engine.get_booking(booking_id).await.unwrap().status,
        BookingStatus::Pending
    );

    // The guest was charged, so the booking must end up confirmed.
    let r = first.await.unwrap().unwrap();
    assert_eq!(r.booking.status, BookingStatus::Confirmed);
    assert_eq!(r.payment.status, PaymentStatus::Success);
    assert_eq!(
        engine.get_booking(booking_id).await.unwrap().status,
        BookingStatus::Confirmed
    );

    // Settled: an ordinary cancel goes through.
    let cancelled = engine.cancel_booking(booking_id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn lifecycle_transitions_through_engine() {
    let engine = new_engine("lifecycle.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;

    let stayed = engine
        .reserve(request(hotel_id, room_id, stay("2024-06-01", "2024-06-03")))
        .await
        .unwrap();
    let completed = engine.complete_booking(stayed.booking.id).await.unwrap();
    assert_eq!(completed.status, BookingStatus::Completed);
    assert!(matches!(
        engine.cancel_booking(stayed.booking.id).await,
        Err(EngineError::InvalidStateTransition {
            from: BookingStatus::Completed,
            to: BookingStatus::Cancelled,
            ..
        })
    ));

    // Completed stays still hold their nights.
    assert!(matches!(
        engine
            .reserve(request(hotel_id, room_id, stay("2024-06-02", "2024-06-04")))
            .await,
        Err(EngineError::RoomUnavailable { .. })
    ));

    let r = engine
        .reserve(request(hotel_id, room_id, stay("2024-07-01", "2024-07-03")))
        .await
        .unwrap();
    engine.cancel_booking(r.booking.id).await.unwrap();
    assert!(matches!(
        engine.cancel_booking(r.booking.id).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        engine.complete_booking(r.booking.id).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        engine.retry_payment(r.booking.id, PaymentMethod::Card).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));

    assert!(matches!(
        engine.cancel_booking(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn pending_booking_can_be_cancelled_then_not_paid() {
    let engine = new_engine("pending_cancel.wal", declining());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let req = request(hotel_id, room_id, stay("2024-06-01", "2024-06-03"));
    let booking_id = req.id;

    assert!(engine.reserve(req).await.is_err());
    engine.cancel_booking(booking_id).await.unwrap();
    assert!(matches!(
        engine.retry_payment(booking_id, PaymentMethod::Card).await,
        Err(EngineError::InvalidStateTransition { from: BookingStatus::Cancelled, .. })
    ));
    assert_eq!(engine.get_payments_for_booking(&booking_id).len(), 1);
}

// ── Inventory ────────────────────────────────────────────

#[tokio::test]
async fn hotel_listing_and_city_search() {
    let engine = new_engine("hotel_search.wal", approving());
    let a = engine.create_hotel(new_hotel("Goa", 3.9)).await.unwrap();
    let b = engine.create_hotel(new_hotel("North Goa", 4.8)).await.unwrap();
    let c = engine.create_hotel(new_hotel("Mumbai", 4.5)).await.unwrap();

    let all: Vec<_> = engine.list_hotels().iter().map(|h| h.id).collect();
    assert_eq!(all, vec![b.id, c.id, a.id]);

    let goa: Vec<_> = engine.search_hotels_by_city("gOa").iter().map(|h| h.id).collect();
    assert_eq!(goa, vec![b.id, a.id]);
    assert!(engine.search_hotels_by_city("Delhi").is_empty());

    assert_eq!(engine.get_hotel(&c.id).unwrap().city, "Mumbai");
    assert!(engine.get_hotel(&Ulid::new()).is_none());
}

#[tokio::test]
async fn hotel_validation_and_update() {
    let engine = new_engine("hotel_update.wal", approving());
    let mut bad = new_hotel("Agra", 6.0);
    assert!(matches!(engine.create_hotel(bad.clone()).await, Err(EngineError::Invalid(_))));
    bad.rating = 4.0;
    let hotel = engine.create_hotel(bad.clone()).await.unwrap();
    assert!(matches!(
        engine.create_hotel(bad.clone()).await,
        Err(EngineError::AlreadyExists(id)) if id == hotel.id
    ));

    let mut changes = bad;
    changes.name = "Taj View".into();
    changes.amenities = vec!["Pool".into(), "pool".into(), "Spa".into()];
    let updated = engine.update_hotel(changes).await.unwrap();
    assert_eq!(updated.name, "Taj View");
    assert_eq!(updated.amenities, vec!["Pool", "Spa"]);
    assert_eq!(updated.created_at, hotel.created_at);

    assert!(matches!(
        engine.update_hotel(new_hotel("Nowhere", 1.0)).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn room_rules() {
    let engine = new_engine("room_rules.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;

    assert!(matches!(
        engine.create_room(new_room(hotel_id, "101", 100_000)).await,
        Err(EngineError::AlreadyExists(id)) if id == room_id
    ));
    assert!(matches!(
        engine.create_room(new_room(Ulid::new(), "1", 100_000)).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.create_room(new_room(hotel_id, "102", -1)).await,
        Err(EngineError::Invalid(_))
    ));
    let mut crowded = new_room(hotel_id, "103", 100_000);
    crowded.max_occupancy = MAX_GUESTS_PER_ROOM + 1;
    assert!(matches!(
        engine.create_room(crowded).await,
        Err(EngineError::LimitExceeded(_))
    ));

    engine.create_room(new_room(hotel_id, "102", 150_000)).await.unwrap();
    let prices: Vec<_> = engine
        .list_rooms_for_hotel(&hotel_id)
        .await
        .iter()
        .map(|r| r.price_per_night)
        .collect();
    assert_eq!(prices, vec![150_000, 200_000]);

    assert!(matches!(
        engine
            .update_room(
                room_id,
                RoomUpdate {
                    max_occupancy: Some(0),
                    ..Default::default()
                }
            )
            .await,
        Err(EngineError::Invalid(_))
    ));
    assert_eq!(engine.get_room_info(&room_id).await.unwrap().max_occupancy, 2);
}

#[tokio::test]
async fn delete_guards() {
    let engine = new_engine("delete_guards.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let r = engine
        .reserve(request(hotel_id, room_id, stay("2024-06-01", "2024-06-03")))
        .await
        .unwrap();

    assert!(matches!(
        engine.delete_hotel(hotel_id).await,
        Err(EngineError::HasRooms(id)) if id == hotel_id
    ));
    assert!(matches!(
        engine.delete_room(room_id).await,
        Err(EngineError::HasActiveBookings(id)) if id == room_id
    ));

    engine.cancel_booking(r.booking.id).await.unwrap();
    engine.delete_room(room_id).await.unwrap();
    assert!(engine.get_room_info(&room_id).await.is_none());
    assert!(engine.get_booking(r.booking.id).await.is_none());
    assert!(matches!(
        engine.reserve(request(hotel_id, room_id, stay("2024-06-01", "2024-06-03"))).await,
        Err(EngineError::NotFound(_))
    ));

    engine.delete_hotel(hotel_id).await.unwrap();
    assert!(engine.get_hotel(&hotel_id).is_none());
    assert!(matches!(
        engine.delete_hotel(hotel_id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn user_bookings_newest_first() {
    let engine = new_engine("user_bookings.wal", approving());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    let user = Ulid::new();

    let mut ids = Vec::new();
    for (a, b) in [("2024-06-01", "2024-06-02"), ("2024-06-10", "2024-06-12")] {
        let mut req = request(hotel_id, room_id, stay(a, b));
        req.user_id = user;
        ids.push(engine.reserve(req).await.unwrap().booking.id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    engine
        .reserve(request(hotel_id, room_id, stay("2024-07-01", "2024-07-02")))
        .await
        .unwrap();

    let mine: Vec<_> = engine.list_user_bookings(&user).await.iter().map(|b| b.id).collect();
    ids.reverse();
    assert_eq!(mine, ids);
    assert!(engine.list_user_bookings(&Ulid::new()).await.is_empty());
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let gateway = ScriptedGateway::new(&[false]);
    let engine = Engine::new(path.clone(), gateway, Duration::from_secs(5)).unwrap();
    let (hotel_id, room_id) = hotel_with_room(&engine).await;

    let pending_req = request(hotel_id, room_id, stay("2024-06-01", "2024-06-03"));
    let pending_id = pending_req.id;
    assert!(engine.reserve(pending_req).await.is_err());
    let confirmed = engine
        .reserve(request(hotel_id, room_id, stay("2024-06-03", "2024-06-05")))
        .await
        .unwrap();
    let cancelled = engine
        .reserve(request(hotel_id, room_id, stay("2024-06-10", "2024-06-11")))
        .await
        .unwrap();
    engine.cancel_booking(cancelled.booking.id).await.unwrap();
    engine
        .update_room(
            room_id,
            RoomUpdate {
                room_type: Some("Suite".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let replayed = Engine::new(path, approving(), Duration::from_secs(5)).unwrap();
    assert_eq!(replayed.get_hotel(&hotel_id), engine.get_hotel(&hotel_id));
    assert_eq!(replayed.get_room_info(&room_id).await.unwrap().room_type, "Suite");
    assert_eq!(
        replayed.list_room_bookings(&room_id).await,
        engine.list_room_bookings(&room_id).await
    );
    assert_eq!(
        replayed.get_booking(pending_id).await.unwrap().status,
        BookingStatus::Pending
    );
    assert_eq!(
        replayed.get_booking(cancelled.booking.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    assert_eq!(
        replayed.get_payments_for_booking(&confirmed.booking.id),
        engine.get_payments_for_booking(&confirmed.booking.id)
    );
    assert_eq!(
        replayed.get_payments_for_booking(&pending_id)[0].status,
        PaymentStatus::Failed
    );
    assert_eq!(replayed.list_user_bookings(&confirmed.booking.user_id).await.len(), 1);

    // The invariant survives a restart.
    assert!(matches!(
        replayed
            .reserve(request(hotel_id, room_id, stay("2024-06-04", "2024-06-06")))
            .await,
        Err(EngineError::RoomUnavailable { .. })
    ));
}

#[tokio::test]
async fn replay_forgets_deleted_inventory() {
    let path = test_wal_path("replay_deleted.wal");
    let engine = Engine::new(path.clone(), approving(), Duration::from_secs(5)).unwrap();
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    engine.delete_room(room_id).await.unwrap();
    engine.delete_hotel(hotel_id).await.unwrap();

    let replayed = Engine::new(path, approving(), Duration::from_secs(5)).unwrap();
    assert!(replayed.get_hotel(&hotel_id).is_none());
    assert!(replayed.get_room_info(&room_id).await.is_none());
    assert!(replayed.list_hotels().is_empty());
}

#[tokio::test]
async fn compaction_preserves_state_and_resets_counter() {
    let path = test_wal_path("compaction.wal");
    let engine = Engine::new(path.clone(), approving(), Duration::from_secs(5)).unwrap();
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    for day in 1..=5 {
        let a = date("2024-06-01") + chrono::Duration::days(day * 2);
        let r = engine
            .reserve(request(hotel_id, room_id, Stay::new(a, a + chrono::Duration::days(1))))
            .await
            .unwrap();
        if day % 2 == 0 {
            engine.cancel_booking(r.booking.id).await.unwrap();
        }
    }
    let before = std::fs::metadata(&path).unwrap().len();
    assert!(engine.wal_appends_since_compact().await > 0);

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    assert!(std::fs::metadata(&path).unwrap().len() < before);

    let replayed = Engine::new(path, approving(), Duration::from_secs(5)).unwrap();
    assert_eq!(
        replayed.list_room_bookings(&room_id).await,
        engine.list_room_bookings(&room_id).await
    );
    for b in engine.list_room_bookings(&room_id).await {
        assert_eq!(
            replayed.get_payments_for_booking(&b.id),
            engine.get_payments_for_booking(&b.id)
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_during_compaction_survive_replay() {
    let path = test_wal_path("compaction_window.wal");
    let engine = Arc::new(Engine::new(path.clone(), approving(), Duration::from_secs(5)).unwrap());
    let (hotel_id, room_id) = hotel_with_room(&engine).await;
    engine
        .reserve(request(hotel_id, room_id, stay("2024-06-01", "2024-06-03")))
        .await
        .unwrap();

    // Hold the room so the snapshot stalls partway through.
    let held = engine.get_room(&room_id).unwrap().write_owned().await;
    let compaction = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.compact_wal().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let late = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.create_hotel(new_hotel("Kochi", 4.8)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);

    compaction.await.unwrap().unwrap();
    let late = late.await.unwrap().unwrap();
    assert_eq!(engine.get_hotel(&late.id), Some(late.clone()));

    let replayed = Engine::new(path, approving(), Duration::from_secs(5)).unwrap();
    assert_eq!(replayed.get_hotel(&late.id), Some(late));
    assert_eq!(replayed.list_hotels().len(), 2);
    assert_eq!(
        replayed.list_room_bookings(&room_id).await,
        engine.list_room_bookings(&room_id).await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_commit_under_concurrent_writes() {
    let path = test_wal_path("group_commit.wal");
    let engine = Arc::new(Engine::new(path.clone(), approving(), Duration::from_secs(5)).unwrap());

    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_hotel(new_hotel(&format!("City {i}"), 3.0)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_hotels().len(), 20);
    assert_eq!(engine.wal_appends_since_compact().await, 20);

    let replayed = Engine::new(path, approving(), Duration::from_secs(5)).unwrap();
    assert_eq!(replayed.list_hotels().len(), 20);
}
