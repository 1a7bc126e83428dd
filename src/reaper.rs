use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine, EngineError};
use crate::observability::{BOOKINGS_EXPIRED_TOTAL, WAL_COMPACTIONS_TOTAL};

const REAP_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Cancel PENDING bookings older than `ttl` so abandoned checkouts stop
/// holding nights. Returns how many were cancelled.
pub async fn reap_expired_pending(engine: &Engine, ttl: Duration) -> usize {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let mut reaped = 0;
    for (booking_id, room_id) in engine.collect_expired_pending(now_ms(), ttl_ms) {
        match engine.cancel_booking(booking_id).await {
            Ok(_) => {
                info!("expired pending booking {booking_id} on room {room_id}");
                reaped += 1;
            }
            // Confirmed, cancelled or being charged since it was collected.
            Err(
                e @ (EngineError::InvalidStateTransition { .. }
                | EngineError::NotFound(_)
                | EngineError::PaymentInProgress(_)),
            ) => {
                debug!("reaper skip {booking_id}: {e}");
            }
            Err(e) => warn!("reaper could not expire {booking_id}: {e}"),
        }
    }
    if reaped > 0 {
        metrics::counter!(BOOKINGS_EXPIRED_TOTAL).increment(reaped as u64);
    }
    reaped
}

/// Background task expiring abandoned PENDING bookings.
pub async fn run_reaper(engine: Arc<Engine>, ttl: Duration) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        reap_expired_pending(&engine, ttl).await;
    }
}

/// Background task compacting the WAL once `threshold` appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                info!("compacted WAL after {appends} appends");
                metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            }
            Err(e) => {
                warn!("WAL compaction failed: {e}");
                metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
            }
        }
    }
}
