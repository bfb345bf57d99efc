use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that rewrites the WAL as a snapshot of current state once
/// the append count since the last compaction crosses `threshold`. Booking
/// churn (book, move, cancel, rebook) otherwise grows the log without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BookingRequest;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("dialyd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn append_counter_resets_on_compaction() {
        let path = test_wal_path("counter_reset.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path, notify).unwrap());

        let room = Ulid::new();
        engine
            .add_room(room, "Bay 1".into(), "B-01".into(), 1, false)
            .await
            .unwrap();
        let staff = Ulid::new();
        engine
            .add_staff(staff, "E. Novak".into(), "nurse".into(), None)
            .await
            .unwrap();
        let r = engine
            .book(
                Ulid::new(),
                BookingRequest {
                    room_id: room,
                    patient_ref: "PT-9".into(),
                    patient_initials: None,
                    treatment: TreatmentType::Hemodialysis,
                    start: 8 * H,
                    end: 12 * H,
                    staff_ids: vec![staff],
                    isolation_required: false,
                    notes: None,
                },
            )
            .await
            .unwrap();
        engine.cancel(r.id, "double entry").await.unwrap();

        assert_eq!(engine.wal_appends_since_compact().await, 4);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
