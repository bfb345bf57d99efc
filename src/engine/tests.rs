use std::path::{Path, PathBuf};
use std::sync::Arc;

use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;

use super::*;

const H: Ms = 3_600_000;

fn wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("dialyd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{name}_{}.wal", Ulid::new()))
}

fn open(path: &Path) -> Engine {
    Engine::new(path.to_path_buf(), Arc::new(NotifyHub::new())).unwrap()
}

async fn add_fixtures(engine: &Engine) -> (Ulid, Ulid) {
    let room_id = Ulid::new();
    engine
        .add_room(room_id, "Bay 1".into(), "B-01".into(), 1, false)
        .await
        .unwrap();
    let staff_id = Ulid::new();
    engine
        .add_staff(staff_id, "A. Okafor".into(), "nurse".into(), None)
        .await
        .unwrap();
    (room_id, staff_id)
}

fn request(room: Ulid, staff: Ulid, start: Ms, end: Ms) -> BookingRequest {
    BookingRequest {
        room_id: room,
        patient_ref: "PT-100".into(),
        patient_initials: Some("AB".into()),
        treatment: TreatmentType::Hemodialysis,
        start,
        end,
        staff_ids: vec![staff],
        isolation_required: false,
        notes: None,
    }
}

fn rejected_rules(err: EngineError) -> Vec<&'static str> {
    match err {
        EngineError::Rejected(failures) => failures.iter().map(|f| f.rule()).collect(),
        other => panic!("expected Rejected, got {other}"),
    }
}

#[tokio::test]
async fn book_stamps_actor_and_scheduled_status() {
    let engine = open(&wal_path("book_stamps"));
    let (room, staff) = add_fixtures(&engine).await;
    let actor = Ulid::new();

    let r = engine
        .book(actor, request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    assert_eq!(r.status, ReservationStatus::Scheduled);
    assert_eq!(r.created_by, actor);
    assert_eq!(r.room_id, room);
    assert_eq!(r.staff_ids, vec![staff]);

    let stored = engine.get_reservation(&r.id).await.unwrap();
    assert_eq!(stored, r);
}

#[tokio::test]
async fn overlapping_room_booking_rejected() {
    let engine = open(&wal_path("room_overlap"));
    let (room, staff) = add_fixtures(&engine).await;
    let other_staff = Ulid::new();
    engine
        .add_staff(other_staff, "B. Lindqvist".into(), "nurse".into(), None)
        .await
        .unwrap();

    engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    let err = engine
        .book(Ulid::new(), request(room, other_staff, 11 * H, 15 * H))
        .await
        .unwrap_err();
    assert_eq!(rejected_rules(err), vec!["room_conflict"]);
}

#[tokio::test]
async fn staff_conflict_across_rooms() {
    let engine = open(&wal_path("staff_cross_room"));
    let (room_a, staff) = add_fixtures(&engine).await;
    let room_b = Ulid::new();
    engine
        .add_room(room_b, "Bay 2".into(), "B-02".into(), 1, false)
        .await
        .unwrap();

    engine
        .book(Ulid::new(), request(room_a, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    let err = engine
        .book(Ulid::new(), request(room_b, staff, 10 * H, 14 * H))
        .await
        .unwrap_err();
    assert_eq!(rejected_rules(err), vec!["staff_conflict"]);
}

#[tokio::test]
async fn back_to_back_sessions_allowed() {
    let engine = open(&wal_path("back_to_back"));
    let (room, staff) = add_fixtures(&engine).await;

    engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();
    // Half-open windows: [8,12) and [12,16) do not overlap.
    engine
        .book(Ulid::new(), request(room, staff, 12 * H, 16 * H))
        .await
        .unwrap();
}

#[tokio::test]
async fn duration_below_minimum_rejected() {
    let engine = open(&wal_path("too_short"));
    let (room, staff) = add_fixtures(&engine).await;

    let err = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 9 * H))
        .await
        .unwrap_err();
    assert_eq!(rejected_rules(err), vec!["duration_too_short"]);
}

#[tokio::test]
async fn isolation_needs_isolation_room() {
    let engine = open(&wal_path("isolation"));
    let (room, staff) = add_fixtures(&engine).await;

    let mut req = request(room, staff, 8 * H, 12 * H);
    req.isolation_required = true;
    let err = engine.book(Ulid::new(), req).await.unwrap_err();
    assert_eq!(rejected_rules(err), vec!["isolation_mismatch"]);

    let iso_room = Ulid::new();
    engine
        .add_room(iso_room, "Isolation 1".into(), "ISO-1".into(), 1, true)
        .await
        .unwrap();
    let mut req = request(iso_room, staff, 8 * H, 12 * H);
    req.isolation_required = true;
    engine.book(Ulid::new(), req).await.unwrap();
}

#[tokio::test]
async fn cancel_frees_slot_for_rebooking() {
    let engine = open(&wal_path("cancel_frees"));
    let (room, staff) = add_fixtures(&engine).await;

    let r = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    let cancelled = engine.cancel(r.id, "patient hospitalized").await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("patient hospitalized"));
    assert!(cancelled.cancelled_at.is_some());

    // Same window books cleanly now.
    engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_requires_reason() {
    let engine = open(&wal_path("cancel_reason"));
    let (room, staff) = add_fixtures(&engine).await;
    let r = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    assert!(matches!(
        engine.cancel(r.id, "   ").await.unwrap_err(),
        EngineError::InvalidRequest(_)
    ));
    // Still live after the failed cancel.
    let stored = engine.get_reservation(&r.id).await.unwrap();
    assert_eq!(stored.status, ReservationStatus::Scheduled);
}

#[tokio::test]
async fn terminal_reservation_refuses_mutation() {
    let engine = open(&wal_path("terminal"));
    let (room, staff) = add_fixtures(&engine).await;
    let r = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    engine.start_session(r.id).await.unwrap();
    engine.complete_session(r.id).await.unwrap();

    assert!(matches!(
        engine.edit(r.id, request(room, staff, 9 * H, 13 * H)).await.unwrap_err(),
        EngineError::Terminal { .. }
    ));
    assert!(matches!(
        engine.reschedule(r.id, 9 * H, 13 * H).await.unwrap_err(),
        EngineError::Terminal { .. }
    ));
    assert!(matches!(
        engine.cancel(r.id, "too late").await.unwrap_err(),
        EngineError::Terminal { .. }
    ));
    assert!(matches!(
        engine.mark_no_show(r.id).await.unwrap_err(),
        EngineError::Terminal { .. }
    ));
}

#[tokio::test]
async fn no_show_only_from_scheduled() {
    let engine = open(&wal_path("no_show_transition"));
    let (room, staff) = add_fixtures(&engine).await;
    let r = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    engine.start_session(r.id).await.unwrap();
    // Patient showed up — no-show no longer applies.
    assert!(matches!(
        engine.mark_no_show(r.id).await.unwrap_err(),
        EngineError::InvalidTransition { .. }
    ));
}

#[tokio::test]
async fn no_show_still_blocks_slot() {
    let engine = open(&wal_path("no_show_blocks"));
    let (room, staff) = add_fixtures(&engine).await;
    let r = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();
    engine.mark_no_show(r.id).await.unwrap();

    // Unlike a cancellation, the slot stays occupied.
    let err = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap_err();
    assert!(rejected_rules(err).contains(&"room_conflict"));
}

#[tokio::test]
async fn edit_does_not_conflict_with_itself() {
    let engine = open(&wal_path("edit_self"));
    let (room, staff) = add_fixtures(&engine).await;
    let r = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    // Shift by one hour within its own original window.
    let updated = engine
        .edit(r.id, request(room, staff, 9 * H, 13 * H))
        .await
        .unwrap();
    assert_eq!(updated.window, Window::new(9 * H, 13 * H));
    assert_eq!(updated.created_by, r.created_by);
}

#[tokio::test]
async fn reschedule_onto_occupied_slot_rejected() {
    let engine = open(&wal_path("reschedule_occupied"));
    let (room, staff) = add_fixtures(&engine).await;
    let other_staff = Ulid::new();
    engine
        .add_staff(other_staff, "C. Duarte".into(), "nurse".into(), None)
        .await
        .unwrap();

    engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();
    let movable = engine
        .book(Ulid::new(), request(room, other_staff, 14 * H, 18 * H))
        .await
        .unwrap();

    let err = engine.reschedule(movable.id, 9 * H, 13 * H).await.unwrap_err();
    assert_eq!(rejected_rules(err), vec!["room_conflict"]);

    // The failed move left the original window untouched.
    let stored = engine.get_reservation(&movable.id).await.unwrap();
    assert_eq!(stored.window, Window::new(14 * H, 18 * H));
}

#[tokio::test]
async fn inactive_room_rejects_new_bookings_keeps_existing() {
    let engine = open(&wal_path("inactive_room"));
    let (room, staff) = add_fixtures(&engine).await;
    let r = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    engine.deactivate_room(room).await.unwrap();

    assert!(matches!(
        engine
            .book(Ulid::new(), request(room, staff, 14 * H, 18 * H))
            .await
            .unwrap_err(),
        EngineError::RoomInactive(_)
    ));
    // A session staying put in the deactivated room can still be adjusted.
    engine.reschedule(r.id, 9 * H, 13 * H).await.unwrap();

    engine.reactivate_room(room).await.unwrap();
    engine
        .book(Ulid::new(), request(room, staff, 14 * H, 18 * H))
        .await
        .unwrap();
}

#[tokio::test]
async fn inactive_staff_cannot_be_newly_assigned() {
    let engine = open(&wal_path("inactive_staff"));
    let (room, staff) = add_fixtures(&engine).await;
    let r = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    engine.deactivate_staff(staff).await.unwrap();

    assert!(matches!(
        engine
            .book(Ulid::new(), request(room, staff, 14 * H, 18 * H))
            .await
            .unwrap_err(),
        EngineError::StaffInactive(_)
    ));
    // Carried-over assignment on an edit is fine.
    engine.edit(r.id, request(room, staff, 9 * H, 13 * H)).await.unwrap();
}

#[tokio::test]
async fn unknown_ids_not_found() {
    let engine = open(&wal_path("not_found"));
    let (_, staff) = add_fixtures(&engine).await;

    assert!(matches!(
        engine
            .book(Ulid::new(), request(Ulid::new(), staff, 8 * H, 12 * H))
            .await
            .unwrap_err(),
        EngineError::NotFound(_)
    ));
    assert!(matches!(
        engine.cancel(Ulid::new(), "nope").await.unwrap_err(),
        EngineError::NotFound(_)
    ));
    assert!(engine.get_reservation(&Ulid::new()).await.is_none());
}

#[tokio::test]
async fn empty_staff_list_rejected() {
    let engine = open(&wal_path("empty_staff"));
    let (room, _) = add_fixtures(&engine).await;

    let mut req = request(room, Ulid::new(), 8 * H, 12 * H);
    req.staff_ids.clear();
    assert!(matches!(
        engine.book(Ulid::new(), req).await.unwrap_err(),
        EngineError::InvalidRequest(_)
    ));
}

#[tokio::test]
async fn replay_restores_full_state() {
    let path = wal_path("replay");
    let (room, staff, kept, cancelled) = {
        let engine = open(&path);
        let (room, staff) = add_fixtures(&engine).await;
        let kept = engine
            .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
            .await
            .unwrap();
        let doomed = engine
            .book(Ulid::new(), request(room, staff, 14 * H, 18 * H))
            .await
            .unwrap();
        engine.cancel(doomed.id, "machine fault").await.unwrap();
        engine.start_session(kept.id).await.unwrap();
        (room, staff, kept.id, doomed.id)
    };

    let engine = open(&path);
    assert!(engine.get_room(&room).is_some());
    assert!(engine.get_staff(&staff).is_some());

    let kept = engine.get_reservation(&kept).await.unwrap();
    assert_eq!(kept.status, ReservationStatus::InProgress);

    let cancelled = engine.get_reservation(&cancelled).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("machine fault"));

    // The replayed indexes still enforce conflicts.
    let err = engine
        .book(Ulid::new(), request(room, staff, 9 * H, 13 * H))
        .await
        .unwrap_err();
    assert!(!rejected_rules(err).is_empty());
    // And the cancelled slot is free again.
    engine
        .book(Ulid::new(), request(room, staff, 14 * H, 18 * H))
        .await
        .unwrap();
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = wal_path("compact");
    {
        let engine = open(&path);
        let (room, staff) = add_fixtures(&engine).await;
        // Churn to give compaction something to discard.
        for _ in 0..5 {
            let r = engine
                .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
                .await
                .unwrap();
            engine.cancel(r.id, "rescheduled").await.unwrap();
        }
        let r = engine
            .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
            .await
            .unwrap();
        engine.complete_session(r.id).await.unwrap();

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    let engine = open(&path);
    let completed: Vec<_> = {
        let book = engine.book.read().await;
        book.iter()
            .filter(|r| r.status == ReservationStatus::Completed)
            .cloned()
            .collect()
    };
    assert_eq!(completed.len(), 1);
    // The compacted snapshot still blocks its slot.
    let err = engine
        .book(
            Ulid::new(),
            request(completed[0].room_id, completed[0].staff_ids[0], 8 * H, 12 * H),
        )
        .await
        .unwrap_err();
    assert!(rejected_rules(err).contains(&"room_conflict"));
}

#[tokio::test]
async fn notify_emits_after_commit() {
    let engine = open(&wal_path("notify"));
    let (room, staff) = add_fixtures(&engine).await;
    let mut rx = engine.notify.subscribe(room);

    let r = engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    match rx.recv().await.unwrap() {
        Event::ReservationBooked { reservation } => assert_eq!(reservation.id, r.id),
        other => panic!("unexpected event: {other:?}"),
    }

    engine.cancel(r.id, "patient request").await.unwrap();
    match rx.recv().await.unwrap() {
        Event::ReservationCancelled { id, reason, .. } => {
            assert_eq!(id, r.id);
            assert_eq!(reason, "patient request");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn rejected_booking_emits_nothing() {
    let engine = open(&wal_path("notify_rejected"));
    let (room, staff) = add_fixtures(&engine).await;
    engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    let mut rx = engine.notify.subscribe(room);
    let _ = engine
        .book(Ulid::new(), request(room, staff, 9 * H, 13 * H))
        .await
        .unwrap_err();

    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn schedule_query_filters_and_sorts() {
    let engine = open(&wal_path("schedule_query"));
    let (room_a, staff) = add_fixtures(&engine).await;
    let room_b = Ulid::new();
    engine
        .add_room(room_b, "Bay 2".into(), "B-02".into(), 1, false)
        .await
        .unwrap();
    let staff_b = Ulid::new();
    engine
        .add_staff(staff_b, "D. Mbeki".into(), "nurse".into(), None)
        .await
        .unwrap();

    let late = engine
        .book(Ulid::new(), request(room_a, staff, 14 * H, 18 * H))
        .await
        .unwrap();
    let early = engine
        .book(Ulid::new(), request(room_b, staff_b, 8 * H, 12 * H))
        .await
        .unwrap();
    let gone = engine
        .book(Ulid::new(), request(room_a, staff, 8 * H, 12 * H))
        .await
        .unwrap();
    engine.cancel(gone.id, "duplicate entry").await.unwrap();

    let day = engine.schedule(0, 24 * H, None).await.unwrap();
    assert_eq!(
        day.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![early.id, late.id]
    );

    let room_a_only = engine.schedule(0, 24 * H, Some(room_a)).await.unwrap();
    assert_eq!(room_a_only.len(), 1);
    assert_eq!(room_a_only[0].id, late.id);

    // Window that touches only the late session.
    let evening = engine.schedule(17 * H, 24 * H, None).await.unwrap();
    assert_eq!(evening.len(), 1);
    assert_eq!(evening[0].id, late.id);

    assert!(matches!(
        engine.schedule(10 * H, 10 * H, None).await.unwrap_err(),
        EngineError::InvalidRequest(_)
    ));
}

#[tokio::test]
async fn duplicate_staff_ids_collapse() {
    let engine = open(&wal_path("dup_staff"));
    let (room, staff) = add_fixtures(&engine).await;

    let mut req = request(room, staff, 8 * H, 12 * H);
    req.staff_ids = vec![staff, staff, staff];
    let r = engine.book(Ulid::new(), req).await.unwrap();
    assert_eq!(r.staff_ids, vec![staff]);
}

#[tokio::test]
async fn collects_every_failure_in_one_response() {
    let engine = open(&wal_path("collect_all"));
    let (room, staff) = add_fixtures(&engine).await;
    engine
        .book(Ulid::new(), request(room, staff, 8 * H, 12 * H))
        .await
        .unwrap();

    // Too short + isolation mismatch + room conflict + staff conflict, all at once.
    let mut req = request(room, staff, 8 * H, 9 * H);
    req.isolation_required = true;
    let rules = rejected_rules(engine.book(Ulid::new(), req).await.unwrap_err());
    assert_eq!(
        rules,
        vec![
            "duration_too_short",
            "isolation_mismatch",
            "room_conflict",
            "staff_conflict"
        ]
    );
}
