use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::validate::{AdmittedReservation, Proposal, validate};

use super::store::ScheduleBook;
use super::{Engine, EngineError, WalCommand, now_ms};
use tokio::sync::oneshot;

/// Create/edit payload as submitted by a booking form.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub room_id: Ulid,
    pub patient_ref: String,
    pub patient_initials: Option<String>,
    pub treatment: TreatmentType,
    pub start: Ms,
    pub end: Ms,
    pub staff_ids: Vec<Ulid>,
    pub isolation_required: bool,
    pub notes: Option<String>,
}

impl Engine {
    // ── Room directory ───────────────────────────────────────

    pub async fn add_room(
        &self,
        id: Ulid,
        name: String,
        code: String,
        capacity: u32,
        is_isolation: bool,
    ) -> Result<Room, EngineError> {
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        if code.len() > MAX_CODE_LEN {
            return Err(EngineError::LimitExceeded("room code too long"));
        }
        if self.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let room = Room {
            id,
            name,
            code,
            capacity,
            is_isolation,
            is_active: true,
        };
        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        self.rooms.insert(id, room.clone());
        self.notify.send(id, &event);
        Ok(room)
    }

    pub async fn update_room(
        &self,
        id: Ulid,
        name: String,
        code: String,
        capacity: u32,
        is_isolation: bool,
    ) -> Result<Room, EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("room name too long"));
        }
        if code.len() > MAX_CODE_LEN {
            return Err(EngineError::LimitExceeded("room code too long"));
        }
        if !self.rooms.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        // An isolation downgrade does not retro-validate existing sessions;
        // the flag is checked at booking time.
        let event = Event::RoomUpdated {
            id,
            name: name.clone(),
            code: code.clone(),
            capacity,
            is_isolation,
        };
        self.wal_append(&event).await?;
        let updated = {
            let mut room = self.rooms.get_mut(&id).ok_or(EngineError::NotFound(id))?;
            room.name = name;
            room.code = code;
            room.capacity = capacity;
            room.is_isolation = is_isolation;
            room.clone()
        };
        self.notify.send(id, &event);
        Ok(updated)
    }

    /// Soft-deactivate: the room stops accepting new reservations but keeps
    /// existing ones and stays referenceable forever.
    pub async fn deactivate_room(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.rooms.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RoomDeactivated { id };
        self.wal_append(&event).await?;
        if let Some(mut room) = self.rooms.get_mut(&id) {
            room.is_active = false;
        }
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn reactivate_room(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.rooms.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RoomReactivated { id };
        self.wal_append(&event).await?;
        if let Some(mut room) = self.rooms.get_mut(&id) {
            room.is_active = true;
        }
        self.notify.send(id, &event);
        Ok(())
    }

    // ── Staff directory ──────────────────────────────────────

    pub async fn add_staff(
        &self,
        id: Ulid,
        name: String,
        job_title: String,
        user_id: Option<Ulid>,
    ) -> Result<StaffMember, EngineError> {
        if self.staff.len() >= MAX_STAFF {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }
        if name.len() > MAX_NAME_LEN || job_title.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("staff name or title too long"));
        }
        if self.staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let member = StaffMember {
            id,
            name,
            job_title,
            is_active: true,
            user_id,
        };
        let event = Event::StaffCreated {
            member: member.clone(),
        };
        self.wal_append(&event).await?;
        self.staff.insert(id, member.clone());
        Ok(member)
    }

    /// Existing assignments are preserved; the member just cannot be newly
    /// assigned from here on.
    pub async fn deactivate_staff(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.staff.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::StaffDeactivated { id };
        self.wal_append(&event).await?;
        if let Some(mut member) = self.staff.get_mut(&id) {
            member.is_active = false;
        }
        Ok(())
    }

    // ── Booking ──────────────────────────────────────────────

    /// Book a new session. `actor` is the explicit identity stamped as
    /// `created_by` — there is no ambient "current user" here.
    pub async fn book(
        &self,
        actor: Ulid,
        req: BookingRequest,
    ) -> Result<Reservation, EngineError> {
        check_request_shape(&req)?;
        self.check_window_limits(req.start, req.end)?;
        let room = self.get_room_checked(&req.room_id)?;
        if !room.is_active {
            return Err(EngineError::RoomInactive(room.id));
        }
        let staff_ids = dedup_staff(req.staff_ids.clone());
        for sid in &staff_ids {
            let member = self.staff.get(sid).ok_or(EngineError::NotFound(*sid))?;
            if !member.is_active {
                return Err(EngineError::StaffInactive(*sid));
            }
        }

        let mut book = self.book.write().await;
        if book.len() >= MAX_RESERVATIONS {
            return Err(EngineError::LimitExceeded("too many reservations"));
        }

        let proposal = Proposal {
            reservation_id: None,
            room_id: room.id,
            start: req.start,
            end: req.end,
            treatment: req.treatment,
            isolation_required: req.isolation_required,
            staff_ids,
        };
        let admitted = self.admit(&book, &proposal, &room)?;

        let reservation = Reservation {
            id: Ulid::new(),
            room_id: admitted.room_id,
            window: admitted.window,
            treatment: admitted.treatment,
            status: ReservationStatus::Scheduled,
            patient_ref: req.patient_ref,
            patient_initials: req.patient_initials,
            staff_ids: admitted.staff_ids,
            isolation_required: admitted.isolation_required,
            cancelled_at: None,
            cancel_reason: None,
            created_by: actor,
            notes: req.notes,
        };
        let event = Event::ReservationBooked {
            reservation: reservation.clone(),
        };
        self.commit_reservation_event(&mut book, &event).await?;
        Ok(reservation)
    }

    /// Edit room/time/staff/treatment fields of a live reservation. Re-runs
    /// the full validation with the reservation excluded from its own
    /// conflict set.
    pub async fn edit(&self, id: Ulid, req: BookingRequest) -> Result<Reservation, EngineError> {
        check_request_shape(&req)?;
        self.check_window_limits(req.start, req.end)?;
        let room = self.get_room_checked(&req.room_id)?;

        let mut book = self.book.write().await;
        let old = book.get(&id).ok_or(EngineError::NotFound(id))?.clone();
        if !old.status.is_editable() {
            return Err(EngineError::Terminal {
                id,
                status: old.status,
            });
        }
        // Moving into a different room requires that room to be active;
        // a session staying put in a since-deactivated room is not a new
        // booking.
        if room.id != old.room_id && !room.is_active {
            return Err(EngineError::RoomInactive(room.id));
        }
        let staff_ids = dedup_staff(req.staff_ids.clone());
        for sid in &staff_ids {
            let member = self.staff.get(sid).ok_or(EngineError::NotFound(*sid))?;
            if !member.is_active && !old.staff_ids.contains(sid) {
                return Err(EngineError::StaffInactive(*sid));
            }
        }

        let proposal = Proposal {
            reservation_id: Some(id),
            room_id: room.id,
            start: req.start,
            end: req.end,
            treatment: req.treatment,
            isolation_required: req.isolation_required,
            staff_ids,
        };
        let admitted = self.admit(&book, &proposal, &room)?;

        let updated = Reservation {
            id,
            room_id: admitted.room_id,
            window: admitted.window,
            treatment: admitted.treatment,
            status: old.status,
            patient_ref: req.patient_ref,
            patient_initials: req.patient_initials,
            staff_ids: admitted.staff_ids,
            isolation_required: admitted.isolation_required,
            cancelled_at: None,
            cancel_reason: None,
            created_by: old.created_by,
            notes: req.notes,
        };
        let event = Event::ReservationUpdated {
            reservation: updated.clone(),
        };
        self.commit_reservation_event(&mut book, &event).await?;
        Ok(updated)
    }

    /// Drag-and-drop reschedule: same room, staff and treatment, new window.
    pub async fn reschedule(
        &self,
        id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Reservation, EngineError> {
        self.check_window_limits(start, end)?;

        let mut book = self.book.write().await;
        let old = book.get(&id).ok_or(EngineError::NotFound(id))?.clone();
        if !old.status.is_editable() {
            return Err(EngineError::Terminal {
                id,
                status: old.status,
            });
        }
        let room = self.get_room_checked(&old.room_id)?;

        let proposal = Proposal {
            reservation_id: Some(id),
            room_id: old.room_id,
            start,
            end,
            treatment: old.treatment,
            isolation_required: old.isolation_required,
            staff_ids: old.staff_ids.clone(),
        };
        let admitted = self.admit(&book, &proposal, &room)?;

        let mut updated = old;
        updated.window = admitted.window;
        let event = Event::ReservationUpdated {
            reservation: updated.clone(),
        };
        self.commit_reservation_event(&mut book, &event).await?;
        Ok(updated)
    }

    // ── Lifecycle ────────────────────────────────────────────

    pub async fn start_session(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::InProgress).await
    }

    pub async fn complete_session(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::Completed).await
    }

    /// Whether the start time has actually passed is the caller's policy.
    pub async fn mark_no_show(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::NoShow).await
    }

    async fn transition(
        &self,
        id: Ulid,
        to: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let mut book = self.book.write().await;
        let cur = book.get(&id).ok_or(EngineError::NotFound(id))?.clone();
        if cur.status.is_terminal() {
            return Err(EngineError::Terminal {
                id,
                status: cur.status,
            });
        }
        if !cur.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                id,
                from: cur.status,
                to,
            });
        }
        let event = match to {
            ReservationStatus::InProgress => Event::ReservationStarted {
                id,
                room_id: cur.room_id,
            },
            ReservationStatus::Completed => Event::ReservationCompleted {
                id,
                room_id: cur.room_id,
            },
            ReservationStatus::NoShow => Event::ReservationNoShow {
                id,
                room_id: cur.room_id,
            },
            _ => return Err(EngineError::InvalidRequest("unsupported transition")),
        };
        self.commit_reservation_event(&mut book, &event).await?;
        book.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Cancel with a mandatory reason. The slot is freed for rebooking.
    pub async fn cancel(&self, id: Ulid, reason: &str) -> Result<Reservation, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::InvalidRequest(
                "cancellation reason must not be empty",
            ));
        }
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }

        let mut book = self.book.write().await;
        let cur = book.get(&id).ok_or(EngineError::NotFound(id))?.clone();
        if cur.status.is_terminal() {
            return Err(EngineError::Terminal {
                id,
                status: cur.status,
            });
        }
        let event = Event::ReservationCancelled {
            id,
            room_id: cur.room_id,
            reason: reason.to_string(),
            at: now_ms(),
        };
        self.commit_reservation_event(&mut book, &event).await?;
        book.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    fn admit(
        &self,
        book: &ScheduleBook,
        proposal: &Proposal,
        room: &Room,
    ) -> Result<AdmittedReservation, EngineError> {
        // A malformed window has no meaningful candidate set; the validator
        // reports InvalidTimeWindow either way.
        let candidates = if proposal.start < proposal.end {
            book.candidates(
                proposal.room_id,
                &proposal.staff_ids,
                &Window::new(proposal.start, proposal.end),
                proposal.reservation_id,
            )
        } else {
            Vec::new()
        };
        validate(proposal, room, &self.durations, &candidates).map_err(EngineError::Rejected)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        for room in self.rooms.iter() {
            events.push(Event::RoomCreated {
                room: room.value().clone(),
            });
        }
        for member in self.staff.iter() {
            events.push(Event::StaffCreated {
                member: member.value().clone(),
            });
        }
        {
            let book = self.book.read().await;
            for reservation in book.iter() {
                events.push(Event::ReservationBooked {
                    reservation: reservation.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx_send(WalCommand::Compact {
            events,
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx_send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn dedup_staff(mut staff_ids: Vec<Ulid>) -> Vec<Ulid> {
    staff_ids.sort();
    staff_ids.dedup();
    staff_ids
}

fn check_request_shape(req: &BookingRequest) -> Result<(), EngineError> {
    if req.staff_ids.is_empty() {
        return Err(EngineError::InvalidRequest("staff list must not be empty"));
    }
    if req.staff_ids.len() > MAX_STAFF_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too many staff on one reservation"));
    }
    if req.patient_ref.is_empty() {
        return Err(EngineError::InvalidRequest("patient reference required"));
    }
    if req.patient_ref.len() > MAX_PATIENT_REF_LEN {
        return Err(EngineError::LimitExceeded("patient reference too long"));
    }
    if let Some(initials) = &req.patient_initials
        && initials.len() > MAX_INITIALS_LEN
    {
        return Err(EngineError::LimitExceeded("patient initials too long"));
    }
    if let Some(notes) = &req.notes
        && notes.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}
