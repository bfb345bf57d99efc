use std::collections::{HashMap, HashSet};

use ulid::Ulid;

use crate::model::*;

/// The Reservation Store: owns every reservation plus the two indexes the
/// conflict-candidate query walks — per-room entries sorted by window start,
/// and reservation ids per staff member.
///
/// Cancelled reservations stay in the record map (their reason and timestamp
/// are part of history) but leave both indexes: they never block time again.
pub struct ScheduleBook {
    reservations: HashMap<Ulid, Reservation>,
    /// Per-room `(start, id)`, sorted by start.
    by_room: HashMap<Ulid, Vec<(Ms, Ulid)>>,
    by_staff: HashMap<Ulid, Vec<Ulid>>,
}

impl Default for ScheduleBook {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleBook {
    pub fn new() -> Self {
        Self {
            reservations: HashMap::new(),
            by_room: HashMap::new(),
            by_staff: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    fn index(&mut self, reservation: &Reservation) {
        let slots = self.by_room.entry(reservation.room_id).or_default();
        let key = (reservation.window.start, reservation.id);
        let pos = slots.partition_point(|e| *e < key);
        slots.insert(pos, key);
        for staff_id in &reservation.staff_ids {
            self.by_staff.entry(*staff_id).or_default().push(reservation.id);
        }
    }

    fn deindex(&mut self, reservation: &Reservation) {
        if let Some(slots) = self.by_room.get_mut(&reservation.room_id) {
            slots.retain(|(_, id)| *id != reservation.id);
        }
        for staff_id in &reservation.staff_ids {
            if let Some(ids) = self.by_staff.get_mut(staff_id) {
                ids.retain(|id| *id != reservation.id);
            }
        }
    }

    fn insert(&mut self, reservation: Reservation) {
        if reservation.blocks_time() {
            self.index(&reservation);
        }
        self.reservations.insert(reservation.id, reservation);
    }

    fn replace(&mut self, reservation: Reservation) {
        if let Some(old) = self.reservations.remove(&reservation.id) {
            if old.blocks_time() {
                self.deindex(&old);
            }
        }
        self.insert(reservation);
    }

    /// Conflict-candidate query: every non-cancelled reservation sharing the
    /// room or any of the staff ids whose window could overlap `window`,
    /// excluding `exclude` (the reservation being edited).
    ///
    /// This is a superset contract — the validator's half-open overlap test
    /// is the authority on exact overlap, so extra candidates are harmless.
    /// Missing one would be a correctness bug.
    pub fn candidates(
        &self,
        room_id: Ulid,
        staff_ids: &[Ulid],
        window: &Window,
        exclude: Option<Ulid>,
    ) -> Vec<&Reservation> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        if let Some(slots) = self.by_room.get(&room_id) {
            // Entries at index >= right_bound start at or after window.end
            // and cannot overlap.
            let right_bound = slots.partition_point(|(start, _)| *start < window.end);
            for (_, id) in &slots[..right_bound] {
                if Some(*id) == exclude {
                    continue;
                }
                if let Some(r) = self.reservations.get(id)
                    && r.window.end > window.start
                    && seen.insert(*id)
                {
                    out.push(r);
                }
            }
        }

        for staff_id in staff_ids {
            if let Some(ids) = self.by_staff.get(staff_id) {
                for id in ids {
                    if Some(*id) == exclude || seen.contains(id) {
                        continue;
                    }
                    if let Some(r) = self.reservations.get(id)
                        && r.window.start < window.end
                        && r.window.end > window.start
                    {
                        seen.insert(*id);
                        out.push(r);
                    }
                }
            }
        }

        out
    }

    /// Apply a committed reservation event. Room/staff directory events are
    /// applied at the engine level, not here.
    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::ReservationBooked { reservation } => {
                // Compaction replays snapshots with their final status, so
                // insert as-is; indexing honors blocks_time.
                self.insert(reservation.clone());
            }
            Event::ReservationUpdated { reservation } => {
                self.replace(reservation.clone());
            }
            Event::ReservationStarted { id, .. } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::InProgress;
                }
            }
            Event::ReservationCompleted { id, .. } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::Completed;
                }
            }
            Event::ReservationCancelled { id, reason, at, .. } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::Cancelled;
                    r.cancel_reason = Some(reason.clone());
                    r.cancelled_at = Some(*at);
                    let snapshot = r.clone();
                    self.deindex(&snapshot);
                }
            }
            Event::ReservationNoShow { id, .. } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::NoShow;
                }
            }
            _ => {}
        }
    }
}
