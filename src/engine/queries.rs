use ulid::Ulid;

use crate::limits::{MAX_QUERY_WINDOW_MS, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn get_room(&self, id: &Ulid) -> Option<Room> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn list_rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.iter().map(|e| e.value().clone()).collect();
        rooms.sort_by(|a, b| a.code.cmp(&b.code).then(a.id.cmp(&b.id)));
        rooms
    }

    pub fn get_staff(&self, id: &Ulid) -> Option<StaffMember> {
        self.staff.get(id).map(|e| e.value().clone())
    }

    pub fn list_staff(&self) -> Vec<StaffMember> {
        let mut staff: Vec<StaffMember> = self.staff.iter().map(|e| e.value().clone()).collect();
        staff.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        staff
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.book.read().await.get(id).cloned()
    }

    /// Board view: every reservation overlapping `[start, end)`, optionally
    /// restricted to one room, sorted by start time. Cancelled reservations
    /// no longer hold a slot and are left out.
    pub async fn schedule(
        &self,
        start: Ms,
        end: Ms,
        room: Option<Ulid>,
    ) -> Result<Vec<Reservation>, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidRequest(
                "query window must satisfy start < end",
            ));
        }
        if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if end - start > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }

        let window = Window::new(start, end);
        let book = self.book.read().await;
        let mut out: Vec<Reservation> = book
            .iter()
            .filter(|r| r.status != ReservationStatus::Cancelled)
            .filter(|r| r.window.overlaps(&window))
            .filter(|r| room.is_none_or(|id| r.room_id == id))
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.window.start, r.id));
        Ok(out)
    }
}
