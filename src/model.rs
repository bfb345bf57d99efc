use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Half-open overlap: a session ending exactly when another begins
    /// does not conflict.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    #[allow(dead_code)]
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Dialysis modality of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreatmentType {
    Hemodialysis,
    Hemodiafiltration,
    PeritonealDialysis,
    Hemofiltration,
}

impl TreatmentType {
    pub const ALL: [TreatmentType; 4] = [
        TreatmentType::Hemodialysis,
        TreatmentType::Hemodiafiltration,
        TreatmentType::PeritonealDialysis,
        TreatmentType::Hemofiltration,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            TreatmentType::Hemodialysis => "hd",
            TreatmentType::Hemodiafiltration => "hdf",
            TreatmentType::PeritonealDialysis => "pd",
            TreatmentType::Hemofiltration => "hf",
        }
    }
}

const MINUTE: Ms = 60_000;

/// Session duration floors and typical lengths per treatment type, in ms.
///
/// Minimum is the floor the validator enforces; average is advisory (slot
/// suggestion, calendar sizing). They are separate knobs on purpose — the
/// floor is a clinical threshold, not a default session length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationPolicy {
    minimums: [Ms; 4],
    averages: [Ms; 4],
}

impl Default for DurationPolicy {
    fn default() -> Self {
        let mut policy = Self {
            minimums: [0; 4],
            averages: [0; 4],
        };
        policy.set(TreatmentType::Hemodialysis, 180 * MINUTE, 240 * MINUTE);
        policy.set(TreatmentType::Hemodiafiltration, 180 * MINUTE, 240 * MINUTE);
        policy.set(TreatmentType::PeritonealDialysis, 60 * MINUTE, 120 * MINUTE);
        policy.set(TreatmentType::Hemofiltration, 240 * MINUTE, 360 * MINUTE);
        policy
    }
}

impl DurationPolicy {
    fn idx(t: TreatmentType) -> usize {
        match t {
            TreatmentType::Hemodialysis => 0,
            TreatmentType::Hemodiafiltration => 1,
            TreatmentType::PeritonealDialysis => 2,
            TreatmentType::Hemofiltration => 3,
        }
    }

    pub fn set(&mut self, t: TreatmentType, minimum: Ms, average: Ms) {
        self.minimums[Self::idx(t)] = minimum;
        self.averages[Self::idx(t)] = average;
    }

    pub fn minimum(&self, t: TreatmentType) -> Ms {
        self.minimums[Self::idx(t)]
    }

    pub fn average(&self, t: TreatmentType) -> Ms {
        self.averages[Self::idx(t)]
    }
}

/// Reservation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl ReservationStatus {
    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed | ReservationStatus::Cancelled | ReservationStatus::NoShow
        )
    }

    /// Room/time/staff/treatment edits are only allowed in these states.
    pub fn is_editable(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Scheduled | ReservationStatus::InProgress
        )
    }

    pub fn can_transition_to(&self, to: ReservationStatus) -> bool {
        use ReservationStatus::*;
        match (self, to) {
            (Scheduled, InProgress) => true,
            (Scheduled | InProgress, Completed) => true,
            (Scheduled | InProgress, Cancelled) => true,
            // The "start time has passed" policy belongs to the caller.
            (Scheduled, NoShow) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReservationStatus::Scheduled => "scheduled",
            ReservationStatus::InProgress => "in_progress",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::NoShow => "no_show",
        }
    }
}

/// A physical treatment bay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub code: String,
    pub capacity: u32,
    pub is_isolation: bool,
    /// Inactive rooms accept no new reservations. Rooms are soft-deactivated,
    /// never deleted, so historical reservations keep a valid reference.
    pub is_active: bool,
}

/// A person assignable to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub name: String,
    pub job_title: String,
    /// Inactive staff cannot be newly assigned; existing assignments stand.
    pub is_active: bool,
    pub user_id: Option<Ulid>,
}

/// One scheduled dialysis session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub window: Window,
    pub treatment: TreatmentType,
    pub status: ReservationStatus,
    /// Anonymized identifier — never a real name.
    pub patient_ref: String,
    pub patient_initials: Option<String>,
    pub staff_ids: Vec<Ulid>,
    pub isolation_required: bool,
    pub cancelled_at: Option<Ms>,
    pub cancel_reason: Option<String>,
    /// Actor who booked the session, supplied explicitly by the caller.
    pub created_by: Ulid,
    pub notes: Option<String>,
}

impl Reservation {
    /// Cancelled sessions free their slot; everything else blocks time.
    pub fn blocks_time(&self) -> bool {
        self.status != ReservationStatus::Cancelled
    }
}

/// The event types — flat, no nesting. WAL record format and the payload
/// pushed to notification subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        id: Ulid,
        name: String,
        code: String,
        capacity: u32,
        is_isolation: bool,
    },
    RoomDeactivated {
        id: Ulid,
    },
    RoomReactivated {
        id: Ulid,
    },
    StaffCreated {
        member: StaffMember,
    },
    StaffDeactivated {
        id: Ulid,
    },
    /// Full snapshot; also used by compaction to re-seed state.
    ReservationBooked {
        reservation: Reservation,
    },
    /// Full snapshot after an edit or move.
    ReservationUpdated {
        reservation: Reservation,
    },
    ReservationStarted {
        id: Ulid,
        room_id: Ulid,
    },
    ReservationCompleted {
        id: Ulid,
        room_id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        room_id: Ulid,
        reason: String,
        at: Ms,
    },
    ReservationNoShow {
        id: Ulid,
        room_id: Ulid,
    },
}

impl Event {
    /// Room the event concerns — routing key for notifications.
    pub fn room_id(&self) -> Option<Ulid> {
        match self {
            Event::RoomCreated { room } => Some(room.id),
            Event::RoomUpdated { id, .. }
            | Event::RoomDeactivated { id }
            | Event::RoomReactivated { id } => Some(*id),
            Event::StaffCreated { .. } | Event::StaffDeactivated { .. } => None,
            Event::ReservationBooked { reservation }
            | Event::ReservationUpdated { reservation } => Some(reservation.room_id),
            Event::ReservationStarted { room_id, .. }
            | Event::ReservationCompleted { room_id, .. }
            | Event::ReservationCancelled { room_id, .. }
            | Event::ReservationNoShow { room_id, .. } => Some(*room_id),
        }
    }
}
