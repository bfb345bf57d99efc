//! Booking admissibility. Pure — the caller supplies the candidate set and
//! persists the result; nothing here touches I/O or clocks.

use ulid::Ulid;

use crate::model::{DurationPolicy, Reservation, Room, TreatmentType, Window, Ms};

/// A proposed reservation, new or edited.
#[derive(Debug, Clone)]
pub struct Proposal {
    /// Set for edits and moves: the reservation being modified, excluded
    /// from its own conflict set.
    pub reservation_id: Option<Ulid>,
    pub room_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub treatment: TreatmentType,
    pub isolation_required: bool,
    pub staff_ids: Vec<Ulid>,
}

/// Validated fields, ready to persist as a `Scheduled` reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedReservation {
    pub room_id: Ulid,
    pub window: Window,
    pub treatment: TreatmentType,
    pub isolation_required: bool,
    pub staff_ids: Vec<Ulid>,
}

/// One violated scheduling rule. `field()` names the request field the
/// failure concerns so callers can attach field-level messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    InvalidTimeWindow {
        start: Ms,
        end: Ms,
    },
    DurationTooShort {
        treatment: TreatmentType,
        required_ms: Ms,
        actual_ms: Ms,
    },
    IsolationMismatch {
        room_id: Ulid,
    },
    RoomConflict {
        conflicting: Ulid,
    },
    StaffConflict {
        staff_id: Ulid,
        conflicting: Ulid,
    },
}

impl ValidationFailure {
    pub fn field(&self) -> &'static str {
        match self {
            ValidationFailure::InvalidTimeWindow { .. } => "time_window",
            ValidationFailure::DurationTooShort { .. } => "time_window",
            ValidationFailure::IsolationMismatch { .. } => "room_id",
            ValidationFailure::RoomConflict { .. } => "room_id",
            ValidationFailure::StaffConflict { .. } => "staff_ids",
        }
    }

    /// Short machine tag, used as a metrics label.
    pub fn rule(&self) -> &'static str {
        match self {
            ValidationFailure::InvalidTimeWindow { .. } => "invalid_time_window",
            ValidationFailure::DurationTooShort { .. } => "duration_too_short",
            ValidationFailure::IsolationMismatch { .. } => "isolation_mismatch",
            ValidationFailure::RoomConflict { .. } => "room_conflict",
            ValidationFailure::StaffConflict { .. } => "staff_conflict",
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationFailure::InvalidTimeWindow { start, end } => {
                write!(f, "end must be after start (got [{start}, {end}))")
            }
            ValidationFailure::DurationTooShort {
                treatment,
                required_ms,
                actual_ms,
            } => {
                let short = (required_ms - actual_ms) / 60_000;
                write!(
                    f,
                    "{} session must last at least {} minutes ({short} minutes short)",
                    treatment.code(),
                    required_ms / 60_000
                )
            }
            ValidationFailure::IsolationMismatch { room_id } => {
                write!(f, "isolation required but room {room_id} is not an isolation room")
            }
            ValidationFailure::RoomConflict { conflicting } => {
                write!(f, "room already booked: conflicts with reservation {conflicting}")
            }
            ValidationFailure::StaffConflict { staff_id, conflicting } => {
                write!(
                    f,
                    "staff member {staff_id} is already assigned to reservation {conflicting} in that time"
                )
            }
        }
    }
}

/// Decide admissibility of `proposal` against a snapshot of possibly
/// conflicting reservations.
///
/// `existing` must contain every non-cancelled reservation that shares the
/// room or any proposed staff member and could overlap the window — a
/// conservative superset is fine (extra candidates are filtered by the exact
/// overlap test here; a missing candidate is a correctness bug in the
/// caller's query).
///
/// All applicable failures are collected so the caller can surface them as
/// field-level errors in one response.
pub fn validate(
    proposal: &Proposal,
    room: &Room,
    durations: &DurationPolicy,
    existing: &[&Reservation],
) -> Result<AdmittedReservation, Vec<ValidationFailure>> {
    let mut failures = Vec::new();

    let well_formed = proposal.start < proposal.end;
    if !well_formed {
        failures.push(ValidationFailure::InvalidTimeWindow {
            start: proposal.start,
            end: proposal.end,
        });
    }

    if well_formed {
        let actual = proposal.end - proposal.start;
        let required = durations.minimum(proposal.treatment);
        if actual < required {
            failures.push(ValidationFailure::DurationTooShort {
                treatment: proposal.treatment,
                required_ms: required,
                actual_ms: actual,
            });
        }
    }

    if proposal.isolation_required && !room.is_isolation {
        failures.push(ValidationFailure::IsolationMismatch { room_id: room.id });
    }

    // Overlap checks only make sense on a well-formed window.
    if well_formed {
        let window = Window::new(proposal.start, proposal.end);

        for other in existing {
            if Some(other.id) == proposal.reservation_id || !other.blocks_time() {
                continue;
            }
            if !window.overlaps(&other.window) {
                continue;
            }
            if other.room_id == proposal.room_id {
                failures.push(ValidationFailure::RoomConflict {
                    conflicting: other.id,
                });
            }
            for staff_id in &proposal.staff_ids {
                if other.staff_ids.contains(staff_id) {
                    failures.push(ValidationFailure::StaffConflict {
                        staff_id: *staff_id,
                        conflicting: other.id,
                    });
                }
            }
        }
    }

    if failures.is_empty() {
        Ok(AdmittedReservation {
            room_id: proposal.room_id,
            window: Window::new(proposal.start, proposal.end),
            treatment: proposal.treatment,
            isolation_required: proposal.isolation_required,
            staff_ids: proposal.staff_ids.clone(),
        })
    } else {
        Err(failures)
    }
}
