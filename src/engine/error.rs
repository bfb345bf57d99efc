use ulid::Ulid;

use crate::model::ReservationStatus;
use crate::validate::ValidationFailure;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    RoomInactive(Ulid),
    StaffInactive(Ulid),
    /// Mutation attempted on a completed/cancelled/no-show reservation.
    /// An authorization-style refusal, raised before validation runs.
    Terminal {
        id: Ulid,
        status: ReservationStatus,
    },
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    /// The proposal violated one or more scheduling rules.
    Rejected(Vec<ValidationFailure>),
    InvalidRequest(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::RoomInactive(id) => {
                write!(f, "room {id} is inactive and accepts no new reservations")
            }
            EngineError::StaffInactive(id) => {
                write!(f, "staff member {id} is inactive and cannot be newly assigned")
            }
            EngineError::Terminal { id, status } => {
                write!(f, "reservation {id} is {} and cannot be modified", status.label())
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(
                    f,
                    "reservation {id}: transition {} -> {} is not permitted",
                    from.label(),
                    to.label()
                )
            }
            EngineError::Rejected(failures) => {
                write!(f, "booking rejected: ")?;
                for (i, failure) in failures.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{failure}")?;
                }
                Ok(())
            }
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
