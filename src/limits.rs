//! Hard caps on stored state and request shapes. Requests past these limits
//! are rejected up front so a single client cannot blow up memory or the WAL.

use crate::model::Ms;

pub const MAX_ROOMS: usize = 4_096;
pub const MAX_STAFF: usize = 16_384;
pub const MAX_RESERVATIONS: usize = 1_048_576;
pub const MAX_STAFF_PER_RESERVATION: usize = 16;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CODE_LEN: usize = 32;
pub const MAX_NOTES_LEN: usize = 4_096;
pub const MAX_PATIENT_REF_LEN: usize = 128;
pub const MAX_INITIALS_LEN: usize = 8;
pub const MAX_REASON_LEN: usize = 1_024;

/// 1970-01-01. Negative timestamps are never legitimate session times.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01. Anything later is a client bug (seconds vs millis, usually).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// No single session runs longer than 7 days.
pub const MAX_WINDOW_DURATION_MS: Ms = 7 * 24 * 3_600_000;

/// Schedule queries are bounded to roughly a year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;
