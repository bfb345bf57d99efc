//! Newline-delimited JSON protocol.
//!
//! Every frame is one JSON object on one line. The first frame from a client
//! must be `{"op":"hello","token":...,"actor":...}`; the actor ulid is the
//! identity stamped on everything the connection books. After the `welcome`
//! response the client sends requests and, if it has issued `listen`, also
//! receives unsolicited `event` frames for the subscribed rooms.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use crate::engine::{BookingRequest, Engine, EngineError};
use crate::model::{Event, Ms, Reservation, Room, StaffMember, TreatmentType};
use crate::observability::{
    AUTH_FAILURES_TOTAL, BOOKINGS_TOTAL, REQUEST_DURATION_SECONDS, REQUESTS_TOTAL,
    VALIDATION_FAILURES_TOTAL, op_label,
};

const MAX_FRAME_LEN: usize = 64 * 1024;
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Booking fields shared by `book` and `edit`.
#[derive(Debug, Deserialize)]
pub struct SessionFields {
    pub room_id: Ulid,
    pub patient_ref: String,
    #[serde(default)]
    pub patient_initials: Option<String>,
    pub treatment: TreatmentType,
    pub start: Ms,
    pub end: Ms,
    pub staff_ids: Vec<Ulid>,
    #[serde(default)]
    pub isolation_required: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl From<SessionFields> for BookingRequest {
    fn from(f: SessionFields) -> Self {
        BookingRequest {
            room_id: f.room_id,
            patient_ref: f.patient_ref,
            patient_initials: f.patient_initials,
            treatment: f.treatment,
            start: f.start,
            end: f.end,
            staff_ids: f.staff_ids,
            isolation_required: f.isolation_required,
            notes: f.notes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        token: String,
        actor: Ulid,
    },
    AddRoom {
        #[serde(default)]
        id: Option<Ulid>,
        name: String,
        code: String,
        capacity: u32,
        #[serde(default)]
        is_isolation: bool,
    },
    UpdateRoom {
        id: Ulid,
        name: String,
        code: String,
        capacity: u32,
        is_isolation: bool,
    },
    DeactivateRoom {
        id: Ulid,
    },
    ReactivateRoom {
        id: Ulid,
    },
    AddStaff {
        #[serde(default)]
        id: Option<Ulid>,
        name: String,
        job_title: String,
        #[serde(default)]
        user_id: Option<Ulid>,
    },
    DeactivateStaff {
        id: Ulid,
    },
    Book {
        #[serde(flatten)]
        session: SessionFields,
    },
    Edit {
        id: Ulid,
        #[serde(flatten)]
        session: SessionFields,
    },
    Move {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    Start {
        id: Ulid,
    },
    Complete {
        id: Ulid,
    },
    Cancel {
        id: Ulid,
        reason: String,
    },
    NoShow {
        id: Ulid,
    },
    GetReservation {
        id: Ulid,
    },
    ListRooms,
    ListStaff,
    Schedule {
        start: Ms,
        end: Ms,
        #[serde(default)]
        room_id: Option<Ulid>,
    },
    Listen {
        room_id: Ulid,
    },
    Unlisten {
        room_id: Ulid,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Welcome,
    Room { room: Room },
    Rooms { rooms: Vec<Room> },
    Staff { member: StaffMember },
    StaffList { staff: Vec<StaffMember> },
    Reservation { reservation: Reservation },
    Schedule { reservations: Vec<Reservation> },
    Done,
    Event { room_id: Ulid, event: Event },
    /// One or more scheduling rules failed; `errors` maps the offending
    /// field (`time_window`, `room_id`, `staff_ids`) to its messages.
    Rejected { errors: BTreeMap<String, Vec<String>> },
    /// Refused before validation: terminal-state mutation and the like.
    Forbidden { message: String },
    Error { message: String },
}

fn response_status(resp: &Response) -> &'static str {
    match resp {
        Response::Rejected { .. } => "rejected",
        Response::Forbidden { .. } => "forbidden",
        Response::Error { .. } => "error",
        _ => "ok",
    }
}

fn error_response(err: EngineError) -> Response {
    match err {
        EngineError::Rejected(failures) => {
            let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for failure in &failures {
                metrics::counter!(VALIDATION_FAILURES_TOTAL, "rule" => failure.rule())
                    .increment(1);
                errors
                    .entry(failure.field().to_string())
                    .or_default()
                    .push(failure.to_string());
            }
            Response::Rejected { errors }
        }
        terminal @ EngineError::Terminal { .. } => Response::Forbidden {
            message: terminal.to_string(),
        },
        other => Response::Error {
            message: other.to_string(),
        },
    }
}

type Conn = Framed<TcpStream, LinesCodec>;

async fn send(framed: &mut Conn, resp: &Response) -> io::Result<()> {
    let line = serde_json::to_string(resp)?;
    framed.send(line).await.map_err(io::Error::other)
}

/// Serve one authenticated client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    token: String,
) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    // First frame must be hello with the shared token.
    let actor = match framed.next().await {
        None => return Ok(()),
        Some(line) => {
            let line = line.map_err(io::Error::other)?;
            match serde_json::from_str::<Request>(&line) {
                Ok(Request::Hello {
                    token: presented,
                    actor,
                }) => {
                    if presented != token {
                        metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                        let resp = Response::Error {
                            message: "authentication failed".into(),
                        };
                        send(&mut framed, &resp).await?;
                        return Ok(());
                    }
                    actor
                }
                _ => {
                    let resp = Response::Error {
                        message: "expected hello frame".into(),
                    };
                    send(&mut framed, &resp).await?;
                    return Ok(());
                }
            }
        }
    };
    send(&mut framed, &Response::Welcome).await?;
    tracing::debug!(%actor, "client authenticated");

    // Per-room forwarder tasks feed subscribed events into one queue so they
    // can interleave with request/response traffic on the single line stream.
    let (event_tx, mut event_rx) = mpsc::channel::<(Ulid, Event)>(EVENT_QUEUE_CAPACITY);
    let mut listeners: HashMap<Ulid, JoinHandle<()>> = HashMap::new();

    let result = loop {
        tokio::select! {
            frame = framed.next() => {
                let Some(frame) = frame else { break Ok(()) };
                let line = match frame {
                    Ok(line) => line,
                    Err(e) => break Err(io::Error::other(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let request = match serde_json::from_str::<Request>(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        let resp = Response::Error { message: format!("malformed request: {e}") };
                        if let Err(e) = send(&mut framed, &resp).await {
                            break Err(e);
                        }
                        continue;
                    }
                };

                let op = op_label(&request);
                let started = Instant::now();
                let resp = match request {
                    Request::Listen { room_id } => {
                        listen(&engine, &mut listeners, &event_tx, room_id);
                        Response::Done
                    }
                    Request::Unlisten { room_id } => {
                        if let Some(handle) = listeners.remove(&room_id) {
                            handle.abort();
                        }
                        Response::Done
                    }
                    other => dispatch(&engine, actor, other).await,
                };
                metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op)
                    .record(started.elapsed().as_secs_f64());
                metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => response_status(&resp))
                    .increment(1);
                if let Err(e) = send(&mut framed, &resp).await {
                    break Err(e);
                }
            }
            Some((room_id, event)) = event_rx.recv() => {
                let resp = Response::Event { room_id, event };
                if let Err(e) = send(&mut framed, &resp).await {
                    break Err(e);
                }
            }
        }
    };

    for handle in listeners.into_values() {
        handle.abort();
    }
    result
}

fn listen(
    engine: &Engine,
    listeners: &mut HashMap<Ulid, JoinHandle<()>>,
    event_tx: &mpsc::Sender<(Ulid, Event)>,
    room_id: Ulid,
) {
    if listeners.contains_key(&room_id) {
        return;
    }
    let mut rx = engine.notify.subscribe(room_id);
    let tx = event_tx.clone();
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send((room_id, event)).await.is_err() {
                        break;
                    }
                }
                // A lagging calendar client misses frames rather than
                // stalling the hub.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    listeners.insert(room_id, handle);
}

async fn dispatch(engine: &Engine, actor: Ulid, request: Request) -> Response {
    match request {
        Request::Hello { .. } => Response::Error {
            message: "already authenticated".into(),
        },
        Request::AddRoom {
            id,
            name,
            code,
            capacity,
            is_isolation,
        } => match engine
            .add_room(id.unwrap_or_else(Ulid::new), name, code, capacity, is_isolation)
            .await
        {
            Ok(room) => Response::Room { room },
            Err(e) => error_response(e),
        },
        Request::UpdateRoom {
            id,
            name,
            code,
            capacity,
            is_isolation,
        } => match engine.update_room(id, name, code, capacity, is_isolation).await {
            Ok(room) => Response::Room { room },
            Err(e) => error_response(e),
        },
        Request::DeactivateRoom { id } => match engine.deactivate_room(id).await {
            Ok(()) => Response::Done,
            Err(e) => error_response(e),
        },
        Request::ReactivateRoom { id } => match engine.reactivate_room(id).await {
            Ok(()) => Response::Done,
            Err(e) => error_response(e),
        },
        Request::AddStaff {
            id,
            name,
            job_title,
            user_id,
        } => match engine
            .add_staff(id.unwrap_or_else(Ulid::new), name, job_title, user_id)
            .await
        {
            Ok(member) => Response::Staff { member },
            Err(e) => error_response(e),
        },
        Request::DeactivateStaff { id } => match engine.deactivate_staff(id).await {
            Ok(()) => Response::Done,
            Err(e) => error_response(e),
        },
        Request::Book { session } => match engine.book(actor, session.into()).await {
            Ok(reservation) => {
                metrics::counter!(BOOKINGS_TOTAL).increment(1);
                Response::Reservation { reservation }
            }
            Err(e) => error_response(e),
        },
        Request::Edit { id, session } => match engine.edit(id, session.into()).await {
            Ok(reservation) => Response::Reservation { reservation },
            Err(e) => error_response(e),
        },
        Request::Move { id, start, end } => match engine.reschedule(id, start, end).await {
            Ok(reservation) => Response::Reservation { reservation },
            Err(e) => error_response(e),
        },
        Request::Start { id } => match engine.start_session(id).await {
            Ok(reservation) => Response::Reservation { reservation },
            Err(e) => error_response(e),
        },
        Request::Complete { id } => match engine.complete_session(id).await {
            Ok(reservation) => Response::Reservation { reservation },
            Err(e) => error_response(e),
        },
        Request::Cancel { id, reason } => match engine.cancel(id, &reason).await {
            Ok(reservation) => Response::Reservation { reservation },
            Err(e) => error_response(e),
        },
        Request::NoShow { id } => match engine.mark_no_show(id).await {
            Ok(reservation) => Response::Reservation { reservation },
            Err(e) => error_response(e),
        },
        Request::GetReservation { id } => match engine.get_reservation(&id).await {
            Some(reservation) => Response::Reservation { reservation },
            None => error_response(EngineError::NotFound(id)),
        },
        Request::ListRooms => Response::Rooms {
            rooms: engine.list_rooms(),
        },
        Request::ListStaff => Response::StaffList {
            staff: engine.list_staff(),
        },
        Request::Schedule {
            start,
            end,
            room_id,
        } => match engine.schedule(start, end, room_id).await {
            Ok(reservations) => Response::Schedule { reservations },
            Err(e) => error_response(e),
        },
        Request::Listen { .. } | Request::Unlisten { .. } => Response::Error {
            message: "subscription ops are handled per connection".into(),
        },
    }
}
