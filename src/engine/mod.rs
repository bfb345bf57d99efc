mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use mutations::BookingRequest;
pub use store::ScheduleBook;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The scheduling engine for one facility: room and staff directories, the
/// reservation book, the WAL writer, and the notification hub.
///
/// Every booking mutation runs read-candidates → validate → WAL-append →
/// apply → notify while holding the book's write lock. That single guarded
/// section is what keeps two racing requests for the same room or staff
/// member from both passing validation on a stale snapshot.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, Room>,
    pub(super) staff: DashMap<Ulid, StaffMember>,
    pub(super) book: RwLock<ScheduleBook>,
    pub(super) durations: DurationPolicy,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_policy(wal_path, notify, DurationPolicy::default())
    }

    pub fn with_policy(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        durations: DurationPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let rooms = DashMap::new();
        let staff = DashMap::new();
        let mut book = ScheduleBook::new();

        for event in &events {
            match event {
                Event::RoomCreated { room } => {
                    rooms.insert(room.id, room.clone());
                }
                Event::RoomUpdated {
                    id,
                    name,
                    code,
                    capacity,
                    is_isolation,
                } => {
                    if let Some(mut room) = rooms.get_mut(id) {
                        room.name = name.clone();
                        room.code = code.clone();
                        room.capacity = *capacity;
                        room.is_isolation = *is_isolation;
                    }
                }
                Event::RoomDeactivated { id } => {
                    if let Some(mut room) = rooms.get_mut(id) {
                        room.is_active = false;
                    }
                }
                Event::RoomReactivated { id } => {
                    if let Some(mut room) = rooms.get_mut(id) {
                        room.is_active = true;
                    }
                }
                Event::StaffCreated { member } => {
                    staff.insert(member.id, member.clone());
                }
                Event::StaffDeactivated { id } => {
                    if let Some(mut member) = staff.get_mut(id) {
                        member.is_active = false;
                    }
                }
                reservation_event => book.apply_event(reservation_event),
            }
        }

        Ok(Self {
            rooms,
            staff,
            book: RwLock::new(book),
            durations,
            wal_tx,
            notify,
        })
    }

    pub fn duration_policy(&self) -> &DurationPolicy {
        &self.durations
    }

    pub(super) async fn wal_tx_send(&self, cmd: WalCommand) -> Result<(), EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx_send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + notify for a reservation event. The caller holds
    /// the book's write lock, so the event becomes visible atomically with
    /// its durability.
    pub(super) async fn commit_reservation_event(
        &self,
        book: &mut ScheduleBook,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        book.apply_event(event);
        if let Some(room_id) = event.room_id() {
            self.notify.send(room_id, event);
        }
        Ok(())
    }

    /// Reject raw timestamps that cannot be legitimate session bounds.
    /// Start/end ordering itself is the validator's business.
    pub(super) fn check_window_limits(&self, start: Ms, end: Ms) -> Result<(), EngineError> {
        if start < MIN_VALID_TIMESTAMP_MS
            || end < MIN_VALID_TIMESTAMP_MS
            || start > MAX_VALID_TIMESTAMP_MS
            || end > MAX_VALID_TIMESTAMP_MS
        {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        if end - start > MAX_WINDOW_DURATION_MS {
            return Err(EngineError::LimitExceeded("window too wide"));
        }
        Ok(())
    }

    pub(super) fn get_room_checked(&self, id: &Ulid) -> Result<Room, EngineError> {
        self.rooms
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(*id))
    }
}
