use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{SessionError, SessionResult};
use crate::room::{Outbox, Participant, Room};
use crate::screen_share;
use crate::signaling::{ParticipantInfo, Role, ServerMessage};

/// Validation limits applied to join requests
#[derive(Debug, Clone, Copy)]
pub struct JoinLimits {
    pub max_room_id_len: usize,
    pub max_display_name_len: usize,
}

impl Default for JoinLimits {
    fn default() -> Self {
        Self {
            max_room_id_len: 128,
            max_display_name_len: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: String,
    pub display_name: String,
    pub role: Role,
}

/// What a successful join hands back to the new arrival
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub participant_id: String,
    pub room_id: String,
    pub participants: Vec<ParticipantInfo>,
    pub admin_id: Option<String>,
}

/// Read-only view of one room
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub participants: Vec<ParticipantInfo>,
    pub admin_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RoomSnapshot {
    fn of(room: &Room) -> Self {
        Self {
            room_id: room.id().to_string(),
            participants: room.snapshot(),
            admin_id: room.admin_id().map(str::to_string),
            created_at: room.created_at(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    Leave,
    ConnectionLost,
}

impl Departure {
    fn as_str(self) -> &'static str {
        match self {
            Departure::Leave => "leave",
            Departure::ConnectionLost => "connection_lost",
        }
    }
}

/// Owner of every room and participant record.
///
/// Rooms live in a `DashMap` keyed by room id, so each room is guarded by its
/// shard lock: all operations on one room are serialized while operations on
/// different rooms proceed independently. Creation, mutation and removal of an
/// emptied room happen under a single guard, so no empty room is ever visible.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    rooms: DashMap<String, Room>,
    /// participant_id -> room_id
    memberships: DashMap<String, String>,
    limits: JoinLimits,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(JoinLimits::default())
    }
}

impl RoomRegistry {
    pub fn new(limits: JoinLimits) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: DashMap::new(),
                memberships: DashMap::new(),
                limits,
            }),
        }
    }

    /// Add a connection to a room, creating the room on first join.
    ///
    /// The `join-success` acknowledgement is queued on `outbox` before the
    /// room guard is released, so the new arrival always sees it ahead of any
    /// later room event.
    pub fn join(
        &self,
        participant_id: &str,
        outbox: Outbox,
        request: JoinRequest,
    ) -> SessionResult<JoinOutcome> {
        let room_id = request.room_id.trim();
        let display_name = request.display_name.trim();
        if room_id.is_empty() {
            return Err(SessionError::invalid("room_id must not be empty"));
        }
        if room_id.len() > self.inner.limits.max_room_id_len {
            return Err(SessionError::invalid("room_id is too long"));
        }
        if display_name.is_empty() {
            return Err(SessionError::invalid("display_name must not be empty"));
        }
        if display_name.chars().count() > self.inner.limits.max_display_name_len {
            return Err(SessionError::invalid("display_name is too long"));
        }
        if let Some(current) = self.room_of(participant_id) {
            return Err(SessionError::invalid(format!(
                "connection already joined room {current}"
            )));
        }

        let participant = Participant::new(
            participant_id.to_string(),
            display_name.to_string(),
            request.role,
            outbox,
        );
        let arrival = participant.info();

        let mut room = self
            .inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id));

        if let Err(err) = room.insert(participant) {
            let emptied = room.is_empty();
            drop(room);
            if emptied {
                self.inner.rooms.remove_if(room_id, |_, room| room.is_empty());
            }
            counter!(
                "callhub_join_rejections_total",
                1,
                "reason" => err.metric_label()
            );
            return Err(err);
        }
        self.inner
            .memberships
            .insert(participant_id.to_string(), room_id.to_string());

        let outcome = JoinOutcome {
            participant_id: participant_id.to_string(),
            room_id: room_id.to_string(),
            participants: room.snapshot(),
            admin_id: room.admin_id().map(str::to_string),
        };
        room.send_to(
            participant_id,
            ServerMessage::JoinSuccess {
                participant_id: outcome.participant_id.clone(),
                room_id: outcome.room_id.clone(),
                participants: outcome.participants.clone(),
                admin_id: outcome.admin_id.clone(),
            },
        );
        let notified = room.broadcast_except(
            participant_id,
            &ServerMessage::ParticipantJoined {
                participant: arrival,
            },
        );
        let room_size = room.len();
        drop(room);

        info!(
            room_id = %room_id,
            participant_id = %participant_id,
            role = %request.role,
            room_size,
            notified,
            "participant joined"
        );
        counter!("callhub_joins_total", 1, "role" => request.role.as_str());
        self.record_gauges();
        Ok(outcome)
    }

    /// Remove a participant after an explicit leave. Returns false when the
    /// participant was already gone.
    pub fn leave(&self, participant_id: &str) -> bool {
        self.depart(participant_id, Departure::Leave)
    }

    /// Same observable effect as `leave`; used when the connection drops.
    pub fn connection_lost(&self, participant_id: &str) -> bool {
        self.depart(participant_id, Departure::ConnectionLost)
    }

    fn depart(&self, participant_id: &str, reason: Departure) -> bool {
        let Some((_, room_id)) = self.inner.memberships.remove(participant_id) else {
            debug!(
                participant_id = %participant_id,
                reason = reason.as_str(),
                "departure for participant without membership ignored"
            );
            return false;
        };

        let removed = match self.inner.rooms.entry(room_id.clone()) {
            Entry::Occupied(mut entry) => {
                let room = entry.get_mut();
                let removed = room.remove(participant_id).is_some();
                if removed {
                    screen_share::end_sessions_for(room, participant_id);
                    room.broadcast(&ServerMessage::ParticipantLeft {
                        id: participant_id.to_string(),
                    });
                }
                if room.is_empty() {
                    entry.remove();
                    info!(room_id = %room_id, "room closed");
                }
                removed
            }
            Entry::Vacant(_) => false,
        };

        if removed {
            info!(
                room_id = %room_id,
                participant_id = %participant_id,
                reason = reason.as_str(),
                "participant left"
            );
            counter!("callhub_departures_total", 1, "reason" => reason.as_str());
            self.record_gauges();
        }
        removed
    }

    /// Participants of `room_id` in join order; empty when the room is absent.
    pub fn list_participants(&self, room_id: &str) -> Vec<ParticipantInfo> {
        self.inner
            .rooms
            .get(room_id)
            .map(|room| room.snapshot())
            .unwrap_or_default()
    }

    pub fn room_snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.inner
            .rooms
            .get(room_id)
            .map(|room| RoomSnapshot::of(&room))
    }

    /// Snapshot of the room the given participant belongs to.
    pub fn snapshot_for(&self, participant_id: &str) -> SessionResult<RoomSnapshot> {
        self.with_member_room(participant_id, |room| Ok(RoomSnapshot::of(room)))
    }

    pub fn room_of(&self, participant_id: &str) -> Option<String> {
        self.inner
            .memberships
            .get(participant_id)
            .map(|entry| entry.value().clone())
    }

    pub fn contains_room(&self, room_id: &str) -> bool {
        self.inner.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn participant_count(&self) -> usize {
        self.inner.memberships.len()
    }

    /// Run `f` against the sender's room while holding that room's guard.
    ///
    /// The membership index is read and released before the room is locked;
    /// the room lock is never held while waiting on the membership index.
    pub(crate) fn with_member_room<T>(
        &self,
        participant_id: &str,
        f: impl FnOnce(&mut Room) -> SessionResult<T>,
    ) -> SessionResult<T> {
        let room_id = self.room_of(participant_id).ok_or(SessionError::NotInRoom)?;
        let mut room = self
            .inner
            .rooms
            .get_mut(&room_id)
            .ok_or(SessionError::NotInRoom)?;
        if !room.contains(participant_id) {
            return Err(SessionError::NotInRoom);
        }
        f(&mut room)
    }

    fn record_gauges(&self) {
        gauge!("callhub_rooms_active", self.room_count() as f64);
        gauge!("callhub_participants_active", self.participant_count() as f64);
    }
}
