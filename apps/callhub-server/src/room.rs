use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::{SessionError, SessionResult};
use crate::screen_share::ScreenShares;
use crate::signaling::{ParticipantInfo, Role, ServerMessage};

/// Outbound half of a client connection. Every message for one connection goes
/// through the same channel, so delivery order per recipient is routing order.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// One live connection's membership record
#[derive(Debug)]
pub struct Participant {
    id: String,
    name: String,
    role: Role,
    is_mic_on: bool,
    is_screen_sharing: bool,
    joined_at: DateTime<Utc>,
    outbox: Outbox,
}

impl Participant {
    pub fn new(id: String, name: String, role: Role, outbox: Outbox) -> Self {
        Self {
            id,
            name,
            role,
            is_mic_on: role.default_mic_on(),
            is_screen_sharing: false,
            joined_at: Utc::now(),
            outbox,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_mic_on(&self) -> bool {
        self.is_mic_on
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.is_screen_sharing
    }

    /// Only `media::MediaControl` calls this.
    pub(crate) fn set_mic_on(&mut self, enabled: bool) {
        self.is_mic_on = enabled;
    }

    /// Only the screen-share negotiation calls this.
    pub(crate) fn set_screen_sharing(&mut self, sharing: bool) {
        self.is_screen_sharing = sharing;
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            role: self.role,
            is_mic_on: self.is_mic_on,
            is_screen_sharing: self.is_screen_sharing,
            joined_at: self.joined_at,
        }
    }

    /// Returns false when the connection's writer is already gone.
    pub(crate) fn send(&self, message: ServerMessage) -> bool {
        self.outbox.send(message).is_ok()
    }
}

/// A named group of participants with at most one bound admin
#[derive(Debug)]
pub struct Room {
    id: String,
    participants: Vec<Participant>,
    admin_id: Option<String>,
    screen_shares: ScreenShares,
    created_at: DateTime<Utc>,
}

impl Room {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            participants: Vec::new(),
            admin_id: None,
            screen_shares: ScreenShares::default(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn admin_id(&self) -> Option<&str> {
        self.admin_id.as_deref()
    }

    pub fn is_admin(&self, participant_id: &str) -> bool {
        self.admin_id.as_deref() == Some(participant_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participant(participant_id).is_some()
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == participant_id)
    }

    pub(crate) fn participant_mut(&mut self, participant_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == participant_id)
    }

    /// Participants in join order
    pub fn snapshot(&self) -> Vec<ParticipantInfo> {
        self.participants.iter().map(Participant::info).collect()
    }

    pub(crate) fn screen_shares(&self) -> &ScreenShares {
        &self.screen_shares
    }

    pub(crate) fn screen_shares_mut(&mut self) -> &mut ScreenShares {
        &mut self.screen_shares
    }

    /// Insert a participant, binding the admin slot for admin joins. A live
    /// admin is never displaced; the new arrival is rejected instead.
    pub(crate) fn insert(&mut self, participant: Participant) -> SessionResult<()> {
        if self.contains(&participant.id) {
            return Err(SessionError::invalid("participant already in room"));
        }
        if participant.role == Role::Admin {
            if let Some(current) = &self.admin_id {
                if current != &participant.id {
                    return Err(SessionError::AdminConflict {
                        room_id: self.id.clone(),
                    });
                }
            }
            self.admin_id = Some(participant.id.clone());
        }
        self.participants.push(participant);
        Ok(())
    }

    /// Remove a participant and release the admin slot if it held it.
    pub(crate) fn remove(&mut self, participant_id: &str) -> Option<Participant> {
        let index = self
            .participants
            .iter()
            .position(|p| p.id == participant_id)?;
        let participant = self.participants.remove(index);
        if self.is_admin(participant_id) {
            self.admin_id = None;
        }
        Some(participant)
    }

    /// Deliver to one participant. Absent recipients are not an error.
    pub(crate) fn send_to(&self, participant_id: &str, message: ServerMessage) -> bool {
        self.participant(participant_id)
            .map(|p| p.send(message))
            .unwrap_or(false)
    }

    /// Deliver to every participant, the acting one included.
    pub(crate) fn broadcast(&self, message: &ServerMessage) -> usize {
        self.participants
            .iter()
            .filter(|p| p.send(message.clone()))
            .count()
    }

    /// Deliver to every participant except `sender_id`.
    pub(crate) fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) -> usize {
        self.participants
            .iter()
            .filter(|p| p.id != sender_id)
            .filter(|p| p.send(message.clone()))
            .count()
    }
}
