//! Client-side half of the protocol: a local view of the joined room and the
//! session that turns server events into peer-link actions and replies.

use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::peer_link::{MediaEngine, PeerLinks};
use crate::signaling::{ClientMessage, MediaLink, ParticipantInfo, Role, ServerMessage};

/// Local microphone state. A local toggle stays provisional until the server
/// confirms it; the server value always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicState {
    pub confirmed: bool,
    pub pending: Option<bool>,
}

impl MicState {
    pub fn effective(&self) -> bool {
        self.pending.unwrap_or(self.confirmed)
    }
}

/// Participant list as this client knows it
#[derive(Debug, Clone)]
pub struct RoomView {
    participant_id: String,
    room_id: String,
    admin_id: Option<String>,
    participants: Vec<ParticipantInfo>,
    mic: MicState,
    screen_share_request: Option<String>,
}

impl RoomView {
    pub fn new(
        participant_id: String,
        room_id: String,
        participants: Vec<ParticipantInfo>,
        admin_id: Option<String>,
    ) -> Self {
        let confirmed = participants
            .iter()
            .find(|p| p.id == participant_id)
            .map(|p| p.is_mic_on)
            .unwrap_or(false);
        Self {
            participant_id,
            room_id,
            admin_id,
            participants,
            mic: MicState {
                confirmed,
                pending: None,
            },
            screen_share_request: None,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn admin_id(&self) -> Option<&str> {
        self.admin_id.as_deref()
    }

    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }

    pub fn participant(&self, id: &str) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn is_self(&self, id: &str) -> bool {
        self.participant_id == id
    }

    pub fn mic(&self) -> MicState {
        self.mic
    }

    /// Admin id of a screen-share request waiting for an answer.
    pub fn screen_share_request(&self) -> Option<&str> {
        self.screen_share_request.as_deref()
    }

    fn upsert(&mut self, participant: ParticipantInfo) {
        if participant.role == Role::Admin {
            self.admin_id = Some(participant.id.clone());
        }
        match self.participants.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => *existing = participant,
            None => self.participants.push(participant),
        }
    }

    fn remove(&mut self, id: &str) {
        self.participants.retain(|p| p.id != id);
        if self.admin_id.as_deref() == Some(id) {
            self.admin_id = None;
        }
        if self.screen_share_request.as_deref() == Some(id) {
            self.screen_share_request = None;
        }
    }

    fn set_mic_flag(&mut self, id: &str, is_mic_on: bool) {
        if let Some(p) = self.participants.iter_mut().find(|p| p.id == id) {
            p.is_mic_on = is_mic_on;
        }
    }

    fn set_sharing(&mut self, id: &str, sharing: bool) {
        if let Some(p) = self.participants.iter_mut().find(|p| p.id == id) {
            p.is_screen_sharing = sharing;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinFailure {
    pub code: ErrorCode,
    pub reason: String,
}

/// Drives one client connection's state. `handle` consumes server events and
/// returns the messages the client must send in response.
pub struct ClientSession<E: MediaEngine> {
    role: Role,
    view: Option<RoomView>,
    links: PeerLinks<E>,
    join_failure: Option<JoinFailure>,
}

impl<E: MediaEngine> ClientSession<E> {
    pub fn new(engine: E, role: Role) -> Self {
        Self {
            role,
            view: None,
            links: PeerLinks::new(engine, role),
            join_failure: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn view(&self) -> Option<&RoomView> {
        self.view.as_ref()
    }

    pub fn links(&self) -> &PeerLinks<E> {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut PeerLinks<E> {
        &mut self.links
    }

    pub fn join_failure(&self) -> Option<&JoinFailure> {
        self.join_failure.as_ref()
    }

    pub fn join_request(&self, room_id: &str, display_name: &str) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
            role: self.role.as_str().to_string(),
        }
    }

    pub fn handle(&mut self, message: ServerMessage) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        match message {
            ServerMessage::JoinSuccess {
                participant_id,
                room_id,
                participants,
                admin_id,
            } => {
                info!(room_id = %room_id, participant_id = %participant_id, "joined room");
                let view = RoomView::new(participant_id, room_id, participants, admin_id);
                self.links.engine_mut().set_microphone(view.mic.confirmed);
                self.join_failure = None;
                self.view = Some(view);
                self.start_audio_to_admin(&mut out);
            }

            ServerMessage::JoinError { code, reason } => {
                warn!(code = code.as_str(), reason = %reason, "join rejected");
                self.join_failure = Some(JoinFailure { code, reason });
            }

            ServerMessage::ParticipantJoined { participant } => {
                let Some(view) = self.view.as_mut() else {
                    return out;
                };
                view.upsert(participant);
                self.start_audio_to_admin(&mut out);
            }

            ServerMessage::ParticipantLeft { id } => {
                if let Some(view) = self.view.as_mut() {
                    view.remove(&id);
                }
                let closed = self.links.teardown_remote(&id);
                debug!(remote_id = %id, closed, "participant left");
            }

            ServerMessage::ParticipantMicChanged { id, is_mic_on } => {
                let Some(view) = self.view.as_mut() else {
                    return out;
                };
                view.set_mic_flag(&id, is_mic_on);
                if view.is_self(&id) {
                    let before = view.mic.effective();
                    view.mic = MicState {
                        confirmed: is_mic_on,
                        pending: None,
                    };
                    if before != is_mic_on {
                        self.links.engine_mut().set_microphone(is_mic_on);
                    }
                }
            }

            ServerMessage::MicCommand { enabled } => {
                let Some(view) = self.view.as_mut() else {
                    return out;
                };
                let before = view.mic.effective();
                view.mic = MicState {
                    confirmed: enabled,
                    pending: None,
                };
                let id = view.participant_id.clone();
                view.set_mic_flag(&id, enabled);
                self.links.engine_mut().set_microphone(enabled);
                if before != enabled {
                    out.push(ClientMessage::ReportMicState { enabled });
                }
            }

            ServerMessage::Participants {
                participants,
                admin_id,
            } => {
                let Some(view) = self.view.as_mut() else {
                    return out;
                };
                view.participants = participants;
                view.admin_id = admin_id;
                let stale: Vec<String> = self
                    .links
                    .remotes()
                    .into_iter()
                    .filter(|remote| view.participant(remote).is_none())
                    .collect();
                for remote in stale {
                    self.links.teardown_remote(&remote);
                }
                self.start_audio_to_admin(&mut out);
            }

            ServerMessage::ChatMessage { name, text, .. } => {
                debug!(from = %name, text = %text, "chat message");
            }

            ServerMessage::Signal {
                channel,
                from,
                payload,
            } => match self.links.on_signal(&from, channel, payload) {
                Ok(replies) => out.extend(replies),
                Err(err) => warn!(error = %err, "dropping signal"),
            },

            ServerMessage::ScreenShareRequested { from } => {
                if let Some(view) = self.view.as_mut() {
                    view.screen_share_request = Some(from);
                }
            }

            ServerMessage::ScreenShareStarted { id } => {
                let Some(view) = self.view.as_mut() else {
                    return out;
                };
                view.set_sharing(&id, true);
                if view.is_self(&id) {
                    if let Some(admin_id) = view.admin_id.clone() {
                        self.start_link(&admin_id, MediaLink::ScreenShare, &mut out);
                    }
                }
            }

            ServerMessage::ScreenShareRejected { id } => {
                info!(target_id = %id, "screen share rejected");
            }

            ServerMessage::ScreenShareStopped { id } => {
                let Some(view) = self.view.as_mut() else {
                    return out;
                };
                view.set_sharing(&id, false);
                let remote = if view.is_self(&id) {
                    view.admin_id.clone()
                } else {
                    Some(id)
                };
                if let Some(remote) = remote {
                    self.links.teardown(&remote, MediaLink::ScreenShare);
                }
            }

            ServerMessage::Pong => {}

            ServerMessage::Error { code, message } => {
                warn!(code = code.as_str(), message = %message, "request failed");
            }
        }
        out
    }

    /// Admin toggle of its own outbound microphone. Users follow the admin's
    /// commands and have no toggle.
    pub fn set_mic(&mut self, enabled: bool) -> Option<ClientMessage> {
        if self.role != Role::Admin {
            return None;
        }
        let view = self.view.as_mut()?;
        view.mic.pending = Some(enabled);
        self.links.engine_mut().set_microphone(enabled);
        Some(ClientMessage::SetOwnMic { enabled })
    }

    pub fn accept_screen_share(&mut self) -> Option<ClientMessage> {
        self.view
            .as_mut()?
            .screen_share_request
            .take()
            .map(|_| ClientMessage::AcceptScreenShare)
    }

    pub fn reject_screen_share(&mut self) -> Option<ClientMessage> {
        self.view
            .as_mut()?
            .screen_share_request
            .take()
            .map(|_| ClientMessage::RejectScreenShare)
    }

    /// Leave the room and drop every link.
    pub fn leave(&mut self) -> Option<ClientMessage> {
        self.links.teardown_all();
        self.view.take().map(|_| ClientMessage::LeaveRoom)
    }

    /// Users keep one audio link to the admin, started from their side.
    fn start_audio_to_admin(&mut self, out: &mut Vec<ClientMessage>) {
        if self.role != Role::User {
            return;
        }
        let Some(admin_id) = self.view.as_ref().and_then(|v| v.admin_id.clone()) else {
            return;
        };
        self.start_link(&admin_id, MediaLink::Audio, out);
    }

    fn start_link(&mut self, remote_id: &str, link: MediaLink, out: &mut Vec<ClientMessage>) {
        match self.links.start(remote_id, link) {
            Ok(Some(offer)) => out.push(offer),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "could not start peer link"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_link::fake::{answer, offer, FakeEngine};
    use crate::signaling::Channel;
    use chrono::Utc;

    fn info(id: &str, role: Role, is_mic_on: bool) -> ParticipantInfo {
        ParticipantInfo {
            id: id.into(),
            name: id.to_uppercase(),
            role,
            is_mic_on,
            is_screen_sharing: false,
            joined_at: Utc::now(),
        }
    }

    fn joined_user(with_admin: bool) -> (ClientSession<FakeEngine>, Vec<ClientMessage>) {
        let mut session = ClientSession::new(FakeEngine::default(), Role::User);
        let mut participants = vec![info("ann", Role::User, true)];
        if with_admin {
            participants.insert(0, info("boss", Role::Admin, false));
        }
        let out = session.handle(ServerMessage::JoinSuccess {
            participant_id: "ann".into(),
            room_id: "r1".into(),
            participants,
            admin_id: with_admin.then(|| "boss".to_string()),
        });
        (session, out)
    }

    #[test_timeout::timeout]
    fn user_offers_audio_to_the_admin_on_join() {
        let (session, out) = joined_user(true);
        assert_eq!(
            out,
            vec![ClientMessage::Signal {
                channel: Channel::UserAudio,
                target_id: None,
                payload: offer(1),
            }]
        );
        assert!(session.links().contains("boss", MediaLink::Audio));
        assert_eq!(session.links().engine().microphone, Some(true));
    }

    #[test_timeout::timeout]
    fn late_admin_gets_the_audio_offer_when_it_joins() {
        let (mut session, out) = joined_user(false);
        assert!(out.is_empty());
        let out = session.handle(ServerMessage::ParticipantJoined {
            participant: info("boss", Role::Admin, false),
        });
        assert_eq!(out.len(), 1);
        assert_eq!(session.view().unwrap().admin_id(), Some("boss"));
    }

    #[test_timeout::timeout]
    fn mic_command_overrides_and_echoes() {
        let (mut session, _) = joined_user(true);
        let out = session.handle(ServerMessage::MicCommand { enabled: false });
        assert_eq!(out, vec![ClientMessage::ReportMicState { enabled: false }]);
        assert_eq!(session.links().engine().microphone, Some(false));
        assert!(!session.view().unwrap().mic().effective());

        let out = session.handle(ServerMessage::MicCommand { enabled: false });
        assert!(out.is_empty());
    }

    #[test_timeout::timeout]
    fn admin_toggle_is_provisional_until_confirmed() {
        let mut session = ClientSession::new(FakeEngine::default(), Role::Admin);
        session.handle(ServerMessage::JoinSuccess {
            participant_id: "boss".into(),
            room_id: "r1".into(),
            participants: vec![info("boss", Role::Admin, false)],
            admin_id: Some("boss".into()),
        });

        assert_eq!(session.set_mic(true), Some(ClientMessage::SetOwnMic { enabled: true }));
        let mic = session.view().unwrap().mic();
        assert_eq!(mic.pending, Some(true));
        assert!(!mic.confirmed);

        session.handle(ServerMessage::ParticipantMicChanged {
            id: "boss".into(),
            is_mic_on: true,
        });
        let mic = session.view().unwrap().mic();
        assert_eq!(mic, MicState { confirmed: true, pending: None });
    }

    #[test_timeout::timeout]
    fn users_have_no_mic_toggle() {
        let (mut session, _) = joined_user(true);
        assert_eq!(session.set_mic(false), None);
    }

    #[test_timeout::timeout]
    fn accepted_share_starts_the_screen_offer_and_stop_tears_it_down() {
        let (mut session, _) = joined_user(true);
        session.handle(ServerMessage::ScreenShareRequested { from: "boss".into() });
        assert_eq!(session.view().unwrap().screen_share_request(), Some("boss"));
        assert_eq!(session.accept_screen_share(), Some(ClientMessage::AcceptScreenShare));
        assert_eq!(session.accept_screen_share(), None);

        let out = session.handle(ServerMessage::ScreenShareStarted { id: "ann".into() });
        assert_eq!(
            out,
            vec![ClientMessage::Signal {
                channel: Channel::UserScreen,
                target_id: None,
                payload: offer(2),
            }]
        );
        assert!(session.view().unwrap().participant("ann").unwrap().is_screen_sharing);

        let out = session.handle(ServerMessage::Signal {
            channel: Channel::AdminScreenReply,
            from: "boss".into(),
            payload: answer(5),
        });
        assert!(out.is_empty());

        session.handle(ServerMessage::ScreenShareStopped { id: "ann".into() });
        assert!(!session.links().contains("boss", MediaLink::ScreenShare));
        assert!(session.links().contains("boss", MediaLink::Audio));
    }

    #[test_timeout::timeout]
    fn stopping_a_share_keeps_the_admin_screen_broadcast() {
        let (mut session, _) = joined_user(true);
        let out = session.handle(ServerMessage::Signal {
            channel: Channel::AdminScreen,
            from: "boss".into(),
            payload: offer(9),
        });
        assert_eq!(
            out,
            vec![ClientMessage::Signal {
                channel: Channel::UserScreenReply,
                target_id: None,
                payload: answer(2),
            }]
        );

        session.handle(ServerMessage::ScreenShareRequested { from: "boss".into() });
        assert_eq!(session.accept_screen_share(), Some(ClientMessage::AcceptScreenShare));
        let out = session.handle(ServerMessage::ScreenShareStarted { id: "ann".into() });
        assert_eq!(
            out,
            vec![ClientMessage::Signal {
                channel: Channel::UserScreen,
                target_id: None,
                payload: offer(3),
            }]
        );
        assert!(session.links().contains("boss", MediaLink::ScreenBroadcast));
        assert!(session.links().contains("boss", MediaLink::ScreenShare));

        session.handle(ServerMessage::ScreenShareStopped { id: "ann".into() });
        assert!(!session.links().contains("boss", MediaLink::ScreenShare));
        assert!(session.links().contains("boss", MediaLink::ScreenBroadcast));
        assert_eq!(session.links().engine().closed, vec![3]);
    }

    #[test_timeout::timeout]
    fn departure_and_reconciliation_tear_links_down() {
        let mut session = ClientSession::new(FakeEngine::default(), Role::Admin);
        session.handle(ServerMessage::JoinSuccess {
            participant_id: "boss".into(),
            room_id: "r1".into(),
            participants: vec![
                info("boss", Role::Admin, false),
                info("ann", Role::User, true),
                info("bob", Role::User, true),
            ],
            admin_id: Some("boss".into()),
        });
        for user in ["ann", "bob"] {
            let out = session.handle(ServerMessage::Signal {
                channel: Channel::UserAudio,
                from: user.into(),
                payload: offer(0),
            });
            assert!(matches!(
                out.as_slice(),
                [ClientMessage::Signal { channel: Channel::AdminAudio, target_id: Some(t), .. }] if t == user
            ));
        }

        session.handle(ServerMessage::ParticipantLeft { id: "ann".into() });
        assert!(!session.links().contains("ann", MediaLink::Audio));

        session.handle(ServerMessage::Participants {
            participants: vec![info("boss", Role::Admin, false)],
            admin_id: Some("boss".into()),
        });
        assert!(session.links().is_empty());
        assert_eq!(session.links().engine().closed.len(), 2);
    }

    #[test_timeout::timeout]
    fn join_error_is_recorded() {
        let mut session = ClientSession::new(FakeEngine::default(), Role::Admin);
        session.handle(ServerMessage::JoinError {
            code: ErrorCode::AdminConflict,
            reason: "taken".into(),
        });
        assert!(session.view().is_none());
        assert_eq!(session.join_failure().unwrap().code, ErrorCode::AdminConflict);
        assert_eq!(session.leave(), None);
    }
}
