use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ErrorCode, SessionError};

/// Role a participant claims when joining a room
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    /// Users start ready to speak, admins start muted until they opt in.
    pub fn default_mic_on(self) -> bool {
        matches!(self, Role::User)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl FromStr for Role {
    type Err = SessionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(SessionError::InvalidRequest(format!(
                "unknown role {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical signaling channels. Each channel has a fixed sender rule and a
/// fixed way of resolving its recipients, see `relay::ChannelRule`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    /// User to admin audio negotiation.
    UserAudio,
    /// Admin to one user audio negotiation.
    AdminAudio,
    /// Admin camera offers.
    Camera,
    /// User answers to the admin camera.
    UserCamera,
    /// Admin screen broadcast offers.
    AdminScreen,
    /// User answers to the admin screen broadcast.
    UserScreenReply,
    /// A user's own screen share, always towards the admin.
    UserScreen,
    /// Admin answers to one user's screen share.
    AdminScreenReply,
}

impl Channel {
    pub const ALL: [Channel; 8] = [
        Channel::UserAudio,
        Channel::AdminAudio,
        Channel::Camera,
        Channel::UserCamera,
        Channel::AdminScreen,
        Channel::UserScreenReply,
        Channel::UserScreen,
        Channel::AdminScreenReply,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::UserAudio => "user-audio",
            Channel::AdminAudio => "admin-audio",
            Channel::Camera => "camera",
            Channel::UserCamera => "user-camera",
            Channel::AdminScreen => "admin-screen",
            Channel::UserScreenReply => "user-screen-reply",
            Channel::UserScreen => "user-screen",
            Channel::AdminScreenReply => "admin-screen-reply",
        }
    }

    /// The media connection a signal on this channel belongs to.
    pub fn media_link(self) -> MediaLink {
        match self {
            Channel::UserAudio | Channel::AdminAudio => MediaLink::Audio,
            Channel::Camera | Channel::UserCamera => MediaLink::Camera,
            Channel::AdminScreen | Channel::UserScreenReply => MediaLink::ScreenBroadcast,
            Channel::UserScreen | Channel::AdminScreenReply => MediaLink::ScreenShare,
        }
    }

    /// Channel a participant with `role` uses to send signals for `link`.
    pub fn outbound(role: Role, link: MediaLink) -> Channel {
        match (role, link) {
            (Role::Admin, MediaLink::Audio) => Channel::AdminAudio,
            (Role::Admin, MediaLink::Camera) => Channel::Camera,
            (Role::Admin, MediaLink::ScreenBroadcast) => Channel::AdminScreen,
            (Role::Admin, MediaLink::ScreenShare) => Channel::AdminScreenReply,
            (Role::User, MediaLink::Audio) => Channel::UserAudio,
            (Role::User, MediaLink::Camera) => Channel::UserCamera,
            (Role::User, MediaLink::ScreenBroadcast) => Channel::UserScreenReply,
            (Role::User, MediaLink::ScreenShare) => Channel::UserScreen,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of peer-to-peer media connection a client keeps per remote participant.
/// The admin's own screen broadcast and a user's accepted share are separate
/// links, so both can run between the same two participants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MediaLink {
    Audio,
    Camera,
    ScreenBroadcast,
    ScreenShare,
}

impl MediaLink {
    pub const ALL: [MediaLink; 4] = [
        MediaLink::Audio,
        MediaLink::Camera,
        MediaLink::ScreenBroadcast,
        MediaLink::ScreenShare,
    ];
}

/// Opaque signaling payload. The server carries it from sender to recipient
/// without looking inside; only the client media layer interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(serde_json::Value);

impl SignalPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room. `role` stays a string so malformed roles surface as
    /// `invalid_request` instead of a framing error.
    JoinRoom {
        room_id: String,
        display_name: String,
        role: String,
    },
    LeaveRoom,
    /// Ask for the current participant list of the joined room
    ListParticipants,
    ChatMessage {
        text: String,
    },
    Signal {
        channel: Channel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        payload: SignalPayload,
    },
    SetOwnMic {
        enabled: bool,
    },
    SetUserMic {
        target_id: String,
        enabled: bool,
    },
    /// Client echo of its actual microphone state
    ReportMicState {
        enabled: bool,
    },
    RequestScreenShare {
        target_id: String,
    },
    AcceptScreenShare,
    RejectScreenShare,
    StopScreenShare {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
    },
    /// Heartbeat to keep connection alive
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom => "leave-room",
            ClientMessage::ListParticipants => "list-participants",
            ClientMessage::ChatMessage { .. } => "chat-message",
            ClientMessage::Signal { .. } => "signal",
            ClientMessage::SetOwnMic { .. } => "set-own-mic",
            ClientMessage::SetUserMic { .. } => "set-user-mic",
            ClientMessage::ReportMicState { .. } => "report-mic-state",
            ClientMessage::RequestScreenShare { .. } => "request-screen-share",
            ClientMessage::AcceptScreenShare => "accept-screen-share",
            ClientMessage::RejectScreenShare => "reject-screen-share",
            ClientMessage::StopScreenShare { .. } => "stop-screen-share",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Acknowledge successful join
    JoinSuccess {
        participant_id: String,
        room_id: String,
        participants: Vec<ParticipantInfo>,
        admin_id: Option<String>,
    },
    /// Join failed
    JoinError { code: ErrorCode, reason: String },
    /// New participant joined the room
    ParticipantJoined { participant: ParticipantInfo },
    /// Participant left the room, gracefully or not
    ParticipantLeft { id: String },
    ParticipantMicChanged { id: String, is_mic_on: bool },
    /// Imperative instruction for the receiving client's own microphone
    MicCommand { enabled: bool },
    /// Answer to `list-participants`
    Participants {
        participants: Vec<ParticipantInfo>,
        admin_id: Option<String>,
    },
    ChatMessage {
        from: String,
        name: String,
        text: String,
        timestamp: i64,
    },
    Signal {
        channel: Channel,
        from: String,
        payload: SignalPayload,
    },
    ScreenShareRequested { from: String },
    ScreenShareStarted { id: String },
    ScreenShareRejected { id: String },
    ScreenShareStopped { id: String },
    /// Response to ping
    Pong,
    /// Error reported to the acting client only
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    pub fn error(err: &SessionError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantInfo {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub is_mic_on: bool,
    #[serde(default)]
    pub is_screen_sharing: bool,
    pub joined_at: DateTime<Utc>,
}

/// Generate a unique participant ID
pub fn generate_participant_id() -> String {
    Uuid::new_v4().to_string()
}
