//! Server-held microphone flags.
//!
//! The flag stored on each participant is the single source of truth. Client
//! toggles are provisional until the `participant-mic-changed` broadcast
//! confirms them, and a `mic-command` always overrides local state.

use metrics::counter;
use tracing::{debug, info};

use crate::error::{SessionError, SessionResult};
use crate::registry::RoomRegistry;
use crate::signaling::ServerMessage;

#[derive(Clone)]
pub struct MediaControl {
    registry: RoomRegistry,
}

impl MediaControl {
    pub fn new(registry: RoomRegistry) -> Self {
        Self { registry }
    }

    /// Admin switches its own outbound microphone.
    pub fn set_own_mic(&self, sender_id: &str, enabled: bool) -> SessionResult<()> {
        self.registry.with_member_room(sender_id, |room| {
            if !room.is_admin(sender_id) {
                return Err(SessionError::Unauthorized {
                    action: "change the microphone state",
                });
            }
            if let Some(admin) = room.participant_mut(sender_id) {
                admin.set_mic_on(enabled);
            }
            room.broadcast(&ServerMessage::ParticipantMicChanged {
                id: sender_id.to_string(),
                is_mic_on: enabled,
            });
            info!(room_id = %room.id(), enabled, "admin microphone changed");
            Ok(())
        })
    }

    /// Admin mutes or unmutes a participant. The room gets the observational
    /// broadcast; the target additionally gets the imperative `mic-command`.
    pub fn set_user_mic(&self, sender_id: &str, target_id: &str, enabled: bool) -> SessionResult<()> {
        self.registry.with_member_room(sender_id, |room| {
            if !room.is_admin(sender_id) {
                counter!("callhub_mic_rejections_total", 1);
                return Err(SessionError::Unauthorized {
                    action: "change another participant's microphone",
                });
            }
            if target_id == sender_id {
                return Err(SessionError::invalid(
                    "use set-own-mic for the admin microphone",
                ));
            }
            let Some(target) = room.participant_mut(target_id) else {
                debug!(
                    room_id = %room.id(),
                    target_id = %target_id,
                    "mic change for absent participant dropped"
                );
                return Ok(());
            };
            target.set_mic_on(enabled);

            room.broadcast(&ServerMessage::ParticipantMicChanged {
                id: target_id.to_string(),
                is_mic_on: enabled,
            });
            room.send_to(target_id, ServerMessage::MicCommand { enabled });
            counter!("callhub_mic_commands_total", 1);
            info!(
                room_id = %room.id(),
                target_id = %target_id,
                enabled,
                "participant microphone set by admin"
            );
            Ok(())
        })
    }

    /// A client reports what its microphone actually does. Reports never
    /// change the server flag; a disagreeing report gets the authoritative
    /// value re-sent as a command. Returns true when a correction was sent.
    pub fn report_mic_state(&self, sender_id: &str, enabled: bool) -> SessionResult<bool> {
        self.registry.with_member_room(sender_id, |room| {
            let Some(authoritative) = room.participant(sender_id).map(|p| p.is_mic_on()) else {
                return Err(SessionError::NotInRoom);
            };
            if authoritative == enabled {
                return Ok(false);
            }
            room.send_to(
                sender_id,
                ServerMessage::MicCommand {
                    enabled: authoritative,
                },
            );
            counter!("callhub_mic_corrections_total", 1);
            debug!(
                room_id = %room.id(),
                participant_id = %sender_id,
                reported = enabled,
                authoritative,
                "corrected diverging microphone state"
            );
            Ok(true)
        })
    }

    pub fn mic_state(&self, participant_id: &str) -> Option<bool> {
        self.registry
            .with_member_room(participant_id, |room| {
                Ok(room.participant(participant_id).map(|p| p.is_mic_on()))
            })
            .ok()
            .flatten()
    }
}
