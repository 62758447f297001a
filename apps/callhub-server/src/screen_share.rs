//! Admin-requested screen sharing.
//!
//! A session is keyed by its target user and remembers the admin that asked
//! for it. `Idle` is the absence of a session:
//!
//! ```text
//! Idle --request--> Requested --accept--> Active --stop/departure--> Idle
//!                   Requested --reject/departure--> Idle
//! ```
//!
//! This module is the only writer of a participant's screen-sharing flag.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{SessionError, SessionResult};
use crate::registry::RoomRegistry;
use crate::room::Room;
use crate::signaling::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenShareState {
    Requested,
    Active,
}

#[derive(Debug, Clone)]
pub struct ScreenShareSession {
    pub admin_id: String,
    pub target_id: String,
    pub state: ScreenShareState,
    /// When the admin asked.
    pub created_at: DateTime<Utc>,
}

/// Sessions of one room, at most one per target
#[derive(Debug, Default)]
pub struct ScreenShares {
    by_target: HashMap<String, ScreenShareSession>,
}

impl ScreenShares {
    pub fn get(&self, target_id: &str) -> Option<&ScreenShareSession> {
        self.by_target.get(target_id)
    }

    fn involving(&self, participant_id: &str) -> Vec<String> {
        self.by_target
            .values()
            .filter(|s| s.target_id == participant_id || s.admin_id == participant_id)
            .map(|s| s.target_id.clone())
            .collect()
    }

    fn active_for_admin(&self, admin_id: &str) -> Vec<String> {
        let mut targets: Vec<String> = self
            .by_target
            .values()
            .filter(|s| s.admin_id == admin_id && s.state == ScreenShareState::Active)
            .map(|s| s.target_id.clone())
            .collect();
        targets.sort();
        targets
    }
}

/// Drives screen-share sessions on top of the registry
#[derive(Clone)]
pub struct ScreenShareNegotiator {
    registry: RoomRegistry,
}

impl ScreenShareNegotiator {
    pub fn new(registry: RoomRegistry) -> Self {
        Self { registry }
    }

    /// Admin asks `target_id` to share its screen.
    pub fn request(&self, sender_id: &str, target_id: &str) -> SessionResult<()> {
        self.registry.with_member_room(sender_id, |room| {
            if !room.is_admin(sender_id) {
                return Err(SessionError::Unauthorized {
                    action: "request a screen share",
                });
            }
            if target_id == sender_id {
                return Err(SessionError::invalid(
                    "the admin cannot request its own screen",
                ));
            }
            if !room.contains(target_id) {
                debug!(
                    room_id = %room.id(),
                    target_id = %target_id,
                    "screen share request for absent participant dropped"
                );
                return Ok(());
            }
            if room.screen_shares().get(target_id).is_some() {
                counter!("callhub_screen_share_busy_total", 1);
                return Err(SessionError::Busy {
                    target_id: target_id.to_string(),
                });
            }

            room.screen_shares_mut().by_target.insert(
                target_id.to_string(),
                ScreenShareSession {
                    admin_id: sender_id.to_string(),
                    target_id: target_id.to_string(),
                    state: ScreenShareState::Requested,
                    created_at: Utc::now(),
                },
            );
            room.send_to(
                target_id,
                ServerMessage::ScreenShareRequested {
                    from: sender_id.to_string(),
                },
            );
            info!(room_id = %room.id(), target_id = %target_id, "screen share requested");
            Ok(())
        })
    }

    /// Target accepts a pending request and becomes the capture initiator.
    pub fn accept(&self, sender_id: &str) -> SessionResult<()> {
        self.registry.with_member_room(sender_id, |room| {
            let session = room
                .screen_shares_mut()
                .by_target
                .get_mut(sender_id)
                .filter(|s| s.state == ScreenShareState::Requested)
                .ok_or_else(|| SessionError::invalid("no pending screen share request"))?;
            session.state = ScreenShareState::Active;

            if let Some(participant) = room.participant_mut(sender_id) {
                participant.set_screen_sharing(true);
            }
            room.broadcast(&ServerMessage::ScreenShareStarted {
                id: sender_id.to_string(),
            });
            counter!("callhub_screen_shares_started_total", 1);
            info!(room_id = %room.id(), target_id = %sender_id, "screen share active");
            Ok(())
        })
    }

    /// Target declines a pending request; only the admin hears about it.
    pub fn reject(&self, sender_id: &str) -> SessionResult<()> {
        self.registry.with_member_room(sender_id, |room| {
            let pending = room
                .screen_shares()
                .get(sender_id)
                .is_some_and(|s| s.state == ScreenShareState::Requested);
            if !pending {
                return Err(SessionError::invalid("no pending screen share request"));
            }
            let Some(session) = room.screen_shares_mut().by_target.remove(sender_id) else {
                return Err(SessionError::invalid("no pending screen share request"));
            };
            room.send_to(
                &session.admin_id,
                ServerMessage::ScreenShareRejected {
                    id: sender_id.to_string(),
                },
            );
            info!(room_id = %room.id(), target_id = %sender_id, "screen share rejected");
            Ok(())
        })
    }

    /// Stop active sharing. The sharing user stops its own session; the admin
    /// stops `target_id`, or every active session it owns when none is named.
    /// Returns the number of sessions ended.
    pub fn stop(&self, sender_id: &str, target_id: Option<&str>) -> SessionResult<usize> {
        self.registry.with_member_room(sender_id, |room| {
            let targets = if room.is_admin(sender_id) {
                match target_id {
                    Some(target) => vec![target.to_string()],
                    None => room.screen_shares().active_for_admin(sender_id),
                }
            } else {
                match target_id {
                    Some(target) if target != sender_id => {
                        return Err(SessionError::Unauthorized {
                            action: "stop another participant's screen share",
                        });
                    }
                    _ => vec![sender_id.to_string()],
                }
            };

            let all_active = !targets.is_empty()
                && targets.iter().all(|target| {
                    room.screen_shares()
                        .get(target)
                        .is_some_and(|s| s.state == ScreenShareState::Active)
                });
            if !all_active {
                return Err(SessionError::invalid("no active screen share to stop"));
            }

            for target in &targets {
                finish_session(room, target);
            }
            Ok(targets.len())
        })
    }

    /// Current state of the session targeting `target_id`, `None` when idle.
    pub fn state_of(&self, target_id: &str) -> Option<ScreenShareState> {
        self.registry
            .with_member_room(target_id, |room| {
                Ok(room.screen_shares().get(target_id).map(|s| s.state))
            })
            .ok()
            .flatten()
    }
}

/// End every session the departed participant took part in, with the same
/// effects as an explicit stop. Called by the registry with the room guard
/// held, after the participant has been removed.
pub(crate) fn end_sessions_for(room: &mut Room, departed_id: &str) {
    let targets = room.screen_shares().involving(departed_id);
    for target in targets {
        finish_session(room, &target);
    }
}

fn finish_session(room: &mut Room, target_id: &str) {
    if room.screen_shares_mut().by_target.remove(target_id).is_none() {
        return;
    }
    if let Some(participant) = room.participant_mut(target_id) {
        participant.set_screen_sharing(false);
    }
    room.broadcast(&ServerMessage::ScreenShareStopped {
        id: target_id.to_string(),
    });
    counter!("callhub_screen_shares_stopped_total", 1);
    info!(room_id = %room.id(), target_id = %target_id, "screen share stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::signaling::Role;
    use crate::test_support::{join, TestClient};

    struct Fixture {
        registry: RoomRegistry,
        screen: ScreenShareNegotiator,
        admin: TestClient,
        ann: TestClient,
        bob: TestClient,
    }

    fn fixture() -> Fixture {
        let registry = RoomRegistry::default();
        let mut admin = join(&registry, "r1", "Boss", Role::Admin);
        let mut ann = join(&registry, "r1", "Ann", Role::User);
        let bob = join(&registry, "r1", "Bob", Role::User);
        let _ = admin.drain();
        let _ = ann.drain();
        Fixture {
            screen: ScreenShareNegotiator::new(registry.clone()),
            registry,
            admin,
            ann,
            bob,
        }
    }

    fn sharing_flag(registry: &RoomRegistry, id: &str) -> bool {
        registry
            .list_participants("r1")
            .into_iter()
            .find(|p| p.id == id)
            .map(|p| p.is_screen_sharing)
            .unwrap_or(false)
    }

    #[test_timeout::timeout]
    fn reject_clears_the_session_and_allows_a_new_request() {
        let mut f = fixture();
        f.screen.request(&f.admin.id, &f.ann.id).unwrap();
        assert_eq!(
            f.ann.drain(),
            vec![ServerMessage::ScreenShareRequested {
                from: f.admin.id.clone()
            }]
        );
        assert!(f.bob.drain().is_empty());
        assert_eq!(f.screen.state_of(&f.ann.id), Some(ScreenShareState::Requested));

        f.screen.reject(&f.ann.id).unwrap();
        assert_eq!(
            f.admin.drain(),
            vec![ServerMessage::ScreenShareRejected { id: f.ann.id.clone() }]
        );
        assert!(!sharing_flag(&f.registry, &f.ann.id));
        assert_eq!(f.screen.state_of(&f.ann.id), None);

        f.screen.request(&f.admin.id, &f.ann.id).unwrap();
        assert_eq!(f.screen.state_of(&f.ann.id), Some(ScreenShareState::Requested));
    }

    #[test_timeout::timeout]
    fn duplicate_request_is_busy_without_contacting_target() {
        let mut f = fixture();
        f.screen.request(&f.admin.id, &f.ann.id).unwrap();
        let _ = f.ann.drain();

        let err = f.screen.request(&f.admin.id, &f.ann.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);
        assert!(f.ann.drain().is_empty());

        f.screen.accept(&f.ann.id).unwrap();
        let err = f.screen.request(&f.admin.id, &f.ann.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);
    }

    #[test_timeout::timeout]
    fn only_the_admin_may_request() {
        let mut f = fixture();
        let err = f.screen.request(&f.bob.id, &f.ann.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
        assert!(f.ann.drain().is_empty());
        assert_eq!(f.screen.state_of(&f.ann.id), None);
    }

    #[test_timeout::timeout]
    fn active_requires_a_prior_request() {
        let mut f = fixture();
        let err = f.screen.accept(&f.ann.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert_eq!(f.screen.state_of(&f.ann.id), None);
        assert!(!sharing_flag(&f.registry, &f.ann.id));
        assert!(f.admin.drain().is_empty());

        f.screen.request(&f.admin.id, &f.ann.id).unwrap();
        let err = f.screen.accept(&f.bob.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert_eq!(f.screen.state_of(&f.bob.id), None);
    }

    #[test_timeout::timeout]
    fn accept_then_stop_by_target() {
        let mut f = fixture();
        f.screen.request(&f.admin.id, &f.ann.id).unwrap();
        let _ = f.ann.drain();

        f.screen.accept(&f.ann.id).unwrap();
        let started = ServerMessage::ScreenShareStarted { id: f.ann.id.clone() };
        assert_eq!(f.admin.drain(), vec![started.clone()]);
        assert_eq!(f.bob.drain(), vec![started.clone()]);
        assert_eq!(f.ann.drain(), vec![started]);
        assert!(sharing_flag(&f.registry, &f.ann.id));
        assert_eq!(f.screen.state_of(&f.ann.id), Some(ScreenShareState::Active));

        assert_eq!(f.screen.stop(&f.ann.id, None).unwrap(), 1);
        let stopped = ServerMessage::ScreenShareStopped { id: f.ann.id.clone() };
        assert_eq!(f.admin.drain(), vec![stopped.clone()]);
        assert_eq!(f.bob.drain(), vec![stopped]);
        assert!(!sharing_flag(&f.registry, &f.ann.id));
        assert_eq!(f.screen.state_of(&f.ann.id), None);

        let err = f.screen.stop(&f.ann.id, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[test_timeout::timeout]
    fn admin_stops_named_or_all_sessions() {
        let f = fixture();
        for user in [&f.ann.id, &f.bob.id] {
            f.screen.request(&f.admin.id, user).unwrap();
            f.screen.accept(user).unwrap();
        }
        assert_eq!(f.screen.stop(&f.admin.id, Some(f.bob.id.as_str())).unwrap(), 1);
        assert_eq!(f.screen.state_of(&f.bob.id), None);
        assert_eq!(f.screen.state_of(&f.ann.id), Some(ScreenShareState::Active));

        assert_eq!(f.screen.stop(&f.admin.id, None).unwrap(), 1);
        assert_eq!(f.screen.state_of(&f.ann.id), None);
    }

    #[test_timeout::timeout]
    fn users_cannot_stop_someone_else() {
        let f = fixture();
        f.screen.request(&f.admin.id, &f.ann.id).unwrap();
        f.screen.accept(&f.ann.id).unwrap();
        let err = f.screen.stop(&f.bob.id, Some(f.ann.id.as_str())).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
        assert_eq!(f.screen.state_of(&f.ann.id), Some(ScreenShareState::Active));
    }

    #[test_timeout::timeout]
    fn pending_request_can_not_be_stopped() {
        let f = fixture();
        f.screen.request(&f.admin.id, &f.ann.id).unwrap();
        let err = f.screen.stop(&f.admin.id, Some(f.ann.id.as_str())).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        assert_eq!(f.screen.state_of(&f.ann.id), Some(ScreenShareState::Requested));
    }

    #[test_timeout::timeout]
    fn target_departure_ends_active_session() {
        let mut f = fixture();
        f.screen.request(&f.admin.id, &f.ann.id).unwrap();
        f.screen.accept(&f.ann.id).unwrap();
        let _ = f.admin.drain();
        let _ = f.bob.drain();

        f.registry.connection_lost(&f.ann.id);
        let expected = vec![
            ServerMessage::ScreenShareStopped { id: f.ann.id.clone() },
            ServerMessage::ParticipantLeft { id: f.ann.id.clone() },
        ];
        assert_eq!(f.admin.drain(), expected);
        assert_eq!(f.bob.drain(), expected);
    }

    #[test_timeout::timeout]
    fn admin_departure_ends_pending_request() {
        let mut f = fixture();
        f.screen.request(&f.admin.id, &f.ann.id).unwrap();
        let _ = f.ann.drain();

        f.registry.leave(&f.admin.id);
        assert_eq!(
            f.ann.drain(),
            vec![
                ServerMessage::ScreenShareStopped { id: f.ann.id.clone() },
                ServerMessage::ParticipantLeft { id: f.admin.id.clone() },
            ]
        );
        assert_eq!(f.screen.state_of(&f.ann.id), None);
        let err = f.screen.accept(&f.ann.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[test_timeout::timeout]
    fn request_for_absent_target_is_absorbed() {
        let f = fixture();
        f.screen.request(&f.admin.id, "gone").unwrap();
        assert_eq!(f.screen.state_of("gone"), None);
    }
}
