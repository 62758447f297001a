use chrono::Utc;
use metrics::counter;
use tracing::debug;

use crate::error::{SessionError, SessionResult};
use crate::registry::RoomRegistry;
use crate::signaling::ServerMessage;

pub const DEFAULT_MAX_CHAT_LEN: usize = 2000;

/// Room chat. Messages are stamped server-side and go to the whole room,
/// sender included; nothing is kept after delivery.
#[derive(Clone)]
pub struct ChatRelay {
    registry: RoomRegistry,
    max_len: usize,
}

impl ChatRelay {
    pub fn new(registry: RoomRegistry, max_len: usize) -> Self {
        Self { registry, max_len }
    }

    pub fn post(&self, sender_id: &str, text: &str) -> SessionResult<usize> {
        if text.trim().is_empty() {
            return Err(SessionError::invalid("chat text must not be empty"));
        }
        if text.chars().count() > self.max_len {
            return Err(SessionError::invalid("chat text is too long"));
        }

        self.registry.with_member_room(sender_id, |room| {
            let name = room
                .participant(sender_id)
                .map(|p| p.name().to_string())
                .ok_or(SessionError::NotInRoom)?;
            let delivered = room.broadcast(&ServerMessage::ChatMessage {
                from: sender_id.to_string(),
                name,
                text: text.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            });
            counter!("callhub_chat_messages_total", 1);
            debug!(room_id = %room.id(), participant_id = %sender_id, delivered, "chat message");
            Ok(delivered)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::signaling::Role;
    use crate::test_support::join;

    #[test_timeout::timeout]
    fn chat_reaches_everyone_including_sender() {
        let registry = RoomRegistry::default();
        let chat = ChatRelay::new(registry.clone(), 16);
        let mut ann = join(&registry, "r1", "Ann", Role::User);
        let mut bob = join(&registry, "r1", "Bob", Role::User);
        let _ = ann.drain();

        assert_eq!(chat.post(&ann.id, "hello").unwrap(), 2);
        let ann_id = ann.id.clone();
        for client in [&mut ann, &mut bob] {
            match client.drain().as_slice() {
                [ServerMessage::ChatMessage {
                    from,
                    name,
                    text,
                    timestamp,
                }] => {
                    assert_eq!(name, "Ann");
                    assert_eq!(text, "hello");
                    assert!(*timestamp > 0);
                    assert_eq!(from, &ann_id);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test_timeout::timeout]
    fn empty_or_long_text_is_rejected() {
        let registry = RoomRegistry::default();
        let chat = ChatRelay::new(registry.clone(), 4);
        let mut ann = join(&registry, "r1", "Ann", Role::User);
        for text in ["", "   ", "12345"] {
            let err = chat.post(&ann.id, text).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidRequest);
        }
        assert!(ann.drain().is_empty());
        assert_eq!(chat.post("ghost", "hi").unwrap_err(), SessionError::NotInRoom);
    }
}
