use tokio::sync::mpsc;

use crate::registry::{JoinOutcome, JoinRequest, RoomRegistry};
use crate::room::Outbox;
use crate::signaling::{Role, ServerMessage};

pub(crate) fn connection() -> (Outbox, mpsc::UnboundedReceiver<ServerMessage>) {
    mpsc::unbounded_channel()
}

/// Everything queued for a connection so far
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

pub(crate) struct TestClient {
    pub id: String,
    pub rx: mpsc::UnboundedReceiver<ServerMessage>,
    pub outcome: JoinOutcome,
}

impl TestClient {
    pub(crate) fn drain(&mut self) -> Vec<ServerMessage> {
        drain(&mut self.rx)
    }
}

/// Join `room_id` and discard the join acknowledgement.
pub(crate) fn join(registry: &RoomRegistry, room_id: &str, name: &str, role: Role) -> TestClient {
    let id = crate::signaling::generate_participant_id();
    let (outbox, mut rx) = connection();
    let outcome = registry
        .join(
            &id,
            outbox,
            JoinRequest {
                room_id: room_id.into(),
                display_name: name.into(),
                role,
            },
        )
        .expect("join should succeed");
    let _ = drain(&mut rx);
    TestClient { id, rx, outcome }
}
