//! Client-side table of peer media connections.
//!
//! At most one connection exists per (remote participant, media link). The
//! side that owns the captured source starts the link; the other side opens
//! its end lazily when the first signal arrives and answers it. Signaling is
//! non-trickle, so each side normally emits a single envelope per link.
//! Signals that arrive while the local end is still opening are queued and
//! applied once it is ready. Tear-down is idempotent.

use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

use crate::signaling::{Channel, ClientMessage, MediaLink, Role, SignalPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Initiator,
    Answerer,
}

/// Result of opening a local connection end
pub enum Opening<C> {
    /// Usable now; `local` is the description to send, if any.
    Ready {
        connection: C,
        local: Option<SignalPayload>,
    },
    /// Still gathering; finish with `PeerLinks::mark_ready`.
    Pending(C),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("media engine failed: {0}")]
pub struct MediaError(pub String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("link {link:?} with {remote_id} torn down: {source}")]
pub struct PeerLinkError {
    pub remote_id: String,
    pub link: MediaLink,
    #[source]
    pub source: MediaError,
}

/// The media layer the links drive. Payloads are opaque here.
pub trait MediaEngine {
    type Connection;

    fn open(
        &mut self,
        remote_id: &str,
        link: MediaLink,
        side: Side,
    ) -> Result<Opening<Self::Connection>, MediaError>;

    /// Apply the remote description; returns the local answer to send, if any.
    fn apply_remote(
        &mut self,
        connection: &mut Self::Connection,
        payload: &SignalPayload,
    ) -> Result<Option<SignalPayload>, MediaError>;

    fn close(&mut self, connection: Self::Connection);

    /// Hardware-facing mute of the local outbound audio track.
    fn set_microphone(&mut self, enabled: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Opening,
    Ready,
}

struct PeerLink<C> {
    connection: C,
    side: Side,
    state: LinkState,
    queued: VecDeque<SignalPayload>,
}

type LinkKey = (String, MediaLink);

pub struct PeerLinks<E: MediaEngine> {
    engine: E,
    local_role: Role,
    links: BTreeMap<LinkKey, PeerLink<E::Connection>>,
}

impl<E: MediaEngine> PeerLinks<E> {
    pub fn new(engine: E, local_role: Role) -> Self {
        Self {
            engine,
            local_role,
            links: BTreeMap::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, remote_id: &str, link: MediaLink) -> bool {
        self.links.contains_key(&key(remote_id, link))
    }

    pub fn state(&self, remote_id: &str, link: MediaLink) -> Option<LinkState> {
        self.links.get(&key(remote_id, link)).map(|l| l.state)
    }

    pub fn side(&self, remote_id: &str, link: MediaLink) -> Option<Side> {
        self.links.get(&key(remote_id, link)).map(|l| l.side)
    }

    /// Start a link as initiator. A link that already exists is left alone.
    pub fn start(
        &mut self,
        remote_id: &str,
        link: MediaLink,
    ) -> Result<Option<ClientMessage>, PeerLinkError> {
        if self.contains(remote_id, link) {
            return Ok(None);
        }
        let opening = self
            .engine
            .open(remote_id, link, Side::Initiator)
            .map_err(|source| link_error(remote_id, link, source))?;
        debug!(remote_id = %remote_id, ?link, "starting peer link");
        let local = self.insert(remote_id, link, Side::Initiator, opening);
        Ok(local.map(|payload| self.envelope(remote_id, link, payload)))
    }

    /// Feed a relayed signal into the matching link, opening it as answerer
    /// when the remote started first.
    pub fn on_signal(
        &mut self,
        from: &str,
        channel: Channel,
        payload: SignalPayload,
    ) -> Result<Vec<ClientMessage>, PeerLinkError> {
        let link = channel.media_link();
        let mut outbound = Vec::new();
        if !self.contains(from, link) {
            let opening = self
                .engine
                .open(from, link, Side::Answerer)
                .map_err(|source| link_error(from, link, source))?;
            debug!(remote_id = %from, ?link, "answering peer link");
            if let Some(local) = self.insert(from, link, Side::Answerer, opening) {
                outbound.push(self.envelope(from, link, local));
            }
        }

        let Some(entry) = self.links.get_mut(&key(from, link)) else {
            return Ok(outbound);
        };
        if entry.state == LinkState::Opening {
            entry.queued.push_back(payload);
            return Ok(outbound);
        }
        if let Some(answer) = self.apply(from, link, &payload)? {
            outbound.push(self.envelope(from, link, answer));
        }
        Ok(outbound)
    }

    /// Finish a pending open, then apply anything queued meanwhile.
    pub fn mark_ready(
        &mut self,
        remote_id: &str,
        link: MediaLink,
        local: Option<SignalPayload>,
    ) -> Result<Vec<ClientMessage>, PeerLinkError> {
        let Some(entry) = self.links.get_mut(&key(remote_id, link)) else {
            return Ok(Vec::new());
        };
        entry.state = LinkState::Ready;
        let queued = std::mem::take(&mut entry.queued);

        let mut outbound = Vec::new();
        if let Some(local) = local {
            outbound.push(self.envelope(remote_id, link, local));
        }
        for payload in queued {
            if let Some(answer) = self.apply(remote_id, link, &payload)? {
                outbound.push(self.envelope(remote_id, link, answer));
            }
        }
        Ok(outbound)
    }

    /// Close one link. Returns false when it was already gone.
    pub fn teardown(&mut self, remote_id: &str, link: MediaLink) -> bool {
        match self.links.remove(&key(remote_id, link)) {
            Some(entry) => {
                self.engine.close(entry.connection);
                debug!(remote_id = %remote_id, ?link, "peer link closed");
                true
            }
            None => false,
        }
    }

    /// Close every link with one remote participant.
    pub fn teardown_remote(&mut self, remote_id: &str) -> usize {
        let keys: Vec<_> = self
            .links
            .keys()
            .filter(|(remote, _)| remote == remote_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter(|(remote, link)| self.teardown(remote, *link))
            .count()
    }

    pub fn teardown_all(&mut self) -> usize {
        let keys: Vec<_> = self.links.keys().cloned().collect();
        keys.into_iter()
            .filter(|(remote, link)| self.teardown(remote, *link))
            .count()
    }

    /// Remote ids that currently have at least one link.
    pub fn remotes(&self) -> Vec<String> {
        let mut remotes: Vec<String> = self.links.keys().map(|(r, _)| r.clone()).collect();
        remotes.dedup();
        remotes
    }

    fn insert(
        &mut self,
        remote_id: &str,
        link: MediaLink,
        side: Side,
        opening: Opening<E::Connection>,
    ) -> Option<SignalPayload> {
        let (connection, state, local) = match opening {
            Opening::Ready { connection, local } => (connection, LinkState::Ready, local),
            Opening::Pending(connection) => (connection, LinkState::Opening, None),
        };
        self.links.insert(
            key(remote_id, link),
            PeerLink {
                connection,
                side,
                state,
                queued: VecDeque::new(),
            },
        );
        local
    }

    fn apply(
        &mut self,
        remote_id: &str,
        link: MediaLink,
        payload: &SignalPayload,
    ) -> Result<Option<SignalPayload>, PeerLinkError> {
        let Some(entry) = self.links.get_mut(&key(remote_id, link)) else {
            return Ok(None);
        };
        match self.engine.apply_remote(&mut entry.connection, payload) {
            Ok(answer) => Ok(answer),
            Err(source) => {
                warn!(remote_id = %remote_id, ?link, error = %source, "remote description rejected");
                self.teardown(remote_id, link);
                Err(link_error(remote_id, link, source))
            }
        }
    }

    /// Admins address the remote explicitly; user channels always resolve to
    /// the admin server-side.
    fn envelope(&self, remote_id: &str, link: MediaLink, payload: SignalPayload) -> ClientMessage {
        let target_id = match self.local_role {
            Role::Admin => Some(remote_id.to_string()),
            Role::User => None,
        };
        ClientMessage::Signal {
            channel: Channel::outbound(self.local_role, link),
            target_id,
            payload,
        }
    }
}

impl<E: MediaEngine> Drop for PeerLinks<E> {
    fn drop(&mut self) {
        self.teardown_all();
    }
}

fn key(remote_id: &str, link: MediaLink) -> LinkKey {
    (remote_id.to_string(), link)
}

fn link_error(remote_id: &str, link: MediaLink, source: MediaError) -> PeerLinkError {
    PeerLinkError {
        remote_id: remote_id.to_string(),
        link,
        source,
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use serde_json::json;

    /// Records every engine call; answers offers with a canned answer.
    #[derive(Default)]
    pub struct FakeEngine {
        pub pending: bool,
        pub fail_apply: bool,
        pub next_id: u32,
        pub opened: Vec<(String, MediaLink, Side)>,
        pub applied: Vec<(u32, SignalPayload)>,
        pub closed: Vec<u32>,
        pub microphone: Option<bool>,
    }

    pub fn offer(n: u32) -> SignalPayload {
        SignalPayload::new(json!({"type": "offer", "sdp": format!("offer-{n}")}))
    }

    pub fn answer(n: u32) -> SignalPayload {
        SignalPayload::new(json!({"type": "answer", "sdp": format!("answer-{n}")}))
    }

    impl MediaEngine for FakeEngine {
        type Connection = u32;

        fn open(
            &mut self,
            remote_id: &str,
            link: MediaLink,
            side: Side,
        ) -> Result<Opening<u32>, MediaError> {
            self.next_id += 1;
            self.opened.push((remote_id.to_string(), link, side));
            if self.pending {
                return Ok(Opening::Pending(self.next_id));
            }
            let local = match side {
                Side::Initiator => Some(offer(self.next_id)),
                Side::Answerer => None,
            };
            Ok(Opening::Ready {
                connection: self.next_id,
                local,
            })
        }

        fn apply_remote(
            &mut self,
            connection: &mut u32,
            payload: &SignalPayload,
        ) -> Result<Option<SignalPayload>, MediaError> {
            if self.fail_apply {
                return Err(MediaError("bad description".into()));
            }
            self.applied.push((*connection, payload.clone()));
            let is_offer = payload.as_json()["type"] == "offer";
            Ok(is_offer.then(|| answer(*connection)))
        }

        fn close(&mut self, connection: u32) {
            self.closed.push(connection);
        }

        fn set_microphone(&mut self, enabled: bool) {
            self.microphone = Some(enabled);
        }
    }
}
