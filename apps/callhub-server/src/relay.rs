//! Signal routing between participants of one room.
//!
//! The relay owns no state. Every envelope is resolved against the sender's
//! room under that room's guard and pushed straight onto the recipients'
//! outboxes, so envelopes for one sender/recipient pair keep their order and
//! interleave correctly with membership events.

use metrics::counter;
use tracing::{debug, trace};

use crate::error::{SessionError, SessionResult};
use crate::registry::RoomRegistry;
use crate::room::Room;
use crate::signaling::{Channel, SignalPayload, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Senders {
    AdminOnly,
    Anyone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    /// The room's bound admin, whatever target the client named.
    Admin,
    /// Exactly the named participant.
    RequiredTarget,
    /// The named participant, or everyone else when no target is given.
    TargetOrRoom,
}

/// Authorization and recipient resolution for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRule {
    pub senders: Senders,
    pub recipients: Recipients,
}

impl ChannelRule {
    pub fn of(channel: Channel) -> Self {
        let (senders, recipients) = match channel {
            Channel::UserAudio => (Senders::Anyone, Recipients::Admin),
            Channel::AdminAudio => (Senders::AdminOnly, Recipients::RequiredTarget),
            Channel::Camera => (Senders::AdminOnly, Recipients::TargetOrRoom),
            Channel::UserCamera => (Senders::Anyone, Recipients::Admin),
            Channel::AdminScreen => (Senders::AdminOnly, Recipients::TargetOrRoom),
            Channel::UserScreenReply => (Senders::Anyone, Recipients::Admin),
            Channel::UserScreen => (Senders::Anyone, Recipients::Admin),
            Channel::AdminScreenReply => (Senders::AdminOnly, Recipients::RequiredTarget),
        };
        Self {
            senders,
            recipients,
        }
    }
}

/// One routed signal as received from a client
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub channel: Channel,
    pub target_id: Option<String>,
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteReport {
    /// Connections the envelope was queued on. Zero is a valid outcome.
    pub delivered: usize,
}

#[derive(Clone)]
pub struct SignalRelay {
    registry: RoomRegistry,
}

impl SignalRelay {
    pub fn new(registry: RoomRegistry) -> Self {
        Self { registry }
    }

    /// Forward `envelope` from `sender_id` to the recipients its channel
    /// resolves to. Delivery is at most once with no retry; a recipient that
    /// has already left simply gets nothing.
    pub fn route(&self, sender_id: &str, envelope: SignalEnvelope) -> SessionResult<RouteReport> {
        let channel = envelope.channel;
        let result = self
            .registry
            .with_member_room(sender_id, |room| deliver(room, sender_id, envelope));

        match &result {
            Ok(report) => {
                counter!(
                    "callhub_signals_routed_total",
                    1,
                    "channel" => channel.as_str()
                );
                trace!(
                    participant_id = %sender_id,
                    channel = %channel,
                    delivered = report.delivered,
                    "signal routed"
                );
            }
            Err(err) => {
                counter!(
                    "callhub_signals_rejected_total",
                    1,
                    "channel" => channel.as_str(),
                    "reason" => err.metric_label()
                );
                debug!(
                    participant_id = %sender_id,
                    channel = %channel,
                    error = %err,
                    "signal rejected"
                );
            }
        }
        result
    }
}

fn deliver(room: &Room, sender_id: &str, envelope: SignalEnvelope) -> SessionResult<RouteReport> {
    let SignalEnvelope {
        channel,
        target_id,
        payload,
    } = envelope;
    let rule = ChannelRule::of(channel);

    if rule.senders == Senders::AdminOnly && !room.is_admin(sender_id) {
        return Err(SessionError::Unauthorized {
            action: "signal on admin channels",
        });
    }

    let target = match rule.recipients {
        Recipients::Admin => match room.admin_id() {
            Some(admin_id) => Some(admin_id.to_string()),
            None => {
                debug!(room_id = %room.id(), channel = %channel, "no admin bound, signal dropped");
                return Ok(RouteReport::default());
            }
        },
        Recipients::RequiredTarget => match target_id {
            Some(target) => Some(target),
            None => {
                return Err(SessionError::invalid(format!(
                    "channel {channel} requires a target_id"
                )))
            }
        },
        Recipients::TargetOrRoom => target_id,
    };

    let message = ServerMessage::Signal {
        channel,
        from: sender_id.to_string(),
        payload,
    };

    let delivered = match target {
        Some(target) if target == sender_id => {
            return Err(SessionError::invalid(format!(
                "channel {channel} cannot address the sender"
            )));
        }
        Some(target) => usize::from(room.send_to(&target, message)),
        None => room.broadcast_except(sender_id, &message),
    };
    Ok(RouteReport { delivered })
}
