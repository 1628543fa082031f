use crossbeam::channel::{Receiver, Sender};

use crate::{
    protocol::{PresenceUpdate, ServerEvent, SessionSnapshot, SyncEvent},
    sessions::SessionCode,
    store::{MessageData, ParticipantData, UserId},
};

pub type EventSender = Sender<(EngineEvent, Recipients)>;
pub type EventReceiver = Receiver<(EngineEvent, Recipients)>;

/// Which subscribers of a session a broadcast is addressed to
#[derive(Debug, Clone)]
pub enum Recipients {
    All,
    Some(Vec<UserId>),
}

impl Recipients {
    pub fn includes(&self, user_id: &UserId) -> bool {
        match self {
            Self::All => true,
            Self::Some(ids) => ids.contains(user_id),
        }
    }
}

/// Events emitted by session workers and the presence sweep.
///
/// Everything here was produced inside a session's single-writer critical
/// section and funnels through one channel with one consumer, so every
/// subscriber of a session observes the same order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An accepted playback mutation
    PlaybackChanged {
        code: SessionCode,
        event: SyncEvent,
    },
    /// The host seat moved; clients re-apply the full snapshot so the
    /// transfer is observed identically everywhere
    HostChanged {
        code: SessionCode,
        snapshot: SessionSnapshot,
    },
    /// A chat or system message was appended
    MessageSent {
        code: SessionCode,
        message: MessageData,
    },
    ParticipantJoined {
        code: SessionCode,
        participant: ParticipantData,
    },
    ParticipantReconnected {
        code: SessionCode,
        participant: ParticipantData,
    },
    ParticipantDisconnected {
        code: SessionCode,
        user_id: UserId,
    },
    ParticipantLeft {
        code: SessionCode,
        user_id: UserId,
    },
    /// A guest asked for the host seat while the host was still around
    HostRequested {
        code: SessionCode,
        requester: UserId,
    },
    SessionEnded {
        code: SessionCode,
    },
}

impl EngineEvent {
    pub fn code(&self) -> &SessionCode {
        match self {
            Self::PlaybackChanged { code, .. }
            | Self::HostChanged { code, .. }
            | Self::MessageSent { code, .. }
            | Self::ParticipantJoined { code, .. }
            | Self::ParticipantReconnected { code, .. }
            | Self::ParticipantDisconnected { code, .. }
            | Self::ParticipantLeft { code, .. }
            | Self::HostRequested { code, .. }
            | Self::SessionEnded { code } => code,
        }
    }
}

impl From<EngineEvent> for ServerEvent {
    fn from(value: EngineEvent) -> Self {
        match value {
            EngineEvent::PlaybackChanged { event, .. } => Self::SyncEvent(event),
            EngineEvent::HostChanged { snapshot, .. } => Self::Snapshot(snapshot),
            EngineEvent::MessageSent { message, .. } => Self::Message(message),
            EngineEvent::ParticipantJoined { participant, .. } => {
                Self::Presence(PresenceUpdate::Joined { participant })
            }
            EngineEvent::ParticipantReconnected { participant, .. } => {
                Self::Presence(PresenceUpdate::Reconnected { participant })
            }
            EngineEvent::ParticipantDisconnected { user_id, .. } => {
                Self::Presence(PresenceUpdate::Disconnected { user_id })
            }
            EngineEvent::ParticipantLeft { user_id, .. } => {
                Self::Presence(PresenceUpdate::Left { user_id })
            }
            EngineEvent::HostRequested { requester, .. } => {
                Self::Presence(PresenceUpdate::HostRequested { requester })
            }
            EngineEvent::SessionEnded { .. } => Self::Presence(PresenceUpdate::SessionEnded),
        }
    }
}
