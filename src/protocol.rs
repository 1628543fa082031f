use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    sessions::SessionCode,
    store::{
        ContentRef, MessageData, ParticipantData, PlaybackState, UpdateOrigin, UserId, UserProfile,
    },
};

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope named an operation this engine does not speak
    #[error("unknown op {0:?}")]
    UnknownOp(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Kinds of authoritative playback mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncEventKind {
    Play,
    Pause,
    Seek,
    RateChange,
    /// The host's player reached the end of the content
    Ended,
}

/// A playback mutation as proposed by the host's client.
///
/// `version` is host-assigned: the last version the host observed, plus
/// one. The synchronizer accepts a proposal only when this is strictly
/// greater than the session's current version, which rejects reordered
/// duplicates while tolerating gaps from lost intermediates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackProposal {
    pub kind: SyncEventKind,
    pub position: f32,
    pub rate: f32,
    pub version: u64,
}

/// An accepted playback mutation, as broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub kind: SyncEventKind,
    pub position: f32,
    pub rate: f32,
    pub version: u64,
    pub origin: UpdateOrigin,
    pub emitted_at: DateTime<Utc>,
}

/// The complete authoritative state sent to a joining or reconnecting
/// participant. Late joiners get this instead of historical events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub code: SessionCode,
    pub content: ContentRef,
    pub host_id: UserId,
    pub playback: PlaybackState,
    pub participants: Vec<ParticipantData>,
    pub captured_at: DateTime<Utc>,
}

/// An inbound frame from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    pub session_id: String,
    pub user_id: UserId,
    #[serde(flatten)]
    pub command: ClientCommand,
}

/// The closed set of operations a client may request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "op",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    Join { profile: UserProfile },
    Leave,
    UpdatePlayback { proposal: PlaybackProposal },
    SendMessage { body: String },
    Heartbeat { observed_position: Option<f32> },
    RequestHost,
}

impl ClientCommand {
    const KNOWN_OPS: &'static [&'static str] = &[
        "join",
        "leave",
        "updatePlayback",
        "sendMessage",
        "heartbeat",
        "requestHost",
    ];
}

/// Decodes an inbound frame, rejecting unknown `op` values explicitly
/// instead of silently ignoring them.
pub fn decode_client(raw: &str) -> Result<ClientEnvelope, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let op = value
        .get("op")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProtocolError::Malformed("missing op".to_string()))?;

    if !ClientCommand::KNOWN_OPS.contains(&op) {
        return Err(ProtocolError::UnknownOp(op.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// An outbound frame to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    pub session_id: SessionCode,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl ServerEnvelope {
    pub fn new(session_id: SessionCode, event: ServerEvent) -> Self {
        Self { session_id, event }
    }
}

/// The closed set of frames the engine pushes to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Full authoritative state; first frame of every subscription and the
    /// frame every client applies after a host handoff
    Snapshot(SessionSnapshot),
    /// An accepted playback mutation
    SyncEvent(SyncEvent),
    /// A chat or system message
    Message(MessageData),
    /// A seat changed
    Presence(PresenceUpdate),
    /// A rejected action, addressed to its caller
    Error(ErrorPayload),
}

/// Seat-level changes observed by everyone in the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PresenceUpdate {
    Joined { participant: ParticipantData },
    Left { user_id: UserId },
    Disconnected { user_id: UserId },
    Reconnected { participant: ParticipantData },
    /// A guest asked for the host seat; delivered to the current host
    HostRequested { requester: UserId },
    SessionEnded,
}

/// An explicit error code and message, so the calling UI can explain why
/// an action didn't apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ContentKind, Role};

    #[test]
    fn test_decode_rejects_unknown_op() {
        let raw = r#"{"sessionId": "AAAAAA", "userId": "alice", "op": "teleport", "payload": {}}"#;

        let err = decode_client(raw).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOp(op) if op == "teleport"));
    }

    #[test]
    fn test_decode_rejects_missing_op() {
        let raw = r#"{"sessionId": "AAAAAA", "userId": "alice"}"#;

        let err = decode_client(raw).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_decode_update_playback() {
        let raw = r#"{
            "sessionId": "AB12CD",
            "userId": "alice",
            "op": "updatePlayback",
            "payload": {
                "proposal": {"kind": "seek", "position": 50.0, "rate": 1.0, "version": 3}
            }
        }"#;

        let envelope = decode_client(raw).unwrap();

        assert_eq!(envelope.session_id, "AB12CD");
        assert_eq!(envelope.user_id, UserId::from("alice"));
        assert!(matches!(
            envelope.command,
            ClientCommand::UpdatePlayback { proposal } if proposal.version == 3
        ));
    }

    #[test]
    fn test_server_envelope_wire_shape() {
        let now = Utc::now();
        let code = SessionCode::parse("AB12CD").unwrap();

        let envelope = ServerEnvelope::new(
            code,
            ServerEvent::SyncEvent(SyncEvent {
                kind: SyncEventKind::Play,
                position: 0.0,
                rate: 1.0,
                version: 1,
                origin: UpdateOrigin::User(UserId::from("alice")),
                emitted_at: now,
            }),
        );

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["sessionId"], "AB12CD");
        assert_eq!(json["op"], "syncEvent");
        assert_eq!(json["payload"]["kind"], "play");

        let parsed: ServerEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_presence_roundtrip() {
        let now = Utc::now();
        let participant = ParticipantData {
            profile: UserProfile {
                user_id: UserId::from("bob"),
                display_name: "Bob".to_string(),
                avatar_url: None,
            },
            role: Role::Guest,
            connection: crate::store::ConnectionState::Connected,
            connected_at: now,
            last_heartbeat_at: now,
        };

        let event = ServerEvent::Presence(PresenceUpdate::Joined { participant });
        let json = serde_json::to_string(&event).unwrap();
        let parsed: ServerEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, event);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let now = Utc::now();
        let code = SessionCode::parse("XY34ZW").unwrap();

        let snapshot = SessionSnapshot {
            code: code.clone(),
            content: ContentRef {
                id: "tt0133093".to_string(),
                kind: ContentKind::Movie,
            },
            host_id: UserId::from("alice"),
            playback: PlaybackState::initial(now),
            participants: Vec::new(),
            captured_at: now,
        };

        let envelope = ServerEnvelope::new(code, ServerEvent::Snapshot(snapshot));
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: ServerEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, envelope);
    }
}
