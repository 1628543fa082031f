use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sessions::SessionCode;

/// An opaque user identifier supplied by the external identity provider.
/// The engine never validates or authenticates it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Externally resolved identity attached to a seat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// What kind of content a session is watching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    Movie,
    Episode,
}

/// Opaque reference into the external catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRef {
    pub id: String,
    pub kind: ContentKind,
}

/// Who authored a playback mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "by", content = "user")]
pub enum UpdateOrigin {
    User(UserId),
    /// Safety pauses and host handoffs are authored by the engine itself
    System,
}

/// The authoritative playback tuple of a session.
///
/// `version` strictly increases on every accepted mutation; anything stale
/// is rejected before it can touch this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    /// Position in seconds at the moment of the last accepted mutation
    pub position: f32,
    pub is_playing: bool,
    pub rate: f32,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: UpdateOrigin,
}

impl PlaybackState {
    /// The state every session starts in: parked at zero, paused, 1x.
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            position: 0.0,
            is_playing: false,
            rate: 1.0,
            version: 0,
            updated_at: now,
            updated_by: UpdateOrigin::System,
        }
    }

    /// Where playback should be at `now`, extrapolated from the last
    /// accepted mutation. This is the drift-correction contract clients
    /// reconcile against; the engine itself never reads media time.
    pub fn expected_position(&self, now: DateTime<Utc>) -> f32 {
        if !self.is_playing {
            return self.position;
        }

        let elapsed = (now - self.updated_at).num_milliseconds().max(0) as f32 / 1000.0;
        self.position + elapsed * self.rate
    }
}

/// A watch-party session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub code: SessionCode,
    pub content: ContentRef,
    /// The single authoritative participant. Reassigned on handoff.
    pub host_id: UserId,
    pub playback: PlaybackState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A participant's role within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Host,
    Guest,
}

/// Where a seat is in its connection lifecycle.
/// `Left` is terminal; a later rejoin creates a fresh seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Left,
}

/// A seat in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantData {
    pub profile: UserProfile,
    pub role: Role,
    pub connection: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl ParticipantData {
    pub fn user_id(&self) -> &UserId {
        &self.profile.user_id
    }
}

/// Chat and system messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Chat,
    System,
}

/// A message in a session's append-only log.
/// Ordered by `created_at`, with the store-assigned `id` breaking ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub id: u64,
    pub user_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}
