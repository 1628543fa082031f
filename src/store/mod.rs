use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::sessions::SessionCode;

mod data;
pub use data::*;

mod memory;
pub use memory::*;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// An unknown or internal error happened with the store
    #[error("internal store error: {0}")]
    Internal(String),
    /// A record already exists
    #[error("{resource} with {field} of value {value} already exists")]
    Conflict {
        resource: &'static str,
        field: &'static str,
        value: String,
    },
    /// A record doesn't exist
    #[error("{resource}:{identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: String,
    },
    /// An optimistic write lost the compare-and-swap on `version`
    #[error("version conflict: expected {expected}, store has {actual}")]
    VersionConflict { expected: u64, actual: u64 },
}

#[derive(Debug)]
pub struct NewSession {
    pub code: SessionCode,
    pub content: ContentRef,
    pub host_id: UserId,
    pub playback: PlaybackState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewMessage {
    pub user_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

/// Represents a type that can durably keep session, seat, and message
/// records for the engine.
///
/// The store holds no engine logic. The one rule it enforces is optimistic
/// concurrency on the playback snapshot: [`SessionStore::update_playback`]
/// only succeeds when the caller's `expected_version` matches the persisted
/// one, so a crashed and restarted worker can resume from the last persisted
/// version without double-applying.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn create_session(&self, new_session: NewSession) -> Result<SessionData>;
    async fn session_by_code(&self, code: &SessionCode) -> Result<SessionData>;
    /// Every known session, for restoring workers after a restart.
    async fn sessions(&self) -> Result<Vec<SessionData>>;
    /// Persists an accepted playback mutation, compare-and-swapping on the
    /// previously persisted version. The refreshed expiry rides along so an
    /// accepted mutation is a single durable write.
    async fn update_playback(
        &self,
        code: &SessionCode,
        expected_version: u64,
        playback: PlaybackState,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn update_host(&self, code: &SessionCode, host_id: &UserId) -> Result<()>;
    /// Pushes the expiry deadline out after accepted activity.
    async fn touch_session(&self, code: &SessionCode, expires_at: DateTime<Utc>) -> Result<()>;
    async fn delete_session(&self, code: &SessionCode) -> Result<()>;
    async fn expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SessionCode>>;

    /// Inserts or replaces a seat record, keyed by user id within a session.
    async fn upsert_participant(
        &self,
        code: &SessionCode,
        participant: ParticipantData,
    ) -> Result<()>;
    async fn participants(&self, code: &SessionCode) -> Result<Vec<ParticipantData>>;

    async fn append_message(&self, code: &SessionCode, new_message: NewMessage)
        -> Result<MessageData>;
    /// The most recent messages in display order, oldest first.
    async fn recent_messages(&self, code: &SessionCode, limit: usize) -> Result<Vec<MessageData>>;
}
