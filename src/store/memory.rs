use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    MessageData, NewMessage, NewSession, ParticipantData, PlaybackState, Result, SessionData,
    SessionStore, StoreError, UserId,
};
use crate::sessions::SessionCode;

/// The reference store: everything in process memory.
///
/// Suitable for tests and single-node deployments. Durable backends
/// implement [`SessionStore`] against a real database instead.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionCode, StoredSession>>,
}

struct StoredSession {
    data: SessionData,
    /// Seats in join order
    participants: Vec<ParticipantData>,
    messages: Vec<MessageData>,
    next_message_id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_session<T>(
        &self,
        code: &SessionCode,
        f: impl FnOnce(&mut StoredSession) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self.sessions.lock();

        let session = sessions.get_mut(code).ok_or_else(|| StoreError::NotFound {
            resource: "session",
            identifier: code.to_string(),
        })?;

        f(session)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, new_session: NewSession) -> Result<SessionData> {
        let mut sessions = self.sessions.lock();

        if sessions.contains_key(&new_session.code) {
            return Err(StoreError::Conflict {
                resource: "session",
                field: "code",
                value: new_session.code.to_string(),
            });
        }

        let data = SessionData {
            code: new_session.code.clone(),
            content: new_session.content,
            host_id: new_session.host_id,
            playback: new_session.playback,
            created_at: new_session.created_at,
            expires_at: new_session.expires_at,
        };

        sessions.insert(
            new_session.code,
            StoredSession {
                data: data.clone(),
                participants: Vec::new(),
                messages: Vec::new(),
                next_message_id: 1,
            },
        );

        Ok(data)
    }

    async fn session_by_code(&self, code: &SessionCode) -> Result<SessionData> {
        self.with_session(code, |session| Ok(session.data.clone()))
    }

    async fn sessions(&self) -> Result<Vec<SessionData>> {
        let sessions = self.sessions.lock();
        Ok(sessions.values().map(|s| s.data.clone()).collect())
    }

    async fn update_playback(
        &self,
        code: &SessionCode,
        expected_version: u64,
        playback: PlaybackState,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_session(code, |session| {
            let actual = session.data.playback.version;

            if actual != expected_version {
                return Err(StoreError::VersionConflict {
                    expected: expected_version,
                    actual,
                });
            }

            session.data.playback = playback;
            session.data.expires_at = expires_at;
            Ok(())
        })
    }

    async fn update_host(&self, code: &SessionCode, host_id: &UserId) -> Result<()> {
        self.with_session(code, |session| {
            session.data.host_id = host_id.clone();
            Ok(())
        })
    }

    async fn touch_session(&self, code: &SessionCode, expires_at: DateTime<Utc>) -> Result<()> {
        self.with_session(code, |session| {
            session.data.expires_at = expires_at;
            Ok(())
        })
    }

    async fn delete_session(&self, code: &SessionCode) -> Result<()> {
        self.sessions
            .lock()
            .remove(code)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                resource: "session",
                identifier: code.to_string(),
            })
    }

    async fn expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<SessionCode>> {
        let sessions = self.sessions.lock();

        Ok(sessions
            .values()
            .filter(|s| s.data.expires_at <= now)
            .map(|s| s.data.code.clone())
            .collect())
    }

    async fn upsert_participant(
        &self,
        code: &SessionCode,
        participant: ParticipantData,
    ) -> Result<()> {
        self.with_session(code, |session| {
            let existing = session
                .participants
                .iter_mut()
                .find(|p| p.user_id() == participant.user_id());

            match existing {
                Some(seat) => *seat = participant,
                None => session.participants.push(participant),
            }

            Ok(())
        })
    }

    async fn participants(&self, code: &SessionCode) -> Result<Vec<ParticipantData>> {
        self.with_session(code, |session| Ok(session.participants.clone()))
    }

    async fn append_message(
        &self,
        code: &SessionCode,
        new_message: NewMessage,
    ) -> Result<MessageData> {
        self.with_session(code, |session| {
            let message = MessageData {
                id: session.next_message_id,
                user_id: new_message.user_id,
                body: new_message.body,
                kind: new_message.kind,
                created_at: new_message.created_at,
            };

            session.next_message_id += 1;
            session.messages.push(message.clone());

            Ok(message)
        })
    }

    async fn recent_messages(&self, code: &SessionCode, limit: usize) -> Result<Vec<MessageData>> {
        self.with_session(code, |session| {
            let start = session.messages.len().saturating_sub(limit);
            Ok(session.messages[start..].to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ContentKind, ContentRef, MessageKind};

    fn new_session(code: &SessionCode) -> NewSession {
        let now = Utc::now();

        NewSession {
            code: code.clone(),
            content: ContentRef {
                id: "tt0133093".to_string(),
                kind: ContentKind::Movie,
            },
            host_id: UserId::from("alice"),
            playback: PlaybackState::initial(now),
            created_at: now,
            expires_at: now + chrono::Duration::hours(24),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_codes() {
        let store = MemoryStore::new();
        let code = SessionCode::parse("AAAAAA").unwrap();

        store.create_session(new_session(&code)).await.unwrap();
        let err = store.create_session(new_session(&code)).await.unwrap_err();

        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_playback_cas_rejects_mismatched_version() {
        let store = MemoryStore::new();
        let code = SessionCode::parse("BBBBBB").unwrap();
        store.create_session(new_session(&code)).await.unwrap();

        let mut playback = PlaybackState::initial(Utc::now());
        playback.version = 1;
        let expires_at = Utc::now() + chrono::Duration::hours(24);

        // A write based on a version the store never saw must fail
        let err = store
            .update_playback(&code, 3, playback.clone(), expires_at)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 3,
                actual: 0
            }
        ));

        // And leaves nothing behind
        let session = store.session_by_code(&code).await.unwrap();
        assert_eq!(session.playback.version, 0);

        store
            .update_playback(&code, 0, playback, expires_at)
            .await
            .unwrap();
        let session = store.session_by_code(&code).await.unwrap();
        assert_eq!(session.playback.version, 1);
        assert_eq!(session.expires_at, expires_at);
    }

    #[tokio::test]
    async fn test_recent_messages_returns_tail_in_order() {
        let store = MemoryStore::new();
        let code = SessionCode::parse("CCCCCC").unwrap();
        store.create_session(new_session(&code)).await.unwrap();

        for i in 0..5 {
            store
                .append_message(
                    &code,
                    NewMessage {
                        user_id: UserId::from("alice"),
                        body: format!("message {}", i),
                        kind: MessageKind::Chat,
                        created_at: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        let backlog = store.recent_messages(&code, 3).await.unwrap();
        let bodies: Vec<_> = backlog.iter().map(|m| m.body.as_str()).collect();

        assert_eq!(bodies, vec!["message 2", "message 3", "message 4"]);

        // Ids are monotonic and break created_at ties
        assert!(backlog.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_expired_sessions_sweep() {
        let store = MemoryStore::new();
        let code = SessionCode::parse("DDDDDD").unwrap();

        let mut session = new_session(&code);
        session.expires_at = Utc::now() - chrono::Duration::minutes(1);
        store.create_session(session).await.unwrap();

        let expired = store.expired_sessions(Utc::now()).await.unwrap();
        assert_eq!(expired, vec![code.clone()]);

        store.delete_session(&code).await.unwrap();
        assert!(store.expired_sessions(Utc::now()).await.unwrap().is_empty());
    }
}
