use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::{sync::oneshot, time::timeout};

use crate::{
    broadcast::Subscription,
    events::{EngineEvent, Recipients},
    presence::{select_successor, HeartbeatOutcome},
    protocol::{
        ErrorPayload, PlaybackProposal, ServerEnvelope, ServerEvent, SessionSnapshot, SyncEvent,
    },
    store::{
        ConnectionState, ContentRef, MessageData, NewSession, ParticipantData, PlaybackState,
        SessionData, SessionStore, StoreError, UserId, UserProfile,
    },
    MatineeContext,
};

mod code;
mod playback;
mod session;

pub use code::*;
pub use playback::*;
pub use session::*;

/// Everything that can go wrong with a session operation. Each variant
/// maps to a stable wire code so clients can explain rejections.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("No session with that code exists")]
    SessionNotFound,
    #[error("The session has expired")]
    SessionExpired,
    #[error("Could not generate a unique session code")]
    CodeGenerationExhausted,
    #[error("Only the host may change playback")]
    NotHost,
    #[error("Stale update: version {proposed} is not ahead of {current}")]
    StaleUpdate { proposed: u64, current: u64 },
    #[error("Invalid event: {0}")]
    InvalidEvent(&'static str),
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),
    #[error("The session is too busy to take the request")]
    SessionBusy,
    #[error("The session did not answer in time")]
    Timeout,
    #[error("The session is full")]
    ParticipantLimitExceeded,
    #[error("The user has no seat in this session")]
    NotInSession,
    #[error("Internal engine error")]
    Internal,
}

impl SessionError {
    /// The stable code carried by outbound error envelopes.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "session-not-found",
            Self::SessionExpired => "session-expired",
            Self::CodeGenerationExhausted => "code-generation-exhausted",
            Self::NotHost => "not-host",
            Self::StaleUpdate { .. } => "stale-update",
            Self::InvalidEvent(_) => "invalid-event",
            Self::InvalidMessage(_) => "invalid-message",
            Self::SessionBusy => "session-busy",
            Self::Timeout => "timeout",
            Self::ParticipantLimitExceeded => "participant-limit-exceeded",
            Self::NotInSession => "not-in-session",
            Self::Internal => "internal",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.wire_code().to_string(),
            message: self.to_string(),
        }
    }

    fn from_store(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { .. } => Self::SessionNotFound,
            _ => Self::Internal,
        }
    }
}

impl From<SyncRejection> for SessionError {
    fn from(value: SyncRejection) -> Self {
        match value {
            SyncRejection::NotHost => Self::NotHost,
            SyncRejection::Stale { proposed, current } => Self::StaleUpdate { proposed, current },
            SyncRejection::Invalid(reason) => Self::InvalidEvent(reason),
        }
    }
}

/// The public face of the engine: creates sessions, routes calls onto the
/// owning session workers, and runs the background sweeps.
pub struct SessionManager<S> {
    context: MatineeContext<S>,
}

impl<S> SessionManager<S>
where
    S: SessionStore,
{
    pub fn new(context: &MatineeContext<S>) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Respawns workers for persisted sessions on init, so a restarted
    /// engine resumes from the last persisted versions.
    pub async fn restore(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        let sessions = self.context.store.sessions().await?;
        let mut restored = 0;

        for data in sessions {
            // Expired leftovers are collected by the sweep instead
            if data.expires_at <= now {
                continue;
            }

            self.context.presence.register_session(&data.code);
            let handle = SessionWorker::spawn(&self.context, data.clone());
            self.context.sessions.insert(data.code.clone(), handle);
            restored += 1;
        }

        if restored > 0 {
            info!("Restored {} sessions from the store", restored);
        }

        Ok(())
    }

    /// Creates a session for the given content, seating the creator as
    /// host. The code is regenerated on collision a bounded number of
    /// times.
    pub async fn create_session(
        &self,
        content: ContentRef,
        creator: UserProfile,
    ) -> Result<SessionData, SessionError> {
        let now = Utc::now();
        let mut created = None;

        for _ in 0..self.context.config.code_attempts {
            let code = SessionCode::generate();

            let new_session = NewSession {
                code: code.clone(),
                content: content.clone(),
                host_id: creator.user_id.clone(),
                playback: PlaybackState::initial(now),
                created_at: now,
                expires_at: now + self.context.config.session_ttl,
            };

            match self.context.store.create_session(new_session).await {
                Ok(data) => {
                    created = Some(data);
                    break;
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!("Session code {} collided, generating another", code);
                    continue;
                }
                Err(e) => {
                    warn!("Creating a session failed: {}", e);
                    return Err(SessionError::Internal);
                }
            }
        }

        let data = created.ok_or(SessionError::CodeGenerationExhausted)?;

        // Display metadata is nice to have, never load-bearing
        match self.context.catalog.content_meta(&content).await {
            Ok(meta) => info!(
                "Session {} created by {}, watching {}",
                data.code, creator.user_id, meta.title
            ),
            Err(e) => {
                info!("Session {} created by {}", data.code, creator.user_id);
                debug!("No content metadata for session {}: {}", data.code, e);
            }
        }

        self.context.presence.register_session(&data.code);
        let handle = SessionWorker::spawn(&self.context, data.clone());
        self.context.sessions.insert(data.code.clone(), handle.clone());

        // Seat the creator through the normal join path
        let outcome = self
            .dispatch(&handle, |reply| SessionCommand::Join {
                profile: creator,
                reply,
            })
            .await?;

        Ok(outcome.session)
    }

    /// Joins a session by code, returning the current snapshot and recent
    /// chat backlog. Joining while already seated is idempotent.
    pub async fn join_session(
        &self,
        code: &str,
        profile: UserProfile,
    ) -> Result<JoinOutcome, SessionError> {
        let handle = self.resolve(code)?;

        self.dispatch(&handle, |reply| SessionCommand::Join { profile, reply })
            .await
    }

    /// Releases a seat for good. A departing host triggers handoff.
    pub async fn leave_session(&self, code: &str, user_id: &UserId) -> Result<(), SessionError> {
        let handle = self.resolve(code)?;
        let user_id = user_id.clone();

        self.dispatch(&handle, |reply| SessionCommand::Leave { user_id, reply })
            .await
    }

    /// Proposes a playback mutation. Accepted only from the current host;
    /// the accepted event is broadcast to every subscriber.
    pub async fn update_playback(
        &self,
        code: &str,
        user_id: &UserId,
        proposal: PlaybackProposal,
    ) -> Result<SyncEvent, SessionError> {
        let handle = self.resolve(code)?;
        let user_id = user_id.clone();

        self.dispatch(&handle, |reply| SessionCommand::UpdatePlayback {
            user_id,
            proposal,
            reply,
        })
        .await
    }

    /// Asks for the host seat. Auto-granted only when the current host has
    /// been gone past the grace period.
    pub async fn request_host(
        &self,
        code: &str,
        user_id: &UserId,
    ) -> Result<HostRequestOutcome, SessionError> {
        let handle = self.resolve(code)?;
        let user_id = user_id.clone();

        self.dispatch(&handle, |reply| SessionCommand::RequestHost { user_id, reply })
            .await
    }

    /// Appends a chat message and broadcasts it.
    pub async fn send_message(
        &self,
        code: &str,
        user_id: &UserId,
        body: &str,
    ) -> Result<MessageData, SessionError> {
        let handle = self.resolve(code)?;
        let user_id = user_id.clone();
        let body = body.to_string();

        self.dispatch(&handle, |reply| SessionCommand::SendMessage {
            user_id,
            body,
            reply,
        })
        .await
    }

    /// Refreshes a seat's liveness. Never moves playback state; the
    /// observed position is a drift hint for logs only.
    pub async fn heartbeat(
        &self,
        code: &str,
        user_id: &UserId,
        observed_position: Option<f32>,
    ) -> Result<(), SessionError> {
        let handle = self.resolve(code)?;
        let code = &handle.code;

        let outcome = self
            .context
            .presence
            .heartbeat(code, user_id, Utc::now())
            .ok_or(SessionError::NotInSession)?;

        if let Some(position) = observed_position {
            debug!(
                "User {} observes {:.1}s locally in session {}",
                user_id, position, code
            );
        }

        if let HeartbeatOutcome::Reconnected(seat) = outcome {
            self.persist_seat(code, &seat).await;
            self.context.emit(
                EngineEvent::ParticipantReconnected {
                    code: code.clone(),
                    participant: seat,
                },
                Recipients::All,
            );
        }

        Ok(())
    }

    /// Opens the outbound frame stream for a seated participant. The first
    /// frame is always the current authoritative snapshot.
    pub async fn subscribe(
        &self,
        code: &str,
        user_id: &UserId,
    ) -> Result<Subscription, SessionError> {
        let handle = self.resolve(code)?;
        let code = &handle.code;

        let seat = self
            .context
            .presence
            .mark_connected(code, user_id, Utc::now())
            .ok_or(SessionError::NotInSession)?;

        self.persist_seat(code, &seat).await;

        // Serve the snapshot from the latest persisted copy; a few
        // milliseconds of staleness is within the drift tolerance
        let session = self
            .context
            .store
            .session_by_code(code)
            .await
            .map_err(SessionError::from_store)?;

        let snapshot = SessionSnapshot {
            code: code.clone(),
            content: session.content,
            host_id: session.host_id,
            playback: session.playback,
            participants: self.context.presence.seats(code),
            captured_at: Utc::now(),
        };

        Ok(self.context.broadcast.subscribe(
            code,
            user_id,
            ServerEnvelope::new(code.clone(), ServerEvent::Snapshot(snapshot)),
        ))
    }

    /// The latest persisted session record, served without touching the
    /// worker.
    pub async fn session(&self, code: &str) -> Result<SessionData, SessionError> {
        let handle = self.resolve(code)?;

        self.context
            .store
            .session_by_code(&handle.code)
            .await
            .map_err(SessionError::from_store)
    }

    /// Current seats of a session, in join order.
    pub fn participants(&self, code: &str) -> Result<Vec<ParticipantData>, SessionError> {
        let handle = self.resolve(code)?;

        Ok(self.context.presence.seats(&handle.code))
    }

    /// Ends a session explicitly, dropping its worker and durable record.
    pub async fn end_session(&self, code: &str) -> Result<(), SessionError> {
        let handle = self.resolve(code)?;
        let code = handle.code.clone();

        info!("Session {} ended explicitly", code);
        self.end(&code).await.map_err(SessionError::from_store)
    }

    /// One liveness pass over every active session: flips silent seats,
    /// releases seats past the grace window, and signals host timeouts.
    pub(crate) async fn sweep_presence(&self) {
        let now = Utc::now();
        let handles: Vec<_> = self
            .context
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for handle in handles {
            let code = &handle.code;
            let report = self.context.presence.sweep_session(code, now);

            for seat in &report.newly_disconnected {
                self.persist_seat(code, seat).await;
                self.context.emit(
                    EngineEvent::ParticipantDisconnected {
                        code: code.clone(),
                        user_id: seat.user_id().clone(),
                    },
                    Recipients::All,
                );
            }

            for seat in &report.released {
                self.persist_seat(code, seat).await;
                self.context.emit(
                    EngineEvent::ParticipantLeft {
                        code: code.clone(),
                        user_id: seat.user_id().clone(),
                    },
                    Recipients::All,
                );
            }

            self.signal_host_timeout(&handle, now).await;
        }
    }

    /// One pass collecting sessions past their expiry deadline.
    pub(crate) async fn sweep_expired(&self) {
        let expired = match self.context.store.expired_sessions(Utc::now()).await {
            Ok(expired) => expired,
            Err(e) => {
                warn!("Listing expired sessions failed: {}", e);
                return;
            }
        };

        for code in expired {
            info!("Session {} expired, ending it", code);

            if let Err(e) = self.end(&code).await {
                warn!("Ending expired session {} failed: {}", code, e);
            }
        }
    }

    async fn signal_host_timeout(&self, handle: &SessionHandle, now: chrono::DateTime<Utc>) {
        let code = &handle.code;

        let Ok(session) = self.context.store.session_by_code(code).await else {
            return;
        };

        let Some(silence) = self.context.presence.silence(code, &session.host_id, now) else {
            return;
        };

        let host_timeout =
            chrono::Duration::from_std(self.context.config.host_timeout).expect("fits in range");

        if silence <= host_timeout {
            return;
        }

        let host_seat = self.context.presence.seat(code, &session.host_id);
        let host_gone = host_seat
            .map(|s| s.connection != ConnectionState::Connected)
            .unwrap_or(true);

        if !host_gone {
            return;
        }

        // Only poke the worker when there is something for it to do:
        // playback to freeze, or a guest to promote
        let seats = self.context.presence.seats(code);
        let has_successor = select_successor(&seats).is_some();

        if session.playback.is_playing || has_successor {
            let _ = handle.try_send(SessionCommand::HostSilent {
                host_id: session.host_id,
            });
        }
    }

    async fn end(&self, code: &SessionCode) -> Result<(), StoreError> {
        if let Some((_, handle)) = self.context.sessions.remove(code) {
            let _ = handle.try_send(SessionCommand::End);
        }

        self.context.presence.drop_session(code);
        self.context.emit(
            EngineEvent::SessionEnded { code: code.clone() },
            Recipients::All,
        );

        self.context.store.delete_session(code).await
    }

    async fn persist_seat(&self, code: &SessionCode, seat: &ParticipantData) {
        if let Err(e) = self
            .context
            .store
            .upsert_participant(code, seat.clone())
            .await
        {
            warn!(
                "Persisting seat {} in session {} failed: {}",
                seat.user_id(),
                code,
                e
            );
        }
    }

    fn resolve(&self, input: &str) -> Result<Arc<SessionHandle>, SessionError> {
        let code = SessionCode::parse(input).ok_or(SessionError::SessionNotFound)?;

        self.context
            .sessions
            .get(&code)
            .map(|handle| handle.clone())
            .ok_or(SessionError::SessionNotFound)
    }

    /// Queues a command onto the owning worker and waits for its reply,
    /// bounded by the request deadline. The engine never retries on the
    /// caller's behalf.
    async fn dispatch<T>(
        &self,
        handle: &SessionHandle,
        build: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (sender, receiver) = oneshot::channel();
        handle.try_send(build(sender))?;

        match timeout(self.context.config.request_deadline, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Internal),
            Err(_) => Err(SessionError::Timeout),
        }
    }
}

impl<S> Clone for SessionManager<S>
where
    S: SessionStore,
{
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_map_to_stable_wire_codes() {
        let cases = [
            (SessionError::SessionNotFound, "session-not-found"),
            (SessionError::NotHost, "not-host"),
            (
                SessionError::StaleUpdate {
                    proposed: 2,
                    current: 3,
                },
                "stale-update",
            ),
            (SessionError::InvalidEvent("bad rate"), "invalid-event"),
            (SessionError::SessionBusy, "session-busy"),
            (SessionError::Timeout, "timeout"),
        ];

        for (error, code) in cases {
            let payload = error.to_payload();
            assert_eq!(payload.code, code);
            assert!(!payload.message.is_empty());
        }
    }

    #[test]
    fn test_rejections_convert_losslessly() {
        let error: SessionError = SyncRejection::Stale {
            proposed: 1,
            current: 5,
        }
        .into();

        assert_eq!(
            error,
            SessionError::StaleUpdate {
                proposed: 1,
                current: 5
            }
        );
    }
}
