use std::{sync::Arc, time::Duration};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::{
    spawn,
    sync::{mpsc, oneshot},
    time::sleep,
};

use crate::{
    events::{EngineEvent, Recipients},
    presence::{select_successor, PresenceError, SeatOutcome},
    protocol::{PlaybackProposal, SessionSnapshot, SyncEvent},
    store::{
        ConnectionState, MessageData, MessageKind, NewMessage, ParticipantData, PlaybackState,
        Role, SessionData, SessionStore, StoreError, UserId, UserProfile,
    },
    MatineeContext,
};

use super::{PlaybackSynchronizer, SessionCode, SessionError};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// What a participant receives when a join is accepted
#[derive(Debug)]
pub struct JoinOutcome {
    pub session: SessionData,
    pub participants: Vec<ParticipantData>,
    /// The most recent chat messages, oldest first, for immediate context
    pub backlog: Vec<MessageData>,
}

/// How a host request resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRequestOutcome {
    /// The requester is the host now
    Granted,
    /// The current host is still around; they were notified and can grant
    /// the request themselves
    Pending,
}

/// The messages a session worker processes, one at a time.
pub enum SessionCommand {
    Join {
        profile: UserProfile,
        reply: Reply<JoinOutcome>,
    },
    Leave {
        user_id: UserId,
        reply: Reply<()>,
    },
    UpdatePlayback {
        user_id: UserId,
        proposal: PlaybackProposal,
        reply: Reply<SyncEvent>,
    },
    RequestHost {
        user_id: UserId,
        reply: Reply<HostRequestOutcome>,
    },
    SendMessage {
        user_id: UserId,
        body: String,
        reply: Reply<MessageData>,
    },
    /// The presence sweep saw the host silent past the timeout
    HostSilent { host_id: UserId },
    End,
}

/// A cheap handle used to queue commands onto a session's worker.
pub struct SessionHandle {
    pub code: SessionCode,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Queues a command without waiting. A full queue means the session is
    /// overloaded and the caller should not pile on.
    pub fn try_send(&self, command: SessionCommand) -> Result<(), SessionError> {
        use mpsc::error::TrySendError;

        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::SessionBusy,
            TrySendError::Closed(_) => SessionError::SessionNotFound,
        })
    }
}

/// The owner of one session's mutable state.
///
/// Every mutation is serialized through this worker's command queue, so
/// there is one logical writer per session and no shared-memory locking on
/// the playback tuple.
pub struct SessionWorker<S> {
    context: MatineeContext<S>,
    data: SessionData,
    synchronizer: PlaybackSynchronizer,
    /// Rollback anchor: the last state the store confirmed
    persisted: PlaybackState,
    commands: mpsc::Receiver<SessionCommand>,
}

impl<S> SessionWorker<S>
where
    S: SessionStore,
{
    const PERSIST_ATTEMPTS: u32 = 3;

    /// Spawns the worker task for a session and returns its handle.
    pub fn spawn(context: &MatineeContext<S>, data: SessionData) -> Arc<SessionHandle> {
        let (sender, receiver) = mpsc::channel(context.config.command_queue_depth);

        let handle = Arc::new(SessionHandle {
            code: data.code.clone(),
            commands: sender,
        });

        let worker = Self {
            context: context.clone(),
            synchronizer: PlaybackSynchronizer::new(data.playback.clone()),
            persisted: data.playback.clone(),
            data,
            commands: receiver,
        };

        spawn(worker.run());

        handle
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                SessionCommand::Join { profile, reply } => {
                    let _ = reply.send(self.handle_join(profile).await);
                }
                SessionCommand::Leave { user_id, reply } => {
                    let _ = reply.send(self.handle_leave(user_id).await);
                }
                SessionCommand::UpdatePlayback {
                    user_id,
                    proposal,
                    reply,
                } => {
                    let _ = reply.send(self.handle_update(user_id, proposal).await);
                }
                SessionCommand::RequestHost { user_id, reply } => {
                    let _ = reply.send(self.handle_request_host(user_id).await);
                }
                SessionCommand::SendMessage {
                    user_id,
                    body,
                    reply,
                } => {
                    let _ = reply.send(self.handle_send_message(user_id, body).await);
                }
                SessionCommand::HostSilent { host_id } => {
                    self.handle_host_silent(host_id).await;
                }
                SessionCommand::End => break,
            }
        }

        debug!("Worker for session {} stopped", self.data.code);
    }

    async fn handle_join(&mut self, profile: UserProfile) -> Result<JoinOutcome, SessionError> {
        if Utc::now() > self.data.expires_at {
            return Err(SessionError::SessionExpired);
        }

        let user_id = profile.user_id.clone();
        let role = if user_id == self.data.host_id {
            Role::Host
        } else {
            Role::Guest
        };

        let outcome = self
            .context
            .presence
            .join(&self.data.code, profile, role, Utc::now())
            .map_err(|e| match e {
                PresenceError::Full => SessionError::ParticipantLimitExceeded,
                PresenceError::NotSeated => SessionError::NotInSession,
            })?;

        self.persist_seat(outcome.participant()).await;

        match &outcome {
            SeatOutcome::Joined(participant) => self.emit(
                EngineEvent::ParticipantJoined {
                    code: self.data.code.clone(),
                    participant: participant.clone(),
                },
                Recipients::All,
            ),
            SeatOutcome::Reconnected(participant) => self.emit(
                EngineEvent::ParticipantReconnected {
                    code: self.data.code.clone(),
                    participant: participant.clone(),
                },
                Recipients::All,
            ),
            // An idempotent rejoin changes nothing worth announcing
            SeatOutcome::AlreadySeated(_) => {}
        }

        // A parked, host-less session seats the first arrival as host
        if user_id != self.data.host_id && self.host_seat_released() {
            self.transfer_host(&user_id).await?;
        }

        let backlog = self
            .context
            .store
            .recent_messages(&self.data.code, self.context.config.message_backlog)
            .await
            .unwrap_or_else(|e| {
                warn!("Fetching backlog for session {} failed: {}", self.data.code, e);
                Vec::new()
            });

        self.touch_expiry().await;

        Ok(JoinOutcome {
            session: self.data.clone(),
            participants: self.context.presence.seats(&self.data.code),
            backlog,
        })
    }

    async fn handle_leave(&mut self, user_id: UserId) -> Result<(), SessionError> {
        let seat = self
            .context
            .presence
            .mark_left(&self.data.code, &user_id)
            .ok_or(SessionError::NotInSession)?;

        self.persist_seat(&seat).await;

        info!("User {} left session {}", user_id, self.data.code);
        self.emit(
            EngineEvent::ParticipantLeft {
                code: self.data.code.clone(),
                user_id: user_id.clone(),
            },
            Recipients::All,
        );

        if user_id == self.data.host_id {
            self.hand_off().await?;
        }

        Ok(())
    }

    async fn handle_update(
        &mut self,
        user_id: UserId,
        proposal: PlaybackProposal,
    ) -> Result<SyncEvent, SessionError> {
        let event = self
            .synchronizer
            .apply(&self.data.host_id, &user_id, &proposal, Utc::now())?;

        self.persist_playback().await?;
        self.synchronizer.settle();

        self.emit(
            EngineEvent::PlaybackChanged {
                code: self.data.code.clone(),
                event: event.clone(),
            },
            Recipients::All,
        );

        Ok(event)
    }

    async fn handle_request_host(
        &mut self,
        user_id: UserId,
    ) -> Result<HostRequestOutcome, SessionError> {
        let requester = self
            .context
            .presence
            .seat(&self.data.code, &user_id)
            .filter(|s| s.connection == ConnectionState::Connected)
            .ok_or(SessionError::NotInSession)?;

        if user_id == self.data.host_id {
            return Ok(HostRequestOutcome::Granted);
        }

        if self.host_is_reclaimable() {
            info!(
                "Granting host of session {} to {} after host absence",
                self.data.code, user_id
            );
            self.transfer_host(requester.user_id()).await?;
            return Ok(HostRequestOutcome::Granted);
        }

        // The host is still around; surface the request and let their UI
        // decide
        self.emit(
            EngineEvent::HostRequested {
                code: self.data.code.clone(),
                requester: user_id,
            },
            Recipients::Some(vec![self.data.host_id.clone()]),
        );

        Ok(HostRequestOutcome::Pending)
    }

    async fn handle_send_message(
        &mut self,
        user_id: UserId,
        body: String,
    ) -> Result<MessageData, SessionError> {
        if body.trim().is_empty() {
            return Err(SessionError::InvalidMessage("message body is empty"));
        }

        if body.chars().count() > self.context.config.max_message_length {
            return Err(SessionError::InvalidMessage("message body is too long"));
        }

        self.context
            .presence
            .seat(&self.data.code, &user_id)
            .ok_or(SessionError::NotInSession)?;

        let message = self
            .context
            .store
            .append_message(
                &self.data.code,
                NewMessage {
                    user_id,
                    body,
                    kind: MessageKind::Chat,
                    created_at: Utc::now(),
                },
            )
            .await
            .map_err(|e| {
                warn!("Appending message to session {} failed: {}", self.data.code, e);
                SessionError::Internal
            })?;

        self.touch_expiry().await;

        self.emit(
            EngineEvent::MessageSent {
                code: self.data.code.clone(),
                message: message.clone(),
            },
            Recipients::All,
        );

        Ok(message)
    }

    async fn handle_host_silent(&mut self, host_id: UserId) {
        // A handoff may have already happened by the time this arrives
        if host_id != self.data.host_id {
            return;
        }

        let Some(silence) = self
            .context
            .presence
            .silence(&self.data.code, &host_id, Utc::now())
        else {
            return;
        };

        let timeout =
            chrono::Duration::from_std(self.context.config.host_timeout).expect("fits in range");

        // The host may have come back between the sweep and this command
        if silence < timeout {
            return;
        }

        info!(
            "Host {} of session {} went silent, pausing and starting handoff",
            host_id, self.data.code
        );

        if let Some(event) = self.synchronizer.freeze(Utc::now()) {
            if self.persist_playback().await.is_ok() {
                self.emit(
                    EngineEvent::PlaybackChanged {
                        code: self.data.code.clone(),
                        event,
                    },
                    Recipients::All,
                );
            }
        }

        if let Err(e) = self.hand_off().await {
            warn!("Handoff for session {} failed: {}", self.data.code, e);
        }
    }

    /// Reassigns the host seat after the current host left or timed out.
    async fn hand_off(&mut self) -> Result<(), SessionError> {
        let seats = self.context.presence.seats(&self.data.code);

        match select_successor(&seats) {
            Some(successor) => {
                let successor = successor.user_id().clone();
                self.transfer_host(&successor).await
            }
            None => self.park().await,
        }
    }

    /// No connected guest can take over: freeze playback and wait for
    /// someone to come back.
    async fn park(&mut self) -> Result<(), SessionError> {
        if let Some(event) = self.synchronizer.freeze(Utc::now()) {
            self.persist_playback().await?;
            self.emit(
                EngineEvent::PlaybackChanged {
                    code: self.data.code.clone(),
                    event,
                },
                Recipients::All,
            );
        }

        info!(
            "Session {} has no connected guests, parked without a host",
            self.data.code
        );

        Ok(())
    }

    async fn transfer_host(&mut self, successor: &UserId) -> Result<(), SessionError> {
        let previous = self.data.host_id.clone();

        // The transfer is an ordered, system-authored mutation
        self.synchronizer.bump_for_handoff(Utc::now());
        self.persist_playback().await?;

        self.context
            .store
            .update_host(&self.data.code, successor)
            .await
            .map_err(|e| {
                warn!("Persisting host of session {} failed: {}", self.data.code, e);
                SessionError::Internal
            })?;

        // Demote before promoting so there is never a second host
        if let Some(seat) = self
            .context
            .presence
            .set_role(&self.data.code, &previous, Role::Guest)
        {
            self.persist_seat(&seat).await;
        }

        if let Some(seat) = self
            .context
            .presence
            .set_role(&self.data.code, successor, Role::Host)
        {
            self.persist_seat(&seat).await;
        }

        self.data.host_id = successor.clone();

        info!(
            "Host of session {} transferred from {} to {}",
            self.data.code, previous, successor
        );

        self.emit(
            EngineEvent::HostChanged {
                code: self.data.code.clone(),
                snapshot: self.snapshot(),
            },
            Recipients::All,
        );

        Ok(())
    }

    /// Persists the synchronizer's state, retrying transient store errors.
    /// If the store cannot confirm the write, in-memory state rolls back to
    /// the last persisted version so the two never diverge.
    async fn persist_playback(&mut self) -> Result<(), SessionError> {
        let playback = self.synchronizer.playback().clone();
        let expires_at = Utc::now() + self.context.config.session_ttl;
        let expected = self.persisted.version;

        for attempt in 1..=Self::PERSIST_ATTEMPTS {
            let result = self
                .context
                .store
                .update_playback(&self.data.code, expected, playback.clone(), expires_at)
                .await;

            match result {
                Ok(()) => {
                    self.persisted = playback.clone();
                    self.data.playback = playback;
                    self.data.expires_at = expires_at;
                    return Ok(());
                }
                // This worker is the only writer; a CAS conflict means the
                // store diverged and retrying would double-apply
                Err(StoreError::VersionConflict { expected, actual }) => {
                    warn!(
                        "Persist for session {} lost the version race ({} vs {})",
                        self.data.code, expected, actual
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        "Persisting session {} failed on attempt {}: {}",
                        self.data.code, attempt, e
                    );

                    if attempt < Self::PERSIST_ATTEMPTS {
                        sleep(Duration::from_millis(50 * attempt as u64)).await;
                    }
                }
            }
        }

        self.synchronizer.rollback(self.persisted.clone());
        Err(SessionError::Internal)
    }

    async fn persist_seat(&self, seat: &ParticipantData) {
        if let Err(e) = self
            .context
            .store
            .upsert_participant(&self.data.code, seat.clone())
            .await
        {
            warn!(
                "Persisting seat {} in session {} failed: {}",
                seat.user_id(),
                self.data.code,
                e
            );
        }
    }

    async fn touch_expiry(&mut self) {
        let expires_at = Utc::now() + self.context.config.session_ttl;

        match self
            .context
            .store
            .touch_session(&self.data.code, expires_at)
            .await
        {
            Ok(()) => self.data.expires_at = expires_at,
            Err(e) => warn!("Refreshing expiry of session {} failed: {}", self.data.code, e),
        }
    }

    fn host_seat_released(&self) -> bool {
        self.context
            .presence
            .seat(&self.data.code, &self.data.host_id)
            .is_none()
    }

    fn host_is_reclaimable(&self) -> bool {
        let Some(seat) = self
            .context
            .presence
            .seat(&self.data.code, &self.data.host_id)
        else {
            return true;
        };

        match seat.connection {
            ConnectionState::Disconnected => {
                let grace = chrono::Duration::from_std(self.context.config.host_request_grace)
                    .expect("fits in range");

                Utc::now() - seat.last_heartbeat_at > grace
            }
            _ => false,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            code: self.data.code.clone(),
            content: self.data.content.clone(),
            host_id: self.data.host_id.clone(),
            playback: self.synchronizer.playback().clone(),
            participants: self.context.presence.seats(&self.data.code),
            captured_at: Utc::now(),
        }
    }

    fn emit(&self, event: EngineEvent, recipients: Recipients) {
        self.context.emit(event, recipients);
    }
}
