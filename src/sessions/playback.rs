use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    config::Config,
    protocol::{PlaybackProposal, SyncEvent, SyncEventKind},
    store::{PlaybackState, UpdateOrigin, UserId},
};

/// Why a proposal was turned away. Rejections never mutate state and never
/// reach the broadcaster.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncRejection {
    #[error("only the host may change playback")]
    NotHost,
    #[error("stale update: proposed version {proposed} is not ahead of {current}")]
    Stale { proposed: u64, current: u64 },
    #[error("invalid event: {0}")]
    Invalid(&'static str),
}

/// Where a session is in its playback lifecycle.
///
/// `Seeking` is transient and collapses back to `Playing`/`Paused` once the
/// accepted seek has been published. `Ended` is terminal for the content;
/// the session itself stays alive for chat.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    #[default]
    Idle,
    Playing,
    Paused,
    Seeking,
    Ended,
}

/// The authoritative playback state machine for one session.
///
/// Owned exclusively by that session's worker task; every mutation happens
/// inside the worker's critical section, so `version` is a total order over
/// accepted events.
#[derive(Debug)]
pub struct PlaybackSynchronizer {
    phase: PlaybackPhase,
    playback: PlaybackState,
}

impl PlaybackSynchronizer {
    /// Resumes from a persisted snapshot, deriving the phase from it.
    pub fn new(playback: PlaybackState) -> Self {
        let phase = if playback.version == 0 {
            PlaybackPhase::Idle
        } else if playback.is_playing {
            PlaybackPhase::Playing
        } else {
            PlaybackPhase::Paused
        };

        Self { phase, playback }
    }

    pub fn playback(&self) -> &PlaybackState {
        &self.playback
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    /// Applies a host proposal, returning the accepted event to broadcast.
    pub fn apply(
        &mut self,
        host_id: &UserId,
        origin: &UserId,
        proposal: &PlaybackProposal,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, SyncRejection> {
        if origin != host_id {
            return Err(SyncRejection::NotHost);
        }

        if !proposal.position.is_finite() || !proposal.rate.is_finite() {
            return Err(SyncRejection::Invalid("position and rate must be finite"));
        }

        if proposal.position < 0.0 {
            return Err(SyncRejection::Invalid("position must not be negative"));
        }

        if proposal.rate <= 0.0 || proposal.rate > Config::MAX_RATE {
            return Err(SyncRejection::Invalid("rate must be within (0, 4]"));
        }

        if self.phase == PlaybackPhase::Ended {
            return Err(SyncRejection::Invalid("content has already ended"));
        }

        if proposal.version <= self.playback.version {
            return Err(SyncRejection::Stale {
                proposed: proposal.version,
                current: self.playback.version,
            });
        }

        self.phase = match proposal.kind {
            SyncEventKind::Play => PlaybackPhase::Playing,
            SyncEventKind::Pause => PlaybackPhase::Paused,
            SyncEventKind::Seek => PlaybackPhase::Seeking,
            SyncEventKind::RateChange => self.phase,
            SyncEventKind::Ended => PlaybackPhase::Ended,
        };

        self.playback.is_playing = match proposal.kind {
            SyncEventKind::Play => true,
            SyncEventKind::Pause | SyncEventKind::Ended => false,
            // A seek or rate change does not start or stop playback
            SyncEventKind::Seek | SyncEventKind::RateChange => self.playback.is_playing,
        };

        self.playback.position = proposal.position;
        self.playback.rate = proposal.rate;
        self.playback.version = proposal.version;
        self.playback.updated_at = now;
        self.playback.updated_by = UpdateOrigin::User(origin.clone());

        Ok(self.as_event(proposal.kind))
    }

    /// Collapses the transient `Seeking` phase once the seek is published.
    pub fn settle(&mut self) {
        if self.phase == PlaybackPhase::Seeking {
            self.phase = if self.playback.is_playing {
                PlaybackPhase::Playing
            } else {
                PlaybackPhase::Paused
            };
        }
    }

    /// The safety pause applied when the host goes silent. Returns the
    /// system-authored event to broadcast, or `None` if playback was
    /// already stopped.
    pub fn freeze(&mut self, now: DateTime<Utc>) -> Option<SyncEvent> {
        if !self.playback.is_playing {
            return None;
        }

        // Freeze at the extrapolated position so guests don't jump back
        self.playback.position = self.playback.expected_position(now);
        self.playback.is_playing = false;
        self.playback.version += 1;
        self.playback.updated_at = now;
        self.playback.updated_by = UpdateOrigin::System;
        self.phase = PlaybackPhase::Paused;

        Some(self.as_event(SyncEventKind::Pause))
    }

    /// Advances the version for a host handoff so every client observes the
    /// transfer as an ordered, system-authored mutation.
    pub fn bump_for_handoff(&mut self, now: DateTime<Utc>) -> PlaybackState {
        self.playback.version += 1;
        self.playback.updated_at = now;
        self.playback.updated_by = UpdateOrigin::System;

        self.playback.clone()
    }

    /// Restores the last persisted snapshot after a failed store write.
    pub fn rollback(&mut self, persisted: PlaybackState) {
        *self = Self::new(persisted);
    }

    fn as_event(&self, kind: SyncEventKind) -> SyncEvent {
        SyncEvent {
            kind,
            position: self.playback.position,
            rate: self.playback.rate,
            version: self.playback.version,
            origin: self.playback.updated_by.clone(),
            emitted_at: self.playback.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> UserId {
        UserId::from("alice")
    }

    fn guest() -> UserId {
        UserId::from("bob")
    }

    fn synchronizer() -> PlaybackSynchronizer {
        PlaybackSynchronizer::new(PlaybackState::initial(Utc::now()))
    }

    fn proposal(kind: SyncEventKind, position: f32, version: u64) -> PlaybackProposal {
        PlaybackProposal {
            kind,
            position,
            rate: 1.0,
            version,
        }
    }

    #[test]
    fn test_guest_proposals_are_rejected() {
        let mut sync = synchronizer();

        let err = sync
            .apply(
                &host(),
                &guest(),
                &proposal(SyncEventKind::Seek, 10.0, 1),
                Utc::now(),
            )
            .unwrap_err();

        assert_eq!(err, SyncRejection::NotHost);
        assert_eq!(sync.playback().version, 0);
    }

    #[test]
    fn test_versions_advance_through_a_session() {
        let mut sync = synchronizer();
        let now = Utc::now();

        assert_eq!(sync.phase(), PlaybackPhase::Idle);

        let play = sync
            .apply(&host(), &host(), &proposal(SyncEventKind::Play, 0.0, 1), now)
            .unwrap();
        assert_eq!(play.version, 1);
        assert_eq!(sync.phase(), PlaybackPhase::Playing);

        let pause = sync
            .apply(
                &host(),
                &host(),
                &proposal(SyncEventKind::Pause, 10.0, 2),
                now,
            )
            .unwrap();
        assert_eq!(pause.version, 2);
        assert!(!sync.playback().is_playing);
        assert_eq!(sync.playback().position, 10.0);
        assert_eq!(sync.phase(), PlaybackPhase::Paused);
    }

    #[test]
    fn test_reordered_duplicate_is_stale() {
        let mut sync = synchronizer();
        let now = Utc::now();

        sync.apply(&host(), &host(), &proposal(SyncEventKind::Play, 0.0, 1), now)
            .unwrap();

        // Host issued seek->20 (v2) then seek->50 (v3); the network
        // delivered v3 first
        sync.apply(&host(), &host(), &proposal(SyncEventKind::Seek, 50.0, 3), now)
            .unwrap();

        let err = sync
            .apply(&host(), &host(), &proposal(SyncEventKind::Seek, 20.0, 2), now)
            .unwrap_err();

        assert_eq!(
            err,
            SyncRejection::Stale {
                proposed: 2,
                current: 3
            }
        );
        assert_eq!(sync.playback().position, 50.0);
        assert_eq!(sync.playback().version, 3);
    }

    #[test]
    fn test_exact_duplicate_is_stale() {
        let mut sync = synchronizer();
        let now = Utc::now();
        let play = proposal(SyncEventKind::Play, 0.0, 1);

        sync.apply(&host(), &host(), &play, now).unwrap();
        let err = sync.apply(&host(), &host(), &play, now).unwrap_err();

        assert!(matches!(err, SyncRejection::Stale { .. }));
    }

    #[test]
    fn test_malformed_events_never_mutate() {
        let mut sync = synchronizer();
        let now = Utc::now();

        let cases = [
            PlaybackProposal {
                kind: SyncEventKind::Seek,
                position: -1.0,
                rate: 1.0,
                version: 1,
            },
            PlaybackProposal {
                kind: SyncEventKind::RateChange,
                position: 0.0,
                rate: 0.0,
                version: 1,
            },
            PlaybackProposal {
                kind: SyncEventKind::RateChange,
                position: 0.0,
                rate: 4.5,
                version: 1,
            },
            PlaybackProposal {
                kind: SyncEventKind::Seek,
                position: f32::NAN,
                rate: 1.0,
                version: 1,
            },
        ];

        for case in cases {
            let err = sync.apply(&host(), &host(), &case, now).unwrap_err();
            assert!(matches!(err, SyncRejection::Invalid(_)));
            assert_eq!(sync.playback().version, 0);
        }
    }

    #[test]
    fn test_seek_is_transient_and_keeps_play_state() {
        let mut sync = synchronizer();
        let now = Utc::now();

        sync.apply(&host(), &host(), &proposal(SyncEventKind::Play, 0.0, 1), now)
            .unwrap();
        sync.apply(&host(), &host(), &proposal(SyncEventKind::Seek, 30.0, 2), now)
            .unwrap();

        assert_eq!(sync.phase(), PlaybackPhase::Seeking);
        assert!(sync.playback().is_playing);

        sync.settle();
        assert_eq!(sync.phase(), PlaybackPhase::Playing);
    }

    #[test]
    fn test_ended_is_terminal() {
        let mut sync = synchronizer();
        let now = Utc::now();

        sync.apply(&host(), &host(), &proposal(SyncEventKind::Play, 0.0, 1), now)
            .unwrap();
        sync.apply(
            &host(),
            &host(),
            &proposal(SyncEventKind::Ended, 5400.0, 2),
            now,
        )
        .unwrap();

        assert_eq!(sync.phase(), PlaybackPhase::Ended);

        let err = sync
            .apply(&host(), &host(), &proposal(SyncEventKind::Play, 0.0, 3), now)
            .unwrap_err();
        assert!(matches!(err, SyncRejection::Invalid(_)));
    }

    #[test]
    fn test_freeze_pauses_at_extrapolated_position() {
        let mut sync = synchronizer();
        let now = Utc::now();

        sync.apply(&host(), &host(), &proposal(SyncEventKind::Play, 10.0, 1), now)
            .unwrap();

        let later = now + chrono::Duration::seconds(4);
        let event = sync.freeze(later).expect("playing session freezes");

        assert_eq!(event.kind, SyncEventKind::Pause);
        assert_eq!(event.origin, UpdateOrigin::System);
        assert_eq!(event.version, 2);
        assert!((event.position - 14.0).abs() < 0.01);

        // Already paused: nothing to freeze, no version burned
        assert!(sync.freeze(later).is_none());
        assert_eq!(sync.playback().version, 2);
    }

    #[test]
    fn test_handoff_bump_is_system_authored() {
        let mut sync = synchronizer();
        let now = Utc::now();

        sync.apply(&host(), &host(), &proposal(SyncEventKind::Play, 0.0, 1), now)
            .unwrap();

        let state = sync.bump_for_handoff(now);
        assert_eq!(state.version, 2);
        assert_eq!(state.updated_by, UpdateOrigin::System);
    }

    #[test]
    fn test_rollback_restores_persisted_state() {
        let mut sync = synchronizer();
        let now = Utc::now();

        sync.apply(&host(), &host(), &proposal(SyncEventKind::Play, 0.0, 1), now)
            .unwrap();
        let persisted = sync.playback().clone();

        sync.apply(&host(), &host(), &proposal(SyncEventKind::Seek, 90.0, 2), now)
            .unwrap();
        sync.rollback(persisted.clone());

        assert_eq!(sync.playback(), &persisted);
        assert_eq!(sync.phase(), PlaybackPhase::Playing);
    }
}
