use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, info};
use thiserror::Error;

use crate::{
    config::Config,
    sessions::SessionCode,
    store::{ConnectionState, ParticipantData, Role, UserId, UserProfile},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresenceError {
    #[error("session is full")]
    Full,
    #[error("user has no seat in this session")]
    NotSeated,
}

/// How a join request resolved against existing seats
#[derive(Debug)]
pub enum SeatOutcome {
    /// A fresh seat was created
    Joined(ParticipantData),
    /// A disconnected seat inside the grace window was reclaimed
    Reconnected(ParticipantData),
    /// The user was already seated and connected; joins are idempotent
    AlreadySeated(ParticipantData),
}

impl SeatOutcome {
    pub fn participant(&self) -> &ParticipantData {
        match self {
            Self::Joined(p) | Self::Reconnected(p) | Self::AlreadySeated(p) => p,
        }
    }
}

/// What a liveness ping did to a seat
#[derive(Debug)]
pub enum HeartbeatOutcome {
    Refreshed,
    /// The seat was disconnected and silently came back inside the grace
    /// window
    Reconnected(ParticipantData),
}

/// Result of one liveness sweep over a session
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Seats that just missed too many heartbeats
    pub newly_disconnected: Vec<ParticipantData>,
    /// Seats released after the reconnection grace window ran out
    pub released: Vec<ParticipantData>,
}

/// Tracks who currently holds a seat in each session, their role, and
/// their liveness. Connection state is in-memory authority; the worker
/// persists snapshots of it to the store.
pub struct PresenceTracker {
    config: Config,
    seats: DashMap<SessionCode, Vec<ParticipantData>>,
}

impl PresenceTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            seats: Default::default(),
        }
    }

    /// Registers a session so seats can be tracked for it.
    pub fn register_session(&self, code: &SessionCode) {
        self.seats.entry(code.clone()).or_default();
    }

    /// Forgets a session and every seat in it.
    pub fn drop_session(&self, code: &SessionCode) {
        self.seats.remove(code);
    }

    /// Seats a user, reusing a live or reclaimable seat when one exists.
    pub fn join(
        &self,
        code: &SessionCode,
        profile: UserProfile,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<SeatOutcome, PresenceError> {
        let mut seats = self.seats.entry(code.clone()).or_default();

        if let Some(seat) = seats
            .iter_mut()
            .find(|s| s.user_id() == &profile.user_id && s.connection != ConnectionState::Left)
        {
            seat.last_heartbeat_at = now;

            // Identity details may have changed between connections
            seat.profile = profile;

            return Ok(match seat.connection {
                ConnectionState::Disconnected => {
                    seat.connection = ConnectionState::Connected;
                    info!("User {} reconnected to session {}", seat.user_id(), code);
                    SeatOutcome::Reconnected(seat.clone())
                }
                _ => SeatOutcome::AlreadySeated(seat.clone()),
            });
        }

        let occupied = seats
            .iter()
            .filter(|s| s.connection != ConnectionState::Left)
            .count();

        if occupied >= self.config.max_participants {
            return Err(PresenceError::Full);
        }

        let participant = ParticipantData {
            profile,
            role,
            connection: ConnectionState::Connecting,
            connected_at: now,
            last_heartbeat_at: now,
        };

        info!("User {} joined session {}", participant.user_id(), code);
        seats.push(participant.clone());

        Ok(SeatOutcome::Joined(participant))
    }

    /// Flips a seat to `Connected` once its channel is established.
    pub fn mark_connected(
        &self,
        code: &SessionCode,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Option<ParticipantData> {
        self.update_seat(code, user_id, |seat| {
            seat.connection = ConnectionState::Connected;
            seat.last_heartbeat_at = now;
        })
    }

    /// Refreshes a seat's liveness. Never moves playback state.
    pub fn heartbeat(
        &self,
        code: &SessionCode,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Option<HeartbeatOutcome> {
        let mut reconnected = None;

        self.update_seat(code, user_id, |seat| {
            seat.last_heartbeat_at = now;

            if seat.connection == ConnectionState::Disconnected {
                seat.connection = ConnectionState::Connected;
                reconnected = Some(seat.clone());
            }
        })?;

        Some(match reconnected {
            Some(seat) => HeartbeatOutcome::Reconnected(seat),
            None => HeartbeatOutcome::Refreshed,
        })
    }

    /// Marks a seat disconnected without releasing it, so the user can
    /// come back silently inside the grace window.
    pub fn mark_disconnected(
        &self,
        code: &SessionCode,
        user_id: &UserId,
    ) -> Option<ParticipantData> {
        self.update_seat(code, user_id, |seat| {
            seat.connection = ConnectionState::Disconnected;
        })
    }

    /// Releases a seat for good. Rejoining later creates a fresh seat.
    pub fn mark_left(&self, code: &SessionCode, user_id: &UserId) -> Option<ParticipantData> {
        self.update_seat(code, user_id, |seat| {
            seat.connection = ConnectionState::Left;
        })
    }

    pub fn set_role(&self, code: &SessionCode, user_id: &UserId, role: Role) -> Option<ParticipantData> {
        self.update_seat(code, user_id, |seat| {
            seat.role = role;
        })
    }

    /// The live seat of a user, if they have one. Released seats don't
    /// count; a rejoin after leaving is a fresh seat.
    pub fn seat(&self, code: &SessionCode, user_id: &UserId) -> Option<ParticipantData> {
        self.seats
            .get(code)?
            .iter()
            .find(|s| s.user_id() == user_id && s.connection != ConnectionState::Left)
            .cloned()
    }

    /// Every seat that has not been released, in join order.
    pub fn seats(&self, code: &SessionCode) -> Vec<ParticipantData> {
        self.seats
            .get(code)
            .map(|seats| {
                seats
                    .iter()
                    .filter(|s| s.connection != ConnectionState::Left)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// How long a seat has gone without a heartbeat.
    pub fn silence(&self, code: &SessionCode, user_id: &UserId, now: DateTime<Utc>) -> Option<Duration> {
        self.seat(code, user_id).map(|s| now - s.last_heartbeat_at)
    }

    /// One liveness pass over a session: flips silent seats to
    /// disconnected and releases seats whose grace window ran out.
    pub fn sweep_session(&self, code: &SessionCode, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let Some(mut seats) = self.seats.get_mut(code) else {
            return report;
        };

        let disconnect_after =
            Duration::from_std(self.config.disconnect_timeout()).expect("fits in chrono range");
        let release_after = disconnect_after
            + Duration::from_std(self.config.reconnect_grace).expect("fits in chrono range");

        for seat in seats.iter_mut() {
            let silence = now - seat.last_heartbeat_at;

            match seat.connection {
                ConnectionState::Connected | ConnectionState::Connecting
                    if silence > disconnect_after =>
                {
                    debug!(
                        "User {} in session {} missed {} heartbeats, marking disconnected",
                        seat.user_id(),
                        code,
                        self.config.missed_heartbeats
                    );

                    seat.connection = ConnectionState::Disconnected;
                    report.newly_disconnected.push(seat.clone());
                }
                ConnectionState::Disconnected if silence > release_after => {
                    info!(
                        "User {} in session {} did not return, releasing seat",
                        seat.user_id(),
                        code
                    );

                    seat.connection = ConnectionState::Left;
                    report.released.push(seat.clone());
                }
                _ => {}
            }
        }

        report
    }

    fn update_seat(
        &self,
        code: &SessionCode,
        user_id: &UserId,
        f: impl FnOnce(&mut ParticipantData),
    ) -> Option<ParticipantData> {
        let mut seats = self.seats.get_mut(code)?;

        let seat = seats
            .iter_mut()
            .find(|s| s.user_id() == user_id && s.connection != ConnectionState::Left)?;

        f(seat);
        Some(seat.clone())
    }
}

/// Picks the next host after the current one leaves or times out: the
/// longest-connected currently-connected guest, ties broken by the
/// lexicographically smallest user id.
///
/// Pure over the participant set, so every node that runs it agrees.
pub fn select_successor(participants: &[ParticipantData]) -> Option<&ParticipantData> {
    participants
        .iter()
        .filter(|p| p.role == Role::Guest && p.connection == ConnectionState::Connected)
        .min_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.user_id().cmp(b.user_id()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            user_id: UserId::from(id),
            display_name: id.to_string(),
            avatar_url: None,
        }
    }

    fn participant(id: &str, role: Role, connection: ConnectionState, connected_at: DateTime<Utc>) -> ParticipantData {
        ParticipantData {
            profile: profile(id),
            role,
            connection,
            connected_at,
            last_heartbeat_at: connected_at,
        }
    }

    fn code() -> SessionCode {
        SessionCode::parse("TEST01").unwrap()
    }

    #[test]
    fn test_join_is_idempotent_while_connected() {
        let tracker = PresenceTracker::new(&Config::default());
        let now = Utc::now();

        let first = tracker.join(&code(), profile("alice"), Role::Host, now).unwrap();
        assert!(matches!(first, SeatOutcome::Joined(_)));

        let again = tracker.join(&code(), profile("alice"), Role::Host, now).unwrap();
        assert!(matches!(again, SeatOutcome::AlreadySeated(_)));

        assert_eq!(tracker.seats(&code()).len(), 1);
    }

    #[test]
    fn test_reconnect_keeps_seat_and_role() {
        let tracker = PresenceTracker::new(&Config::default());
        let now = Utc::now();

        tracker.join(&code(), profile("alice"), Role::Host, now).unwrap();
        tracker.mark_disconnected(&code(), &UserId::from("alice"));

        let outcome = tracker
            .join(&code(), profile("alice"), Role::Host, now)
            .unwrap();

        let SeatOutcome::Reconnected(seat) = outcome else {
            panic!("expected a reconnection");
        };
        assert_eq!(seat.role, Role::Host);
        assert_eq!(seat.connected_at, now);
    }

    #[test]
    fn test_left_seats_do_not_come_back() {
        let tracker = PresenceTracker::new(&Config::default());
        let now = Utc::now();
        let later = now + Duration::seconds(30);

        tracker.join(&code(), profile("bob"), Role::Guest, now).unwrap();
        tracker.mark_left(&code(), &UserId::from("bob"));

        let outcome = tracker.join(&code(), profile("bob"), Role::Guest, later).unwrap();

        let SeatOutcome::Joined(seat) = outcome else {
            panic!("expected a fresh seat");
        };
        assert_eq!(seat.connected_at, later);
        assert_eq!(seat.connection, ConnectionState::Connecting);
    }

    #[test]
    fn test_participant_limit() {
        let config = Config {
            max_participants: 2,
            ..Default::default()
        };
        let tracker = PresenceTracker::new(&config);
        let now = Utc::now();

        tracker.join(&code(), profile("a"), Role::Host, now).unwrap();
        tracker.join(&code(), profile("b"), Role::Guest, now).unwrap();

        let err = tracker.join(&code(), profile("c"), Role::Guest, now).unwrap_err();
        assert_eq!(err, PresenceError::Full);

        // A released seat frees capacity
        tracker.mark_left(&code(), &UserId::from("b"));
        tracker.join(&code(), profile("c"), Role::Guest, now).unwrap();
    }

    #[test]
    fn test_sweep_disconnects_then_releases() {
        let config = Config::default();
        let tracker = PresenceTracker::new(&config);
        let now = Utc::now();

        tracker.join(&code(), profile("alice"), Role::Guest, now).unwrap();
        tracker.mark_connected(&code(), &UserId::from("alice"), now);

        // Not yet silent long enough
        let report = tracker.sweep_session(&code(), now + Duration::seconds(10));
        assert!(report.newly_disconnected.is_empty());

        // Past three missed heartbeats
        let report = tracker.sweep_session(&code(), now + Duration::seconds(16));
        assert_eq!(report.newly_disconnected.len(), 1);

        // Still holding the seat inside the grace window
        let report = tracker.sweep_session(&code(), now + Duration::seconds(60));
        assert!(report.released.is_empty());

        // Grace window over, seat released
        let report = tracker.sweep_session(&code(), now + Duration::seconds(140));
        assert_eq!(report.released.len(), 1);
        assert_eq!(report.released[0].user_id(), &UserId::from("alice"));
        assert!(tracker.seats(&code()).is_empty());
    }

    #[test]
    fn test_heartbeat_reconnects_silently() {
        let tracker = PresenceTracker::new(&Config::default());
        let now = Utc::now();
        let user = UserId::from("alice");

        tracker.join(&code(), profile("alice"), Role::Guest, now).unwrap();
        tracker.mark_disconnected(&code(), &user);

        let outcome = tracker.heartbeat(&code(), &user, now).unwrap();
        assert!(matches!(outcome, HeartbeatOutcome::Reconnected(_)));

        let outcome = tracker.heartbeat(&code(), &user, now).unwrap();
        assert!(matches!(outcome, HeartbeatOutcome::Refreshed));
    }

    #[test]
    fn test_successor_is_longest_connected_guest() {
        let now = Utc::now();

        let participants = vec![
            participant("host", Role::Host, ConnectionState::Disconnected, now),
            participant("late", Role::Guest, ConnectionState::Connected, now + Duration::seconds(20)),
            participant("early", Role::Guest, ConnectionState::Connected, now + Duration::seconds(5)),
            participant("offline", Role::Guest, ConnectionState::Disconnected, now),
        ];

        let successor = select_successor(&participants).unwrap();
        assert_eq!(successor.user_id(), &UserId::from("early"));
    }

    #[test]
    fn test_successor_ties_break_by_user_id() {
        let now = Utc::now();

        let participants = vec![
            participant("zoe", Role::Guest, ConnectionState::Connected, now),
            participant("amy", Role::Guest, ConnectionState::Connected, now),
        ];

        let successor = select_successor(&participants).unwrap();
        assert_eq!(successor.user_id(), &UserId::from("amy"));
    }

    #[test]
    fn test_no_connected_guest_means_no_successor() {
        let now = Utc::now();

        let participants = vec![
            participant("host", Role::Host, ConnectionState::Disconnected, now),
            participant("gone", Role::Guest, ConnectionState::Left, now),
        ];

        assert!(select_successor(&participants).is_none());
    }
}
