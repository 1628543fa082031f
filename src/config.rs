use std::time::Duration;

/// The configuration of the sync engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Length of the shareable session code
    pub code_length: usize,
    /// How many collision retries before code generation gives up
    pub code_attempts: usize,
    /// How long a session lives without accepted activity
    pub session_ttl: chrono::Duration,
    /// Expected interval between client liveness pings
    pub heartbeat_interval: Duration,
    /// How many missed intervals before a seat flips to disconnected
    pub missed_heartbeats: u32,
    /// How long the host can stay silent before a safety pause and handoff
    pub host_timeout: Duration,
    /// How long a disconnected host keeps priority over a host request
    pub host_request_grace: Duration,
    /// How long a disconnected seat is kept for silent reconnection
    pub reconnect_grace: Duration,
    /// Deadline for any call suspended on a session worker
    pub request_deadline: Duration,
    /// Depth of a session worker's command queue
    pub command_queue_depth: usize,
    /// Pending frames a subscriber may accumulate before it is dropped
    pub subscriber_buffer: usize,
    /// Maximum participants per session
    pub max_participants: usize,
    /// Maximum chat message body length, in characters
    pub max_message_length: usize,
    /// How many chat messages a joiner receives as backlog
    pub message_backlog: usize,
    /// How often presence looks for silent seats
    pub presence_sweep_interval: Duration,
    /// How often expired sessions are collected
    pub expiry_sweep_interval: Duration,
}

impl Config {
    /// The fastest playback rate a host may set
    pub const MAX_RATE: f32 = 4.0;

    /// Local drift beyond this many seconds should make a client resync
    pub const DRIFT_THRESHOLD: f32 = 2.0;

    /// How long a seat may go without a heartbeat before it is disconnected
    pub fn disconnect_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Short enough to read aloud, long enough to avoid collisions
            code_length: 6,
            code_attempts: 5,
            // Sessions outlive a long movie night, not a vacation
            session_ttl: chrono::Duration::hours(24),
            heartbeat_interval: Duration::from_secs(5),
            // Three missed pings before the seat is considered gone
            missed_heartbeats: 3,
            host_timeout: Duration::from_secs(20),
            host_request_grace: Duration::from_secs(15),
            reconnect_grace: Duration::from_secs(120),
            request_deadline: Duration::from_secs(5),
            command_queue_depth: 100,
            subscriber_buffer: 256,
            max_participants: 50,
            max_message_length: 2000,
            message_backlog: 50,
            presence_sweep_interval: Duration::from_secs(5),
            expiry_sweep_interval: Duration::from_secs(60),
        }
    }
}
