use std::sync::Arc;

use crossbeam::channel::unbounded;
use dashmap::DashMap;
use log::warn;
use tokio::{spawn, task::spawn_blocking, time::interval};

mod broadcast;
mod catalog;
mod config;
mod events;
mod player;
mod presence;
mod protocol;
mod sessions;
mod store;
mod util;

pub use broadcast::*;
pub use catalog::*;
pub use config::*;
pub use events::*;
pub use player::*;
pub use presence::*;
pub use protocol::*;
pub use sessions::*;
pub use store::*;
pub use util::*;

// Reduces verbosity
type Registry<K, V> = Arc<DashMap<K, Arc<V>>>;

/// The watch-party engine, facilitating session coordination, playback
/// synchronization, presence, and fan-out.
pub struct Matinee<S> {
    context: MatineeContext<S>,
    event_receiver: EventReceiver,

    pub sessions: SessionManager<S>,
}

/// A type passed to various components of the engine, to access state,
/// emit events, and reach collaborators.
pub struct MatineeContext<S> {
    pub config: Config,
    pub store: Arc<S>,
    pub catalog: Arc<dyn Catalog>,
    pub presence: Arc<PresenceTracker>,
    pub broadcast: Arc<Broadcaster>,
    pub sessions: Registry<SessionCode, SessionHandle>,

    event_sender: EventSender,
}

impl<S> Matinee<S>
where
    S: SessionStore,
{
    pub fn new(config: Config, store: S, catalog: impl Catalog) -> Self {
        let (event_sender, event_receiver) = unbounded();

        let context = MatineeContext {
            presence: Arc::new(PresenceTracker::new(&config)),
            broadcast: Broadcaster::new(&config),
            store: Arc::new(store),
            catalog: Arc::new(catalog),
            sessions: Default::default(),
            event_sender,
            config,
        };

        let sessions = SessionManager::new(&context);

        Self {
            context,
            event_receiver,
            sessions,
        }
    }

    /// Restores persisted sessions, starts the background sweeps, and
    /// pumps engine events into the broadcaster. Runs until dropped.
    pub async fn run(&self) {
        if let Err(e) = self.sessions.restore().await {
            warn!("Restoring sessions failed: {}", e);
        }

        let manager = self.sessions.clone();
        let every = self.context.config.presence_sweep_interval;
        spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                manager.sweep_presence().await;
            }
        });

        let manager = self.sessions.clone();
        let every = self.context.config.expiry_sweep_interval;
        spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                manager.sweep_expired().await;
            }
        });

        self.pump_events().await;
    }

    /// Drains the engine event bus into the broadcaster. A single consumer
    /// keeps the per-session order every worker produced.
    async fn pump_events(&self) {
        while let Ok((event, recipients)) = {
            let receiver = self.event_receiver.clone();
            spawn_blocking(move || receiver.recv())
                .await
                .expect("receiver task joins")
        } {
            self.deliver(event, recipients);
        }
    }

    fn deliver(&self, event: EngineEvent, recipients: Recipients) {
        let code = event.code().clone();
        let ended = matches!(event, EngineEvent::SessionEnded { .. });
        let envelope = ServerEnvelope::new(code.clone(), ServerEvent::from(event));

        let dropped = self.context.broadcast.publish(&code, envelope, &recipients);

        // Subscribers that overflowed their buffer count as disconnected;
        // the seat survives for a reconnect like any other drop
        for user_id in dropped {
            if self.context.presence.mark_disconnected(&code, &user_id).is_some() {
                self.context.emit(
                    EngineEvent::ParticipantDisconnected {
                        code: code.clone(),
                        user_id,
                    },
                    Recipients::All,
                );
            }
        }

        if ended {
            self.context.broadcast.drop_channel(&code);
        }
    }
}

impl<S> MatineeContext<S>
where
    S: SessionStore,
{
    pub fn emit(&self, event: EngineEvent, recipients: Recipients) {
        self.event_sender
            .send((event, recipients))
            .expect("event bus is open");
    }
}

impl<S> Clone for MatineeContext<S>
where
    S: SessionStore,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            catalog: self.catalog.clone(),
            presence: self.presence.clone(),
            broadcast: self.broadcast.clone(),
            sessions: self.sessions.clone(),
            event_sender: self.event_sender.clone(),
        }
    }
}
