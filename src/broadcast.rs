use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll, Waker},
};

use futures_util::Stream;
use log::warn;
use parking_lot::Mutex;

use crate::{
    config::Config,
    events::Recipients,
    protocol::ServerEnvelope,
    sessions::SessionCode,
    store::UserId,
    util::Id,
};

pub type SubscriberId = Id<Subscriber>;

/// Delivers engine decisions to every connected participant of a session.
///
/// One logical channel per session; per-subscriber bounded buffers so a
/// slow client is dropped instead of holding the session up. The
/// broadcaster never mutates engine state, it only reads and republishes.
pub struct Broadcaster {
    me: Weak<Self>,
    config: Config,
    channels: Mutex<Vec<Channel>>,
}

struct Channel {
    code: SessionCode,
    subscribers: Vec<Subscriber>,
}

pub struct Subscriber {
    id: SubscriberId,
    user_id: UserId,
    pending: Arc<Mutex<VecDeque<ServerEnvelope>>>,
    waker: Arc<Mutex<Option<Waker>>>,
}

/// A live subscription. Polled as a stream of outbound frames; dropping it
/// unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    code: SessionCode,
    user_id: UserId,
    pending: Arc<Mutex<VecDeque<ServerEnvelope>>>,
    waker: Arc<Mutex<Option<Waker>>>,
    manager: Weak<Broadcaster>,
}

impl Broadcaster {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config: config.clone(),
            channels: Default::default(),
        })
    }

    /// Registers a subscriber and immediately queues the given snapshot as
    /// its first frame. Late joiners get current state, not history.
    pub fn subscribe(
        &self,
        code: &SessionCode,
        user_id: &UserId,
        snapshot: ServerEnvelope,
    ) -> Subscription {
        let subscriber = Subscriber::new(user_id.clone());
        let subscription = subscriber.subscription(code.clone(), self.me.clone());

        subscriber.push(snapshot);

        let mut channels = self.channels.lock();
        match channels.iter_mut().find(|c| &c.code == code) {
            Some(channel) => channel.subscribers.push(subscriber),
            None => channels.push(Channel {
                code: code.clone(),
                subscribers: vec![subscriber],
            }),
        }

        subscription
    }

    /// Pushes a frame to the addressed subscribers of a session.
    ///
    /// Returns the users whose subscriptions were dropped for exceeding
    /// the pending-frame bound, so the caller can treat them as
    /// disconnected.
    pub fn publish(
        &self,
        code: &SessionCode,
        envelope: ServerEnvelope,
        recipients: &Recipients,
    ) -> Vec<UserId> {
        let mut dropped = Vec::new();
        let mut channels = self.channels.lock();

        let Some(channel) = channels.iter_mut().find(|c| &c.code == code) else {
            return dropped;
        };

        channel.subscribers.retain(|subscriber| {
            if !recipients.includes(&subscriber.user_id) {
                return true;
            }

            if subscriber.pending.lock().len() >= self.config.subscriber_buffer {
                warn!(
                    "Subscriber {} in session {} is not draining, dropping it",
                    subscriber.user_id, code
                );

                dropped.push(subscriber.user_id.clone());
                return false;
            }

            subscriber.push(envelope.clone());
            true
        });

        dropped
    }

    /// Tears down the channel of an ended session.
    pub fn drop_channel(&self, code: &SessionCode) {
        self.channels.lock().retain(|c| &c.code != code);
    }

    /// How many subscriptions a session currently has.
    pub fn subscriber_count(&self, code: &SessionCode) -> usize {
        self.channels
            .lock()
            .iter()
            .find(|c| &c.code == code)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    fn unsubscribe(&self, code: &SessionCode, id: SubscriberId) {
        let mut channels = self.channels.lock();

        if let Some(channel) = channels.iter_mut().find(|c| &c.code == code) {
            channel.subscribers.retain(|s| s.id != id);
        }
    }
}

impl Subscriber {
    fn new(user_id: UserId) -> Self {
        Self {
            id: SubscriberId::new(),
            user_id,
            pending: Default::default(),
            waker: Default::default(),
        }
    }

    fn push(&self, envelope: ServerEnvelope) {
        self.pending.lock().push_back(envelope);

        if let Some(waker) = self.waker.lock().take() {
            waker.wake()
        }
    }

    fn subscription(&self, code: SessionCode, manager: Weak<Broadcaster>) -> Subscription {
        Subscription {
            id: self.id,
            code,
            user_id: self.user_id.clone(),
            pending: self.pending.clone(),
            waker: self.waker.clone(),
            manager,
        }
    }
}

impl Subscription {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Takes the next pending frame without waiting, if one is queued.
    pub fn try_next(&self) -> Option<ServerEnvelope> {
        self.pending.lock().pop_front()
    }
}

impl Stream for Subscription {
    type Item = ServerEnvelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(envelope) = self.pending.lock().pop_front() {
            return Poll::Ready(Some(envelope));
        }

        *self.waker.lock() = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(&self.code, self.id)
        }
    }
}
