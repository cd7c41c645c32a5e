//! Single-writer, multi-reader state publication with replay-latest semantics.
//!
//! The `watch` channel holds the latest value for late subscribers and the
//! `broadcast` channel carries every transition in order. Both are updated
//! under one lock so a new subscriber sees the current value and then exactly
//! the transitions that follow it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, watch};

const DEFAULT_HISTORY: usize = 64;

pub struct StatePublisher<S> {
    channels: Arc<Mutex<Channels<S>>>,
}

struct Channels<S> {
    latest: watch::Sender<S>,
    transitions: broadcast::Sender<S>,
}

impl<S> StatePublisher<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(initial: S) -> Self {
        Self::with_capacity(initial, DEFAULT_HISTORY)
    }

    /// `capacity` bounds how far a slow subscriber may fall behind before it is resynced.
    pub fn with_capacity(initial: S, capacity: usize) -> Self {
        let (latest, _) = watch::channel(initial);
        let (transitions, _) = broadcast::channel(capacity.max(1));
        Self {
            channels: Arc::new(Mutex::new(Channels {
                latest,
                transitions,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Channels<S>> {
        lock(&self.channels)
    }

    pub fn publish(&self, state: S) {
        let channels = self.lock();
        channels.latest.send_replace(state.clone());
        // No subscribers is fine; the watch channel still holds the value.
        let _ = channels.transitions.send(state);
    }

    pub fn current(&self) -> S {
        self.lock().latest.borrow().clone()
    }

    /// Ordered stream of transitions, starting from the current state.
    pub fn subscribe(&self) -> StateStream<S> {
        let channels = self.lock();
        StateStream {
            current: channels.latest.borrow().clone(),
            transitions: channels.transitions.subscribe(),
            channels: Arc::downgrade(&self.channels),
        }
    }

    /// Latest value only, for observers that do not care about intermediate states.
    pub fn watch(&self) -> watch::Receiver<S> {
        self.lock().latest.subscribe()
    }
}

fn lock<S>(channels: &Mutex<Channels<S>>) -> MutexGuard<'_, Channels<S>> {
    channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct StateStream<S> {
    current: S,
    transitions: broadcast::Receiver<S>,
    channels: Weak<Mutex<Channels<S>>>,
}

impl<S> StateStream<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// State as of subscription or the last value returned by `next`.
    pub fn current(&self) -> &S {
        &self.current
    }

    /// Next transition. A subscriber that lagged past the buffer jumps to the latest state.
    /// Returns `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<S> {
        let state = match self.transitions.recv().await {
            Ok(state) => state,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "State subscriber lagged, resyncing to latest");
                let shared = self.channels.upgrade()?;
                // Resubscribe and read under the publish lock so the resync value is not
                // delivered a second time by the new receiver.
                let channels = lock(&shared);
                self.transitions = channels.transitions.subscribe();
                channels.latest.borrow().clone()
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        };
        self.current = state.clone();
        Some(state)
    }

    /// Wait until the current state or a later transition satisfies `pred`.
    pub async fn wait_for(&mut self, pred: impl Fn(&S) -> bool) -> Option<S> {
        if pred(&self.current) {
            return Some(self.current.clone());
        }
        while let Some(state) = self.next().await {
            if pred(&state) {
                return Some(state);
            }
        }
        None
    }
}
