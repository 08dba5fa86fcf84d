use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::actors::{FetchMessage, StateMessage};

/// A message plus its optional deadline. Envelopes past `expire_at` are
/// dropped at the receive side, so queued work naturally ages out.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub message: T,
    pub expire_at: Option<DateTime<Utc>>,
}

impl<T> Envelope<T> {
    pub fn new(message: T) -> Self {
        Self {
            message,
            expire_at: None,
        }
    }

    pub fn expiring(message: T, expire_at: DateTime<Utc>) -> Self {
        Self {
            message,
            expire_at: Some(expire_at),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at < now)
    }
}

/// Two-sided in-process message bus between the state loop (DB-bound) and
/// the fetch loop (HTTP-bound).
///
/// `tell` waits for queue space and is only lost on shutdown; `hope` is
/// best-effort and drops the message when the receiving side is saturated.
/// Handlers stay idempotent either way, so an occasional duplicate or drop
/// is harmless.
#[derive(Clone)]
pub struct Bus {
    state_tx: mpsc::Sender<Envelope<StateMessage>>,
    fetch_tx: mpsc::Sender<Envelope<FetchMessage>>,
}

impl Bus {
    pub fn new(
        capacity: usize,
    ) -> (
        Bus,
        mpsc::Receiver<Envelope<StateMessage>>,
        mpsc::Receiver<Envelope<FetchMessage>>,
    ) {
        let (state_tx, state_rx) = mpsc::channel(capacity);
        let (fetch_tx, fetch_rx) = mpsc::channel(capacity);
        (Bus { state_tx, fetch_tx }, state_rx, fetch_rx)
    }

    pub async fn tell_state(&self, message: StateMessage) {
        if self.state_tx.send(Envelope::new(message)).await.is_err() {
            tracing::error!("state loop is gone, message lost");
        }
    }

    pub async fn tell_fetch(&self, message: FetchMessage) {
        if self.fetch_tx.send(Envelope::new(message)).await.is_err() {
            tracing::error!("fetch loop is gone, message lost");
        }
    }

    pub fn hope_state(&self, message: StateMessage, expire_at: Option<DateTime<Utc>>) {
        let envelope = Envelope {
            message,
            expire_at,
        };
        if let Err(err) = self.state_tx.try_send(envelope) {
            tracing::debug!("drop state message: {}", err);
        }
    }

    pub fn hope_fetch(&self, message: FetchMessage, expire_at: Option<DateTime<Utc>>) {
        let envelope = Envelope {
            message,
            expire_at,
        };
        if let Err(err) = self.fetch_tx.try_send(envelope) {
            tracing::debug!("drop fetch message: {}", err);
        }
    }
}
