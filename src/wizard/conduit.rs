//! Blocking handoff between a running stage and the event loop.
//!
//! `hand_off` resolves only after the consumer has taken the value with
//! [`Handoff::accept`], so the loop observes every value before the
//! producer moves on.

use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
#[error("conduit consumer is gone")]
pub struct ConduitClosed;

/// A value in transit, acknowledged on `accept`.
#[derive(Debug)]
pub struct Handoff<T> {
    value: T,
    ack: oneshot::Sender<()>,
}

impl<T> Handoff<T> {
    /// Look at the value without releasing the producer.
    pub fn peek(&self) -> &T {
        &self.value
    }

    pub fn accept(self) -> T {
        let _ = self.ack.send(());
        self.value
    }
}

#[derive(Debug)]
pub struct Conduit<T> {
    tx: mpsc::Sender<Handoff<T>>,
}

impl<T> Clone for Conduit<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> Conduit<T> {
    pub fn pair() -> (Self, mpsc::Receiver<Handoff<T>>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub async fn hand_off(&self, value: T) -> Result<(), ConduitClosed> {
        let (ack, acked) = oneshot::channel();
        self.tx
            .send(Handoff { value, ack })
            .await
            .map_err(|_| ConduitClosed)?;
        // Dropping the handoff unaccepted also counts as closed.
        acked.await.map_err(|_| ConduitClosed)
    }
}
