//! Lifecycle publication/subscription abstraction (mechanics only).
//!
//! The queue publishes one message per job transition; transports (SSE, websockets,
//! audit sinks) subscribe and fan the messages out further.
//!
//! ## Delivery
//!
//! - **Best-effort broadcast**: every live subscriber receives a copy of each message
//! - **Ordered per publisher**: a subscriber sees messages in the order one publisher sent them
//! - **No persistence**: the job store is the source of truth; the bus only distributes
//!
//! Consumers that fall behind or disconnect lose messages; they can always re-read the
//! current job state from the queue.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

/// Publication failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Internal lock poisoning; the bus can no longer be trusted.
    #[error("event bus lock poisoned")]
    Poisoned,
    /// The transport refused the message.
    #[error("event bus transport error: {0}")]
    Transport(String),
}

/// A subscription to a message stream.
///
/// Each subscription gets a copy of every message published after it was created.
///
/// ```ignore
/// let sub = bus.subscribe();
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => forward(event),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
///
/// Subscriptions are meant for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub bus.
///
/// Object safe, so services hold an `Arc<dyn EventBus<M>>` and tests swap in
/// the in-memory implementation.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
