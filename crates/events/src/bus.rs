//! Notification publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes "something changed" notifications between the job
//! manager and anyone waiting on a job. It is a **latency optimization**, not a
//! source of truth:
//!
//! - **Transport-agnostic**: in-memory channels, Redis pub/sub, etc.
//! - **Best-effort**: a message may be dropped, duplicated or reordered
//! - **No persistence**: the job store is authoritative; waiters always re-read it
//!
//! Waiters combine a subscription with a bounded `recv_timeout`, so a lost
//! message only costs one poll interval of latency.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to a notification stream.
///
/// Each subscription receives its own copy of every message published after it
/// was created (broadcast semantics).
///
/// ```ignore
/// let sub = bus.subscribe();
/// loop {
///     match sub.recv_timeout(poll_interval) {
///         Ok(msg) => { /* re-read the store */ }
///         Err(RecvTimeoutError::Timeout) => { /* re-read the store anyway */ }
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
///
/// Subscriptions are meant to be consumed by a single thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Fire-and-forget pub/sub channel.
///
/// `publish()` may fail (bus closed, network error); callers on the completion
/// path log the failure and carry on, because correctness never depends on
/// delivery.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
