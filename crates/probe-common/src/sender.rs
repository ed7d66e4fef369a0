//! The [`EventSender`] trait is the transport used by probes to hand events
//! to user-space.
//!
//! [`EventSender::send`] must not block since it's called from hook context.
//! Failing to deliver an event is not an error: the event is dropped.

use std::sync::Arc;

use tokio::sync::mpsc;

pub trait EventSender<T>: Send + Sync {
    /// Must not block since it can be used in hook context
    fn send(&self, event: T);
}

/// Simple implementation for tokio::mpsc bounded channels.
/// Sending with full channel will drop messages.
impl<T: 'static + Send> EventSender<T> for mpsc::Sender<T> {
    fn send(&self, event: T) {
        if self.try_send(event).is_err() {
            log::warn!("dropping msg");
        }
    }
}

/// Unbounded channels never drop, unless the receiver is gone.
impl<T: 'static + Send> EventSender<T> for mpsc::UnboundedSender<T> {
    fn send(&self, event: T) {
        if mpsc::UnboundedSender::send(self, event).is_err() {
            log::warn!("dropping msg: receiver closed");
        }
    }
}

impl<T, S: EventSender<T> + ?Sized> EventSender<T> for Arc<S> {
    fn send(&self, event: T) {
        (**self).send(event)
    }
}

/// EventSenderWrapper wraps an EventSender with a new one which calls
/// a callback on every event generated. This is useful for consumers
/// which want to take some actions when events are sent.
#[derive(Clone)]
pub struct EventSenderWrapper<S, F> {
    cb: F,
    inner: S,
}

impl<S, F> EventSenderWrapper<S, F> {
    pub fn new(inner: S, cb: F) -> Self {
        Self { inner, cb }
    }
}

impl<S, F, E> EventSender<E> for EventSenderWrapper<S, F>
where
    S: EventSender<E>,
    F: Fn(&E) + Send + Sync,
{
    fn send(&self, event: E) {
        (self.cb)(&event);
        self.inner.send(event)
    }
}
