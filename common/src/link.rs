use std::sync::atomic::{AtomicBool, Ordering};

/// Broker link status shared between an MQTT receiver and the scheduler.
///
/// The receiver only flips flags. Subscribing happens on the scheduler side
/// once the connect notification has been released, since some clients hold
/// their API lock until the receiver is done with the event.
#[derive(Debug, Default)]
pub struct LinkState {
    connected: AtomicBool,
    resubscribe: AtomicBool,
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&self) {
        self.connected.store(true, Ordering::Release);
        self.resubscribe.store(true, Ordering::Release);
    }

    pub fn on_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Returns true once per connect; the caller owns the subscribe attempt.
    pub fn take_resubscribe(&self) -> bool {
        self.resubscribe.swap(false, Ordering::AcqRel)
    }

    /// Re-arm after a failed subscribe so the next pass retries.
    pub fn retry_resubscribe(&self) {
        self.resubscribe.store(true, Ordering::Release);
    }
}
