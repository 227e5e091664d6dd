//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Deferred delivery. A subscription whose thread mode cannot run on the posting thread is
// wrapped in a `PendingPost` and handed to the poster of its mode.
//
// | Component          | Description                                                      |
// |--------------------|------------------------------------------------------------------|
// | PendingPost        | One deferred (subscription, event) delivery, pooled              |
// | PendingPostPool    | Recycles boxed pending posts                                     |
// | Poster             | Accepts pending posts for later invocation                       |
// | MainPoster         | FIFO drained on the main context in time-boxed slices            |
// | BackgroundPoster   | FIFO drained by one job at a time on the background executor     |
// | AsyncPoster        | One executor job per pending post                                |
// | TrackedAsyncPoster | Like AsyncPoster, with collision handling and cancellation       |
//--------------------------------------------------------------------------------------------------

mod async_poster;
mod background;
mod main_thread;
mod tracked;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::events::bus::EventBus;
use crate::events::types::Event;
use crate::subscribers::Subscription;

pub(crate) use async_poster::AsyncPoster;
pub(crate) use background::BackgroundPoster;
pub use main_thread::{MainLoop, MainLoopHandle, MainThreadSupport};
pub(crate) use main_thread::MainPoster;
pub(crate) use tracked::TrackedAsyncPoster;

/// Most pending posts kept for reuse
const MAX_POOLED: usize = 10_000;

/// A delivery waiting for a poster.
#[derive(Default)]
pub(crate) struct PendingPost {
    subscription: Option<Arc<Subscription>>,
    event: Option<Arc<dyn Event>>,
}

impl PendingPost {
    /// Takes the delivery out, leaving an empty shell for the pool
    pub(crate) fn take(&mut self) -> Option<(Arc<Subscription>, Arc<dyn Event>)> {
        Some((self.subscription.take()?, self.event.take()?))
    }

    pub(crate) fn parts(&self) -> Option<(&Arc<Subscription>, &Arc<dyn Event>)> {
        Some((self.subscription.as_ref()?, self.event.as_ref()?))
    }
}

/// Recycles `PendingPost` boxes so busy buses do not allocate one per deferred delivery.
#[derive(Default)]
pub(crate) struct PendingPostPool {
    pool: Mutex<Vec<Box<PendingPost>>>,
}

impl PendingPostPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn obtain(&self, subscription: Arc<Subscription>, event: Arc<dyn Event>) -> Box<PendingPost> {
        let mut pending = self.pool.lock().pop().unwrap_or_default();
        pending.subscription = Some(subscription);
        pending.event = Some(event);
        pending
    }

    pub(crate) fn release(&self, mut pending: Box<PendingPost>) {
        pending.subscription = None;
        pending.event = None;
        let mut pool = self.pool.lock();
        if pool.len() < MAX_POOLED {
            pool.push(pending);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.pool.lock().len()
    }
}

/// Accepts deliveries that run later, on another context.
pub(crate) trait Poster: Send + Sync {
    fn enqueue(&self, bus: &EventBus, pending: Box<PendingPost>);
}
