use std::sync::Arc;

use tracing::error;

use super::{PendingPost, Poster};
use crate::events::bus::EventBus;
use crate::executor::Executor;

/// Hands every Async-mode post to the executor as its own job. No ordering between posts.
pub(crate) struct AsyncPoster {
    executor: Arc<dyn Executor>,
}

impl AsyncPoster {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

impl Poster for AsyncPoster {
    fn enqueue(&self, bus: &EventBus, pending: Box<PendingPost>) {
        let weak = bus.downgrade();
        let job = Box::new(move || {
            if let Some(bus) = weak.upgrade() {
                bus.invoke_pending(pending);
            }
        });
        if let Err(err) = self.executor.execute(job) {
            error!("Async delivery dropped: {}", err);
        }
    }
}
