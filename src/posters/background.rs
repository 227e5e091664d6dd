use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use super::{PendingPost, Poster};
use crate::events::bus::{EventBus, WeakEventBus};
use crate::executor::Executor;

/// How long an idle drain job waits for more work before retiring
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Queue {
    items: VecDeque<Box<PendingPost>>,
    /// True while a drain job is scheduled or running
    running: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Delivers Background-mode posts one at a time, in FIFO order.
///
/// At most one drain job exists at any time, so background handlers never run concurrently
/// with each other even on a multi-threaded executor.
pub(crate) struct BackgroundPoster {
    shared: Arc<Shared>,
    executor: Arc<dyn Executor>,
}

impl BackgroundPoster {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                available: Condvar::new(),
            }),
            executor,
        }
    }

    fn drain(shared: &Shared, bus: &WeakEventBus) {
        loop {
            let next = {
                let mut queue = shared.queue.lock();
                if queue.items.is_empty() {
                    shared.available.wait_for(&mut queue, IDLE_WAIT);
                }
                match queue.items.pop_front() {
                    Some(pending) => pending,
                    None => {
                        queue.running = false;
                        return;
                    }
                }
            };

            match bus.upgrade() {
                Some(bus) => bus.invoke_pending(next),
                None => {
                    debug!("Event bus dropped, discarding background deliveries");
                    let mut queue = shared.queue.lock();
                    queue.items.clear();
                    queue.running = false;
                    return;
                }
            }
        }
    }
}

/// The drain job handed to the executor. Dropped unrun, it clears `running` so the next
/// post starts a new drain for whatever is still queued.
struct DrainJob {
    shared: Arc<Shared>,
    bus: WeakEventBus,
    started: bool,
}

impl DrainJob {
    fn run(mut self) {
        self.started = true;
        BackgroundPoster::drain(&self.shared, &self.bus);
    }
}

impl Drop for DrainJob {
    fn drop(&mut self) {
        if !self.started {
            let mut queue = self.shared.queue.lock();
            queue.running = false;
            warn!(
                "Background drain dropped before running, {} deliveries wait for the next post",
                queue.items.len()
            );
        }
    }
}

impl Poster for BackgroundPoster {
    fn enqueue(&self, bus: &EventBus, pending: Box<PendingPost>) {
        let start = {
            let mut queue = self.shared.queue.lock();
            queue.items.push_back(pending);
            self.shared.available.notify_one();
            !std::mem::replace(&mut queue.running, true)
        };

        if start {
            let job = DrainJob {
                shared: self.shared.clone(),
                bus: bus.downgrade(),
                started: false,
            };
            if let Err(err) = self.executor.execute(Box::new(move || job.run())) {
                error!("Background drain not started: {}", err);
            }
        }
    }
}
