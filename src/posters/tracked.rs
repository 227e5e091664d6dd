use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::{PendingPost, Poster};
use crate::events::bus::{EventBus, WeakEventBus};
use crate::events::types::{CollisionBehavior, Event};
use crate::executor::Executor;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

/// An AsyncTracked delivery that has not finished yet.
struct TrackedTask {
    code: Option<String>,
    subscriber_id: usize,
    state: Arc<AtomicU8>,
}

impl TrackedTask {
    fn collides(&self, subscriber_id: usize, code: &Option<String>) -> bool {
        self.subscriber_id == subscriber_id && codes_match(&self.code, code)
    }

    /// Stops the delivery if it has not started. Returns true if it was stopped.
    fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn codes_match(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Unfinished tracked deliveries per concrete event type.
#[derive(Default)]
struct Tracker {
    tasks: Mutex<HashMap<TypeId, Vec<TrackedTask>>>,
}

impl Tracker {
    fn untrack(&self, key: TypeId, state: &Arc<AtomicU8>) {
        let mut tasks = self.tasks.lock();
        if let Some(list) = tasks.get_mut(&key) {
            list.retain(|task| !Arc::ptr_eq(&task.state, state));
            if list.is_empty() {
                tasks.remove(&key);
            }
        }
    }
}

/// Hands AsyncTracked posts to the executor, one job each, and remembers the ones that have not
/// finished so they can be replaced, ignored or cancelled.
pub(crate) struct TrackedAsyncPoster {
    executor: Arc<dyn Executor>,
    tracker: Arc<Tracker>,
}

impl TrackedAsyncPoster {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            tracker: Arc::new(Tracker::default()),
        }
    }

    /// Cancels the tracked deliveries of `event`'s type whose code matches, for every
    /// subscriber.
    ///
    /// Matching deliveries stop being tracked. Ones already running are not interrupted.
    ///
    /// # Returns
    ///
    /// The number of deliveries that were prevented from running.
    pub(crate) fn cancel(&self, event: &dyn Event) -> usize {
        let key = event.event_type().id();
        let code = event.unique_code();
        let mut tasks = self.tracker.tasks.lock();
        let Some(list) = tasks.get_mut(&key) else {
            return 0;
        };

        let mut cancelled = 0;
        list.retain(|task| {
            if !codes_match(&task.code, &code) {
                return true;
            }
            if task.cancel() {
                cancelled += 1;
            }
            false
        });
        if list.is_empty() {
            tasks.remove(&key);
        }
        debug!("Cancelled {} tracked deliveries of {}", cancelled, event.event_type());
        cancelled
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.tracker.tasks.lock().values().map(Vec::len).sum()
    }
}

impl Poster for TrackedAsyncPoster {
    fn enqueue(&self, bus: &EventBus, pending: Box<PendingPost>) {
        let Some((subscription, event)) = pending.parts() else {
            return;
        };
        let key = event.event_type().id();
        let code = event.unique_code();
        let subscriber_id = subscription.subscriber_id();
        let state = Arc::new(AtomicU8::new(PENDING));

        {
            let mut tasks = self.tracker.tasks.lock();
            let list = tasks.entry(key).or_default();
            match event.collision_behavior() {
                CollisionBehavior::IgnoreNew => {
                    if list.iter().any(|task| task.collides(subscriber_id, &code)) {
                        debug!(
                            "Ignoring tracked {} for {}, a matching delivery is unfinished",
                            event.event_type(),
                            subscription.subscriber_type().name()
                        );
                        drop(tasks);
                        bus.release_pending(pending);
                        return;
                    }
                }
                CollisionBehavior::ReplaceWithNew => list.retain(|task| {
                    if task.collides(subscriber_id, &code) {
                        task.cancel();
                        false
                    } else {
                        true
                    }
                }),
            }
            list.push(TrackedTask {
                code,
                subscriber_id,
                state: state.clone(),
            });
        }

        let job = TrackedJob {
            tracker: self.tracker.clone(),
            key,
            state,
            bus: bus.downgrade(),
            pending: Some(pending),
        };
        if let Err(err) = self.executor.execute(Box::new(move || job.run())) {
            error!("Tracked async delivery dropped: {}", err);
        }
    }
}

/// One tracked delivery on the executor. It is untracked when it finishes, and also when the
/// executor drops it unrun.
struct TrackedJob {
    tracker: Arc<Tracker>,
    key: TypeId,
    state: Arc<AtomicU8>,
    bus: WeakEventBus,
    pending: Option<Box<PendingPost>>,
}

impl TrackedJob {
    fn run(mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let claimed = self
            .state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            bus.invoke_pending(pending);
        } else {
            bus.release_pending(pending);
        }
    }
}

impl Drop for TrackedJob {
    fn drop(&mut self) {
        if self.pending.is_some() {
            warn!("Tracked delivery dropped before running");
        }
        self.tracker.untrack(self.key, &self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EventBusError, EventBusResult};
    use crate::executor::Job;
    use crate::posters::PendingPostPool;
    use crate::subscribers::{
        Subscriber, SubscriberMethod, SubscriberRef, SubscriberType, Subscription, ThreadMode,
        subscriber_id,
    };
    use std::sync::atomic::AtomicUsize;

    /// Holds jobs until the test runs them
    #[derive(Default)]
    struct Parked {
        jobs: Mutex<Vec<Job>>,
    }

    impl Parked {
        fn run_all(&self) {
            let jobs = std::mem::take(&mut *self.jobs.lock());
            for job in jobs {
                job();
            }
        }
    }

    impl Executor for Parked {
        fn execute(&self, job: Job) -> EventBusResult<()> {
            self.jobs.lock().push(job);
            Ok(())
        }
    }

    struct Refusing;

    impl Executor for Refusing {
        fn execute(&self, _job: Job) -> EventBusResult<()> {
            Err(EventBusError::ExecutorRejected("refusing".to_string()))
        }
    }

    #[derive(Debug)]
    struct Fetch(&'static str);

    impl Event for Fetch {
        fn unique_code(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[derive(Default)]
    struct Loader {
        calls: AtomicUsize,
    }

    impl Subscriber for Loader {
        fn subscriber_methods() -> Vec<SubscriberMethod> {
            vec![
                SubscriberMethod::new("on_fetch", |l: &Loader, _: &Fetch| {
                    l.calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .with_thread_mode(ThreadMode::AsyncTracked),
            ]
        }
    }

    fn enqueue_fetch(
        poster: &TrackedAsyncPoster,
        bus: &EventBus,
        loader: &Arc<Loader>,
        code: &'static str,
    ) {
        let subscription = Arc::new(Subscription::new(
            SubscriberRef::strong(loader),
            subscriber_id(loader),
            SubscriberType::of::<Loader>(),
            Loader::subscriber_methods().remove(0),
        ));
        let pending = PendingPostPool::new().obtain(subscription, Arc::new(Fetch(code)));
        poster.enqueue(bus, pending);
    }

    #[test]
    fn test_replace_cancels_pending_duplicate() {
        let bus = EventBus::builder().async_pool_size(1).build().unwrap();
        let loader = Arc::new(Loader::default());
        let parked = Arc::new(Parked::default());
        let poster = TrackedAsyncPoster::new(parked.clone());

        enqueue_fetch(&poster, &bus, &loader, "a");
        enqueue_fetch(&poster, &bus, &loader, "a");
        enqueue_fetch(&poster, &bus, &loader, "b");
        assert_eq!(poster.tracked(), 2);

        parked.run_all();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(poster.tracked(), 0);
    }

    #[test]
    fn test_cancel_counts_prevented_deliveries() {
        let bus = EventBus::builder().async_pool_size(1).build().unwrap();
        let loader = Arc::new(Loader::default());
        let parked = Arc::new(Parked::default());
        let poster = TrackedAsyncPoster::new(parked.clone());

        enqueue_fetch(&poster, &bus, &loader, "a");
        enqueue_fetch(&poster, &bus, &loader, "b");
        assert_eq!(poster.cancel(&Fetch("a")), 1);
        assert_eq!(poster.cancel(&Fetch("a")), 0);

        parked.run_all();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(poster.tracked(), 0);
    }

    #[test]
    fn test_rejected_job_is_untracked() {
        let bus = EventBus::builder().async_pool_size(1).build().unwrap();
        let loader = Arc::new(Loader::default());
        let poster = TrackedAsyncPoster::new(Arc::new(Refusing));

        enqueue_fetch(&poster, &bus, &loader, "a");
        assert_eq!(poster.tracked(), 0);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_codes_match() {
        assert!(codes_match(&Some("a".into()), &Some("a".into())));
        assert!(!codes_match(&Some("a".into()), &Some("b".into())));
        assert!(codes_match(&None, &Some("b".into())));
        assert!(codes_match(&Some("a".into()), &None));
    }
}
