//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | MainThreadSupport       | The application's designated main context         | is_main_thread    |
// |                         |                                                   | schedule          |
// | MainLoop                | Ready-made main context backed by a channel       | run_pending       |
// |                         |                                                   | run_for           |
// | MainPoster              | Delivers Main/MainOrdered posts on that context   | enqueue           |
//--------------------------------------------------------------------------------------------------

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{PendingPost, Poster};
use crate::error::{EventBusError, EventBusResult};
use crate::events::bus::{EventBus, WeakEventBus};
use crate::executor::Job;

/// The main execution context of the embedding application.
///
/// Usually a UI or game loop. Without one, every thread counts as main and Main-mode
/// handlers run on the posting thread.
pub trait MainThreadSupport: Send + Sync {
    /// Returns true if the calling thread is the main context
    fn is_main_thread(&self) -> bool;

    /// Runs `task` on the main context, after tasks scheduled before it.
    ///
    /// Returns `Err(ExecutorRejected)` if the task was dropped without running.
    fn schedule(&self, task: Job) -> EventBusResult<()>;
}

/// A minimal main context: the thread that created it runs whatever was scheduled when it
/// calls [`run_pending`](Self::run_pending) or [`run_for`](Self::run_for).
///
/// `MainLoop` stays on its thread; hand [`handle`](Self::handle) to the bus builder.
pub struct MainLoop {
    thread: ThreadId,
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    _not_send: PhantomData<*const ()>,
}

impl MainLoop {
    /// Makes the calling thread the main context
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        info!("Main loop bound to thread {:?}", thread::current().name());
        Self {
            thread: thread::current().id(),
            sender,
            receiver,
            _not_send: PhantomData,
        }
    }

    /// Returns a handle other threads can schedule through
    pub fn handle(&self) -> MainLoopHandle {
        MainLoopHandle {
            thread: self.thread,
            sender: self.sender.clone(),
        }
    }

    /// Runs every task scheduled so far, including ones they schedule.
    ///
    /// # Returns
    ///
    /// The number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            count += 1;
        }
        count
    }

    /// Runs tasks as they arrive until `duration` has elapsed.
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut count = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(task) => {
                    task();
                    count += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return count;
                }
            }
        }
    }

    /// Runs tasks until `done` returns true or `timeout` elapses.
    ///
    /// # Returns
    ///
    /// Whether `done` became true.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !done() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if let Ok(task) = self
                .receiver
                .recv_timeout(remaining.min(Duration::from_millis(10)))
            {
                task();
            }
        }
        true
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable, thread-safe side of a [`MainLoop`].
#[derive(Clone)]
pub struct MainLoopHandle {
    thread: ThreadId,
    sender: Sender<Job>,
}

impl MainThreadSupport for MainLoopHandle {
    fn is_main_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn schedule(&self, task: Job) -> EventBusResult<()> {
        self.sender
            .send(task)
            .map_err(|_| EventBusError::ExecutorRejected("main loop is gone".to_string()))
    }
}

#[derive(Default)]
struct Queue {
    items: VecDeque<Box<PendingPost>>,
    /// True while a drain task is scheduled on the main context
    active: bool,
}

struct Shared {
    support: Arc<dyn MainThreadSupport>,
    queue: Mutex<Queue>,
    max_drain: Duration,
}

/// Delivers Main and MainOrdered posts on the main context.
///
/// One drain task at a time is scheduled. A drain that runs longer than `max_drain` hands
/// the rest of the queue to a fresh task so the main context can do other work in between.
pub(crate) struct MainPoster {
    shared: Arc<Shared>,
}

impl MainPoster {
    pub(crate) fn new(support: Arc<dyn MainThreadSupport>, max_drain: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                support,
                queue: Mutex::new(Queue::default()),
                max_drain,
            }),
        }
    }

    fn schedule_drain(shared: Arc<Shared>, bus: WeakEventBus) {
        let support = shared.support.clone();
        let task = DrainTask {
            shared,
            bus,
            started: false,
        };
        if let Err(err) = support.schedule(Box::new(move || task.run())) {
            error!("Main drain not scheduled: {}", err);
        }
    }

    fn drain(shared: &Arc<Shared>, bus: &WeakEventBus) {
        let started = Instant::now();
        loop {
            let next = {
                let mut queue = shared.queue.lock();
                match queue.items.pop_front() {
                    Some(pending) => pending,
                    None => {
                        queue.active = false;
                        return;
                    }
                }
            };

            let Some(strong) = bus.upgrade() else {
                let mut queue = shared.queue.lock();
                queue.items.clear();
                queue.active = false;
                return;
            };
            strong.invoke_pending(next);
            drop(strong);

            if started.elapsed() >= shared.max_drain {
                debug!("Main drain exceeded {:?}, rescheduling", shared.max_drain);
                Self::schedule_drain(shared.clone(), bus.clone());
                return;
            }
        }
    }
}

/// One scheduled drain of the main queue.
///
/// A main context that drops the task unrun clears `active`, so the next post schedules a
/// fresh drain for whatever is still queued.
struct DrainTask {
    shared: Arc<Shared>,
    bus: WeakEventBus,
    started: bool,
}

impl DrainTask {
    fn run(mut self) {
        self.started = true;
        MainPoster::drain(&self.shared, &self.bus);
    }
}

impl Drop for DrainTask {
    fn drop(&mut self) {
        if !self.started {
            let mut queue = self.shared.queue.lock();
            queue.active = false;
            warn!(
                "Main drain dropped before running, {} deliveries wait for the next post",
                queue.items.len()
            );
        }
    }
}

impl Poster for MainPoster {
    fn enqueue(&self, bus: &EventBus, pending: Box<PendingPost>) {
        let start = {
            let mut queue = self.shared.queue.lock();
            queue.items.push_back(pending);
            !std::mem::replace(&mut queue.active, true)
        };
        if start {
            Self::schedule_drain(self.shared.clone(), bus.downgrade());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_main_loop_identity() {
        let main_loop = MainLoop::new();
        let handle = main_loop.handle();
        assert!(handle.is_main_thread());

        let remote = handle.clone();
        let from_other = thread::spawn(move || remote.is_main_thread()).join().unwrap();
        assert!(!from_other);
    }

    #[test]
    fn test_tasks_run_on_loop_thread_in_order() {
        let main_loop = MainLoop::new();
        let handle = main_loop.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        let worker = {
            let order = order.clone();
            thread::spawn(move || {
                for i in 0..3 {
                    let order = order.clone();
                    let check = handle.clone();
                    handle
                        .schedule(Box::new(move || {
                            assert!(check.is_main_thread());
                            order.lock().push(i);
                        }))
                        .unwrap();
                }
            })
        };
        worker.join().unwrap();

        assert_eq!(main_loop.run_pending(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_run_until() {
        let main_loop = MainLoop::new();
        let handle = main_loop.handle();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        thread::spawn(move || {
            handle
                .schedule(Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        });

        assert!(main_loop.run_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) == 1));
        assert!(!main_loop.run_until(Duration::from_millis(20), || false));
    }

    #[test]
    fn test_schedule_fails_once_loop_is_gone() {
        let main_loop = MainLoop::new();
        let handle = main_loop.handle();
        drop(main_loop);

        let err = handle.schedule(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, EventBusError::ExecutorRejected(_)));
    }
}
