#[cfg(test)]
pub mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;
    use parking_lot::Mutex;

    use crate::error::{EventBusError, EventBusResult};
    use crate::events::{
        Event, EventBus, EventType, NoSubscriberEvent, SubscriberExceptionEvent, WeakEventBus,
    };
    use crate::executor::Job;
    use crate::posters::MainThreadSupport;
    use crate::subscribers::{Subscriber, SubscriberMethod, ThreadMode};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    #[derive(Debug)]
    struct First;
    impl Event for First {}

    #[derive(Debug)]
    struct Second;
    impl Event for Second {}

    #[derive(Debug)]
    struct Orphan;
    impl Event for Orphan {}

    fn test_bus() -> EventBus {
        EventBus::builder()
            .source("unit")
            .async_pool_size(2)
            .build()
            .unwrap()
    }

    // Posts Second from inside the highest priority First handler
    struct Chain {
        bus: WeakEventBus,
        log: Log,
    }

    impl Subscriber for Chain {
        fn subscriber_methods() -> Vec<SubscriberMethod> {
            vec![
                SubscriberMethod::new("first_high", |c: &Chain, _: &First| {
                    c.log.lock().push("first:high");
                    if let Some(bus) = c.bus.upgrade() {
                        bus.post(Second)?;
                    }
                    c.log.lock().push("first:high:done");
                    Ok(())
                })
                .with_priority(1),
                SubscriberMethod::new("first_low", |c: &Chain, _: &First| {
                    c.log.lock().push("first:low");
                    Ok(())
                }),
                SubscriberMethod::new("second", |c: &Chain, _: &Second| {
                    c.log.lock().push("second");
                    Ok(())
                }),
            ]
        }
    }

    #[test]
    fn test_reentrant_post_is_delivered_after_current_event() {
        let bus = test_bus();
        let chain = Arc::new(Chain {
            bus: bus.downgrade(),
            log: Log::default(),
        });
        bus.register(&chain).unwrap();

        bus.post(First).unwrap();
        assert_eq!(
            *chain.log.lock(),
            vec!["first:high", "first:high:done", "first:low", "second"]
        );
    }

    // One instance, five handlers on the same event type
    struct Ranked {
        bus: WeakEventBus,
        log: Log,
        cancel: AtomicBool,
    }

    fn ranked_method(name: &'static str, priority: i32) -> SubscriberMethod {
        SubscriberMethod::new(name, move |r: &Ranked, event: &First| {
            r.log.lock().push(name);
            if priority == 1 && r.cancel.load(Ordering::SeqCst) {
                let bus = r.bus.upgrade().ok_or_else(|| anyhow!("bus gone"))?;
                bus.cancel_event_delivery(event)?;
            }
            Ok(())
        })
        .with_priority(priority)
    }

    impl Subscriber for Ranked {
        fn subscriber_methods() -> Vec<SubscriberMethod> {
            vec![
                ranked_method("p0", 0),
                ranked_method("m100", -100),
                ranked_method("p10", 10),
                ranked_method("m1", -1),
                ranked_method("p1", 1),
            ]
        }
    }

    #[test]
    fn test_priority_order_and_cancellation() {
        let bus = test_bus();
        let ranked = Arc::new(Ranked {
            bus: bus.downgrade(),
            log: Log::default(),
            cancel: AtomicBool::new(true),
        });
        bus.register(&ranked).unwrap();

        bus.post(First).unwrap();
        assert_eq!(*ranked.log.lock(), vec!["p10", "p1"]);

        ranked.log.lock().clear();
        ranked.cancel.store(false, Ordering::SeqCst);
        bus.post(First).unwrap();
        assert_eq!(*ranked.log.lock(), vec!["p10", "p1", "p0", "m1", "m100"]);
    }

    #[test]
    fn test_cancel_outside_handler_is_illegal() {
        let bus = test_bus();
        let event = First;
        assert!(matches!(
            bus.cancel_event_delivery(&event),
            Err(EventBusError::IllegalCancellation(_))
        ));
        assert!(matches!(
            bus.abort_event_delivery(&event),
            Err(EventBusError::IllegalCancellation(_))
        ));
    }

    // First fails after queueing Second; lower priority First handler must be skipped
    struct Failing {
        bus: WeakEventBus,
        log: Log,
    }

    impl Subscriber for Failing {
        fn subscriber_methods() -> Vec<SubscriberMethod> {
            vec![
                SubscriberMethod::new("explode", |f: &Failing, _: &First| {
                    if let Some(bus) = f.bus.upgrade() {
                        bus.post(Second)?;
                    }
                    Err(anyhow!("first failed"))
                })
                .with_priority(1),
                SubscriberMethod::new("after", |f: &Failing, _: &First| {
                    f.log.lock().push("after");
                    Ok(())
                }),
                SubscriberMethod::new("second", |f: &Failing, _: &Second| {
                    f.log.lock().push("second");
                    Ok(())
                }),
            ]
        }
    }

    #[test]
    fn test_throw_mode_surfaces_failure_and_keeps_draining() {
        let bus = EventBus::builder()
            .throw_subscriber_exception(true)
            .async_pool_size(2)
            .build()
            .unwrap();
        let failing = Arc::new(Failing {
            bus: bus.downgrade(),
            log: Log::default(),
        });
        bus.register(&failing).unwrap();

        let err = bus.post(First).unwrap_err();
        match err {
            EventBusError::HandlerInvocation { subscriber, cause, .. } => {
                assert!(subscriber.ends_with("Failing"));
                assert_eq!(cause.to_string(), "first failed");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*failing.log.lock(), vec!["second"]);
    }

    #[derive(Default)]
    struct Watcher {
        unhandled: Mutex<Vec<EventType>>,
    }

    impl Subscriber for Watcher {
        fn subscriber_methods() -> Vec<SubscriberMethod> {
            vec![SubscriberMethod::new(
                "on_no_subscriber",
                |w: &Watcher, e: &NoSubscriberEvent| {
                    w.unhandled.lock().push(e.original_event.event_type());
                    Ok(())
                },
            )]
        }
    }

    #[test]
    fn test_no_subscriber_event_is_posted_once() {
        let bus = test_bus();
        let watcher = Arc::new(Watcher::default());
        bus.register(&watcher).unwrap();

        bus.post(Orphan).unwrap();
        assert_eq!(*watcher.unhandled.lock(), vec![EventType::of::<Orphan>()]);
    }

    #[test]
    fn test_no_subscriber_event_can_be_disabled() {
        let bus = EventBus::builder()
            .send_no_subscriber_event(false)
            .async_pool_size(2)
            .build()
            .unwrap();
        let watcher = Arc::new(Watcher::default());
        bus.register(&watcher).unwrap();

        bus.post(Orphan).unwrap();
        assert!(watcher.unhandled.lock().is_empty());
    }

    #[test]
    fn test_unhandled_system_event_does_not_recurse() {
        let bus = test_bus();
        let original = Arc::new(Orphan);
        bus.post(NoSubscriberEvent {
            bus: bus.downgrade(),
            original_event: original,
            timestamp: chrono::Utc::now(),
        })
        .unwrap();
        assert!(!bus.has_subscriber_for::<NoSubscriberEvent>());
    }

    #[derive(Default)]
    struct Grumpy {
        reports: AtomicUsize,
        messages: Mutex<Vec<String>>,
    }

    impl Subscriber for Grumpy {
        fn subscriber_methods() -> Vec<SubscriberMethod> {
            vec![
                SubscriberMethod::new("on_first", |_: &Grumpy, _: &First| Err(anyhow!("nope"))),
                SubscriberMethod::new(
                    "on_exception",
                    |g: &Grumpy, e: &SubscriberExceptionEvent| {
                        g.reports.fetch_add(1, Ordering::SeqCst);
                        let consistent =
                            e.subscriber::<Grumpy>().is_some() && e.causing_event.is::<First>();
                        g.messages.lock().push(format!("{}:{}", e.error, consistent));
                        Err(anyhow!("also nope"))
                    },
                ),
            ]
        }
    }

    #[test]
    fn test_failing_exception_handler_is_not_reported_again() {
        let bus = test_bus();
        let grumpy = Arc::new(Grumpy::default());
        bus.register(&grumpy).unwrap();

        bus.post(First).unwrap();
        assert_eq!(grumpy.reports.load(Ordering::SeqCst), 1);
        assert_eq!(*grumpy.messages.lock(), vec!["nope:true".to_string()]);
    }

    // Main context driven by hand
    #[derive(Clone, Default)]
    struct ManualMain {
        main: Arc<AtomicBool>,
        tasks: Arc<Mutex<Vec<Job>>>,
    }

    impl ManualMain {
        fn run(&self) -> usize {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            let count = tasks.len();
            for task in tasks {
                task();
            }
            count
        }
    }

    impl MainThreadSupport for ManualMain {
        fn is_main_thread(&self) -> bool {
            self.main.load(Ordering::SeqCst)
        }

        fn schedule(&self, task: Job) -> EventBusResult<()> {
            self.tasks.lock().push(task);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Modal {
        log: Log,
    }

    impl Subscriber for Modal {
        fn subscriber_methods() -> Vec<SubscriberMethod> {
            vec![
                SubscriberMethod::new("on_main", |m: &Modal, _: &First| {
                    m.log.lock().push("main");
                    Ok(())
                })
                .with_thread_mode(ThreadMode::Main),
                SubscriberMethod::new("on_ordered", |m: &Modal, _: &First| {
                    m.log.lock().push("ordered");
                    Ok(())
                })
                .with_thread_mode(ThreadMode::MainOrdered),
            ]
        }
    }

    #[test]
    fn test_main_modes_on_main_thread() {
        let main = ManualMain::default();
        main.main.store(true, Ordering::SeqCst);
        let bus = EventBus::builder()
            .main_thread_support(main.clone())
            .async_pool_size(2)
            .build()
            .unwrap();
        let modal = Arc::new(Modal::default());
        bus.register(&modal).unwrap();

        bus.post(First).unwrap();
        assert_eq!(*modal.log.lock(), vec!["main"]);
        assert_eq!(main.run(), 1);
        assert_eq!(*modal.log.lock(), vec!["main", "ordered"]);
    }

    #[test]
    fn test_main_modes_off_main_thread() {
        let main = ManualMain::default();
        let bus = EventBus::builder()
            .main_thread_support(main.clone())
            .max_main_drain(Duration::from_secs(5))
            .async_pool_size(2)
            .build()
            .unwrap();
        let modal = Arc::new(Modal::default());
        bus.register(&modal).unwrap();

        bus.post(First).unwrap();
        assert!(modal.log.lock().is_empty());
        assert_eq!(main.run(), 1);
        assert_eq!(*modal.log.lock(), vec!["main", "ordered"]);
        assert_eq!(main.run(), 0);
    }

    #[test]
    fn test_main_drain_yields_when_over_budget() {
        let main = ManualMain::default();
        let bus = EventBus::builder()
            .main_thread_support(main.clone())
            .max_main_drain(Duration::ZERO)
            .async_pool_size(2)
            .build()
            .unwrap();
        let modal = Arc::new(Modal::default());
        bus.register(&modal).unwrap();

        bus.post(First).unwrap();
        assert_eq!(main.run(), 1);
        assert_eq!(*modal.log.lock(), vec!["main"]);
        assert_eq!(main.run(), 1);
        assert_eq!(*modal.log.lock(), vec!["main", "ordered"]);

        while main.run() > 0 {}
        assert_eq!(modal.log.lock().len(), 2);
    }

    #[test]
    fn test_unregistered_subscription_skips_queued_delivery() {
        let main = ManualMain::default();
        let bus = EventBus::builder()
            .main_thread_support(main.clone())
            .async_pool_size(2)
            .build()
            .unwrap();
        let modal = Arc::new(Modal::default());
        bus.register(&modal).unwrap();

        bus.post(First).unwrap();
        bus.unregister(&modal);
        main.run();
        assert!(modal.log.lock().is_empty());
    }

    #[test]
    fn test_max_main_drain_saturates() {
        let bus = EventBus::builder()
            .max_main_drain(Duration::MAX)
            .async_pool_size(2)
            .build()
            .unwrap();
        assert_eq!(bus.config().max_main_drain_millis, u64::MAX);

        let bus = EventBus::builder()
            .max_main_drain(Duration::from_millis(250))
            .async_pool_size(2)
            .build()
            .unwrap();
        assert_eq!(bus.config().max_main_drain(), Duration::from_millis(250));
    }
}
