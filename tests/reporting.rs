//--------------------------------------------------------------------------------------------------
// TEST MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Failure and dead-event reporting, throw mode and configuration plumbing.
//--------------------------------------------------------------------------------------------------

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::bail;
use crossbeam_channel::{Sender, unbounded};
use eventbus::{
    Event, EventBusConfig, EventBusError, NoSubscriberEvent, Subscriber, SubscriberExceptionEvent,
    SubscriberMethod, ThreadMode,
};
use parking_lot::Mutex;

use common::{WAIT, assert_quiet, builder, test_bus};

#[derive(Debug, PartialEq)]
struct Order(u32);
impl Event for Order {}

#[derive(Debug)]
struct Orphan;
impl Event for Orphan {}

struct Broken {
    attempts: AtomicUsize,
}

impl Subscriber for Broken {
    fn subscriber_methods() -> Vec<SubscriberMethod> {
        vec![SubscriberMethod::new("on_order", |b: &Broken, order: &Order| {
            b.attempts.fetch_add(1, Ordering::SeqCst);
            bail!("cannot handle order {}", order.0)
        })]
    }
}

struct Exploding;

impl Subscriber for Exploding {
    fn subscriber_methods() -> Vec<SubscriberMethod> {
        vec![SubscriberMethod::new("on_order", |_: &Exploding, _: &Order| {
            panic!("boom")
        })]
    }
}

struct BrokenAsync {
    attempts: AtomicUsize,
}

impl Subscriber for BrokenAsync {
    fn subscriber_methods() -> Vec<SubscriberMethod> {
        vec![
            SubscriberMethod::new("on_order", |b: &BrokenAsync, _: &Order| {
                b.attempts.fetch_add(1, Ordering::SeqCst);
                bail!("async failure")
            })
            .with_thread_mode(ThreadMode::Async),
        ]
    }
}

/// Collects the bus's own reports
struct Monitor {
    failures: Sender<(String, String, bool)>,
    orphans: Mutex<Vec<String>>,
}

impl Subscriber for Monitor {
    fn subscriber_methods() -> Vec<SubscriberMethod> {
        vec![
            SubscriberMethod::new("on_failure", |m: &Monitor, e: &SubscriberExceptionEvent| {
                let is_order = e.causing_event.downcast_ref::<Order>().is_some();
                let _ = m.failures.send((
                    e.causing_subscriber_type.to_string(),
                    format!("{:#}", e.error),
                    is_order,
                ));
                Ok(())
            }),
            SubscriberMethod::new("on_orphan", |m: &Monitor, e: &NoSubscriberEvent| {
                m.orphans
                    .lock()
                    .push(e.original_event.event_type().short_name().to_string());
                Ok(())
            }),
        ]
    }
}

fn monitor() -> (Arc<Monitor>, crossbeam_channel::Receiver<(String, String, bool)>) {
    let (tx, rx) = unbounded();
    let monitor = Arc::new(Monitor {
        failures: tx,
        orphans: Mutex::new(Vec::new()),
    });
    (monitor, rx)
}

#[test]
fn test_handler_error_is_reported_as_event() {
    let bus = test_bus();
    let (monitor, rx) = monitor();
    let broken = Arc::new(Broken {
        attempts: AtomicUsize::new(0),
    });
    bus.register(&monitor).unwrap();
    bus.register(&broken).unwrap();

    bus.post(Order(7)).unwrap();

    let (subscriber, error, is_order) = rx.try_recv().unwrap();
    assert!(subscriber.ends_with("Broken"));
    assert_eq!(error, "cannot handle order 7");
    assert!(is_order);
    assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
}

struct Inspector {
    seen: Mutex<Option<(bool, bool)>>,
}

impl Subscriber for Inspector {
    fn subscriber_methods() -> Vec<SubscriberMethod> {
        vec![SubscriberMethod::new(
            "on_failure",
            |i: &Inspector, e: &SubscriberExceptionEvent| {
                let same_instance = e.subscriber::<Broken>().is_some();
                let bus_alive = e.bus.upgrade().is_some();
                *i.seen.lock() = Some((same_instance, bus_alive));
                Ok(())
            },
        )]
    }
}

#[test]
fn test_exception_event_exposes_subscriber_and_bus() {
    let bus = test_bus();
    let inspector = Arc::new(Inspector {
        seen: Mutex::new(None),
    });
    let broken = Arc::new(Broken {
        attempts: AtomicUsize::new(0),
    });
    bus.register(&inspector).unwrap();
    bus.register(&broken).unwrap();

    bus.post(Order(1)).unwrap();
    assert_eq!(*inspector.seen.lock(), Some((true, true)));
}

#[test]
fn test_panic_is_reported() {
    let bus = test_bus();
    let (monitor, rx) = monitor();
    bus.register(&monitor).unwrap();
    bus.register(&Arc::new(Exploding)).unwrap();

    bus.post(Order(1)).unwrap();

    let (subscriber, error, _) = rx.try_recv().unwrap();
    assert!(subscriber.ends_with("Exploding"));
    assert!(error.contains("boom"));
}

#[test]
fn test_exception_event_can_be_disabled() {
    let bus = builder()
        .send_subscriber_exception_event(false)
        .log_subscriber_exceptions(false)
        .build()
        .unwrap();
    let (monitor, rx) = monitor();
    bus.register(&monitor).unwrap();
    bus.register(&Arc::new(Broken {
        attempts: AtomicUsize::new(0),
    }))
    .unwrap();

    bus.post(Order(1)).unwrap();
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_throw_mode_returns_failure() {
    let bus = builder().throw_subscriber_exception(true).build().unwrap();
    let (monitor, rx) = monitor();
    bus.register(&monitor).unwrap();
    bus.register(&Arc::new(Broken {
        attempts: AtomicUsize::new(0),
    }))
    .unwrap();

    match bus.post(Order(3)) {
        Err(EventBusError::HandlerInvocation {
            subscriber, cause, ..
        }) => {
            assert!(subscriber.ends_with("Broken"));
            assert_eq!(cause.to_string(), "cannot handle order 3");
        }
        other => panic!("expected a handler failure, got {:?}", other),
    }
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_throw_mode_still_reports_async_failures() {
    let bus = builder().throw_subscriber_exception(true).build().unwrap();
    let (monitor, rx) = monitor();
    let broken = Arc::new(BrokenAsync {
        attempts: AtomicUsize::new(0),
    });
    bus.register(&monitor).unwrap();
    bus.register(&broken).unwrap();

    bus.post(Order(4)).unwrap();

    let (subscriber, error, is_order) = rx.recv_timeout(WAIT).unwrap();
    assert!(subscriber.ends_with("BrokenAsync"));
    assert_eq!(error, "async failure");
    assert!(is_order);
    assert_quiet(&rx);
}

#[test]
fn test_unhandled_event_is_reported() {
    let bus = test_bus();
    let (monitor, _rx) = monitor();
    bus.register(&monitor).unwrap();

    bus.post(Orphan).unwrap();
    bus.post(Order(1)).unwrap();
    assert_eq!(*monitor.orphans.lock(), vec!["Orphan", "Order"]);
}

#[test]
fn test_config_drives_builder() {
    let config: EventBusConfig = serde_json::from_str(
        r#"{"source": "orders", "send_no_subscriber_event": false, "async_pool_size": 2}"#,
    )
    .unwrap();
    let bus = builder().config(config.clone()).build().unwrap();
    assert_eq!(bus.source(), "orders");
    assert_eq!(bus.config(), &config);

    let (monitor, _rx) = monitor();
    bus.register(&monitor).unwrap();
    bus.post(Orphan).unwrap();
    assert!(monitor.orphans.lock().is_empty());
}
