//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The public face of the crate. `EventBus` is a cheap, cloneable handle around shared state:
// registry, sticky store, resolver, finder and posters.
//
// | Component       | Description                                                          |
// |-----------------|----------------------------------------------------------------------|
// | EventBus        | Register subscribers, post events, manage sticky events              |
// | WeakEventBus    | Non-owning handle carried by system events and poster jobs           |
// | EventBusBuilder | Configuration and injected collaborators (executors, main context)   |
//
//--------------------------------------------------------------------------------------------------
// DELIVERY
//--------------------------------------------------------------------------------------------------
// | Step                 | Where                                                              |
// |----------------------|--------------------------------------------------------------------|
// | queue + drain        | enqueue_and_drain, posting::enqueue                               |
// | per event            | post_single_event: closure -> snapshots -> route                   |
// | route                | post_to_subscription (thread mode table)                           |
// | invoke               | invoke_subscriber / invoke_pending                                 |
// | report               | handle_subscriber_failure, report_no_subscriber                    |
// | hold (lossless)      | hold_unmatched, release_held                                       |
//--------------------------------------------------------------------------------------------------

use std::any::{Any, type_name};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::posting::{self, Cancellation, DrainGuard, QueuedEvent, Scope};
use super::resolver::EventTypeResolver;
use super::sticky::StickyEventStore;
use super::system::{NoSubscriberEvent, SubscriberExceptionEvent, is_system_event};
use super::types::{Event, EventType, downcast_arc};
use crate::config::EventBusConfig;
use crate::error::{EventBusError, EventBusResult};
use crate::executor::{Executor, ThreadPool};
use crate::posters::{
    AsyncPoster, BackgroundPoster, MainPoster, MainThreadSupport, PendingPost, PendingPostPool,
    Poster, TrackedAsyncPoster,
};
use crate::subscribers::{
    DescriptorProvider, Invocation, Subscriber, SubscriberIndex, SubscriberMethod,
    SubscriberMethodFinder, SubscriberRef, SubscriberRegistry, SubscriberType, Subscription,
    ThreadMode, subscriber_id,
};

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// Most events a lossless bus holds; older ones are dropped first
const MAX_HELD: usize = 10_000;

/// State shared by every handle of one bus
pub(crate) struct EventBusInner {
    id: u64,
    config: EventBusConfig,
    resolver: EventTypeResolver,
    finder: SubscriberMethodFinder,
    registry: SubscriberRegistry,
    sticky: StickyEventStore,
    main_thread: Option<Arc<dyn MainThreadSupport>>,
    main_poster: Option<MainPoster>,
    background_poster: BackgroundPoster,
    async_poster: AsyncPoster,
    tracked_poster: TrackedAsyncPoster,
    pending_posts: PendingPostPool,
    /// Events nobody subscribed to yet, kept in lossless mode
    held: Mutex<VecDeque<QueuedEvent>>,
}

/// Typed in-process publish/subscribe bus.
///
/// Clones share the same registry and sticky store. Nothing is global: create a bus at the
/// application boundary and pass it to whoever needs it.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use eventbus::{Event, EventBus, Subscriber, SubscriberMethod};
///
/// #[derive(Debug)]
/// struct Ping;
/// impl Event for Ping {}
///
/// #[derive(Default)]
/// struct Counter(AtomicUsize);
///
/// impl Subscriber for Counter {
///     fn subscriber_methods() -> Vec<SubscriberMethod> {
///         vec![SubscriberMethod::new("on_ping", |c: &Counter, _: &Ping| {
///             c.0.fetch_add(1, Ordering::SeqCst);
///             Ok(())
///         })]
///     }
/// }
///
/// let bus = EventBus::new().unwrap();
/// let counter = Arc::new(Counter::default());
/// bus.register(&counter).unwrap();
/// bus.post(Ping).unwrap();
/// assert_eq!(counter.0.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

/// A handle that does not keep its bus alive.
#[derive(Clone)]
pub struct WeakEventBus {
    inner: Weak<EventBusInner>,
    id: u64,
}

impl WeakEventBus {
    /// Returns the bus if it still exists
    pub fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }

    /// Returns true if this handle was created from `bus`
    pub fn is(&self, bus: &EventBus) -> bool {
        self.id == bus.inner.id
    }
}

impl fmt::Debug for WeakEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEventBus")
            .field("id", &self.id)
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("id", &self.inner.id)
            .field("source", &self.inner.config.source)
            .field("event_inheritance", &self.inner.config.event_inheritance)
            .finish()
    }
}

impl EventBus {
    /// Creates a bus with the default configuration and a shared worker pool.
    pub fn new() -> EventBusResult<Self> {
        Self::builder().build()
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// Name of this bus, as configured
    pub fn source(&self) -> &str {
        &self.inner.config.source
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            inner: Arc::downgrade(&self.inner),
            id: self.inner.id,
        }
    }

    //----------------------------------------------------------------------------------------------
    // Registration
    //----------------------------------------------------------------------------------------------

    /// Registers every handler of `subscriber`.
    ///
    /// # Returns
    ///
    /// * `Err(NoMatchingHandler)` - the subscriber type has no handlers
    /// * `Err(UnresolvedSubscriber)` - strict verification and no provider knows the type
    /// * `Err(DuplicateRegistration)` - the instance is already registered
    pub fn register<S: Subscriber>(&self, subscriber: &Arc<S>) -> EventBusResult<()> {
        self.subscribe(subscriber, SubscriberRef::strong(subscriber), false, None)
    }

    /// Registers `subscriber` and delivers cached sticky events to all of its handlers.
    pub fn register_sticky<S: Subscriber>(&self, subscriber: &Arc<S>) -> EventBusResult<()> {
        self.subscribe(subscriber, SubscriberRef::strong(subscriber), true, None)
    }

    /// Registers only the handlers of `subscriber` bound to one of `event_types`.
    pub fn register_for<S: Subscriber>(
        &self,
        subscriber: &Arc<S>,
        event_types: &[EventType],
    ) -> EventBusResult<()> {
        self.subscribe(subscriber, SubscriberRef::strong(subscriber), false, Some(event_types))
    }

    /// Registers `subscriber` without keeping it alive.
    ///
    /// Once the last `Arc` is dropped the subscriber stops receiving events and is no longer
    /// reported as registered, even if it was never unregistered.
    pub fn register_weak<S: Subscriber>(&self, subscriber: &Arc<S>) -> EventBusResult<()> {
        self.subscribe(subscriber, SubscriberRef::weak(subscriber), false, None)
    }

    fn subscribe<S: Subscriber>(
        &self,
        subscriber: &Arc<S>,
        reference: SubscriberRef,
        sticky: bool,
        only: Option<&[EventType]>,
    ) -> EventBusResult<()> {
        let subscriber_type = SubscriberType::of::<S>();
        let methods = self.inner.finder.find_methods::<S>()?;
        let methods: Vec<SubscriberMethod> = match only {
            Some(event_types) => methods
                .iter()
                .filter(|m| event_types.contains(&m.event_type()))
                .cloned()
                .collect(),
            None => methods.to_vec(),
        };
        if methods.is_empty() {
            return Err(EventBusError::NoMatchingHandler(subscriber_type.name()));
        }

        let installed = self.inner.registry.subscribe(
            reference,
            subscriber_id(subscriber),
            subscriber_type,
            &methods,
        )?;

        let eligible: Vec<_> = installed
            .iter()
            .filter(|s| sticky || s.method().is_sticky())
            .collect();
        if !eligible.is_empty() {
            // Registry lock is released at this point; handlers may register or post freely
            let entries = self.inner.sticky.entries();
            let is_main = self.is_main_thread();
            for subscription in eligible {
                for entry in &entries {
                    let matches = self
                        .inner
                        .resolver
                        .matches(entry.event.event_type(), subscription.method().event_type());
                    if matches && entry.scope.allows(subscription) {
                        debug!(
                            "Delivering sticky {} to {}",
                            entry.event.event_type(),
                            subscriber_type.name()
                        );
                        self.post_to_subscription(subscription, &entry.event, is_main, true)?;
                    }
                }
            }
        }

        if self.inner.config.lossless {
            self.release_held()?;
        }
        Ok(())
    }

    /// Unregisters every handler of `subscriber`.
    ///
    /// Deliveries already handed to another context are dropped; invocations already running
    /// complete. Unknown subscribers are logged and otherwise ignored.
    pub fn unregister<S: Any>(&self, subscriber: &Arc<S>) {
        if !self.inner.registry.unsubscribe(subscriber_id(subscriber), None) {
            warn!("{}", EventBusError::UnknownSubscriber(type_name::<S>()));
        }
    }

    /// Unregisters the handlers of `subscriber` bound to one of `event_types`
    pub fn unregister_for<S: Any>(&self, subscriber: &Arc<S>, event_types: &[EventType]) {
        if !self
            .inner
            .registry
            .unsubscribe(subscriber_id(subscriber), Some(event_types))
        {
            warn!("{}", EventBusError::UnknownSubscriber(type_name::<S>()));
        }
    }

    pub fn is_registered<S: Any>(&self, subscriber: &Arc<S>) -> bool {
        self.inner.registry.is_registered(subscriber_id(subscriber))
    }

    /// Returns true if posting an `E` would reach at least one subscriber
    pub fn has_subscriber_for<E: Event>(&self) -> bool {
        self.has_subscriber_for_type(EventType::of::<E>())
    }

    pub fn has_subscriber_for_type(&self, event_type: EventType) -> bool {
        let closure = self.inner.resolver.closure_of(event_type);
        self.inner.registry.has_subscriptions(&closure)
    }

    //----------------------------------------------------------------------------------------------
    // Posting
    //----------------------------------------------------------------------------------------------

    /// Posts `event` to every matching subscriber.
    ///
    /// Direct handlers have run when this returns, other modes may still be pending. Called
    /// from inside a handler, the event is queued behind the one being delivered.
    ///
    /// # Returns
    ///
    /// `Err(HandlerInvocation)` only with `throw_subscriber_exception`, carrying the first
    /// handler failure of this drain.
    pub fn post<E: Event>(&self, event: E) -> EventBusResult<()> {
        self.post_arc(Arc::new(event))
    }

    /// Posts an already shared event
    pub fn post_arc(&self, event: Arc<dyn Event>) -> EventBusResult<()> {
        self.enqueue_and_drain(QueuedEvent {
            event,
            scope: Scope::All,
        })
    }

    /// Posts `event` to the subscribers of type `target` only.
    ///
    /// `target` is either the full type name or the name without its module path.
    pub fn post_to<E: Event>(&self, event: E, target: impl Into<Arc<str>>) -> EventBusResult<()> {
        self.enqueue_and_drain(QueuedEvent {
            event: Arc::new(event),
            scope: Scope::Named(target.into()),
        })
    }

    /// Posts `event` to the subscriptions `filter` accepts.
    ///
    /// The filter sees each matching subscription, so it can select by handler name, subscriber
    /// type or thread mode.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use eventbus::{Event, EventBus, Subscriber, SubscriberMethod};
    /// # #[derive(Debug)]
    /// # struct Ping;
    /// # impl Event for Ping {}
    /// # struct Screen;
    /// # impl Subscriber for Screen {
    /// #     fn subscriber_methods() -> Vec<SubscriberMethod> {
    /// #         vec![SubscriberMethod::new("on_ping", |_: &Screen, _: &Ping| Ok(()))]
    /// #     }
    /// # }
    /// let bus = EventBus::new().unwrap();
    /// bus.register(&Arc::new(Screen)).unwrap();
    /// bus.post_filtered(Ping, |s| s.method().name() == "on_ping").unwrap();
    /// ```
    pub fn post_filtered<E, F>(&self, event: E, filter: F) -> EventBusResult<()>
    where
        E: Event,
        F: Fn(&Subscription) -> bool + Send + Sync + 'static,
    {
        self.enqueue_and_drain(QueuedEvent {
            event: Arc::new(event),
            scope: Scope::Filtered(Arc::new(filter)),
        })
    }

    /// Caches `event` as the sticky event of its type, then posts it.
    pub fn post_sticky<E: Event>(&self, event: E) -> EventBusResult<()> {
        self.post_sticky_scoped(Arc::new(event), Scope::All)
    }

    /// Caches `event` scoped to subscriber type `target`, then posts it to that type only.
    pub fn post_sticky_to<E: Event>(
        &self,
        event: E,
        target: impl Into<Arc<str>>,
    ) -> EventBusResult<()> {
        self.post_sticky_scoped(Arc::new(event), Scope::Named(target.into()))
    }

    /// Caches `event` together with `filter`, then posts it to the subscriptions `filter`
    /// accepts. Later sticky registrations only replay it where `filter` accepts them too.
    pub fn post_sticky_filtered<E, F>(&self, event: E, filter: F) -> EventBusResult<()>
    where
        E: Event,
        F: Fn(&Subscription) -> bool + Send + Sync + 'static,
    {
        self.post_sticky_scoped(Arc::new(event), Scope::Filtered(Arc::new(filter)))
    }

    fn post_sticky_scoped(&self, event: Arc<dyn Event>, scope: Scope) -> EventBusResult<()> {
        self.inner.sticky.put(event.clone(), scope.clone());
        self.enqueue_and_drain(QueuedEvent { event, scope })
    }

    /// Skips the remaining subscribers of the event type being delivered.
    ///
    /// Only legal from a Direct handler, for the event it is currently handling. Subscribers
    /// of the event's other types (supertypes, interfaces) still receive it.
    ///
    /// `event` must be exactly what the handler received: the posted value itself, or the
    /// ancestor view a handler registered for a supertype was given. A field of the event or a
    /// copy of it is rejected.
    pub fn cancel_event_delivery<E: Event + ?Sized>(&self, event: &E) -> EventBusResult<()> {
        posting::cancel(
            self.inner.id,
            address_of(event),
            event.event_type().id(),
            Cancellation::Type,
        )
    }

    /// Skips every remaining subscriber of the event being delivered, across all its types.
    pub fn abort_event_delivery<E: Event + ?Sized>(&self, event: &E) -> EventBusResult<()> {
        posting::cancel(
            self.inner.id,
            address_of(event),
            event.event_type().id(),
            Cancellation::Event,
        )
    }

    /// Cancels the pending AsyncTracked deliveries of `event`'s type whose
    /// [`unique_code`](Event::unique_code) matches, for every subscriber.
    ///
    /// Deliveries already running finish normally.
    ///
    /// # Returns
    ///
    /// The number of deliveries that will not run.
    pub fn cancel_tracked(&self, event: &dyn Event) -> usize {
        self.inner.tracked_poster.cancel(event)
    }

    /// Number of events a lossless bus is holding for a future subscriber
    pub fn held_event_count(&self) -> usize {
        self.inner.held.lock().len()
    }

    //----------------------------------------------------------------------------------------------
    // Sticky events
    //----------------------------------------------------------------------------------------------

    pub fn get_sticky<E: Event>(&self) -> Option<Arc<E>> {
        self.inner.sticky.get_typed::<E>()
    }

    pub fn get_sticky_event(&self, event_type: EventType) -> Option<Arc<dyn Event>> {
        self.inner.sticky.get(event_type)
    }

    /// Removes and returns the sticky event of type `E`
    pub fn remove_sticky<E: Event>(&self) -> Option<Arc<E>> {
        self.inner
            .sticky
            .remove(EventType::of::<E>())
            .and_then(downcast_arc::<E>)
    }

    pub fn remove_sticky_event(&self, event_type: EventType) -> Option<Arc<dyn Event>> {
        self.inner.sticky.remove(event_type)
    }

    /// Removes the sticky event of `E`'s type if it equals `event`
    pub fn remove_sticky_if_equals<E: Event + PartialEq>(&self, event: &E) -> bool {
        self.inner.sticky.remove_if_equals(event)
    }

    pub fn clear_all_sticky(&self) {
        self.inner.sticky.clear();
    }

    /// Forgets cached type closures and subscriber descriptors
    pub fn clear_caches(&self) {
        self.inner.resolver.clear_cache();
        self.inner.finder.clear_cache();
    }

    //----------------------------------------------------------------------------------------------
    // Delivery
    //----------------------------------------------------------------------------------------------

    fn is_main_thread(&self) -> bool {
        self.inner
            .main_thread
            .as_ref()
            .is_none_or(|support| support.is_main_thread())
    }

    fn enqueue_and_drain(&self, queued: QueuedEvent) -> EventBusResult<()> {
        let Some(guard) = posting::enqueue(self.inner.id, queued) else {
            return Ok(());
        };

        let is_main = self.is_main_thread();
        let mut first_failure = None;
        while let Some(next) = guard.next_event() {
            if let Err(err) = self.post_single_event(&guard, next, is_main) {
                first_failure.get_or_insert(err);
            }
        }
        drop(guard);

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn post_single_event(
        &self,
        guard: &DrainGuard,
        queued: QueuedEvent,
        is_main: bool,
    ) -> EventBusResult<()> {
        let QueuedEvent { event, scope } = queued;
        let closure = self.inner.resolver.closure_of(event.event_type());
        let mut found = false;

        'types: for event_type in closure.iter() {
            let Some(subscriptions) = self.inner.registry.subscriptions_for(*event_type) else {
                continue;
            };
            for subscription in subscriptions.iter() {
                if !subscription.is_active() {
                    continue;
                }
                if !scope.allows(subscription) {
                    continue;
                }
                found = true;

                guard.begin_delivery(
                    &*event,
                    subscription.method().event_type(),
                    subscription.method().thread_mode(),
                );
                let delivered = self.post_to_subscription(subscription, &event, is_main, true);
                let cancellation = guard.end_delivery();
                delivered?;

                match cancellation {
                    Cancellation::None => {}
                    Cancellation::Type => break,
                    Cancellation::Event => break 'types,
                }
            }
        }

        if !found {
            if self.inner.config.lossless && !is_system_event(&*event) {
                self.hold_unmatched(QueuedEvent { event, scope });
            } else {
                self.report_no_subscriber(&event);
            }
        }
        Ok(())
    }

    /// Routes one subscription according to its thread mode
    fn post_to_subscription(
        &self,
        subscription: &Arc<Subscription>,
        event: &Arc<dyn Event>,
        is_main: bool,
        allow_throw: bool,
    ) -> EventBusResult<()> {
        let poster: &dyn Poster = match subscription.method().thread_mode() {
            ThreadMode::Direct => return self.invoke_subscriber(subscription, event, allow_throw),
            ThreadMode::Main => match &self.inner.main_poster {
                Some(main_poster) if !is_main => main_poster,
                _ => return self.invoke_subscriber(subscription, event, allow_throw),
            },
            ThreadMode::MainOrdered => match &self.inner.main_poster {
                Some(main_poster) => main_poster,
                None => return self.invoke_subscriber(subscription, event, allow_throw),
            },
            ThreadMode::Background if is_main => &self.inner.background_poster,
            ThreadMode::Background => {
                return self.invoke_subscriber(subscription, event, allow_throw);
            }
            ThreadMode::Async => &self.inner.async_poster,
            ThreadMode::AsyncTracked => &self.inner.tracked_poster,
        };

        let pending = self
            .inner
            .pending_posts
            .obtain(subscription.clone(), event.clone());
        poster.enqueue(self, pending);
        Ok(())
    }

    fn invoke_subscriber(
        &self,
        subscription: &Subscription,
        event: &Arc<dyn Event>,
        allow_throw: bool,
    ) -> EventBusResult<()> {
        match subscription.invoke(&**event) {
            Invocation::Skipped | Invocation::Delivered => Ok(()),
            Invocation::Failed { subscriber, error } => {
                self.handle_subscriber_failure(subscription, event, subscriber, error, allow_throw)
            }
        }
    }

    /// Runs a delivery a poster deferred. Failures are reported, never returned.
    pub(crate) fn invoke_pending(&self, mut pending: Box<PendingPost>) {
        let taken = pending.take();
        self.inner.pending_posts.release(pending);
        if let Some((subscription, event)) = taken {
            let _ = self.invoke_subscriber(&subscription, &event, false);
        }
    }

    /// Returns a delivery that will not run to the pool
    pub(crate) fn release_pending(&self, pending: Box<PendingPost>) {
        self.inner.pending_posts.release(pending);
    }

    fn handle_subscriber_failure(
        &self,
        subscription: &Subscription,
        event: &Arc<dyn Event>,
        subscriber: Arc<dyn Any + Send + Sync>,
        error: anyhow::Error,
        allow_throw: bool,
    ) -> EventBusResult<()> {
        let config = &self.inner.config;
        let subscriber_name = subscription.subscriber_type().name();
        let event_name = event.event_type().name();

        if let Some(failure) = event.downcast_ref::<SubscriberExceptionEvent>() {
            if config.log_subscriber_exceptions {
                error!(
                    "SubscriberExceptionEvent subscriber {} failed: {:#}",
                    subscriber_name, error
                );
                error!(
                    "Initial event {:?} caused exception in {}: {:#}",
                    failure.causing_event, failure.causing_subscriber_type, failure.error
                );
            }
            return Ok(());
        }

        let error = Arc::new(error);
        if allow_throw && config.throw_subscriber_exception {
            return Err(EventBusError::HandlerInvocation {
                subscriber: subscriber_name,
                event_type: event_name,
                cause: error,
            });
        }

        if config.log_subscriber_exceptions {
            error!(
                "Could not dispatch event {} to subscriber {}: {:#}",
                event_name, subscriber_name, error
            );
        }
        if config.send_subscriber_exception_event {
            let report = SubscriberExceptionEvent {
                bus: self.downgrade(),
                error,
                causing_event: event.clone(),
                causing_subscriber: subscriber,
                causing_subscriber_type: subscriber_name,
                timestamp: Utc::now(),
            };
            if let Err(err) = self.post(report) {
                debug!("Reporting a handler failure failed: {}", err);
            }
        }
        Ok(())
    }

    fn report_no_subscriber(&self, event: &Arc<dyn Event>) {
        let config = &self.inner.config;
        if config.log_no_subscriber_messages {
            debug!(
                "No subscribers registered for event {} on {}",
                event.event_type(),
                config.source
            );
        }
        if config.send_no_subscriber_event && !is_system_event(&**event) {
            let report = NoSubscriberEvent {
                bus: self.downgrade(),
                original_event: event.clone(),
                timestamp: Utc::now(),
            };
            if let Err(err) = self.post(report) {
                debug!("Reporting an unhandled event failed: {}", err);
            }
        }
    }
}

impl EventBus {
    //----------------------------------------------------------------------------------------------
    // Lossless mode
    //----------------------------------------------------------------------------------------------

    fn hold_unmatched(&self, queued: QueuedEvent) {
        debug!(
            "No subscribers for {} on {}, holding it",
            queued.event.event_type(),
            self.inner.config.source
        );
        let mut held = self.inner.held.lock();
        if held.len() >= MAX_HELD {
            if let Some(oldest) = held.pop_front() {
                warn!(
                    "Lossless queue of {} is full, dropping {}",
                    self.inner.config.source,
                    oldest.event.event_type()
                );
            }
        }
        held.push_back(queued);
    }

    /// Posts, in their original order, the held events that now reach a subscription.
    fn release_held(&self) -> EventBusResult<()> {
        let ready: Vec<QueuedEvent> = {
            let mut held = self.inner.held.lock();
            if held.is_empty() {
                return Ok(());
            }
            let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
                held.drain(..).partition(|queued| self.reaches_subscription(queued));
            *held = waiting;
            ready.into()
        };

        let mut first_failure = None;
        for queued in ready {
            debug!("Releasing held {}", queued.event.event_type());
            if let Err(err) = self.enqueue_and_drain(queued) {
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reaches_subscription(&self, queued: &QueuedEvent) -> bool {
        let closure = self.inner.resolver.closure_of(queued.event.event_type());
        closure.iter().any(|event_type| {
            self.inner
                .registry
                .subscriptions_for(*event_type)
                .is_some_and(|subscriptions| {
                    subscriptions
                        .iter()
                        .any(|s| s.is_active() && queued.scope.allows(s))
                })
        })
    }
}

fn address_of<E: ?Sized>(event: &E) -> usize {
    event as *const E as *const () as usize
}

/// Assembles an [`EventBus`].
///
/// Executors default to one shared [`ThreadPool`] sized by `async_pool_size`. Without a main
/// context every thread counts as main.
#[derive(Default)]
pub struct EventBusBuilder {
    config: EventBusConfig,
    main_thread: Option<Arc<dyn MainThreadSupport>>,
    background_executor: Option<Arc<dyn Executor>>,
    async_executor: Option<Arc<dyn Executor>>,
    providers: Vec<Arc<dyn DescriptorProvider>>,
}

impl EventBusBuilder {
    /// Replaces the whole configuration
    pub fn config(mut self, config: EventBusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.config.source = source.into();
        self
    }

    pub fn event_inheritance(mut self, enabled: bool) -> Self {
        self.config.event_inheritance = enabled;
        self
    }

    pub fn log_no_subscriber_messages(mut self, enabled: bool) -> Self {
        self.config.log_no_subscriber_messages = enabled;
        self
    }

    pub fn send_no_subscriber_event(mut self, enabled: bool) -> Self {
        self.config.send_no_subscriber_event = enabled;
        self
    }

    pub fn log_subscriber_exceptions(mut self, enabled: bool) -> Self {
        self.config.log_subscriber_exceptions = enabled;
        self
    }

    pub fn send_subscriber_exception_event(mut self, enabled: bool) -> Self {
        self.config.send_subscriber_exception_event = enabled;
        self
    }

    pub fn throw_subscriber_exception(mut self, enabled: bool) -> Self {
        self.config.throw_subscriber_exception = enabled;
        self
    }

    pub fn strict_method_verification(mut self, enabled: bool) -> Self {
        self.config.strict_method_verification = enabled;
        self
    }

    pub fn async_pool_size(mut self, size: usize) -> Self {
        self.config.async_pool_size = size;
        self
    }

    /// Holds events nobody subscribes to until a matching subscriber registers
    pub fn lossless(mut self, enabled: bool) -> Self {
        self.config.lossless = enabled;
        self
    }

    pub fn max_main_drain(mut self, max: Duration) -> Self {
        self.config.max_main_drain_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the main context that Main and MainOrdered handlers run on
    pub fn main_thread_support<M: MainThreadSupport + 'static>(mut self, support: M) -> Self {
        self.main_thread = Some(Arc::new(support));
        self
    }

    pub fn background_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.background_executor = Some(executor);
        self
    }

    pub fn async_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.async_executor = Some(executor);
        self
    }

    /// Adds a precomputed descriptor table, consulted after the ones added before it
    pub fn add_index(self, index: SubscriberIndex) -> Self {
        self.add_provider(Arc::new(index))
    }

    pub fn add_provider(mut self, provider: Arc<dyn DescriptorProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Builds the bus, starting the default worker pool if an executor is missing.
    pub fn build(self) -> EventBusResult<EventBus> {
        let EventBusBuilder {
            config,
            main_thread,
            background_executor,
            async_executor,
            providers,
        } = self;

        let (background_executor, async_executor) = match (background_executor, async_executor) {
            (Some(background), Some(asynchronous)) => (background, asynchronous),
            (background, asynchronous) => {
                let pool: Arc<dyn Executor> = Arc::new(ThreadPool::with_name(
                    &format!("eventbus-{}", config.source),
                    config.async_pool_size,
                )?);
                (
                    background.unwrap_or_else(|| pool.clone()),
                    asynchronous.unwrap_or(pool),
                )
            }
        };

        let main_poster = main_thread
            .as_ref()
            .map(|support| MainPoster::new(support.clone(), config.max_main_drain()));

        let inner = EventBusInner {
            id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            resolver: EventTypeResolver::new(config.event_inheritance),
            finder: SubscriberMethodFinder::new(providers, config.strict_method_verification),
            registry: SubscriberRegistry::new(),
            sticky: StickyEventStore::new(),
            main_thread,
            main_poster,
            background_poster: BackgroundPoster::new(background_executor),
            async_poster: AsyncPoster::new(async_executor.clone()),
            tracked_poster: TrackedAsyncPoster::new(async_executor),
            pending_posts: PendingPostPool::new(),
            held: Mutex::new(VecDeque::new()),
            config,
        };

        info!(
            "Created event bus {} (inheritance: {}, main context: {})",
            inner.config.source,
            inner.config.event_inheritance,
            inner.main_thread.is_some()
        );
        Ok(EventBus {
            inner: Arc::new(inner),
        })
    }
}
