//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Describes who listens to what. A subscriber type exposes handler descriptors, either through
// a precomputed index or through its own `Subscriber::subscriber_methods`, and the registry maps
// event types to the resulting subscriptions.
//
// | Component                | Description                                                |
// |--------------------------|------------------------------------------------------------|
// | ThreadMode               | Delivery discipline of a handler                           |
// | SubscriberMethod         | One handler descriptor (type, mode, priority, sticky)      |
// | Subscriber               | Trait for types that can be registered                     |
// | DescriptorProvider       | Boundary for descriptor discovery                          |
// | SubscriberIndex          | Precomputed descriptor table                               |
// | SubscriberRegistry       | Event type -> priority-ordered subscriptions               |
// | SubscriptionFilter       | Predicate narrowing a post to some subscriptions           |
//--------------------------------------------------------------------------------------------------

mod finder;
mod index;
mod registry;

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::events::types::{Event, EventType, short_type_name};

pub use finder::{DescriptorProvider, SubscriberMethodFinder};
pub use index::SubscriberIndex;
pub(crate) use registry::SubscriberRegistry;

/// Delivery discipline of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ThreadMode {
    /// Invoked on the posting thread, before `post` returns. Only these handlers may cancel.
    #[default]
    Direct,
    /// Invoked on the main context, immediately if the poster already is the main context
    Main,
    /// Always queued on the main context, preserving order with other main deliveries
    MainOrdered,
    /// Invoked by the single background worker, or inline when posted off the main context
    Background,
    /// Always handed to the async pool
    Async,
    /// Like `Async`, but tracked per event type and subscriber so a colliding post can replace
    /// or be ignored, and pending deliveries can be cancelled with
    /// [`EventBus::cancel_tracked`](crate::EventBus::cancel_tracked)
    AsyncTracked,
}

/// Type-erased handler: receives the subscriber and the event being delivered.
pub type HandlerFn = dyn Fn(&dyn Any, &dyn Event) -> anyhow::Result<()> + Send + Sync;

/// Selects the subscriptions a filtered post may reach.
pub type SubscriptionFilter = Arc<dyn Fn(&Subscription) -> bool + Send + Sync>;

/// Immutable descriptor of one handler of a subscriber type.
#[derive(Clone)]
pub struct SubscriberMethod {
    name: &'static str,
    event_type: EventType,
    thread_mode: ThreadMode,
    priority: i32,
    sticky: bool,
    handler: Arc<HandlerFn>,
}

impl SubscriberMethod {
    /// Creates a descriptor for a handler of `S` receiving `E`.
    ///
    /// The handler also receives subtypes of `E` that expose `E` through
    /// [`Event::upcast`]. Use [`for_type`](Self::for_type) when the event should be handled
    /// as a `dyn Event` instead.
    ///
    /// # Arguments
    ///
    /// * `name` - Handler name, unique per subscriber type and event type
    /// * `handler` - The handler itself
    pub fn new<S, E, F>(name: &'static str, handler: F) -> Self
    where
        S: Any + Send + Sync,
        E: Event,
        F: Fn(&S, &E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let invoker = move |subscriber: &dyn Any, event: &dyn Event| {
            let subscriber = downcast_subscriber::<S>(subscriber)?;
            let typed = event.view::<E>().ok_or_else(|| {
                anyhow!(
                    "event {} has no view as {}",
                    event.event_type(),
                    type_name::<E>()
                )
            })?;
            handler(subscriber, typed)
        };
        Self::from_parts(name, EventType::of::<E>(), Arc::new(invoker))
    }

    /// Creates a descriptor for a handler of `S` that receives matching events untyped.
    ///
    /// Typical for handlers bound to an interface type, which has no concrete value to view.
    pub fn for_type<S, F>(name: &'static str, event_type: EventType, handler: F) -> Self
    where
        S: Any + Send + Sync,
        F: Fn(&S, &dyn Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let invoker = move |subscriber: &dyn Any, event: &dyn Event| {
            handler(downcast_subscriber::<S>(subscriber)?, event)
        };
        Self::from_parts(name, event_type, Arc::new(invoker))
    }

    fn from_parts(name: &'static str, event_type: EventType, handler: Arc<HandlerFn>) -> Self {
        Self {
            name,
            event_type,
            thread_mode: ThreadMode::Direct,
            priority: 0,
            sticky: false,
            handler,
        }
    }

    /// Sets the delivery discipline
    pub fn with_thread_mode(mut self, thread_mode: ThreadMode) -> Self {
        self.thread_mode = thread_mode;
        self
    }

    /// Sets the priority. Higher priorities are delivered first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the handler as sticky: cached sticky events are delivered on registration.
    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn thread_mode(&self) -> ThreadMode {
        self.thread_mode
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Returns true if both descriptors name the same handler
    pub(crate) fn same_handler(&self, other: &SubscriberMethod) -> bool {
        self.name == other.name && self.event_type == other.event_type
    }
}

impl fmt::Debug for SubscriberMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberMethod")
            .field("name", &self.name)
            .field("event_type", &self.event_type)
            .field("thread_mode", &self.thread_mode)
            .field("priority", &self.priority)
            .field("sticky", &self.sticky)
            .finish()
    }
}

fn downcast_subscriber<S: Any>(subscriber: &dyn Any) -> anyhow::Result<&S> {
    subscriber
        .downcast_ref::<S>()
        .ok_or_else(|| anyhow!("subscriber is not a {}", type_name::<S>()))
}

/// A type whose instances can be registered on an [`EventBus`](crate::EventBus).
///
/// `subscriber_methods` is the fallback used when no configured [`DescriptorProvider`]
/// knows the type. Types described by a [`SubscriberIndex`] can keep the empty default.
///
/// ```
/// use eventbus::{Event, Subscriber, SubscriberMethod, ThreadMode};
///
/// #[derive(Debug)]
/// struct Refresh;
/// impl Event for Refresh {}
///
/// struct Screen;
///
/// impl Subscriber for Screen {
///     fn subscriber_methods() -> Vec<SubscriberMethod> {
///         vec![SubscriberMethod::new("on_refresh", |_: &Screen, _: &Refresh| Ok(()))
///             .with_thread_mode(ThreadMode::Main)]
///     }
/// }
/// ```
pub trait Subscriber: Any + Send + Sync {
    fn subscriber_methods() -> Vec<SubscriberMethod>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

/// Runtime descriptor of a subscriber type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberType {
    id: TypeId,
    name: &'static str,
}

impl SubscriberType {
    pub fn of<S: Any>() -> Self {
        Self {
            id: TypeId::of::<S>(),
            name: type_name::<S>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the type name without its module path
    pub fn short_name(&self) -> &'static str {
        short_type_name(self.name)
    }

    /// Returns true if `target` names this type, fully qualified or by its short name.
    pub fn matches_target(&self, target: &str) -> bool {
        self.name == target || self.short_name() == target
    }
}

/// Identity of a registered subscriber instance: the address of its shared allocation.
pub(crate) fn subscriber_id<S: Any>(subscriber: &Arc<S>) -> usize {
    Arc::as_ptr(subscriber) as *const () as usize
}

/// How the registry holds on to a subscriber.
#[derive(Clone)]
pub(crate) enum SubscriberRef {
    Strong(Arc<dyn Any + Send + Sync>),
    Weak(Weak<dyn Any + Send + Sync>),
}

impl SubscriberRef {
    pub(crate) fn strong<S: Any + Send + Sync>(subscriber: &Arc<S>) -> Self {
        SubscriberRef::Strong(subscriber.clone())
    }

    pub(crate) fn weak<S: Any + Send + Sync>(subscriber: &Arc<S>) -> Self {
        let erased: Arc<dyn Any + Send + Sync> = subscriber.clone();
        SubscriberRef::Weak(Arc::downgrade(&erased))
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        match self {
            SubscriberRef::Strong(subscriber) => Some(subscriber.clone()),
            SubscriberRef::Weak(subscriber) => subscriber.upgrade(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        match self {
            SubscriberRef::Strong(_) => true,
            SubscriberRef::Weak(subscriber) => subscriber.strong_count() > 0,
        }
    }
}

/// Outcome of invoking one subscription.
pub(crate) enum Invocation {
    /// Unregistered in the meantime, or a weak subscriber that is gone
    Skipped,
    Delivered,
    Failed {
        subscriber: Arc<dyn Any + Send + Sync>,
        error: anyhow::Error,
    },
}

/// A subscriber instance bound to one of its handler descriptors.
pub struct Subscription {
    subscriber: SubscriberRef,
    subscriber_id: usize,
    subscriber_type: SubscriberType,
    method: SubscriberMethod,
    /// Cleared on unregister so queued deliveries are dropped
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        subscriber: SubscriberRef,
        subscriber_id: usize,
        subscriber_type: SubscriberType,
        method: SubscriberMethod,
    ) -> Self {
        Self {
            subscriber,
            subscriber_id,
            subscriber_type,
            method,
            active: AtomicBool::new(true),
        }
    }

    pub fn method(&self) -> &SubscriberMethod {
        &self.method
    }

    pub fn subscriber_type(&self) -> SubscriberType {
        self.subscriber_type
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.subscriber.is_alive()
    }

    pub(crate) fn subscriber_id(&self) -> usize {
        self.subscriber_id
    }

    pub(crate) fn subscriber_ref(&self) -> &SubscriberRef {
        &self.subscriber
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Runs the handler, catching both returned errors and panics.
    pub(crate) fn invoke(&self, event: &dyn Event) -> Invocation {
        if !self.active.load(Ordering::Acquire) {
            return Invocation::Skipped;
        }
        let Some(subscriber) = self.subscriber.upgrade() else {
            return Invocation::Skipped;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            (self.method.handler)(&*subscriber, event)
        }));
        match outcome {
            Ok(Ok(())) => Invocation::Delivered,
            Ok(Err(error)) => Invocation::Failed { subscriber, error },
            Err(payload) => Invocation::Failed {
                subscriber,
                error: anyhow!("handler {} panicked: {}", self.method.name, panic_message(&*payload)),
            },
        }
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.subscriber_id == other.subscriber_id && self.method.same_handler(&other.method)
    }
}

impl Eq for Subscription {}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber", &self.subscriber_type.name)
            .field("method", &self.method)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
