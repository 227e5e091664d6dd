//! Typed in-process publish/subscribe event bus.
//!
//! Subscribers register handler descriptors, each bound to an event type, a [`ThreadMode`],
//! a priority and a sticky flag. Posted events are matched against the subscriptions of their
//! whole type closure and delivered according to each handler's thread mode.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod posters;
pub mod subscribers;

// Re-export key types for easier usage
pub use config::EventBusConfig;
pub use error::{EventBusError, EventBusResult};
pub use events::{
    CollisionBehavior, Event, EventBus, EventBusBuilder, EventExt, EventType, EventTypeResolver, NoSubscriberEvent,
    SubscriberExceptionEvent, WeakEventBus, downcast_arc,
};
pub use executor::{Executor, Job, ThreadPool, TokioExecutor};
pub use posters::{MainLoop, MainLoopHandle, MainThreadSupport};
pub use subscribers::{
    DescriptorProvider, HandlerFn, Subscriber, SubscriberIndex, SubscriberMethod,
    SubscriberMethodFinder, SubscriberType, Subscription, SubscriptionFilter, ThreadMode,
};
