//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Events and the machinery that delivers them.
//
// | Component                | Description                                                |
// |--------------------------|------------------------------------------------------------|
// | Event / EventType        | What can be posted, and its declared ancestry              |
// | EventTypeResolver        | Type closure an event is matched against                   |
// | StickyEventStore         | Last sticky event per type                                 |
// | posting                  | Per-thread queue, drain loop state, cancellation context   |
// | EventBus                 | Registration, posting and reporting facade                 |
// | NoSubscriberEvent        | Posted when an event reaches nobody                        |
// | SubscriberExceptionEvent | Posted when a handler fails                                |
//--------------------------------------------------------------------------------------------------

pub mod bus;
mod posting;
pub mod resolver;
mod sticky;
pub mod system;
pub mod types;

#[cfg(test)]
mod tests;

// Re-exports
pub use bus::{EventBus, EventBusBuilder, WeakEventBus};
pub use resolver::EventTypeResolver;
pub use system::{NoSubscriberEvent, SubscriberExceptionEvent};
pub use types::{CollisionBehavior, Event, EventExt, EventType, downcast_arc};
