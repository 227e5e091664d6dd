//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Posted when       |
// |-------------------------|---------------------------------------------------|-------------------|
// | NoSubscriberEvent       | Wraps an event nobody subscribed to               | zero matches      |
// | SubscriberExceptionEvent| Wraps a handler failure                           | handler error     |
//--------------------------------------------------------------------------------------------------

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::bus::WeakEventBus;
use super::types::Event;

/// Posted by the bus when an event was delivered to no subscriber at all.
///
/// Subscribe to this type to detect events that fall on the floor.
pub struct NoSubscriberEvent {
    /// The bus the original event was posted to
    pub bus: WeakEventBus,
    /// The event that had no subscribers
    pub original_event: Arc<dyn Event>,
    /// When the bus gave up on the original event
    pub timestamp: DateTime<Utc>,
}

impl Event for NoSubscriberEvent {}

impl fmt::Debug for NoSubscriberEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoSubscriberEvent")
            .field("bus", &self.bus)
            .field("original_event", &self.original_event)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Posted by the bus when a subscriber's handler returned an error or panicked.
pub struct SubscriberExceptionEvent {
    /// The bus the causing event was posted to
    pub bus: WeakEventBus,
    /// What the handler reported
    pub error: Arc<anyhow::Error>,
    /// The event being delivered when the handler failed
    pub causing_event: Arc<dyn Event>,
    /// The subscriber whose handler failed
    pub causing_subscriber: Arc<dyn Any + Send + Sync>,
    /// Type name of the failing subscriber
    pub causing_subscriber_type: &'static str,
    /// When the failure was caught
    pub timestamp: DateTime<Utc>,
}

impl SubscriberExceptionEvent {
    /// Downcasts the failing subscriber to its concrete type.
    pub fn subscriber<S: Any>(&self) -> Option<&S> {
        self.causing_subscriber.downcast_ref::<S>()
    }
}

impl Event for SubscriberExceptionEvent {}

impl fmt::Debug for SubscriberExceptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Subscribers are opaque, only their type name is printed
        f.debug_struct("SubscriberExceptionEvent")
            .field("bus", &self.bus)
            .field("error", &self.error)
            .field("causing_event", &self.causing_event)
            .field("causing_subscriber", &self.causing_subscriber_type)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Returns true for the events the bus generates about its own delivery.
///
/// These never trigger further reporting, which keeps failure reporting from looping.
pub(crate) fn is_system_event(event: &dyn Event) -> bool {
    event.is::<NoSubscriberEvent>() || event.is::<SubscriberExceptionEvent>()
}
