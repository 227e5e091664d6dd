//--------------------------------------------------------------------------------------------------
// ENUMS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Raised by         |
// |-------------------------|---------------------------------------------------|-------------------|
// | EventBusError           | Everything the bus can report to a caller         | register, post,   |
// |                         |                                                   | cancel, config,   |
// |                         |                                                   | execute, schedule |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the event bus.
///
/// Registration and cancellation misuse is always returned synchronously to the caller.
/// Handler failures are only returned when the bus runs with `throw_subscriber_exception`;
/// otherwise they travel back through the bus as
/// [`SubscriberExceptionEvent`](crate::SubscriberExceptionEvent)s.
#[derive(Debug, Error, Clone)]
pub enum EventBusError {
    /// The same subscriber/handler pair was registered twice
    #[error("Subscriber {subscriber} already registered to event {event_type}")]
    DuplicateRegistration {
        subscriber: &'static str,
        event_type: &'static str,
    },

    /// Unregistering a subscriber that was never registered. Only ever logged.
    #[error("Subscriber to unregister was not registered before: {0}")]
    UnknownSubscriber(&'static str),

    /// `cancel_event_delivery`/`abort_event_delivery` called from the wrong place
    #[error("Illegal event cancellation: {0}")]
    IllegalCancellation(String),

    /// The subscriber type declares no handler methods
    #[error("Subscriber {0} has no handler methods")]
    NoMatchingHandler(&'static str),

    /// Strict verification is on and no descriptor provider knows the subscriber type
    #[error("No descriptor provider resolves subscriber {0} and strict method verification is enabled")]
    UnresolvedSubscriber(&'static str),

    /// A handler returned an error or panicked
    #[error("Could not dispatch event {event_type} to subscriber {subscriber}: {cause}")]
    HandlerInvocation {
        subscriber: &'static str,
        event_type: &'static str,
        cause: Arc<anyhow::Error>,
    },

    /// An executor or main context refused a job; the deliveries it carried wait for the next
    /// post of that mode
    #[error("Executor rejected a job: {0}")]
    ExecutorRejected(String),

    /// Configuration could not be loaded
    #[error("Invalid event bus configuration: {0}")]
    Config(String),
}

/// Type alias for Result with EventBusError
pub type EventBusResult<T> = Result<T, EventBusError>;

impl EventBusError {
    /// Returns true if this error wraps a failing handler.
    pub fn is_handler_failure(&self) -> bool {
        matches!(self, EventBusError::HandlerInvocation { .. })
    }
}
