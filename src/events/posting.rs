//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Per-thread posting state. Every (thread, bus) pair owns one FIFO of top-level events and a
// draining flag, so a `post` made from inside a handler only appends and returns.
//
// | State    | Transition                                                                  |
// |----------|-----------------------------------------------------------------------------|
// | Idle     | post -> Queued (state created lazily)                                       |
// | Queued   | not draining -> Draining                                                    |
// | Draining | queue empty -> Idle (state dropped)                                         |
//
// The state also carries the delivery context of the event currently being handed to a
// handler, which is what cancel/abort validate against.
//--------------------------------------------------------------------------------------------------

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::error::{EventBusError, EventBusResult};
use crate::subscribers::{Subscription, SubscriptionFilter, ThreadMode};

use super::types::{Event, EventType};

thread_local! {
    static POSTING_STATES: RefCell<HashMap<u64, PostingState>> = RefCell::new(HashMap::new());
}

/// Which subscriptions a post may reach.
#[derive(Clone, Default)]
pub(crate) enum Scope {
    #[default]
    All,
    /// Subscribers of one type, by full or short type name
    Named(Arc<str>),
    Filtered(SubscriptionFilter),
}

impl Scope {
    pub(crate) fn allows(&self, subscription: &Subscription) -> bool {
        match self {
            Scope::All => true,
            Scope::Named(target) => subscription.subscriber_type().matches_target(target),
            Scope::Filtered(filter) => filter(subscription),
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("All"),
            Scope::Named(target) => f.debug_tuple("Named").field(target).finish(),
            Scope::Filtered(_) => f.write_str("Filtered"),
        }
    }
}

/// A posted event waiting in a thread's queue.
#[derive(Debug, Clone)]
pub(crate) struct QueuedEvent {
    pub(crate) event: Arc<dyn Event>,
    pub(crate) scope: Scope,
}

/// How far a cancellation reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Cancellation {
    #[default]
    None,
    /// Skip the rest of the current event type's subscriptions
    Type,
    /// Skip every remaining subscription of the event
    Event,
}

/// Address and type of a value handed to a handler
type Instance = (usize, TypeId);

struct DeliveryContext {
    /// The posted value itself
    instance: Instance,
    /// The ancestor view a typed handler receives, when it is a different value
    view: Option<Instance>,
    thread_mode: ThreadMode,
    cancellation: Cancellation,
}

impl DeliveryContext {
    fn is_current(&self, candidate: Instance) -> bool {
        self.instance == candidate || self.view == Some(candidate)
    }
}

#[derive(Default)]
struct PostingState {
    queue: VecDeque<QueuedEvent>,
    draining: bool,
    current: Option<DeliveryContext>,
}

fn with_state<R>(bus_id: u64, f: impl FnOnce(&mut PostingState) -> R) -> R {
    POSTING_STATES.with(|states| f(states.borrow_mut().entry(bus_id).or_default()))
}

/// Appends `queued` to this thread's queue.
///
/// # Returns
///
/// A [`DrainGuard`] if the caller must drain the queue, `None` if a drain further up the
/// stack of this thread will pick the event up.
pub(crate) fn enqueue(bus_id: u64, queued: QueuedEvent) -> Option<DrainGuard> {
    with_state(bus_id, |state| {
        state.queue.push_back(queued);
        if state.draining {
            None
        } else {
            state.draining = true;
            Some(DrainGuard { bus_id })
        }
    })
}

/// Exclusive right to drain one thread's queue for one bus.
///
/// Dropping the guard discards the thread's state, including events left behind by a drain
/// that unwound.
pub(crate) struct DrainGuard {
    bus_id: u64,
}

impl DrainGuard {
    /// Pops the next queued event
    pub(crate) fn next_event(&self) -> Option<QueuedEvent> {
        with_state(self.bus_id, |state| state.queue.pop_front())
    }

    /// Opens the delivery context for one handler invocation.
    ///
    /// `handled_as` is the event type of the subscription; when the event is delivered as an
    /// ancestor, the view the handler receives is recorded as well.
    pub(crate) fn begin_delivery(
        &self,
        event: &dyn Event,
        handled_as: EventType,
        thread_mode: ThreadMode,
    ) {
        let instance = (event.data_address(), event.event_type().id());
        let view = if handled_as.id() == instance.1 {
            None
        } else {
            event
                .upcast(handled_as.id())
                .map(|view| (view as *const dyn Any as *const () as usize, handled_as.id()))
        };
        with_state(self.bus_id, |state| {
            state.current = Some(DeliveryContext {
                instance,
                view,
                thread_mode,
                cancellation: Cancellation::None,
            });
        });
    }

    /// Closes the delivery context and reports whether the handler cancelled
    pub(crate) fn end_delivery(&self) -> Cancellation {
        with_state(self.bus_id, |state| {
            state
                .current
                .take()
                .map(|context| context.cancellation)
                .unwrap_or_default()
        })
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        // try_with: the thread-local may already be gone during thread teardown
        let _ = POSTING_STATES.try_with(|states| states.borrow_mut().remove(&self.bus_id));
    }
}

/// Marks the event currently being delivered on this thread as cancelled.
///
/// `address` and `type_id` must identify the value the handler was given: the posted event,
/// or the ancestor view a typed handler received.
pub(crate) fn cancel(
    bus_id: u64,
    address: usize,
    type_id: TypeId,
    cancellation: Cancellation,
) -> EventBusResult<()> {
    POSTING_STATES.with(|states| {
        let mut states = states.borrow_mut();
        let context = states
            .get_mut(&bus_id)
            .and_then(|state| state.current.as_mut())
            .ok_or_else(|| {
                EventBusError::IllegalCancellation(
                    "This method may only be called from inside event handling methods on the posting thread".to_string(),
                )
            })?;

        if context.thread_mode != ThreadMode::Direct {
            return Err(EventBusError::IllegalCancellation(format!(
                "Event handlers may only cancel delivery in thread mode Direct, not {:?}",
                context.thread_mode
            )));
        }
        if !context.is_current((address, type_id)) {
            return Err(EventBusError::IllegalCancellation(
                "Only the currently handled event may be cancelled".to_string(),
            ));
        }

        // An abort is never downgraded to a cancel
        if context.cancellation != Cancellation::Event {
            context.cancellation = cancellation;
        }
        Ok(())
    })
}
