//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | Event                   | Marker trait for anything that can be posted      | supertype         |
// |                         |                                                   | interfaces        |
// |                         |                                                   | upcast            |
// | EventExt                | Object-safe helpers, implemented for every Event  | as_any, into_any  |
// | EventType               | Runtime descriptor of an event type               | of, supertype     |
// | CollisionBehavior       | Clash policy of AsyncTracked deliveries           |                   |
//--------------------------------------------------------------------------------------------------

use std::any::{Any, TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A value that can be posted through the [`EventBus`](crate::EventBus).
///
/// Most events need nothing beyond an empty impl:
///
/// ```
/// use eventbus::Event;
///
/// #[derive(Debug)]
/// struct Ping;
///
/// impl Event for Ping {}
/// ```
///
/// Rust has no class hierarchy, so an event type declares its ancestry explicitly. Subscribers
/// registered for a declared supertype or interface receive the event as long as event
/// inheritance is enabled on the bus. Interface types are ordinary (usually empty) event types
/// that are never posted themselves.
pub trait Event: EventExt + Send + Sync + fmt::Debug + 'static {
    /// The direct supertype of this event type, if any.
    fn supertype() -> Option<EventType>
    where
        Self: Sized,
    {
        None
    }

    /// Interface types this event type implements directly.
    fn interfaces() -> Vec<EventType>
    where
        Self: Sized,
    {
        Vec::new()
    }

    /// Typed view of this event as one of its ancestors.
    ///
    /// Typed handlers registered for an ancestor type receive whatever this returns. Events
    /// that embed their parent's data usually return a reference to that field.
    fn upcast(&self, ancestor: TypeId) -> Option<&dyn Any> {
        let _ = ancestor;
        None
    }

    /// Identity of an [`AsyncTracked`](crate::ThreadMode::AsyncTracked) delivery.
    ///
    /// Tracked deliveries of one event type to one subscriber collide when their codes are
    /// equal. `None` collides with every code. The default is the type name, so all events of
    /// a type collide; override it when events of one type should run side by side.
    fn unique_code(&self) -> Option<String> {
        Some(self.event_type().name().to_string())
    }

    /// What a tracked delivery does when it collides with an unfinished one
    fn collision_behavior(&self) -> CollisionBehavior {
        CollisionBehavior::default()
    }
}

/// Policy for a tracked delivery that collides with one still pending or running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionBehavior {
    /// Drop the new delivery
    IgnoreNew,
    /// Cancel the pending one and deliver the new event instead. A delivery already running
    /// is left to finish.
    #[default]
    ReplaceWithNew,
}

/// Object-safe helpers available on every `dyn Event`.
pub trait EventExt {
    /// Returns the event as `&dyn Any` for downcasting
    fn as_any(&self) -> &dyn Any;

    /// Converts a shared event into a shared `Any`
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Returns the runtime descriptor of the concrete event type
    fn event_type(&self) -> EventType;
}

impl<E: Event> EventExt for E {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn event_type(&self) -> EventType {
        EventType::of::<E>()
    }
}

impl dyn Event {
    /// Returns true if the concrete type of this event is `E`.
    pub fn is<E: Event>(&self) -> bool {
        self.as_any().is::<E>()
    }

    /// Downcasts to the concrete type `E`.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    /// Views the event as `E`, either because it is an `E` or because it upcasts to one.
    pub fn view<E: Event>(&self) -> Option<&E> {
        self.downcast_ref::<E>().or_else(|| {
            self.upcast(TypeId::of::<E>())
                .and_then(|ancestor| ancestor.downcast_ref::<E>())
        })
    }

    /// Address of the event value, used together with its type to recognise the instance
    /// currently being delivered.
    pub(crate) fn data_address(&self) -> usize {
        self as *const dyn Event as *const () as usize
    }
}

/// Downcasts a shared event into a shared concrete event.
pub fn downcast_arc<E: Event>(event: Arc<dyn Event>) -> Option<Arc<E>> {
    event.into_any().downcast::<E>().ok()
}

/// Runtime descriptor of an event type.
///
/// Equality and hashing only look at the `TypeId`; the name and ancestry accessors exist for
/// logging and hierarchy resolution.
#[derive(Clone, Copy)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
    supertype: fn() -> Option<EventType>,
    interfaces: fn() -> Vec<EventType>,
}

impl EventType {
    /// Returns the descriptor of `E`
    pub fn of<E: Event>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: type_name::<E>(),
            supertype: <E as Event>::supertype,
            interfaces: <E as Event>::interfaces,
        }
    }

    /// Returns the `TypeId` of the described type
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Returns the fully qualified type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the type name without its module path
    pub fn short_name(&self) -> &'static str {
        short_type_name(self.name)
    }

    /// Returns the declared direct supertype
    pub fn supertype(&self) -> Option<EventType> {
        (self.supertype)()
    }

    /// Returns the declared direct interfaces
    pub fn interfaces(&self) -> Vec<EventType> {
        (self.interfaces)()
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventType {}

impl Hash for EventType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventType").field(&self.name).finish()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Strips the module path from a type name, keeping generic arguments intact.
pub(crate) fn short_type_name(name: &'static str) -> &'static str {
    let head = name.split('<').next().unwrap_or(name);
    match head.rfind("::") {
        Some(pos) => &name[pos + 2..],
        None => name,
    }
}
