//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Resolves the ordered set of event types a posted event is matched against.
//
// | Position | Contents                                                                 |
// |----------|--------------------------------------------------------------------------|
// | 1        | the concrete type itself                                                 |
// | 2..n     | the declared supertype chain, nearest first                              |
// | n+1..    | interfaces of each class in chain order, depth-first, without duplicates |
//--------------------------------------------------------------------------------------------------

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::EventType;

/// Computes and caches type closures.
///
/// Types never change during the life of the process, so cached closures are never
/// invalidated (except explicitly through [`clear_cache`](Self::clear_cache)).
#[derive(Debug)]
pub struct EventTypeResolver {
    /// When false, every closure is just the concrete type
    inheritance: bool,
    /// Closures keyed by concrete type
    cache: RwLock<HashMap<TypeId, Arc<[EventType]>>>,
}

impl EventTypeResolver {
    /// Creates a resolver. With `inheritance` off it works in exact-type mode.
    pub fn new(inheritance: bool) -> Self {
        Self {
            inheritance,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns true unless the resolver works in exact-type mode
    pub fn inheritance(&self) -> bool {
        self.inheritance
    }

    /// Returns the closure of `event_type`, computing it on first use.
    pub fn closure_of(&self, event_type: EventType) -> Arc<[EventType]> {
        if !self.inheritance {
            return Arc::from(vec![event_type]);
        }

        if let Some(closure) = self.cache.read().get(&event_type.id()) {
            return closure.clone();
        }

        let closure: Arc<[EventType]> = Arc::from(Self::compute(event_type));
        self.cache
            .write()
            .entry(event_type.id())
            .or_insert(closure)
            .clone()
    }

    /// Returns true if `ancestor` is part of the closure of `concrete`.
    pub fn matches(&self, concrete: EventType, ancestor: EventType) -> bool {
        concrete == ancestor || self.closure_of(concrete).contains(&ancestor)
    }

    /// Drops all cached closures
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    fn compute(event_type: EventType) -> Vec<EventType> {
        let mut chain = vec![event_type];
        let mut current = event_type.supertype();
        while let Some(parent) = current {
            // A malformed declaration could loop back on itself
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
            current = parent.supertype();
        }

        let mut closure = chain.clone();
        for class in &chain {
            Self::add_interfaces(&mut closure, class.interfaces());
        }
        closure
    }

    fn add_interfaces(closure: &mut Vec<EventType>, interfaces: Vec<EventType>) {
        for interface in interfaces {
            if !closure.contains(&interface) {
                closure.push(interface);
                Self::add_interfaces(closure, interface.interfaces());
            }
        }
    }
}
