//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | DescriptorProvider      | Yields the handlers of a subscriber type          | find              |
// | SubscriberMethodFinder  | Ordered providers, fallback, per-type cache       | find_methods      |
//--------------------------------------------------------------------------------------------------

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{Subscriber, SubscriberMethod, SubscriberType};
use crate::error::{EventBusError, EventBusResult};

/// Source of handler descriptors for subscriber types.
///
/// Returning `None` means the provider does not know the type and the next provider is asked.
/// `Some(vec![])` is an authoritative "no handlers".
pub trait DescriptorProvider: Send + Sync {
    fn find(&self, subscriber_type: SubscriberType) -> Option<Vec<SubscriberMethod>>;
}

/// Resolves and caches the descriptors of subscriber types.
pub struct SubscriberMethodFinder {
    providers: Vec<Arc<dyn DescriptorProvider>>,
    strict: bool,
    cache: RwLock<HashMap<TypeId, Arc<[SubscriberMethod]>>>,
}

impl SubscriberMethodFinder {
    /// Creates a finder.
    ///
    /// # Arguments
    ///
    /// * `providers` - Tried in order; the first one that knows a type wins
    /// * `strict` - When true, types no provider knows are rejected instead of falling back
    ///   to [`Subscriber::subscriber_methods`]
    pub fn new(providers: Vec<Arc<dyn DescriptorProvider>>, strict: bool) -> Self {
        Self {
            providers,
            strict,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the descriptors of `S`, resolving them on first use.
    ///
    /// # Returns
    ///
    /// * `Err(UnresolvedSubscriber)` - strict mode and no provider knows `S`
    /// * `Err(NoMatchingHandler)` - `S` has no handlers at all
    pub fn find_methods<S: Subscriber>(&self) -> EventBusResult<Arc<[SubscriberMethod]>> {
        let subscriber_type = SubscriberType::of::<S>();
        if let Some(methods) = self.cache.read().get(&subscriber_type.id()) {
            return Ok(methods.clone());
        }

        let methods = match self.providers.iter().find_map(|p| p.find(subscriber_type)) {
            Some(methods) => methods,
            None if self.strict => {
                return Err(EventBusError::UnresolvedSubscriber(subscriber_type.name()));
            }
            None => {
                debug!(
                    "No descriptor provider knows {}, using its own handler list",
                    subscriber_type.name()
                );
                S::subscriber_methods()
            }
        };

        if methods.is_empty() {
            return Err(EventBusError::NoMatchingHandler(subscriber_type.name()));
        }

        let methods: Arc<[SubscriberMethod]> = Arc::from(methods);
        Ok(self
            .cache
            .write()
            .entry(subscriber_type.id())
            .or_insert(methods)
            .clone())
    }

    /// Drops all cached descriptors
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }
}
