use std::any::TypeId;
use std::collections::HashMap;

use super::finder::DescriptorProvider;
use super::{Subscriber, SubscriberMethod, SubscriberType};

/// Precomputed table of handler descriptors, keyed by subscriber type.
///
/// Build one at startup and hand it to
/// [`EventBusBuilder::add_index`](crate::EventBusBuilder::add_index). Types missing from the
/// table are passed on to the next provider.
#[derive(Debug, Default)]
pub struct SubscriberIndex {
    entries: HashMap<TypeId, Vec<SubscriberMethod>>,
}

impl SubscriberIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the handlers of `S`, replacing any earlier entry.
    pub fn insert<S: Subscriber>(&mut self, methods: Vec<SubscriberMethod>) -> &mut Self {
        self.entries.insert(TypeId::of::<S>(), methods);
        self
    }

    /// Builder-style variant of [`insert`](Self::insert)
    pub fn with<S: Subscriber>(mut self, methods: Vec<SubscriberMethod>) -> Self {
        self.insert::<S>(methods);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DescriptorProvider for SubscriberIndex {
    fn find(&self, subscriber_type: SubscriberType) -> Option<Vec<SubscriberMethod>> {
        self.entries.get(&subscriber_type.id()).cloned()
    }
}
