//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Event type -> subscriptions, plus the reverse subscriber -> event types index.
//
// Per-type lists are shared as `Arc<Vec<_>>` and replaced copy-on-write, so a delivery that
// grabbed a snapshot keeps iterating it while registrations change the live list.
//
// | Operation               | Description                                                    |
// |-------------------------|----------------------------------------------------------------|
// | subscribe               | Validate then insert, ordered by descending priority           |
// | unsubscribe             | Remove and deactivate, for all or some event types             |
// | subscriptions_for       | Snapshot of one event type's list                              |
// | is_registered           | Live registrations of one subscriber instance                  |
//--------------------------------------------------------------------------------------------------

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{SubscriberMethod, SubscriberRef, SubscriberType, Subscription};
use crate::error::{EventBusError, EventBusResult};
use crate::events::types::EventType;

pub(crate) type SubscriptionList = Arc<Vec<Arc<Subscription>>>;

/// What the registry knows about one registered instance
struct SubscriberEntry {
    reference: SubscriberRef,
    event_types: Vec<EventType>,
}

#[derive(Default)]
struct RegistryInner {
    by_event_type: HashMap<TypeId, SubscriptionList>,
    by_subscriber: HashMap<usize, SubscriberEntry>,
}

impl RegistryInner {
    fn remove_subscriptions(&mut self, subscriber_id: usize, event_type: EventType) -> usize {
        let Some(list) = self.by_event_type.get_mut(&event_type.id()) else {
            return 0;
        };
        let before = list.len();
        let subscriptions = Arc::make_mut(list);
        subscriptions.retain(|subscription| {
            let keep = subscription.subscriber_id() != subscriber_id;
            if !keep {
                subscription.deactivate();
            }
            keep
        });
        let removed = before - subscriptions.len();
        if subscriptions.is_empty() {
            self.by_event_type.remove(&event_type.id());
        }
        removed
    }

    /// Drops weak registrations whose subscriber no longer exists.
    fn purge_dead(&mut self) {
        let dead: Vec<usize> = self
            .by_subscriber
            .iter()
            .filter(|(_, entry)| !entry.reference.is_alive())
            .map(|(id, _)| *id)
            .collect();
        for subscriber_id in dead {
            if let Some(entry) = self.by_subscriber.remove(&subscriber_id) {
                for event_type in entry.event_types {
                    self.remove_subscriptions(subscriber_id, event_type);
                }
                debug!("Purged collected weak subscriber at {:#x}", subscriber_id);
            }
        }
    }
}

/// Registry of subscriptions, shared by every clone of a bus.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    inner: RwLock<RegistryInner>,
}

impl SubscriberRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Installs one subscription per descriptor.
    ///
    /// Every descriptor is checked for duplicates before anything is inserted, so a failed
    /// call leaves the registry untouched.
    ///
    /// # Returns
    ///
    /// The installed subscriptions, in descriptor order.
    pub(crate) fn subscribe(
        &self,
        reference: SubscriberRef,
        subscriber_id: usize,
        subscriber_type: SubscriberType,
        methods: &[SubscriberMethod],
    ) -> EventBusResult<Vec<Arc<Subscription>>> {
        let mut inner = self.inner.write();
        inner.purge_dead();

        for (position, method) in methods.iter().enumerate() {
            let already_listed = inner
                .by_event_type
                .get(&method.event_type().id())
                .is_some_and(|list| {
                    list.iter().any(|existing| {
                        existing.subscriber_id() == subscriber_id
                            && existing.method().same_handler(method)
                    })
                });
            let repeated = methods[..position].iter().any(|m| m.same_handler(method));
            if already_listed || repeated {
                return Err(EventBusError::DuplicateRegistration {
                    subscriber: subscriber_type.name(),
                    event_type: method.event_type().name(),
                });
            }
        }

        let mut installed = Vec::with_capacity(methods.len());
        for method in methods {
            let subscription = Arc::new(Subscription::new(
                reference.clone(),
                subscriber_id,
                subscriber_type,
                method.clone(),
            ));

            let list = inner
                .by_event_type
                .entry(method.event_type().id())
                .or_default();
            let subscriptions = Arc::make_mut(list);
            let position = subscriptions
                .iter()
                .position(|existing| existing.method().priority() < method.priority())
                .unwrap_or(subscriptions.len());
            subscriptions.insert(position, subscription.clone());

            let entry = inner
                .by_subscriber
                .entry(subscriber_id)
                .or_insert_with(|| SubscriberEntry {
                    reference: reference.clone(),
                    event_types: Vec::new(),
                });
            if !entry.event_types.contains(&method.event_type()) {
                entry.event_types.push(method.event_type());
            }

            installed.push(subscription);
        }

        debug!(
            "Registered {} with {} subscription(s)",
            subscriber_type.name(),
            installed.len()
        );
        Ok(installed)
    }

    /// Removes the subscriptions of one instance.
    ///
    /// # Arguments
    ///
    /// * `subscriber_id` - Identity of the instance
    /// * `event_types` - Restricts removal to these types; `None` removes everything
    ///
    /// # Returns
    ///
    /// `false` if the instance was not registered at all.
    pub(crate) fn unsubscribe(&self, subscriber_id: usize, event_types: Option<&[EventType]>) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.by_subscriber.get_mut(&subscriber_id) else {
            return false;
        };

        let targeted: Vec<EventType> = match event_types {
            Some(only) => entry
                .event_types
                .iter()
                .filter(|t| only.contains(t))
                .copied()
                .collect(),
            None => entry.event_types.clone(),
        };
        entry.event_types.retain(|t| !targeted.contains(t));
        if entry.event_types.is_empty() {
            inner.by_subscriber.remove(&subscriber_id);
        }

        for event_type in targeted {
            inner.remove_subscriptions(subscriber_id, event_type);
        }
        true
    }

    /// Snapshot of the subscriptions for exactly `event_type`
    pub(crate) fn subscriptions_for(&self, event_type: EventType) -> Option<SubscriptionList> {
        self.inner.read().by_event_type.get(&event_type.id()).cloned()
    }

    pub(crate) fn is_registered(&self, subscriber_id: usize) -> bool {
        self.inner
            .read()
            .by_subscriber
            .get(&subscriber_id)
            .is_some_and(|entry| entry.reference.is_alive())
    }

    /// Returns true if any live subscription exists for one of `event_types`
    pub(crate) fn has_subscriptions(&self, event_types: &[EventType]) -> bool {
        let inner = self.inner.read();
        event_types.iter().any(|event_type| {
            inner
                .by_event_type
                .get(&event_type.id())
                .is_some_and(|list| list.iter().any(|s| s.is_active()))
        })
    }
}
