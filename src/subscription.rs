//! # Subscription Table
//!
//! Bounded storage for the client's tracked subscriptions and the per-filter
//! state the reconciler converges: what the application wants
//! (`want_subscribed`) versus what the broker currently has
//! (`is_subscribed`), with at most one request in flight per filter.
//!
//! Slots are addressed by generation-checked [`SubKey`]s so that a key held
//! across an asynchronous boundary (the reassembler's active match, a retry
//! deadline) can never resolve to a different subscription after the slot is
//! recycled.

use embassy_time::Instant;
use heapless::String;

use crate::handle::MessageHandler;
use crate::matcher::filter_matches;
use crate::packet::QoS;

/// Maximum length of a topic or topic filter.
pub const MAX_TOPIC_LEN: usize = 128;

/// How a failure to issue a subscribe/unsubscribe request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionPolicy {
    /// Surface the error to the caller and do not retry. Used for a brand-new
    /// `subscribe` call, before the subscription is tracked.
    AllowPermanentError,
    /// Count the failure and arm a backoff retry. Used after reconnects and
    /// for mid-life failures of already-tracked subscriptions.
    RetryAllErrors,
}

/// One tracked subscription.
///
/// Life of a subscription: created on the first `subscribe` call for its
/// filter; `want_subscribed` flips on `unsubscribe`; the slot is freed only
/// once the reconciler observes `!is_subscribed && !want_subscribed` with no
/// request pending.
pub(crate) struct Subscription {
    pub filter: String<MAX_TOPIC_LEN>,
    pub qos: QoS,
    pub handler: &'static dyn MessageHandler,
    pub failed_attempts: u8,
    pub has_pending_request: bool,
    pub want_subscribed: bool,
    pub is_subscribed: bool,
    /// Packet id of the in-flight SUBSCRIBE/UNSUBSCRIBE, if any.
    pub pending_packet_id: Option<u16>,
    /// Whether the in-flight request is a subscribe (as opposed to unsubscribe).
    pub pending_is_subscribe: bool,
    /// Armed backoff deadline for the next transition retry.
    pub retry_at: Option<Instant>,
}

impl Subscription {
    pub fn new(filter: String<MAX_TOPIC_LEN>, qos: QoS, handler: &'static dyn MessageHandler) -> Self {
        Self {
            filter,
            qos,
            handler,
            failed_attempts: 0,
            has_pending_request: false,
            want_subscribed: true,
            is_subscribed: false,
            pending_packet_id: None,
            pending_is_subscribe: false,
            retry_at: None,
        }
    }
}

/// A generation-checked handle to a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct SubKey {
    index: usize,
    generation: u16,
}

struct Slot {
    generation: u16,
    sub: Option<Subscription>,
}

/// Fixed-capacity arena of subscriptions, owned exclusively by the network
/// task. At most one subscription exists per distinct filter.
pub(crate) struct SubscriptionTable<const N: usize> {
    slots: [Slot; N],
}

impl<const N: usize> SubscriptionTable<N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                sub: None,
            }),
        }
    }

    /// Inserts a subscription, returning its key, or `None` if the table is
    /// full. The caller is responsible for the one-per-filter invariant
    /// (see [`Self::find`]).
    pub fn insert(&mut self, sub: Subscription) -> Option<SubKey> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.sub.is_none())?;
        slot.sub = Some(sub);
        Some(SubKey {
            index,
            generation: slot.generation,
        })
    }

    /// Removes the subscription behind `key`, recycling the slot under a new
    /// generation so stale keys no longer resolve.
    pub fn remove(&mut self, key: SubKey) -> Option<Subscription> {
        let slot = &mut self.slots[key.index];
        if slot.generation != key.generation {
            return None;
        }
        let sub = slot.sub.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(sub)
    }

    pub fn get(&self, key: SubKey) -> Option<&Subscription> {
        let slot = &self.slots[key.index];
        if slot.generation != key.generation {
            return None;
        }
        slot.sub.as_ref()
    }

    pub fn get_mut(&mut self, key: SubKey) -> Option<&mut Subscription> {
        let slot = &mut self.slots[key.index];
        if slot.generation != key.generation {
            return None;
        }
        slot.sub.as_mut()
    }

    /// Looks up the subscription with exactly this filter.
    pub fn find(&self, filter: &str) -> Option<SubKey> {
        self.keys()
            .find(|key| self.get(*key).is_some_and(|sub| sub.filter == filter))
    }

    /// Looks up the subscription whose in-flight request has this packet id.
    pub fn find_by_packet_id(&self, packet_id: u16) -> Option<SubKey> {
        self.keys().find(|key| {
            self.get(*key)
                .is_some_and(|sub| sub.pending_packet_id == Some(packet_id))
        })
    }

    /// First subscription whose filter matches `topic`. Filters are
    /// unordered; the first match wins.
    pub fn match_topic(&self, topic: &str) -> Option<SubKey> {
        self.keys()
            .find(|key| self.get(*key).is_some_and(|sub| filter_matches(&sub.filter, topic)))
    }

    /// Keys of all occupied slots.
    pub fn keys(&self) -> impl Iterator<Item = SubKey> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.sub.as_ref().map(|_| SubKey {
                index,
                generation: slot.generation,
            })
        })
    }

    /// Earliest armed retry deadline across all subscriptions.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|slot| slot.sub.as_ref().and_then(|sub| sub.retry_at))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Message;

    struct NopHandler;
    impl MessageHandler for NopHandler {
        fn on_message(&self, _message: Message<'_>) {}
    }

    static HANDLER: NopHandler = NopHandler;

    fn sub(filter: &str) -> Subscription {
        Subscription::new(String::try_from(filter).unwrap(), QoS::AtMostOnce, &HANDLER)
    }

    #[test]
    fn insert_find_remove() {
        let mut table = SubscriptionTable::<4>::new();
        let key = table.insert(sub("a/b")).unwrap();
        assert_eq!(table.find("a/b"), Some(key));
        assert_eq!(table.find("a/c"), None);

        let removed = table.remove(key).unwrap();
        assert_eq!(removed.filter, "a/b");
        assert_eq!(table.find("a/b"), None);
    }

    #[test]
    fn stale_key_does_not_resolve_after_reuse() {
        let mut table = SubscriptionTable::<1>::new();
        let old = table.insert(sub("a/b")).unwrap();
        table.remove(old);

        let fresh = table.insert(sub("x/y")).unwrap();
        assert!(table.get(old).is_none());
        assert_eq!(table.get(fresh).unwrap().filter, "x/y");
    }

    #[test]
    fn table_capacity_is_bounded() {
        let mut table = SubscriptionTable::<2>::new();
        assert!(table.insert(sub("a")).is_some());
        assert!(table.insert(sub("b")).is_some());
        assert!(table.insert(sub("c")).is_none());
    }

    #[test]
    fn match_topic_uses_wildcards() {
        let mut table = SubscriptionTable::<4>::new();
        table.insert(sub("home/+/state")).unwrap();
        let lights = table.insert(sub("lights/#")).unwrap();

        assert!(table.match_topic("home/door/state").is_some());
        assert_eq!(table.match_topic("lights/kitchen/1"), Some(lights));
        assert_eq!(table.match_topic("other/topic"), None);
    }

    #[test]
    fn next_retry_at_is_minimum() {
        let mut table = SubscriptionTable::<4>::new();
        let a = table.insert(sub("a")).unwrap();
        let b = table.insert(sub("b")).unwrap();
        assert_eq!(table.next_retry_at(), None);

        table.get_mut(a).unwrap().retry_at = Some(Instant::from_ticks(200));
        table.get_mut(b).unwrap().retry_at = Some(Instant::from_ticks(100));
        assert_eq!(table.next_retry_at(), Some(Instant::from_ticks(100)));
    }
}
