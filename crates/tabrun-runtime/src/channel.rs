//! Per-conversation publish/subscribe.
//!
//! Delivery is synchronous and in registration order. A subscriber that
//! returns an error or panics is logged and skipped; the remaining
//! subscribers still receive the event. There is no replay: a late
//! subscriber only sees events published after it subscribed.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tabrun_core::events::ChannelEvent;
use tabrun_core::{ConversationId, CoreError};
use tracing::{debug, warn};

/// Subscriber callback. An `Err` is reported as a delivery failure.
pub type Subscriber = dyn Fn(&ChannelEvent) -> Result<(), String> + Send + Sync;

/// Event stream of one conversation.
pub struct Channel {
    id: ConversationId,
    subscribers: Mutex<Vec<(u64, Arc<Subscriber>)>>,
    next_subscriber: AtomicU64,
    last_event: Mutex<Option<ChannelEvent>>,
}

impl Channel {
    fn new(id: ConversationId) -> Self {
        Self {
            id,
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            last_event: Mutex::new(None),
        }
    }

    /// Conversation this channel belongs to.
    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// Add a subscriber. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&ChannelEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        let key = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock();
        subscribers.push((key, Arc::new(callback)));
        debug!(channel = %self.id, subscribers = subscribers.len(), "subscriber added");
        Subscription {
            channel: Some(Arc::downgrade(self)),
            key,
        }
    }

    fn remove(&self, key: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(k, _)| *k != key);
        let removed = subscribers.len() != before;
        if removed {
            debug!(channel = %self.id, subscribers = subscribers.len(), "subscriber removed");
        }
        removed
    }

    /// Deliver `event` to every current subscriber. Returns how many
    /// accepted it.
    pub fn publish(&self, event: &ChannelEvent) -> usize {
        let snapshot: Vec<Arc<Subscriber>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        *self.last_event.lock() = Some(event.clone());

        let mut delivered = 0;
        for callback in snapshot {
            let reason = match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(reason)) => reason,
                Err(payload) => panic_message(payload.as_ref()),
            };
            let err = CoreError::ChannelDeliveryFailure {
                channel: self.id.clone(),
                reason,
            };
            metrics::counter!("tabrun_channel_delivery_failures_total").increment(1);
            warn!(
                channel = %self.id,
                event_type = %event.event_type,
                error = %err,
                "subscriber failed"
            );
        }
        delivered
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Most recently published event.
    pub fn last_event(&self) -> Option<ChannelEvent> {
        self.last_event.lock().clone()
    }

    /// Forget the most recent event. Subscribers are kept.
    pub fn reset(&self) {
        *self.last_event.lock() = None;
    }

    fn clear_subscribers(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        let count = subscribers.len();
        subscribers.clear();
        count
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("subscriber panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("subscriber panicked: {s}")
    } else {
        "subscriber panicked".to_owned()
    }
}

/// Registration handle returned by [`Channel::subscribe`].
///
/// Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    channel: Option<Weak<Channel>>,
    key: u64,
}

impl Subscription {
    /// Unsubscribe now. Returns whether the subscriber was still registered.
    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    /// Whether this subscription points at `channel`.
    pub fn is_on(&self, channel: &Arc<Channel>) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(channel)))
    }

    fn release(&mut self) -> bool {
        self.channel
            .take()
            .and_then(|weak| weak.upgrade())
            .is_some_and(|channel| channel.remove(self.key))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish_non_exhaustive()
    }
}

/// All conversation channels.
#[derive(Default)]
pub struct ChannelBus {
    channels: DashMap<ConversationId, Arc<Channel>>,
}

impl ChannelBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the channel for `id`.
    pub fn get_channel(&self, id: &ConversationId) -> Arc<Channel> {
        self.channels
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(channel = %id, "channel created");
                Arc::new(Channel::new(id.clone()))
            })
            .value()
            .clone()
    }

    /// The channel for `id`, without creating one.
    pub fn find_channel(&self, id: &ConversationId) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Subscribe to the channel for `id`, creating it if needed.
    ///
    /// The subscriber is attached before the map entry is released, so a
    /// concurrent non-forced [`Self::delete_channel`] either sees it or runs
    /// first and leaves a fresh channel behind.
    pub fn subscribe<F>(&self, id: &ConversationId, callback: F) -> Subscription
    where
        F: Fn(&ChannelEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        let entry = self.channels.entry(id.clone()).or_insert_with(|| {
            debug!(channel = %id, "channel created");
            Arc::new(Channel::new(id.clone()))
        });
        entry.value().subscribe(callback)
    }

    /// Whether `subscription` is attached to the live channel for `id`.
    pub fn is_current(&self, id: &ConversationId, subscription: &Subscription) -> bool {
        self.find_channel(id).is_some_and(|c| subscription.is_on(&c))
    }

    /// Whether a channel exists for `id`.
    pub fn has_channel(&self, id: &ConversationId) -> bool {
        self.channels.contains_key(id)
    }

    /// Publish on an existing channel. Returns 0 when there is none.
    pub fn publish(&self, id: &ConversationId, event: &ChannelEvent) -> usize {
        self.find_channel(id).map_or(0, |c| c.publish(event))
    }

    /// Remove the channel for `id`.
    ///
    /// Without `force`, a channel that still has subscribers is kept and a
    /// warning is logged. Returns whether the channel was removed.
    pub fn delete_channel(&self, id: &ConversationId, force: bool) -> bool {
        // subscriber count is checked under the shard lock
        let removed = self
            .channels
            .remove_if(id, |_, channel| force || channel.subscriber_count() == 0);
        if let Some((_, channel)) = removed {
            let dropped = channel.clear_subscribers();
            debug!(channel = %id, dropped, "channel deleted");
            return true;
        }
        if let Some(subscribers) = self.channels.get(id).map(|c| c.subscriber_count()) {
            warn!(channel = %id, subscribers, "refusing to delete channel with live subscribers");
        }
        false
    }

    /// Ids of all channels.
    pub fn channel_ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.channels.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether there are no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabrun_core::events::event_types;

    fn conv(id: &str) -> ConversationId {
        ConversationId::from(id)
    }

    type Seen = Arc<Mutex<Vec<String>>>;

    fn recorder() -> (Seen, impl Fn(&ChannelEvent) -> Result<(), String> + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |e: &ChannelEvent| {
            sink.lock().push(e.event_type.clone());
            Ok(())
        })
    }

    #[test]
    fn get_channel_is_idempotent() {
        let bus = ChannelBus::new();
        let a = bus.get_channel(&conv("x"));
        let b = bus.get_channel(&conv("x"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn publish_reaches_all_subscribers_in_order() {
        let bus = ChannelBus::new();
        let channel = bus.get_channel(&conv("x"));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let _s1 = channel.subscribe(move |_| {
            o1.lock().push(1);
            Ok(())
        });
        let _s2 = channel.subscribe(move |_| {
            o2.lock().push(2);
            Ok(())
        });
        let delivered = channel.publish(&ChannelEvent::new(event_types::PROGRESS, conv("x")));
        assert_eq!(delivered, 2);
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn failing_and_panicking_subscribers_are_isolated() {
        let bus = ChannelBus::new();
        let channel = bus.get_channel(&conv("x"));
        let _bad = channel.subscribe(|_| Err("socket closed".into()));
        let _worse = channel.subscribe(|_| panic!("boom"));
        let (seen, good) = recorder();
        let _good = channel.subscribe(good);

        let delivered = channel.publish(&ChannelEvent::new(event_types::PROGRESS, conv("x")));
        assert_eq!(delivered, 1);
        assert_eq!(*seen.lock(), vec![event_types::PROGRESS.to_owned()]);
    }

    #[test]
    fn no_cross_talk_between_channels() {
        let bus = ChannelBus::new();
        let (seen_x, cb_x) = recorder();
        let (seen_y, cb_y) = recorder();
        let _x = bus.get_channel(&conv("x")).subscribe(cb_x);
        let _y = bus.get_channel(&conv("y")).subscribe(cb_y);

        let _ = bus.publish(&conv("x"), &ChannelEvent::new("only.x", conv("x")));
        assert_eq!(seen_x.lock().len(), 1);
        assert!(seen_y.lock().is_empty());
    }

    #[test]
    fn late_subscribers_see_only_future_events() {
        let bus = ChannelBus::new();
        let channel = bus.get_channel(&conv("x"));
        let _ = channel.publish(&ChannelEvent::new("early", conv("x")));
        let (seen, cb) = recorder();
        let _sub = channel.subscribe(cb);
        let _ = channel.publish(&ChannelEvent::new("late", conv("x")));
        assert_eq!(*seen.lock(), vec!["late".to_owned()]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = ChannelBus::new();
        let channel = bus.get_channel(&conv("x"));
        let (seen, cb) = recorder();
        let sub = channel.subscribe(cb);
        assert_eq!(channel.subscriber_count(), 1);
        drop(sub);
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(channel.publish(&ChannelEvent::new("e", conv("x"))), 0);
        assert!(seen.lock().is_empty());

        let (_, cb) = recorder();
        let sub = channel.subscribe(cb);
        assert!(sub.unsubscribe());
    }

    #[test]
    fn delete_then_get_creates_fresh_channel() {
        let bus = ChannelBus::new();
        let old = bus.get_channel(&conv("x"));
        assert!(bus.delete_channel(&conv("x"), false));
        assert!(!bus.has_channel(&conv("x")));

        let fresh = bus.get_channel(&conv("x"));
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.subscriber_count(), 0);
    }

    #[test]
    fn non_forced_delete_keeps_subscribed_channel() {
        let bus = ChannelBus::new();
        let channel = bus.get_channel(&conv("x"));
        let (_, cb) = recorder();
        let sub = channel.subscribe(cb);

        assert!(!bus.delete_channel(&conv("x"), false));
        assert!(bus.has_channel(&conv("x")));

        assert!(bus.delete_channel(&conv("x"), true));
        assert!(!bus.has_channel(&conv("x")));
        assert_eq!(channel.subscriber_count(), 0);
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn subscriptions_on_deleted_channel_are_not_current() {
        let bus = ChannelBus::new();
        let (_, cb) = recorder();
        let sub = bus.subscribe(&conv("x"), cb);
        assert!(bus.is_current(&conv("x"), &sub));

        assert!(bus.delete_channel(&conv("x"), true));
        assert!(!bus.is_current(&conv("x"), &sub));
        let _ = bus.get_channel(&conv("x"));
        assert!(!bus.is_current(&conv("x"), &sub));
    }

    #[test]
    fn concurrent_subscribe_never_lands_on_deleted_channel() {
        let bus = Arc::new(ChannelBus::new());
        let deleter = {
            let bus = bus.clone();
            std::thread::spawn(move || {
                let mut deleted = 0;
                for _ in 0..2_000 {
                    if bus.delete_channel(&conv("x"), false) {
                        deleted += 1;
                    }
                }
                deleted
            })
        };
        let subs: Vec<Subscription> = (0..200)
            .map(|_| {
                let (_, cb) = recorder();
                bus.subscribe(&conv("x"), cb)
            })
            .collect();
        let _ = deleter.join().unwrap();

        let channel = bus.find_channel(&conv("x")).unwrap();
        assert_eq!(channel.subscriber_count(), subs.len());
        assert!(subs.iter().all(|s| bus.is_current(&conv("x"), s)));
    }

    #[test]
    fn reset_clears_last_event_only() {
        let bus = ChannelBus::new();
        let channel = bus.get_channel(&conv("x"));
        let (_, cb) = recorder();
        let _sub = channel.subscribe(cb);
        let _ = channel.publish(&ChannelEvent::new("e", conv("x")));
        assert!(channel.last_event().is_some());
        channel.reset();
        assert!(channel.last_event().is_none());
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[test]
    fn subscription_knows_its_channel() {
        let bus = ChannelBus::new();
        let x = bus.get_channel(&conv("x"));
        let y = bus.get_channel(&conv("y"));
        let (_, cb) = recorder();
        let sub = x.subscribe(cb);
        assert!(sub.is_on(&x));
        assert!(!sub.is_on(&y));
    }
}
