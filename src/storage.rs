//! In-memory event storage, historical queries, and live subscriptions.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use crate::{
    event::Event,
    filter::{matches_any, Filter},
};

/// Delivery callback for a live subscription.
pub type Deliver = Box<dyn Fn(&Event) + Send>;

/// Sort key for the timeline: newest first, then greater id first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TimelineKey(Reverse<u64>, Reverse<String>);

impl TimelineKey {
    fn of(ev: &Event) -> Self {
        Self(Reverse(ev.created_at), Reverse(ev.id.clone()))
    }
}

struct Subscription {
    filters: Vec<Filter>,
    deliver: Deliver,
}

/// Events indexed by id and by recency, plus the standing subscriptions
/// notified on every insert.
#[derive(Default)]
pub struct Store {
    events: HashMap<String, Event>,
    timeline: BTreeSet<TimelineKey>,
    subscriptions: BTreeMap<u64, Subscription>,
    next_subscription: u64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, id: &str) -> bool {
        self.events.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Event> {
        self.events.get(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Insert `ev` unless an event with the same id is already stored, then
    /// deliver it to every matching subscription in registration order.
    pub fn add(&mut self, ev: Event) -> bool {
        if self.has(&ev.id) {
            return false;
        }
        self.timeline.insert(TimelineKey::of(&ev));
        for sub in self.subscriptions.values() {
            if matches_any(&sub.filters, &ev) {
                (sub.deliver)(&ev);
            }
        }
        self.events.insert(ev.id.clone(), ev);
        true
    }

    pub fn delete(&mut self, id: &str) -> bool {
        match self.events.remove(id) {
            Some(ev) => {
                self.timeline.remove(&TimelineKey::of(&ev));
                true
            }
            None => false,
        }
    }

    /// Union of the matches of every filter, newest first. Each filter
    /// contributes at most its `limit` most recent matches; an empty filter
    /// list matches every stored event.
    pub fn query(&self, filters: &[Filter]) -> Vec<Event> {
        let selected: BTreeSet<&TimelineKey> = if filters.is_empty() {
            self.timeline.iter().collect()
        } else {
            filters
                .iter()
                .flat_map(|filter| {
                    self.timeline
                        .iter()
                        .filter(move |key| filter.matches(&self.events[&key.1 .0]))
                        .take(filter.limit.unwrap_or(usize::MAX))
                })
                .collect()
        };
        selected
            .into_iter()
            .filter_map(|key| self.events.get(&key.1 .0).cloned())
            .collect()
    }

    /// Register a live subscription and return its internal id.
    pub fn subscribe(&mut self, filters: Vec<Filter>, deliver: Deliver) -> u64 {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.subscriptions.insert(id, Subscription { filters, deliver });
        id
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("events", &self.events.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}
