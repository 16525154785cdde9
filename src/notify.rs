//! Observer-list notification channels.
//!
//! A replaying channel caches the last published value and hands it to late
//! subscribers; a plain channel only reaches observers registered at publish time.
//! Channels are single-threaded. A handler must not publish to the channel it is
//! subscribed to: observers are detached while a value is being delivered.

use log::trace;
use std::cell::{Cell, RefCell};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<T> = Box<dyn FnMut(&T)>;

pub struct Channel<T> {
    name: &'static str,
    replay: bool,
    last: RefCell<Option<T>>,
    observers: RefCell<Vec<(SubscriptionId, Handler<T>)>>,
    next_id: Cell<u64>,
}

impl<T> Channel<T> {
    pub fn new(name: &'static str) -> Self {
        Self::build(name, false, None)
    }

    pub fn replaying(name: &'static str) -> Self {
        Self::build(name, true, None)
    }

    /// Replaying channel that starts out with `value` cached.
    pub fn with_initial(name: &'static str, value: T) -> Self {
        Self::build(name, true, Some(value))
    }

    fn build(name: &'static str, replay: bool, last: Option<T>) -> Self {
        Self {
            name,
            replay,
            last: RefCell::new(last),
            observers: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    pub fn subscribe(&self, handler: impl FnMut(&T) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let mut handler: Handler<T> = Box::new(handler);
        if self.replay
            && let Some(value) = self.last.borrow().as_ref()
        {
            handler(value);
        }
        self.observers.borrow_mut().push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.borrow_mut();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.borrow().len()
    }

    pub(crate) fn publish(&self, value: T) {
        let mut delivering = std::mem::take(&mut *self.observers.borrow_mut());
        trace!("channel {}: delivering to {} observer(s)", self.name, delivering.len());
        for (_, handler) in delivering.iter_mut() {
            handler(&value);
        }

        // keep observers that subscribed while we were delivering
        let mut observers = self.observers.borrow_mut();
        delivering.append(&mut observers);
        *observers = delivering;
        drop(observers);

        if self.replay {
            *self.last.borrow_mut() = Some(value);
        }
    }
}

impl<T: Clone> Channel<T> {
    /// The cached value of a replaying channel.
    pub fn latest(&self) -> Option<T> {
        self.last.borrow().clone()
    }
}
