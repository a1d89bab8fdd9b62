// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! First-class subscriptions with explicit unsubscribe handles, replacing
//! ad-hoc callback wiring in UI code.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

type Callback<T> = Box<dyn FnMut(&T)>;

struct Subscriptions<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// A list of subscribers to one kind of event. Single-threaded (browser).
pub struct Subscribers<T> {
    inner: Rc<RefCell<Subscriptions<T>>>,
}

/// Keeps the subscription alive; dropping it or calling
/// [`SubscriptionHandle::unsubscribe`] removes the callback.
pub struct SubscriptionHandle<T> {
    id: u64,
    list: Weak<RefCell<Subscriptions<T>>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Subscriptions {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, callback: impl FnMut(&T) + 'static) -> SubscriptionHandle<T> {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.callbacks.push((id, Box::new(callback)));
        SubscriptionHandle {
            id,
            list: Rc::downgrade(&self.inner),
        }
    }

    pub fn emit(&self, event: &T) {
        let mut inner = self.inner.borrow_mut();
        for (_, callback) in inner.callbacks.iter_mut() {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> SubscriptionHandle<T> {
    pub fn unsubscribe(self) {
        // Removal happens in drop.
    }
}

impl<T> Drop for SubscriptionHandle<T> {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.borrow_mut().callbacks.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::subscriber::Subscribers;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn emit_reaches_all_subscribers() {
        let subscribers = Subscribers::<u32>::new();
        let total = Rc::new(Cell::new(0));

        let t1 = total.clone();
        let _h1 = subscribers.subscribe(move |v| t1.set(t1.get() + v));
        let t2 = total.clone();
        let _h2 = subscribers.subscribe(move |v| t2.set(t2.get() + v * 10));

        subscribers.emit(&3);
        assert_eq!(total.get(), 33);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let subscribers = Subscribers::<u32>::new();
        let count = Rc::new(Cell::new(0u32));

        let c = count.clone();
        let handle = subscribers.subscribe(move |_| c.set(c.get() + 1));
        subscribers.emit(&1);
        handle.unsubscribe();
        subscribers.emit(&1);
        assert_eq!(count.get(), 1);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let subscribers = Subscribers::<u32>::new();
        {
            let _handle = subscribers.subscribe(|_| {});
            assert_eq!(subscribers.len(), 1);
        }
        assert!(subscribers.is_empty());
    }
}
