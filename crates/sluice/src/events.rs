// ai
//! 📣 A tiny event hub. Listeners are called outside every lock, in registration order.
//!
//! 🧠 Knowledge graph:
//! - Emission takes the listener list out, calls it, then splices it back in front of
//!   anything registered *during* the emission. Reentrant `on(...)` calls are therefore
//!   safe, and a listener registered mid-emission does not see the event being emitted.
//! - An event emitted while another emission is running (a `finish` listener that destroys,
//!   which closes) is queued and delivered by the emission already in progress, right after
//!   the current event. Nobody ever misses one because the list was out on loan.
//! - `clear()` runs after `close`: nothing fires after close, and dropping the closures
//!   breaks any handle cycles they captured. A clear requested mid-emission waits its turn
//!   in the same queue.

use std::collections::VecDeque;
use std::sync::Mutex;

type Listener<E> = (fn(&E) -> bool, Box<dyn FnMut(&E) + Send>);

enum Queued<E> {
    Event(E),
    Clear,
}

struct HubInner<E> {
    listeners: Vec<Listener<E>>,
    emitting: bool,
    queued: VecDeque<Queued<E>>,
}

pub(crate) struct EventHub<E> {
    inner: Mutex<HubInner<E>>,
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                listeners: Vec::new(),
                emitting: false,
                queued: VecDeque::new(),
            }),
        }
    }
}

impl<E: Clone> EventHub<E> {
    pub(crate) fn on(&self, wants: fn(&E) -> bool, listener: impl FnMut(&E) + Send + 'static) {
        lock(&self.inner).listeners.push((wants, Box::new(listener)));
    }

    pub(crate) fn emit(&self, event: &E) {
        self.run(Queued::Event(event.clone()));
    }

    pub(crate) fn clear(&self) {
        self.run(Queued::Clear);
    }

    fn run(&self, first: Queued<E>) {
        {
            let mut inner = lock(&self.inner);
            if inner.emitting {
                // -- 📬 someone up the stack is mid-delivery; they will get to it
                inner.queued.push_back(first);
                return;
            }
            inner.emitting = true;
        }

        let mut next = Some(first);
        while let Some(item) = next {
            match item {
                Queued::Event(event) => {
                    let mut current = std::mem::take(&mut lock(&self.inner).listeners);
                    for (wants, listener) in current.iter_mut() {
                        if wants(&event) {
                            listener(&event);
                        }
                    }
                    let mut inner = lock(&self.inner);
                    let added_meanwhile = std::mem::take(&mut inner.listeners);
                    current.extend(added_meanwhile);
                    inner.listeners = current;
                }
                Queued::Clear => {
                    let dropped = std::mem::take(&mut lock(&self.inner).listeners);
                    // -- 🧹 drop outside the lock; a listener's Drop may touch another hub
                    drop(dropped);
                }
            }
            let mut inner = lock(&self.inner);
            next = inner.queued.pop_front();
            if next.is_none() {
                inner.emitting = false;
            }
        }
    }
}

/// 🔒 Poison-tolerant lock. A panicking user callback must not brick the endpoint.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Debug, Clone)]
    enum Ping {
        A,
        B,
    }

    #[test]
    fn the_one_where_listeners_only_hear_what_they_asked_for() {
        let hub = EventHub::<Ping>::default();
        let heard_a = Arc::new(AtomicUsize::new(0));
        let counter = heard_a.clone();
        hub.on(
            |e| matches!(e, Ping::A),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        hub.emit(&Ping::A);
        hub.emit(&Ping::B);
        hub.emit(&Ping::A);
        assert_eq!(heard_a.load(Ordering::SeqCst), 2);

        hub.clear();
        hub.emit(&Ping::A);
        assert_eq!(heard_a.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn the_one_where_an_event_from_inside_a_listener_still_arrives() {
        let hub = Arc::new(EventHub::<Ping>::default());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let inner_hub = Arc::downgrade(&hub);
        let seen = log.clone();
        hub.on(
            |e| matches!(e, Ping::A),
            move |_| {
                seen.lock().expect("💀 log poisoned").push("a");
                if let Some(hub) = inner_hub.upgrade() {
                    hub.emit(&Ping::B);
                    hub.clear();
                }
                seen.lock().expect("💀 log poisoned").push("a done");
            },
        );
        let seen = log.clone();
        hub.on(
            |e| matches!(e, Ping::B),
            move |_| seen.lock().expect("💀 log poisoned").push("b"),
        );

        hub.emit(&Ping::A);
        hub.emit(&Ping::B);
        // -- B lands after A finished, then the queued clear silences everything
        assert_eq!(*log.lock().expect("💀 log poisoned"), vec!["a", "a done", "b"]);
    }
}
