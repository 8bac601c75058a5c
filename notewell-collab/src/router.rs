//! Destination-based message routing.
//!
//! The router owns the destination → callback map for one connection.
//! Inbound `Message` frames are dispatched by destination; bodies are decoded
//! into the subscriber's payload type before the callback runs, and a decode
//! failure is logged and dropped rather than propagated.
//!
//! Subscriptions are identified by opaque [`SubscriptionHandle`] tokens, so
//! unsubscribing never relies on callback identity. One live subscription
//! exists per destination: re-subscribing a destination cleanly replaces the
//! previous entry instead of leaking its handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::connection::ConnectionStatus;
use crate::protocol;

/// Opaque token returned by [`SubscriptionRouter::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

struct Route {
    destination: String,
    handler: Arc<dyn Fn(&[u8]) + Send + Sync>,
}

#[derive(Default)]
struct RouteTable {
    routes: HashMap<u64, Route>,
    by_destination: HashMap<String, u64>,
}

/// Maps destinations to decoded-message callbacks for one connection.
pub struct SubscriptionRouter {
    table: Mutex<RouteTable>,
    next_id: AtomicU64,
    status: watch::Receiver<ConnectionStatus>,
}

impl SubscriptionRouter {
    pub fn new(status: watch::Receiver<ConnectionStatus>) -> Self {
        Self {
            table: Mutex::new(RouteTable::default()),
            next_id: AtomicU64::new(1),
            status,
        }
    }

    /// Register a callback for a destination.
    ///
    /// Returns `None` (with a warning) while disconnected. An existing
    /// subscription for the same destination is replaced.
    pub fn subscribe<T, F>(&self, destination: &str, callback: F) -> Option<SubscriptionHandle>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        if *self.status.borrow() != ConnectionStatus::Connected {
            log::warn!("subscribe to {destination} while disconnected; ignored");
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let destination = destination.to_string();
        let log_destination = destination.clone();
        let handler: Arc<dyn Fn(&[u8]) + Send + Sync> =
            Arc::new(move |bytes| match protocol::decode::<T>(bytes) {
                Ok(value) => callback(value),
                Err(e) => log::warn!("dropping undecodable message on {log_destination}: {e}"),
            });

        let mut table = self.table.lock().unwrap();
        if let Some(old_id) = table.by_destination.insert(destination.clone(), id) {
            table.routes.remove(&old_id);
            log::debug!("replaced existing subscription for {destination}");
        }
        table.routes.insert(id, Route { destination, handler });
        Some(SubscriptionHandle(id))
    }

    /// Remove one routing entry. A second call with the same handle is a
    /// no-op.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut table = self.table.lock().unwrap();
        if let Some(route) = table.routes.remove(&handle.0) {
            if table.by_destination.get(&route.destination) == Some(&handle.0) {
                table.by_destination.remove(&route.destination);
            }
        }
    }

    /// Deliver a message body to the destination's subscriber, if any.
    ///
    /// The callback runs outside the routing lock, so it may call back into
    /// the router. Returns whether a subscriber was found.
    pub fn dispatch(&self, destination: &str, body: &[u8]) -> bool {
        let handler = {
            let table = self.table.lock().unwrap();
            table
                .by_destination
                .get(destination)
                .and_then(|id| table.routes.get(id))
                .map(|route| route.handler.clone())
        };
        match handler {
            Some(handler) => {
                handler(body);
                true
            }
            None => {
                log::trace!("no subscriber for {destination}");
                false
            }
        }
    }

    /// Drop every routing entry.
    pub fn clear(&self) {
        let mut table = self.table.lock().unwrap();
        table.routes.clear();
        table.by_destination.clear();
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn connected_router() -> (watch::Sender<ConnectionStatus>, SubscriptionRouter) {
        let (tx, rx) = watch::channel(ConnectionStatus::Connected);
        (tx, SubscriptionRouter::new(rx))
    }

    #[test]
    fn test_subscribe_and_dispatch() {
        let (_tx, router) = connected_router();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        router
            .subscribe::<String, _>("/topic/a", move |msg| {
                sink.lock().unwrap().push(msg);
            })
            .unwrap();

        let body = protocol::encode(&"hello".to_string()).unwrap();
        assert!(router.dispatch("/topic/a", &body));
        assert_eq!(seen.lock().unwrap().as_slice(), ["hello".to_string()]);
    }

    #[test]
    fn test_dispatch_preserves_per_destination_order() {
        let (_tx, router) = connected_router();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        router
            .subscribe::<u64, _>("/topic/a", move |n| {
                sink.lock().unwrap().push(n);
            })
            .unwrap();

        for n in 0u64..5 {
            let body = protocol::encode(&n).unwrap();
            router.dispatch("/topic/a", &body);
        }
        assert_eq!(seen.lock().unwrap().as_slice(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_subscribe_while_disconnected_refused() {
        let (tx, rx) = watch::channel(ConnectionStatus::Disconnected);
        let router = SubscriptionRouter::new(rx);
        assert!(router.subscribe::<u64, _>("/topic/a", |_| {}).is_none());
        assert!(router.is_empty());
        drop(tx);
    }

    #[test]
    fn test_resubscribe_replaces_old_handler() {
        let (_tx, router) = connected_router();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let counter = first.clone();
        let old = router
            .subscribe::<u64, _>("/topic/a", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let counter = second.clone();
        router
            .subscribe::<u64, _>("/topic/a", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(router.len(), 1);
        let body = protocol::encode(&7u64).unwrap();
        router.dispatch("/topic/a", &body);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        // Unsubscribing the stale handle must not remove the replacement.
        router.unsubscribe(old);
        assert_eq!(router.len(), 1);
        assert!(router.dispatch("/topic/a", &body));
    }

    #[test]
    fn test_unsubscribe_twice_is_noop() {
        let (_tx, router) = connected_router();
        let handle = router.subscribe::<u64, _>("/topic/a", |_| {}).unwrap();
        router.unsubscribe(handle.clone());
        router.unsubscribe(handle);
        assert!(router.is_empty());
        assert!(!router.dispatch("/topic/a", &protocol::encode(&1u64).unwrap()));
    }

    #[test]
    fn test_decode_failure_dropped() {
        let (_tx, router) = connected_router();
        let seen = Arc::new(AtomicU32::new(0));

        let counter = seen.clone();
        router
            .subscribe::<crate::protocol::EditRequest, _>("/topic/a", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Garbage body: handler must not run, dispatch must not panic.
        assert!(router.dispatch("/topic/a", &[0xFF, 0xFE]));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_removes_everything() {
        let (_tx, router) = connected_router();
        router.subscribe::<u64, _>("/topic/a", |_| {}).unwrap();
        router.subscribe::<u64, _>("/topic/b", |_| {}).unwrap();
        assert_eq!(router.len(), 2);
        router.clear();
        assert!(router.is_empty());
    }
}
