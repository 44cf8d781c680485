//! Crash and group-join notifications.
//!
//! Each `on_*` registration returns a `ListenerHandle`; removing it only
//! detaches that one listener. Listeners run inline on the runtime task, so
//! they should hand heavy work off elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;

use crate::error::ConsumerError;

#[derive(Debug, Clone)]
pub struct CrashEvent {
    pub error: Arc<ConsumerError>,
    pub group_id: String,
    /// Whether the runtime is about to rejoin and run again
    pub restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupJoinEvent {
    /// Time spent joining and syncing the group
    pub duration: Duration,
    pub group_id: String,
    pub group_protocol: String,
    pub is_leader: bool,
    pub leader_id: String,
    pub member_assignment: HashMap<String, Vec<i32>>,
    pub member_id: String,
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registry for one event type
pub struct Listeners<E> {
    next_id: AtomicU64,
    callbacks: DashMap<u64, Callback<E>>,
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: DashMap::new(),
        }
    }

    pub fn add<F>(self: &Arc<Self>, callback: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.insert(id, Arc::new(callback));

        let registry: Weak<Self> = Arc::downgrade(self);
        ListenerHandle {
            remove: Box::new(move || {
                registry
                    .upgrade()
                    .is_some_and(|r| r.callbacks.remove(&id).is_some())
            }),
        }
    }

    pub fn emit(&self, event: &E) {
        // snapshot first so a listener may remove itself (or others) while running
        let callbacks: Vec<Callback<E>> = self.callbacks.iter().map(|c| c.value().clone()).collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability to detach a single listener
pub struct ListenerHandle {
    remove: Box<dyn Fn() -> bool + Send + Sync>,
}

impl ListenerHandle {
    /// Detach the listener. Returns false if it was already gone.
    pub fn remove(self) -> bool {
        (self.remove)()
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ConsumerEvents {
    crash: Arc<Listeners<CrashEvent>>,
    group_join: Arc<Listeners<GroupJoinEvent>>,
}

impl ConsumerEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_crash<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&CrashEvent) + Send + Sync + 'static,
    {
        self.crash.add(callback)
    }

    pub fn on_group_join<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&GroupJoinEvent) + Send + Sync + 'static,
    {
        self.group_join.add(callback)
    }

    pub fn emit_crash(&self, event: &CrashEvent) {
        self.crash.emit(event);
    }

    pub fn emit_group_join(&self, event: &GroupJoinEvent) {
        self.group_join.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn crash_event() -> CrashEvent {
        CrashEvent {
            error: Arc::new(ConsumerError::SessionExpired),
            group_id: "test-group".to_string(),
            restart: false,
        }
    }

    #[test]
    fn test_all_listeners_receive_event() {
        let events = ConsumerEvents::new();
        let count = Arc::new(AtomicUsize::new(0));

        let first = count.clone();
        let _h1 = events.on_crash(move |_| {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = count.clone();
        let _h2 = events.on_crash(move |e| {
            assert_eq!(e.group_id, "test-group");
            second.fetch_add(10, Ordering::SeqCst);
        });

        events.emit_crash(&crash_event());

        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_remove_detaches_only_that_listener() {
        let events = ConsumerEvents::new();
        let count = Arc::new(AtomicUsize::new(0));

        let first = count.clone();
        let h1 = events.on_crash(move |_| {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = count.clone();
        let _h2 = events.on_crash(move |_| {
            second.fetch_add(10, Ordering::SeqCst);
        });

        assert!(h1.remove());
        events.emit_crash(&crash_event());

        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_crash_and_join_listeners_are_independent() {
        let events = ConsumerEvents::new();
        let joins = Arc::new(AtomicUsize::new(0));

        let counter = joins.clone();
        let _join = events.on_group_join(move |e| {
            assert!(e.is_leader);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        events.emit_crash(&crash_event());
        assert_eq!(joins.load(Ordering::SeqCst), 0);

        events.emit_group_join(&GroupJoinEvent {
            duration: Duration::from_millis(12),
            group_id: "test-group".to_string(),
            group_protocol: "RoundRobinAssigner".to_string(),
            is_leader: true,
            leader_id: "member-1".to_string(),
            member_assignment: HashMap::new(),
            member_id: "member-1".to_string(),
        });
        assert_eq!(joins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_after_registry_dropped() {
        let listeners: Arc<Listeners<CrashEvent>> = Arc::new(Listeners::new());
        let handle = listeners.add(|_| {});
        assert_eq!(listeners.len(), 1);
        drop(listeners);

        assert!(!handle.remove());
    }
}
