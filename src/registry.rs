//! Live monitors by id.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use crate::monitor::Monitor;

/// Table of live monitors, keyed by id (usually the server id).
///
/// The registry is an ordinary value: create one per process component
/// that needs it and pass it around.
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: Mutex<HashMap<String, Arc<dyn Monitor>>>,
}

impl std::fmt::Debug for MonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl MonitorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Monitor>>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `monitor` under `id`, disconnecting the monitor it replaces.
    ///
    /// Registering the same monitor again is a no-op.
    pub fn start(&self, id: impl Into<String>, monitor: Arc<dyn Monitor>) {
        let id = id.into();
        let replaced = self.table().insert(id.clone(), monitor.clone());

        if let Some(old) = replaced.filter(|old| !Arc::ptr_eq(old, &monitor)) {
            #[cfg(feature = "tracing")]
            tracing::info!(monitor = %id, "replacing registered monitor");
            old.disconnect();
        }
    }

    /// Monitor registered under `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Monitor>> {
        self.table().get(id).cloned()
    }

    /// Remove and disconnect the monitor registered under `id`.
    pub fn stop(&self, id: &str) -> Option<Arc<dyn Monitor>> {
        let removed = self.table().remove(id);
        if let Some(monitor) = &removed {
            monitor.disconnect();
        }
        removed
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.table().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered monitors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Disconnect and remove every monitor.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.table().drain().collect();

        #[cfg(feature = "tracing")]
        tracing::info!(count = drained.len(), "shutting down monitors");

        for (_, monitor) in drained {
            monitor.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{MonitorState, StringCallback};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct Fake {
        id: String,
        closed: AtomicBool,
    }

    impl Fake {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                closed: AtomicBool::new(false),
            })
        }

        fn closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Monitor for Fake {
        fn id(&self) -> &str {
            &self.id
        }

        fn state(&self) -> MonitorState {
            if self.closed() {
                MonitorState::Disconnected
            } else {
                MonitorState::Connected
            }
        }

        fn disconnect(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn simple_command(&self, command: &str, callback: StringCallback) {
            callback(command.to_string());
        }

        fn human_monitor_command(&self, command: &str, callback: StringCallback) {
            callback(command.to_string());
        }

        fn query_status(&self, callback: StringCallback) {
            callback("running".to_string());
        }

        fn get_version(&self, callback: StringCallback) {
            callback("8.2.0".to_string());
        }
    }

    #[test]
    fn replacing_a_monitor_disconnects_the_old_one() {
        let registry = MonitorRegistry::new();
        let first = Fake::new("vm-1");
        let second = Fake::new("vm-1");

        registry.start("vm-1", first.clone());
        registry.start("vm-1", second.clone());

        assert!(first.closed());
        assert!(!second.closed());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("vm-1").is_some_and(|m| m.is_connected()));
    }

    #[test]
    fn registering_the_same_monitor_twice_keeps_it_connected() {
        let registry = MonitorRegistry::new();
        let monitor = Fake::new("vm-1");

        registry.start("vm-1", monitor.clone());
        registry.start("vm-1", monitor.clone());

        assert!(!monitor.closed());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stop_and_shutdown_disconnect() {
        let registry = MonitorRegistry::new();
        let a = Fake::new("a");
        let b = Fake::new("b");
        let c = Fake::new("c");
        registry.start("b", b.clone());
        registry.start("a", a.clone());
        registry.start("c", c.clone());
        assert_eq!(registry.ids(), ["a", "b", "c"]);

        assert!(registry.stop("b").is_some());
        assert!(b.closed());
        assert!(registry.stop("b").is_none());
        assert!(registry.get("b").is_none());

        registry.shutdown();
        assert!(a.closed() && c.closed());
        assert!(registry.is_empty());
    }
}
