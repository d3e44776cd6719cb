//! Namespace change events.
//!
//! Events are delivered synchronously on the mutating thread, in mutation
//! order, while the namespace lock is held. Observers must not call back
//! into the namespace.

use std::sync::{Arc, Mutex};

/// All paths are canonical.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceEvent {
    FileAdded(String),
    FileDeleted(String),
    FileMoved { from: String, to: String },
    FolderAdded(String),
    FolderDeleted(String),
    FolderMoved { from: String, to: String },
}

pub trait NamespaceObserver: Send + Sync {
    fn on_event(&self, event: &NamespaceEvent);
}

#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<Vec<Arc<dyn NamespaceObserver>>>,
}

impl ObserverRegistry {
    pub fn subscribe(&self, observer: Arc<dyn NamespaceObserver>) {
        self.observers
            .lock()
            .expect("observer registry poisoned")
            .push(observer);
    }

    pub fn emit(&self, event: &NamespaceEvent) {
        let observers = self.observers.lock().expect("observer registry poisoned");
        for obs in observers.iter() {
            obs.on_event(event);
        }
    }

    pub fn emit_all(&self, events: &[NamespaceEvent]) {
        for event in events {
            self.emit(event);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Records every event it sees; handy across namespace tests.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub seen: Mutex<Vec<NamespaceEvent>>,
    }

    impl NamespaceObserver for RecordingObserver {
        fn on_event(&self, event: &NamespaceEvent) {
            self.seen.lock().unwrap().push(event.clone());
        }
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<NamespaceEvent> {
            self.seen.lock().unwrap().clone()
        }
    }
}
