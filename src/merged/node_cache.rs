//! Memo of recent virtual-side path lookups.
//!
//! Keys are lowercased canonical paths (the namespace compares
//! case-insensitively). Namespace events invalidate entries; folder events
//! invalidate the whole subtree by prefix.

use std::sync::Arc;

use moka::sync::Cache;

use crate::namespace::{NamespaceEvent, NamespaceObserver, NodeSnapshot, VirtualNamespace};

const CAPACITY: u64 = 4096;

#[derive(Clone)]
pub enum CachedLookup {
    Missing,
    Hit(NodeSnapshot),
}

pub struct NodeCache {
    entries: Cache<String, CachedLookup>,
}

impl NodeCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Cache::builder()
                .max_capacity(CAPACITY)
                .support_invalidation_closures()
                .build(),
        })
    }

    fn cache_key(canonical: &str) -> String {
        canonical.to_ascii_lowercase()
    }

    /// Resolve `canonical` against the namespace, memoising the answer
    /// (including the negative one).
    pub fn lookup(&self, namespace: &VirtualNamespace, canonical: &str) -> Option<NodeSnapshot> {
        let key = Self::cache_key(canonical);
        let cached = self.entries.get_with(key, || match namespace.find(canonical) {
            Some(snapshot) => CachedLookup::Hit(snapshot),
            None => CachedLookup::Missing,
        });
        match cached {
            CachedLookup::Missing => None,
            CachedLookup::Hit(snapshot) => Some(snapshot),
        }
    }

    fn invalidate_exact(&self, canonical: &str) {
        self.entries.invalidate(&Self::cache_key(canonical));
    }

    fn invalidate_subtree(&self, canonical: &str) {
        let prefix = Self::cache_key(canonical);
        let with_sep = format!("{prefix}/");
        let _ = self
            .entries
            .invalidate_entries_if(move |key, _| key == &prefix || key.starts_with(&with_sep));
        // Predicate invalidation is applied by the housekeeper; flush it so
        // the very next lookup already misses.
        self.entries.run_pending_tasks();
    }
}

impl NamespaceObserver for NodeCache {
    fn on_event(&self, event: &NamespaceEvent) {
        match event {
            NamespaceEvent::FileAdded(p)
            | NamespaceEvent::FileDeleted(p)
            | NamespaceEvent::FolderAdded(p) => self.invalidate_exact(p),
            NamespaceEvent::FileMoved { from, to } => {
                self.invalidate_exact(from);
                self.invalidate_exact(to);
            }
            NamespaceEvent::FolderDeleted(p) => self.invalidate_subtree(p),
            NamespaceEvent::FolderMoved { from, to } => {
                self.invalidate_subtree(from);
                self.invalidate_subtree(to);
            }
        }
    }
}
