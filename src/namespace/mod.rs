pub mod events;
pub mod path;
pub mod tree;

pub use events::{NamespaceEvent, NamespaceObserver};
pub use tree::{DirEntry, EntryKind, NodeSnapshot, VirtualNamespace};
