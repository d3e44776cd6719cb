//! In-memory tree of remote folders and files.
//!
//! Nodes live in an arena indexed by integers; parents are indices, so the
//! tree has no owning cycles. The whole structure sits behind one mutex;
//! namespace traffic is tiny next to byte traffic. Mutations emit events in
//! order, on the mutating thread, with the lock held.

use std::sync::{Arc, Mutex};

use crate::error::{FsError, FsResult};
use crate::types::SharedFile;

use super::events::{NamespaceEvent, NamespaceObserver, ObserverRegistry};
use super::path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Folder,
    File,
}

/// One row of a directory listing.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Resolution result for a canonical path.
#[derive(Clone)]
pub enum NodeSnapshot {
    Folder { path: String },
    File { path: String, file: SharedFile },
}

enum NodeKind {
    Folder { folders: Vec<usize>, files: Vec<usize> },
    File(SharedFile),
}

struct Node {
    name: String,
    parent: Option<usize>,
    kind: NodeKind,
}

struct Tree {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    root: usize,
}

impl Tree {
    fn new() -> Self {
        let root = Node {
            name: String::new(),
            parent: None,
            kind: NodeKind::Folder {
                folders: Vec::new(),
                files: Vec::new(),
            },
        };
        Self {
            nodes: vec![Some(root)],
            free: Vec::new(),
            root: 0,
        }
    }

    fn node(&self, id: usize) -> &Node {
        self.nodes[id].as_ref().expect("dangling node id")
    }

    fn node_mut(&mut self, id: usize) -> &mut Node {
        self.nodes[id].as_mut().expect("dangling node id")
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, id: usize) {
        self.nodes[id] = None;
        self.free.push(id);
    }

    /// Case-insensitive child lookup across both folder and file lists.
    fn child(&self, folder_id: usize, name: &str) -> Option<usize> {
        let NodeKind::Folder { folders, files } = &self.node(folder_id).kind else {
            return None;
        };
        folders
            .iter()
            .chain(files.iter())
            .copied()
            .find(|&id| path::names_equal(&self.node(id).name, name))
    }

    fn lookup(&self, canonical: &str) -> Option<usize> {
        let mut cur = self.root;
        for segment in path::segments(canonical) {
            cur = self.child(cur, segment)?;
        }
        Some(cur)
    }

    fn full_path(&self, id: usize) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(node_id) = cur {
            let node = self.node(node_id);
            if node.parent.is_some() {
                parts.push(node.name.clone());
            }
            cur = node.parent;
        }
        parts.reverse();
        let mut out = String::from("/");
        out.push_str(&parts.join("/"));
        out
    }

    fn attach(&mut self, folder_id: usize, child_id: usize) {
        let is_folder = matches!(self.node(child_id).kind, NodeKind::Folder { .. });
        let NodeKind::Folder { folders, files } = &mut self.node_mut(folder_id).kind else {
            panic!("attach target is not a folder");
        };
        if is_folder {
            folders.push(child_id);
        } else {
            files.push(child_id);
        }
        self.node_mut(child_id).parent = Some(folder_id);
    }

    fn detach(&mut self, child_id: usize) {
        let Some(parent) = self.node(child_id).parent else {
            return;
        };
        let NodeKind::Folder { folders, files } = &mut self.node_mut(parent).kind else {
            return;
        };
        folders.retain(|&id| id != child_id);
        files.retain(|&id| id != child_id);
        self.node_mut(child_id).parent = None;
    }

    /// Walk/create folders down `canonical`, recording a FolderAdded event
    /// for every folder that comes into existence.
    fn ensure_folders(&mut self, canonical: &str, events: &mut Vec<NamespaceEvent>) -> FsResult<usize> {
        let mut cur = self.root;
        let mut cur_path = String::new();
        for segment in path::segments(canonical) {
            let name = path::sanitize_name(segment);
            cur_path.push('/');
            cur_path.push_str(&name);
            match self.child(cur, &name) {
                Some(id) => match self.node(id).kind {
                    NodeKind::Folder { .. } => cur = id,
                    NodeKind::File(_) => return Err(FsError::NotADirectory(cur_path)),
                },
                None => {
                    let id = self.alloc(Node {
                        name: name.clone(),
                        parent: None,
                        kind: NodeKind::Folder {
                            folders: Vec::new(),
                            files: Vec::new(),
                        },
                    });
                    self.attach(cur, id);
                    events.push(NamespaceEvent::FolderAdded(self.full_path(id)));
                    cur = id;
                }
            }
        }
        Ok(cur)
    }

    /// Pick `name` or the first free ` (n)` variant within `folder_id`.
    fn free_name(&self, folder_id: usize, name: &str) -> String {
        let mut n = 0;
        loop {
            let candidate = path::collision_variant(name, n);
            if self.child(folder_id, &candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    /// Rewrite `local_path` on every file in the subtree. The only place
    /// paths are recomputed after a move.
    fn recompute_paths(&self, id: usize) {
        match &self.node(id).kind {
            NodeKind::File(file) => {
                let full = self.full_path(id);
                file.lock().expect("file lock poisoned").local_path = full;
            }
            NodeKind::Folder { folders, files } => {
                for &child in folders.iter().chain(files.iter()) {
                    self.recompute_paths(child);
                }
            }
        }
    }

    /// Collect every file in the subtree as (path, handle).
    fn collect_files(&self, id: usize, out: &mut Vec<(String, SharedFile)>) {
        match &self.node(id).kind {
            NodeKind::File(file) => out.push((self.full_path(id), file.clone())),
            NodeKind::Folder { folders, files } => {
                for &child in folders.iter().chain(files.iter()) {
                    self.collect_files(child, out);
                }
            }
        }
    }

    fn release_subtree(&mut self, id: usize) {
        if let NodeKind::Folder { folders, files } = &self.node(id).kind {
            let children: Vec<usize> = folders.iter().chain(files.iter()).copied().collect();
            for child in children {
                self.release_subtree(child);
            }
        }
        self.release(id);
    }
}

pub struct VirtualNamespace {
    inner: Mutex<Tree>,
    observers: ObserverRegistry,
}

impl Default for VirtualNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualNamespace {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tree::new()),
            observers: ObserverRegistry::default(),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn NamespaceObserver>) {
        self.observers.subscribe(observer);
    }

    fn tree(&self) -> std::sync::MutexGuard<'_, Tree> {
        self.inner.lock().expect("namespace lock poisoned")
    }

    pub fn find(&self, raw_path: &str) -> Option<NodeSnapshot> {
        let canonical = path::canonicalize(raw_path);
        let tree = self.tree();
        let id = tree.lookup(&canonical)?;
        let full = tree.full_path(id);
        Some(match &tree.node(id).kind {
            NodeKind::Folder { .. } => NodeSnapshot::Folder { path: full },
            NodeKind::File(file) => NodeSnapshot::File {
                path: full,
                file: file.clone(),
            },
        })
    }

    pub fn file_exists(&self, raw_path: &str) -> bool {
        matches!(self.find(raw_path), Some(NodeSnapshot::File { .. }))
    }

    pub fn folder_exists(&self, raw_path: &str) -> bool {
        matches!(self.find(raw_path), Some(NodeSnapshot::Folder { .. }))
    }

    /// List a folder; `None` when the path is absent or a file.
    pub fn list(&self, raw_path: &str) -> Option<Vec<DirEntry>> {
        let canonical = path::canonicalize(raw_path);
        let tree = self.tree();
        let id = tree.lookup(&canonical)?;
        let NodeKind::Folder { folders, files } = &tree.node(id).kind else {
            return None;
        };
        let mut out = Vec::with_capacity(folders.len() + files.len());
        for &fid in folders {
            out.push(DirEntry {
                name: tree.node(fid).name.clone(),
                kind: EntryKind::Folder,
                size: 0,
            });
        }
        for &fid in files {
            let NodeKind::File(file) = &tree.node(fid).kind else {
                continue;
            };
            out.push(DirEntry {
                name: tree.node(fid).name.clone(),
                kind: EntryKind::File,
                size: file.lock().expect("file lock poisoned").size,
            });
        }
        Some(out)
    }

    /// Insert a file at `raw_path`, creating intermediate folders, sanitising
    /// the leaf and resolving collisions with ` (n)` suffixes. Returns the
    /// actual canonical path; `file.local_path` is updated to it.
    pub fn add_file(&self, raw_path: &str, file: SharedFile) -> FsResult<String> {
        let canonical = path::canonicalize(raw_path);
        let Some((parent, leaf)) = path::split_parent(&canonical) else {
            return Err(FsError::IsADirectory("/".into()));
        };
        let mut events = Vec::new();
        let mut tree = self.tree();
        let folder_id = tree.ensure_folders(parent, &mut events)?;
        let name = tree.free_name(folder_id, &path::sanitize_name(leaf));
        let id = tree.alloc(Node {
            name: name.clone(),
            parent: None,
            kind: NodeKind::File(file.clone()),
        });
        tree.attach(folder_id, id);
        let full = tree.full_path(id);
        {
            let mut f = file.lock().expect("file lock poisoned");
            f.local_path = full.clone();
            f.deleted_locally = false;
        }
        events.push(NamespaceEvent::FileAdded(full.clone()));
        self.observers.emit_all(&events);
        Ok(full)
    }

    /// Remove a file node and flag the file as locally deleted.
    pub fn delete_file(&self, raw_path: &str) -> FsResult<()> {
        let canonical = path::canonicalize(raw_path);
        let mut tree = self.tree();
        let id = tree
            .lookup(&canonical)
            .ok_or_else(|| FsError::NotFound(canonical.clone()))?;
        let NodeKind::File(file) = &tree.node(id).kind else {
            return Err(FsError::IsADirectory(canonical));
        };
        let full = tree.full_path(id);
        file.lock().expect("file lock poisoned").deleted_locally = true;
        tree.detach(id);
        tree.release(id);
        self.observers.emit(&NamespaceEvent::FileDeleted(full));
        Ok(())
    }

    /// Remove a folder subtree; every descendant file is flagged as locally
    /// deleted and a FileDeleted event emitted for it.
    pub fn delete_folder(&self, raw_path: &str) -> FsResult<()> {
        let canonical = path::canonicalize(raw_path);
        if path::is_root(&canonical) {
            return Err(FsError::ReadOnly("/".into()));
        }
        let mut tree = self.tree();
        let id = tree
            .lookup(&canonical)
            .ok_or_else(|| FsError::NotFound(canonical.clone()))?;
        if !matches!(tree.node(id).kind, NodeKind::Folder { .. }) {
            return Err(FsError::NotADirectory(canonical));
        }
        let full = tree.full_path(id);
        let mut doomed = Vec::new();
        tree.collect_files(id, &mut doomed);
        let mut events = Vec::with_capacity(doomed.len() + 1);
        for (file_path, file) in doomed {
            file.lock().expect("file lock poisoned").deleted_locally = true;
            events.push(NamespaceEvent::FileDeleted(file_path));
        }
        tree.detach(id);
        tree.release_subtree(id);
        events.push(NamespaceEvent::FolderDeleted(full));
        self.observers.emit_all(&events);
        Ok(())
    }

    /// Rename/reparent a file. The destination must not exist; missing
    /// destination folders are created. Returns the actual new path.
    pub fn move_file(&self, raw_src: &str, raw_dst: &str) -> FsResult<String> {
        let src = path::canonicalize(raw_src);
        let dst = path::canonicalize(raw_dst);
        let Some((dst_parent, dst_leaf)) = path::split_parent(&dst) else {
            return Err(FsError::IsADirectory("/".into()));
        };
        let mut events = Vec::new();
        let mut tree = self.tree();
        let id = tree
            .lookup(&src)
            .ok_or_else(|| FsError::NotFound(src.clone()))?;
        let NodeKind::File(file) = &tree.node(id).kind else {
            return Err(FsError::IsADirectory(src));
        };
        let file = file.clone();
        if tree.lookup(&dst).is_some() && !path::paths_equal(&src, &dst) {
            return Err(FsError::Collision(dst));
        }
        let folder_id = tree.ensure_folders(dst_parent, &mut events)?;
        tree.detach(id);
        tree.node_mut(id).name = path::sanitize_name(dst_leaf);
        tree.attach(folder_id, id);
        let full = tree.full_path(id);
        file.lock().expect("file lock poisoned").local_path = full.clone();
        events.push(NamespaceEvent::FileMoved {
            from: src,
            to: full.clone(),
        });
        self.observers.emit_all(&events);
        Ok(full)
    }

    /// Rename/reparent a folder and recompute `local_path` on every
    /// descendant file.
    pub fn move_folder(&self, raw_src: &str, raw_dst: &str) -> FsResult<String> {
        let src = path::canonicalize(raw_src);
        let dst = path::canonicalize(raw_dst);
        if path::is_root(&src) {
            return Err(FsError::ReadOnly("/".into()));
        }
        if path::is_within(&dst, &src) && !path::paths_equal(&dst, &src) {
            return Err(FsError::Collision(format!("cannot move {src} into itself")));
        }
        let Some((dst_parent, dst_leaf)) = path::split_parent(&dst) else {
            return Err(FsError::IsADirectory("/".into()));
        };
        let mut events = Vec::new();
        let mut tree = self.tree();
        let id = tree
            .lookup(&src)
            .ok_or_else(|| FsError::NotFound(src.clone()))?;
        if !matches!(tree.node(id).kind, NodeKind::Folder { .. }) {
            return Err(FsError::NotADirectory(src));
        }
        if tree.lookup(&dst).is_some() && !path::paths_equal(&src, &dst) {
            return Err(FsError::Collision(dst));
        }
        let folder_id = tree.ensure_folders(dst_parent, &mut events)?;
        tree.detach(id);
        tree.node_mut(id).name = path::sanitize_name(dst_leaf);
        tree.attach(folder_id, id);
        tree.recompute_paths(id);
        let full = tree.full_path(id);
        events.push(NamespaceEvent::FolderMoved {
            from: src,
            to: full.clone(),
        });
        self.observers.emit_all(&events);
        Ok(full)
    }

    /// Every file at or under `raw_path`, with its current canonical path.
    pub fn files_under(&self, raw_path: &str) -> Vec<(String, SharedFile)> {
        let canonical = path::canonicalize(raw_path);
        let tree = self.tree();
        let mut out = Vec::new();
        if let Some(id) = tree.lookup(&canonical) {
            tree.collect_files(id, &mut out);
        }
        out
    }

    /// Paths of every file currently in the tree (test/diagnostic helper).
    pub fn all_file_paths(&self) -> Vec<String> {
        let tree = self.tree();
        let mut out = Vec::new();
        tree.collect_files(tree.root, &mut out);
        out.into_iter().map(|(p, _)| p).collect()
    }
}
