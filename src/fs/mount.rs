use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::node::{DirEntry, FsNode, Metadata, NodeHandle, NodeKind, NodeOps};
use super::path;
use crate::errno::{Error, Result};

/// One named entry in the mount namespace tree. Only some entries carry a
/// mounted node; the rest are intermediate path components.
pub struct MountEntry {
    pub name: String,
    pub node: Option<NodeHandle>,
    pub fs_type: Option<String>,
    pub device: Option<String>,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// The mount namespace: a tree of named entries rooted at `/`.
pub struct MountTree {
    entries: Vec<MountEntry>,
}

impl MountTree {
    pub fn new() -> Self {
        MountTree {
            entries: alloc::vec![MountEntry {
                name: String::from("[root]"),
                node: None,
                fs_type: None,
                device: None,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    fn child_named(&self, entry: usize, name: &str) -> Option<usize> {
        self.entries[entry]
            .children
            .iter()
            .copied()
            .find(|&c| self.entries[c].name == name)
    }

    /// Walk (and create) entries down to `path`, returning the entry index.
    /// Inserting at an already-populated entry later replaces only the
    /// mounted node, never the tree position.
    pub fn insert(&mut self, path: &str) -> Result<usize> {
        if !path.starts_with('/') {
            return Err(Error::Invalid);
        }
        let mut at = 0;
        for segment in path::segments(path) {
            at = match self.child_named(at, segment) {
                Some(c) => c,
                None => {
                    self.entries.push(MountEntry {
                        name: String::from(segment),
                        node: None,
                        fs_type: None,
                        device: None,
                        parent: Some(at),
                        children: Vec::new(),
                    });
                    let idx = self.entries.len() - 1;
                    let parent = self.entries[idx].parent.unwrap_or(0);
                    self.entries[parent].children.push(idx);
                    idx
                }
            };
        }
        Ok(at)
    }

    pub fn set_node(&mut self, entry: usize, node: NodeHandle) {
        // Mount roots outlive any individual open; exempt them from
        // tracked teardown.
        node.pin();
        self.entries[entry].node = Some(node);
    }

    pub fn entry(&self, idx: usize) -> &MountEntry {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut MountEntry {
        &mut self.entries[idx]
    }

    /// Locate the deepest mount point that prefixes `segments`. Returns the
    /// mounted node (the root node if nothing deeper matches) and how many
    /// segments the mount consumed.
    pub fn get_mount_point(&self, segments: &[&str]) -> (Option<NodeHandle>, usize) {
        let mut last = self.entries[0].node.clone();
        let mut consumed = 0;

        let mut at = 0;
        for (depth, segment) in segments.iter().enumerate() {
            match self.child_named(at, segment) {
                Some(child) => {
                    at = child;
                    if let Some(node) = &self.entries[at].node {
                        last = Some(node.clone());
                        consumed = depth + 1;
                    }
                }
                None => break,
            }
        }

        (last, consumed)
    }

    fn names_of(&self, entry: usize) -> Vec<String> {
        self.entries[entry]
            .children
            .iter()
            .map(|&c| self.entries[c].name.clone())
            .collect()
    }
}

// ──────────────────────────────────────────────────────────────
//  Mapper nodes — expose namespace children as a read-only directory
// ──────────────────────────────────────────────────────────────

struct MapperOps {
    tree: Arc<Mutex<MountTree>>,
    entry: usize,
}

impl NodeOps for MapperOps {
    fn readdir(&self, _node: &FsNode, index: usize) -> Result<Option<DirEntry>> {
        if index == 0 {
            return Ok(Some(DirEntry {
                inode: 0,
                name: String::from("."),
            }));
        }
        if index == 1 {
            return Ok(Some(DirEntry {
                inode: 1,
                name: String::from(".."),
            }));
        }
        let names = self.tree.lock().names_of(self.entry);
        Ok(names.get(index - 2).map(|name| DirEntry {
            inode: (index - 2) as u64,
            name: name.clone(),
        }))
    }
}

/// Build the read-only directory node backing `map_directory`.
pub fn mapper_node(tree: Arc<Mutex<MountTree>>, entry: usize) -> NodeHandle {
    let meta = Metadata {
        mask: 0o555,
        ..Metadata::default()
    };
    FsNode::new(
        "[mapper]",
        NodeKind::Directory,
        0,
        meta,
        Arc::new(MapperOps { tree, entry }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::node::NullOps;

    fn dir_node(name: &str) -> NodeHandle {
        FsNode::new(name, NodeKind::Directory, 0, Metadata::default(), Arc::new(NullOps))
    }

    #[test]
    fn insert_builds_intermediate_entries_once() {
        let mut tree = MountTree::new();
        let a = tree.insert("/mnt/disk").unwrap();
        let b = tree.insert("/mnt/disk").unwrap();
        assert_eq!(a, b);
        let mnt = tree.insert("/mnt").unwrap();
        assert_eq!(tree.entry(mnt).name, "mnt");
    }

    #[test]
    fn non_absolute_targets_are_rejected() {
        let mut tree = MountTree::new();
        assert_eq!(tree.insert("mnt/disk"), Err(Error::Invalid));
    }

    #[test]
    fn remount_replaces_only_the_node() {
        let mut tree = MountTree::new();
        let idx = tree.insert("/mnt").unwrap();
        tree.set_node(idx, dir_node("first"));
        let before = tree.entries.len();
        let again = tree.insert("/mnt").unwrap();
        tree.set_node(again, dir_node("second"));
        assert_eq!(tree.entries.len(), before);
        assert_eq!(
            tree.entry(idx).node.as_ref().map(|n| n.name.clone()),
            Some(String::from("second"))
        );
    }

    #[test]
    fn deepest_mount_prefix_wins() {
        let mut tree = MountTree::new();
        let root = tree.insert("/").unwrap();
        tree.set_node(root, dir_node("root"));
        let dev = tree.insert("/dev").unwrap();
        tree.set_node(dev, dir_node("devfs"));
        let pts = tree.insert("/dev/pts").unwrap();
        tree.set_node(pts, dir_node("ptsfs"));

        let (node, consumed) = tree.get_mount_point(&["dev", "pts", "0"]);
        assert_eq!(node.unwrap().name, "ptsfs");
        assert_eq!(consumed, 2);

        let (node, consumed) = tree.get_mount_point(&["home", "user"]);
        assert_eq!(node.unwrap().name, "root");
        assert_eq!(consumed, 0);
    }

    #[test]
    fn mapper_lists_dot_dotdot_then_children() {
        let tree = Arc::new(Mutex::new(MountTree::new()));
        {
            let mut t = tree.lock();
            t.insert("/dev/null").unwrap();
            t.insert("/dev/zero").unwrap();
        }
        let dev = tree.lock().insert("/dev").unwrap();
        let node = mapper_node(tree.clone(), dev);
        assert_eq!(node.readdir(0).unwrap().unwrap().name, ".");
        assert_eq!(node.readdir(1).unwrap().unwrap().name, "..");
        assert_eq!(node.readdir(2).unwrap().unwrap().name, "null");
        assert_eq!(node.readdir(3).unwrap().unwrap().name, "zero");
        assert!(node.readdir(4).unwrap().is_none());
    }
}
