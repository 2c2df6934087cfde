use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::node::{DirEntry, FsNode, Metadata, NodeHandle, NodeKind, NodeOps, OpenFlags};
use crate::errno::{Error, Result};

// ──────────────────────────────────────────────────────────────
//  Internal inode arena — indexed by inode number
// ──────────────────────────────────────────────────────────────

struct TmpNode {
    name: String,
    kind: NodeKind,
    mask: u16,
    uid: u32,
    gid: u32,
    atime: u64,
    mtime: u64,
    ctime: u64,
    data: Vec<u8>,
    link_target: Option<String>,
    parent: Option<u64>,
    children: Vec<u64>,
}

impl TmpNode {
    fn length(&self) -> u64 {
        match self.kind {
            NodeKind::Symlink => self.link_target.as_ref().map_or(0, |t| t.len()) as u64,
            _ => self.data.len() as u64,
        }
    }
}

struct TmpfsInner {
    nodes: Vec<Option<TmpNode>>,
}

impl TmpfsInner {
    fn new() -> Self {
        TmpfsInner {
            nodes: alloc::vec![Some(TmpNode {
                name: String::from("/"),
                kind: NodeKind::Directory,
                mask: 0o777,
                uid: 0,
                gid: 0,
                atime: 0,
                mtime: 0,
                ctime: 0,
                data: Vec::new(),
                link_target: None,
                parent: None,
                children: Vec::new(),
            })],
        }
    }

    fn get(&self, inode: u64) -> Result<&TmpNode> {
        self.nodes
            .get(inode as usize)
            .and_then(|n| n.as_ref())
            .ok_or(Error::NoEntry)
    }

    fn get_mut(&mut self, inode: u64) -> Result<&mut TmpNode> {
        self.nodes
            .get_mut(inode as usize)
            .and_then(|n| n.as_mut())
            .ok_or(Error::NoEntry)
    }

    fn child_named(&self, dir: u64, name: &str) -> Result<u64> {
        let parent = self.get(dir)?;
        for &child in &parent.children {
            if let Ok(node) = self.get(child) {
                if node.name == name {
                    return Ok(child);
                }
            }
        }
        Err(Error::NoEntry)
    }

    fn attach(&mut self, dir: u64, node: TmpNode) -> Result<u64> {
        if self.child_named(dir, &node.name).is_ok() {
            return Err(Error::Exists);
        }
        self.nodes.push(Some(node));
        let inode = (self.nodes.len() - 1) as u64;
        self.get_mut(dir)?.children.push(inode);
        Ok(inode)
    }
}

// ──────────────────────────────────────────────────────────────
//  Backend ops — a fresh FsNode is minted per lookup
// ──────────────────────────────────────────────────────────────

pub struct Tmpfs {
    inner: Arc<Mutex<TmpfsInner>>,
}

struct TmpfsOps {
    inner: Arc<Mutex<TmpfsInner>>,
}

impl Tmpfs {
    pub fn new() -> Self {
        Tmpfs {
            inner: Arc::new(Mutex::new(TmpfsInner::new())),
        }
    }

    /// The filesystem's root node, handed to `mount`.
    pub fn root(&self) -> NodeHandle {
        mint(&self.inner, 0, "tmpfs")
    }
}

fn mint(inner: &Arc<Mutex<TmpfsInner>>, inode: u64, fallback_name: &str) -> NodeHandle {
    let guard = inner.lock();
    let (name, kind, meta) = match guard.get(inode) {
        Ok(n) => (
            n.name.clone(),
            n.kind,
            Metadata {
                mask: n.mask,
                uid: n.uid,
                gid: n.gid,
                length: n.length(),
                atime: n.atime,
                mtime: n.mtime,
                ctime: n.ctime,
                nlink: 1,
            },
        ),
        Err(_) => (
            String::from(fallback_name),
            NodeKind::File,
            Metadata::default(),
        ),
    };
    drop(guard);
    FsNode::new(
        &name,
        kind,
        inode,
        meta,
        Arc::new(TmpfsOps {
            inner: inner.clone(),
        }),
    )
}

impl NodeOps for TmpfsOps {
    fn read(&self, node: &FsNode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.lock();
        let file = inner.get(node.inode)?;
        if file.kind == NodeKind::Directory {
            return Err(Error::IsDirectory);
        }
        let data = &file.data;
        if offset as usize >= data.len() {
            return Ok(0);
        }
        let available = &data[offset as usize..];
        let take = buf.len().min(available.len());
        buf[..take].copy_from_slice(&available[..take]);
        Ok(take)
    }

    fn write(&self, node: &FsNode, offset: u64, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let file = inner.get_mut(node.inode)?;
        if file.kind == NodeKind::Directory {
            return Err(Error::IsDirectory);
        }
        let end = offset as usize + data.len();
        if end > file.data.len() {
            file.data.resize(end, 0);
        }
        file.data[offset as usize..end].copy_from_slice(data);
        let length = file.data.len() as u64;
        node.update_meta(|m| m.length = length);
        Ok(data.len())
    }

    fn open(&self, node: &FsNode, _flags: OpenFlags) {
        // Access-time bookkeeping; tmpfs has no real clock source.
        node.update_meta(|m| m.atime = m.atime.max(m.mtime));
    }

    fn readdir(&self, node: &FsNode, index: usize) -> Result<Option<DirEntry>> {
        if index == 0 {
            return Ok(Some(DirEntry {
                inode: node.inode,
                name: String::from("."),
            }));
        }
        if index == 1 {
            return Ok(Some(DirEntry {
                inode: node.inode,
                name: String::from(".."),
            }));
        }
        let inner = self.inner.lock();
        let dir = inner.get(node.inode)?;
        match dir.children.get(index - 2) {
            Some(&child) => Ok(Some(DirEntry {
                inode: child,
                name: inner.get(child)?.name.clone(),
            })),
            None => Ok(None),
        }
    }

    fn finddir(&self, node: &FsNode, name: &str) -> Result<NodeHandle> {
        let child = self.inner.lock().child_named(node.inode, name)?;
        Ok(mint(&self.inner, child, name))
    }

    fn create(&self, node: &FsNode, name: &str, mode: u16) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.attach(
            node.inode,
            TmpNode {
                name: String::from(name),
                kind: NodeKind::File,
                mask: mode,
                uid: node.meta().uid,
                gid: node.meta().gid,
                atime: 0,
                mtime: 0,
                ctime: 0,
                data: Vec::new(),
                link_target: None,
                parent: Some(node.inode),
                children: Vec::new(),
            },
        )?;
        Ok(())
    }

    fn mkdir(&self, node: &FsNode, name: &str, mode: u16) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.attach(
            node.inode,
            TmpNode {
                name: String::from(name),
                kind: NodeKind::Directory,
                mask: mode,
                uid: node.meta().uid,
                gid: node.meta().gid,
                atime: 0,
                mtime: 0,
                ctime: 0,
                data: Vec::new(),
                link_target: None,
                parent: Some(node.inode),
                children: Vec::new(),
            },
        )?;
        Ok(())
    }

    fn unlink(&self, node: &FsNode, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let child = inner.child_named(node.inode, name)?;
        let victim = inner.get(child)?;
        if victim.kind == NodeKind::Directory && !victim.children.is_empty() {
            return Err(Error::IsDirectory);
        }
        inner.get_mut(node.inode)?.children.retain(|&c| c != child);
        inner.nodes[child as usize] = None;
        Ok(())
    }

    fn symlink(&self, node: &FsNode, target: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.attach(
            node.inode,
            TmpNode {
                name: String::from(name),
                kind: NodeKind::Symlink,
                mask: 0o777,
                uid: node.meta().uid,
                gid: node.meta().gid,
                atime: 0,
                mtime: 0,
                ctime: 0,
                data: Vec::new(),
                link_target: Some(String::from(target)),
                parent: Some(node.inode),
                children: Vec::new(),
            },
        )?;
        Ok(())
    }

    fn readlink(&self, node: &FsNode) -> Result<String> {
        let inner = self.inner.lock();
        let link = inner.get(node.inode)?;
        link.link_target.clone().ok_or(Error::Invalid)
    }

    fn chmod(&self, node: &FsNode, mode: u16) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.get_mut(node.inode)?.mask = mode & 0o7777;
        node.update_meta(|m| m.mask = mode & 0o7777);
        Ok(())
    }

    fn chown(&self, node: &FsNode, uid: u32, gid: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let target = inner.get_mut(node.inode)?;
        target.uid = uid;
        target.gid = gid;
        node.update_meta(|m| {
            m.uid = uid;
            m.gid = gid;
        });
        Ok(())
    }

    fn truncate(&self, node: &FsNode) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.get_mut(node.inode)?.data.clear();
        node.update_meta(|m| m.length = 0);
        Ok(())
    }
}

/// Mount callback registered under the "tmpfs" type name.
pub fn mount_tmpfs(_arg: &str, _mountpoint: &str) -> Result<NodeHandle> {
    Ok(Tmpfs::new().root())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_roundtrip() {
        let fs = Tmpfs::new();
        let root = fs.root();
        root.ops.create(&root, "hello.txt", 0o644).unwrap();
        let file = root.finddir("hello.txt").unwrap();
        assert_eq!(file.write(0, b"greetings").unwrap(), 9);
        let mut buf = [0u8; 16];
        assert_eq!(file.read(0, &mut buf).unwrap(), 9);
        assert_eq!(&buf[..9], b"greetings");
        // Reads past the end return zero bytes.
        assert_eq!(file.read(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn lookups_mint_fresh_nodes_backed_by_the_same_inode() {
        let fs = Tmpfs::new();
        let root = fs.root();
        root.ops.create(&root, "f", 0o600).unwrap();
        let a = root.finddir("f").unwrap();
        let b = root.finddir("f").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        a.write(0, b"shared").unwrap();
        let mut buf = [0u8; 6];
        b.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let fs = Tmpfs::new();
        let root = fs.root();
        root.ops.mkdir(&root, "dir", 0o755).unwrap();
        assert_eq!(root.ops.mkdir(&root, "dir", 0o755), Err(Error::Exists));
        assert_eq!(root.ops.create(&root, "dir", 0o644), Err(Error::Exists));
    }

    #[test]
    fn unlink_refuses_populated_directories() {
        let fs = Tmpfs::new();
        let root = fs.root();
        root.ops.mkdir(&root, "dir", 0o755).unwrap();
        let dir = root.finddir("dir").unwrap();
        dir.ops.create(&dir, "inner", 0o644).unwrap();
        assert_eq!(root.ops.unlink(&root, "dir"), Err(Error::IsDirectory));
        dir.ops.unlink(&dir, "inner").unwrap();
        root.ops.unlink(&root, "dir").unwrap();
        assert_eq!(root.finddir("dir").unwrap_err(), Error::NoEntry);
    }

    #[test]
    fn symlinks_store_and_report_their_target() {
        let fs = Tmpfs::new();
        let root = fs.root();
        root.ops.symlink(&root, "/target/file", "link").unwrap();
        let link = root.finddir("link").unwrap();
        assert_eq!(link.kind, NodeKind::Symlink);
        assert_eq!(link.readlink().unwrap(), "/target/file");
        // Stored length matches what readlink hands back.
        assert_eq!(link.meta().length, 12);
    }

    #[test]
    fn readdir_walks_dot_entries_then_children() {
        let fs = Tmpfs::new();
        let root = fs.root();
        root.ops.create(&root, "a", 0o644).unwrap();
        root.ops.create(&root, "b", 0o644).unwrap();
        let names: Vec<String> = (0..)
            .map_while(|i| root.readdir(i).unwrap().map(|e| e.name))
            .collect();
        assert_eq!(names, [".", "..", "a", "b"]);
    }
}
