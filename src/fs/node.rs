use alloc::string::String;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::errno::{Error, Result};
use crate::scheduler::process::Pid;

bitflags! {
    /// Open-mode flags carried through `resolve` and the open flow.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const WRONLY    = 0x0001;
        const RDWR      = 0x0002;
        const APPEND    = 0x0008;
        const CREAT     = 0x0200;
        const TRUNC     = 0x0400;
        const EXCL      = 0x0800;
        const NOFOLLOW  = 0x1000;
        const PATH      = 0x2000;
        const NONBLOCK  = 0x4000;
        const DIRECTORY = 0x8000;
    }
}

/// Permission bits requested from `has_permission`.
pub const PERM_EXEC: u16 = 0o1;
pub const PERM_WRITE: u16 = 0o2;
pub const PERM_READ: u16 = 0o4;

/// What kind of open-able entity a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    CharDevice,
    BlockDevice,
    Pipe,
    Symlink,
}

/// Whether a node's lifetime is reference counted at all. Mount roots are
/// pinned: closes never run their teardown hook and never free them while
/// the mount tree holds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLifetime {
    Tracked,
    Pinned,
}

/// Mutable node attributes, guarded as a unit.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub mask: u16,
    pub uid: u32,
    pub gid: u32,
    pub length: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub nlink: u32,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            mask: 0o644,
            uid: 0,
            gid: 0,
            length: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            nlink: 1,
        }
    }
}

/// One directory entry as produced by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u64,
    pub name: String,
}

/// The backend capability table. Every method defaults to "unsupported";
/// a backend implements exactly the subset it can honor. The open/close
/// hooks are bookkeeping only and default to no-ops.
pub trait NodeOps: Send + Sync {
    fn read(&self, _node: &FsNode, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn write(&self, _node: &FsNode, _offset: u64, _data: &[u8]) -> Result<usize> {
        Err(Error::ReadOnly)
    }

    fn open(&self, _node: &FsNode, _flags: OpenFlags) {}

    fn close(&self, _node: &FsNode) {}

    fn readdir(&self, _node: &FsNode, _index: usize) -> Result<Option<DirEntry>> {
        Err(Error::NotSupported)
    }

    fn finddir(&self, _node: &FsNode, _name: &str) -> Result<NodeHandle> {
        Err(Error::NotSupported)
    }

    fn create(&self, _node: &FsNode, _name: &str, _mode: u16) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn mkdir(&self, _node: &FsNode, _name: &str, _mode: u16) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn unlink(&self, _node: &FsNode, _name: &str) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn symlink(&self, _node: &FsNode, _target: &str, _name: &str) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn readlink(&self, _node: &FsNode) -> Result<String> {
        Err(Error::NotSupported)
    }

    fn chmod(&self, _node: &FsNode, _mode: u16) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn chown(&self, _node: &FsNode, _uid: u32, _gid: u32) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn truncate(&self, _node: &FsNode) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn selectcheck(&self, _node: &FsNode) -> Result<bool> {
        Err(Error::NotSupported)
    }

    fn selectwait(&self, _node: &FsNode, _waiter: Pid) -> Result<()> {
        Err(Error::NotSupported)
    }
}

/// A backend with no capabilities at all (placeholder directories).
pub struct NullOps;

impl NodeOps for NullOps {}

/// The polymorphic VFS node: one open-able entity in the namespace.
pub struct FsNode {
    pub name: String,
    pub kind: NodeKind,
    pub inode: u64,
    meta: Mutex<Metadata>,
    pinned: AtomicBool,
    pub ops: Arc<dyn NodeOps>,
}

impl core::fmt::Debug for FsNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FsNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("inode", &self.inode)
            .field("meta", &self.meta())
            .field("pinned", &self.pinned.load(Ordering::Relaxed))
            .finish()
    }
}

/// Shared-ownership node reference: cloning is the open-count increment,
/// dropping is the decrement, and the backing memory goes away exactly when
/// the last tracked handle does.
pub type NodeHandle = Arc<FsNode>;

impl FsNode {
    pub fn new(name: &str, kind: NodeKind, inode: u64, meta: Metadata, ops: Arc<dyn NodeOps>) -> NodeHandle {
        Arc::new(FsNode {
            name: String::from(name),
            kind,
            inode,
            meta: Mutex::new(meta),
            pinned: AtomicBool::new(false),
            ops,
        })
    }

    pub fn meta(&self) -> Metadata {
        self.meta.lock().clone()
    }

    pub fn update_meta(&self, f: impl FnOnce(&mut Metadata)) {
        f(&mut self.meta.lock());
    }

    pub fn lifetime(&self) -> NodeLifetime {
        if self.pinned.load(Ordering::Relaxed) {
            NodeLifetime::Pinned
        } else {
            NodeLifetime::Tracked
        }
    }

    /// Exempt this node from tracked teardown (mount roots).
    pub fn pin(&self) {
        self.pinned.store(true, Ordering::Relaxed);
    }

    // ---- capability dispatchers; an unset capability is a value error ----

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ops.read(self, offset, buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.ops.write(self, offset, data)
    }

    pub fn readdir(&self, index: usize) -> Result<Option<DirEntry>> {
        if self.kind != NodeKind::Directory {
            return Err(Error::NotDirectory);
        }
        self.ops.readdir(self, index)
    }

    pub fn finddir(&self, name: &str) -> Result<NodeHandle> {
        if self.kind != NodeKind::Directory {
            return Err(Error::NotDirectory);
        }
        self.ops.finddir(self, name)
    }

    pub fn readlink(&self) -> Result<String> {
        self.ops.readlink(self)
    }

    pub fn chmod(&self, mode: u16) -> Result<()> {
        self.ops.chmod(self, mode)
    }

    pub fn chown(&self, uid: u32, gid: u32) -> Result<()> {
        self.ops.chown(self, uid, gid)
    }

    pub fn truncate(&self) -> Result<()> {
        self.ops.truncate(self)
    }

    pub fn selectcheck(&self) -> Result<bool> {
        self.ops.selectcheck(self)
    }

    pub fn selectwait(&self, waiter: Pid) -> Result<()> {
        self.ops.selectwait(self, waiter)
    }
}

impl Drop for FsNode {
    fn drop(&mut self) {
        // The close hook fires once, when the last tracked handle goes away.
        if self.lifetime() == NodeLifetime::Tracked {
            let ops = self.ops.clone();
            ops.close(self);
        }
    }
}

/// Fire the backend's open hook. The caller already owns the handle, so
/// the reference count is exactly the number of live handles.
pub fn open_fs(node: &NodeHandle, flags: OpenFlags) {
    node.ops.open(node, flags);
}

/// Duplicate a reference to a node (fd inheritance, dup).
pub fn clone_fs(node: &NodeHandle) -> NodeHandle {
    node.clone()
}

/// Drop a reference to a node. The backend close hook and the node's memory
/// go away together with the last tracked reference.
pub fn close_fs(node: NodeHandle) {
    drop(node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct CountingOps {
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    impl NodeOps for CountingOps {
        fn open(&self, _node: &FsNode, _flags: OpenFlags) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }
        fn close(&self, _node: &FsNode) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_node(closes: Arc<AtomicUsize>) -> NodeHandle {
        FsNode::new(
            "victim",
            NodeKind::File,
            1,
            Metadata::default(),
            Arc::new(CountingOps {
                opens: AtomicUsize::new(0),
                closes,
            }),
        )
    }

    #[test]
    fn refcount_tracks_clones_and_closes() {
        let closes = Arc::new(AtomicUsize::new(0));
        let node = counting_node(closes.clone());
        assert_eq!(Arc::strong_count(&node), 1);

        let a = clone_fs(&node);
        let b = clone_fs(&node);
        assert_eq!(Arc::strong_count(&node), 3);

        close_fs(a);
        close_fs(b);
        assert_eq!(Arc::strong_count(&node), 1);
        // Backing memory (and the close hook) released exactly once, exactly
        // when the count reaches zero.
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        close_fs(node);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pinned_nodes_skip_the_close_hook() {
        let closes = Arc::new(AtomicUsize::new(0));
        let node = counting_node(closes.clone());
        node.pin();
        assert_eq!(node.lifetime(), NodeLifetime::Pinned);
        close_fs(node);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unset_capabilities_fail_with_typed_errors() {
        let node = FsNode::new("stub", NodeKind::File, 2, Metadata::default(), Arc::new(NullOps));
        let mut buf = [0u8; 4];
        assert_eq!(node.read(0, &mut buf), Err(Error::NotSupported));
        assert_eq!(node.write(0, b"x"), Err(Error::ReadOnly));
        assert_eq!(node.readlink().unwrap_err(), Error::NotSupported);
        // Directory operations on a non-directory are a state conflict.
        assert_eq!(node.finddir("x").unwrap_err(), Error::NotDirectory);
    }
}
