pub mod mount;
pub mod node;
pub mod path;
pub mod pipe;
pub mod tmpfs;

use alloc::string::String;
use alloc::sync::Arc;
use hashbrown::HashMap;
use spin::Mutex;

use crate::errno::{Error, Result};
use mount::MountTree;
use node::{open_fs, NodeHandle, NodeKind, OpenFlags, PERM_EXEC, PERM_WRITE};

/// Symlink chains longer than this fail resolution outright.
pub const MAX_SYMLINK_DEPTH: usize = 8;

/// Identity a VFS operation is performed as.
#[derive(Debug, Clone, Copy)]
pub struct Creds {
    pub user: u32,
}

impl Creds {
    pub const ROOT: Creds = Creds { user: 0 };
}

/// A filesystem backend's mount entry point: receives its argument string
/// and the mount-point path, returns the mounted root node.
pub type MountCallback = Arc<dyn Fn(&str, &str) -> Result<NodeHandle> + Send + Sync>;

/// The virtual-file-system context: the mount namespace tree plus the
/// registry of mountable filesystem types.
pub struct Vfs {
    tree: Arc<Mutex<MountTree>>,
    types: Mutex<HashMap<String, MountCallback>>,
}

impl Vfs {
    pub fn new() -> Self {
        Vfs {
            tree: Arc::new(Mutex::new(MountTree::new())),
            types: Mutex::new(HashMap::new()),
        }
    }

    // ── mounting ─────────────────────────────────────────────

    /// Register a mount callback under a filesystem-type name.
    pub fn register_type(&self, name: &str, callback: MountCallback) -> Result<()> {
        let mut types = self.types.lock();
        if types.contains_key(name) {
            return Err(Error::Exists);
        }
        types.insert(String::from(name), callback);
        Ok(())
    }

    /// Mount a registered filesystem type: the callback builds the root
    /// node from its argument string.
    pub fn mount_type(&self, fs_type: &str, arg: &str, mountpoint: &str) -> Result<()> {
        let callback = self
            .types
            .lock()
            .get(fs_type)
            .cloned()
            .ok_or(Error::NoDevice)?;
        let root = callback(arg, mountpoint)?;
        self.mount(mountpoint, root)?;
        let mut tree = self.tree.lock();
        let entry = tree.insert(mountpoint)?;
        let entry = tree.entry_mut(entry);
        entry.fs_type = Some(String::from(fs_type));
        entry.device = Some(String::from(arg));
        Ok(())
    }

    /// Hang a node into the namespace. The target must be absolute; an
    /// already-populated entry has only its node replaced.
    pub fn mount(&self, mountpoint: &str, root: NodeHandle) -> Result<()> {
        let mut tree = self.tree.lock();
        let entry = tree.insert(mountpoint)?;
        tree.set_node(entry, root);
        crate::log_info!("vfs: mounted '{}'", mountpoint);
        Ok(())
    }

    /// Expose a namespace position's children as a read-only directory.
    pub fn map_directory(&self, mountpoint: &str) -> Result<()> {
        let entry = self.tree.lock().insert(mountpoint)?;
        let node = mount::mapper_node(self.tree.clone(), entry);
        self.mount(mountpoint, node)
    }

    pub fn root(&self) -> Option<NodeHandle> {
        self.tree.lock().entry(0).node.clone()
    }

    // ── permission ───────────────────────────────────────────

    /// Owner-versus-other permission check. Root bypasses everything except
    /// the execute/traverse bit. The group triplet is never consulted (the
    /// node's gid is stored but unused here).
    pub fn has_permission(&self, creds: Creds, node: &NodeHandle, bits: u16) -> bool {
        if creds.user == 0 && bits != PERM_EXEC {
            return true;
        }
        let meta = node.meta();
        let owner = (meta.mask >> 6) & 0o7;
        let other = meta.mask & 0o7;
        if creds.user == meta.uid {
            bits & owner != 0
        } else {
            bits & other != 0
        }
    }

    // ── resolution ───────────────────────────────────────────

    /// Resolve a path to a node: canonicalize, find the deepest covering
    /// mount, walk the rest with find-child-by-name, restarting (up to a
    /// fixed depth) whenever a traversed node is a symlink.
    pub fn resolve(&self, cwd: &str, input: &str, flags: OpenFlags) -> Result<NodeHandle> {
        self.resolve_depth(cwd, input, flags, 0)
    }

    fn resolve_depth(
        &self,
        cwd: &str,
        input: &str,
        flags: OpenFlags,
        symlink_depth: usize,
    ) -> Result<NodeHandle> {
        let canonical = path::canonicalize(cwd, input);
        let segs = path::segments(&canonical);

        let (mount_node, consumed) = self.tree.lock().get_mount_point(&segs);
        let mut node = mount_node.ok_or(Error::NoEntry)?;
        let mut depth = consumed;

        loop {
            if node.kind == NodeKind::Symlink {
                let at_leaf = depth == segs.len();
                if at_leaf && flags.contains(OpenFlags::NOFOLLOW) {
                    if flags.contains(OpenFlags::PATH) {
                        // The caller wants the link itself.
                        open_fs(&node, flags);
                        return Ok(node);
                    }
                    return Err(Error::NoEntry);
                }
                if symlink_depth >= MAX_SYMLINK_DEPTH {
                    return Err(Error::SymlinkLoop);
                }
                let target = node.readlink()?;
                // A target whose stored length disagrees with what was read
                // fails resolution entirely.
                if target.len() as u64 != node.meta().length {
                    return Err(Error::Invalid);
                }
                // Restart from the target, relative to the link's directory.
                let base = join_prefix(&segs, depth.saturating_sub(1));
                node = self.resolve_depth(&base, &target, OpenFlags::empty(), symlink_depth + 1)?;
                continue;
            }

            if depth == segs.len() {
                open_fs(&node, flags);
                return Ok(node);
            }
            node = node.finddir(segs[depth]).map_err(|e| match e {
                Error::NotSupported => Error::NoEntry,
                other => other,
            })?;
            depth += 1;
        }
    }

    // ── the open flow ────────────────────────────────────────

    /// Full open semantics over `resolve`: creation, exclusivity,
    /// permission, truncation and append handling. Returns the node, the
    /// granted access bits and the starting offset.
    pub fn open(
        &self,
        creds: Creds,
        cwd: &str,
        input: &str,
        flags: OpenFlags,
        mode: u16,
    ) -> Result<(NodeHandle, u16, u64)> {
        let mut node = match self.resolve(cwd, input, flags) {
            Ok(n) => Some(n),
            Err(Error::NoEntry) => None,
            Err(e) => return Err(e),
        };

        let mut access = 0u16;
        if node.is_some() && flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
            return Err(Error::Exists);
        }

        let wants_read = !flags.contains(OpenFlags::WRONLY) || flags.contains(OpenFlags::RDWR);
        let wants_write = flags.contains(OpenFlags::WRONLY) || flags.contains(OpenFlags::RDWR);

        if wants_read {
            if let Some(n) = &node {
                if !self.has_permission(creds, n, node::PERM_READ) {
                    return Err(Error::Access);
                }
            }
            access |= 0o1;
        }
        if wants_write {
            if let Some(n) = &node {
                if !self.has_permission(creds, n, PERM_WRITE) {
                    return Err(Error::Access);
                }
                if n.kind == NodeKind::Directory {
                    return Err(Error::IsDirectory);
                }
            }
            access |= 0o2;
        }

        if node.is_none() && flags.contains(OpenFlags::CREAT) {
            self.create(creds, cwd, input, mode)?;
            node = Some(self.resolve(cwd, input, flags)?);
        }

        let node = node.ok_or(Error::NoEntry)?;

        if flags.contains(OpenFlags::DIRECTORY) && node.kind != NodeKind::Directory {
            return Err(Error::NotDirectory);
        }
        if flags.contains(OpenFlags::CREAT) && node.kind == NodeKind::Directory {
            return Err(Error::IsDirectory);
        }
        if flags.contains(OpenFlags::TRUNC) {
            if access & 0o2 == 0 {
                return Err(Error::Invalid);
            }
            node.truncate()?;
        }

        let offset = if flags.contains(OpenFlags::APPEND) {
            node.meta().length
        } else {
            0
        };
        Ok((node, access, offset))
    }

    // ── parent-first namespace mutations ─────────────────────

    fn resolve_parent(&self, cwd: &str, input: &str) -> Result<(NodeHandle, String)> {
        let canonical = path::canonicalize(cwd, input);
        let (parent_path, leaf) = path::split_parent(&canonical);
        if leaf.is_empty() {
            return Err(Error::Invalid);
        }
        let parent = self.resolve("/", &parent_path, OpenFlags::empty())?;
        Ok((parent, String::from(leaf)))
    }

    /// Create a regular file; permission on the parent is checked before
    /// the backend is asked.
    pub fn create(&self, creds: Creds, cwd: &str, input: &str, mode: u16) -> Result<()> {
        let (parent, leaf) = self.resolve_parent(cwd, input)?;
        if !self.has_permission(creds, &parent, PERM_WRITE) {
            return Err(Error::Access);
        }
        parent.ops.create(&parent, &leaf, mode)
    }

    pub fn mkdir(&self, creds: Creds, cwd: &str, input: &str, mode: u16) -> Result<()> {
        if input.is_empty() {
            return Err(Error::Invalid);
        }
        let (parent, leaf) = self.resolve_parent(cwd, input)?;
        let exists = self.resolve(cwd, input, OpenFlags::empty()).is_ok();
        if !self.has_permission(creds, &parent, PERM_WRITE) {
            return Err(if exists { Error::Exists } else { Error::Access });
        }
        parent.ops.mkdir(&parent, &leaf, mode)
    }

    pub fn unlink(&self, creds: Creds, cwd: &str, input: &str) -> Result<()> {
        let (parent, leaf) = self.resolve_parent(cwd, input)?;
        if !self.has_permission(creds, &parent, PERM_WRITE) {
            return Err(Error::Access);
        }
        parent.ops.unlink(&parent, &leaf)
    }

    pub fn symlink(&self, _creds: Creds, cwd: &str, target: &str, input: &str) -> Result<()> {
        let (parent, leaf) = self.resolve_parent(cwd, input)?;
        parent.ops.symlink(&parent, target, &leaf)
    }
}

/// Absolute path of the first `depth` segments.
fn join_prefix(segs: &[&str], depth: usize) -> String {
    let mut out = String::new();
    for seg in segs.iter().take(depth) {
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::node::{FsNode, Metadata, NodeOps, NullOps};

    fn vfs_with_root() -> Vfs {
        let vfs = Vfs::new();
        vfs.register_type("tmpfs", Arc::new(tmpfs::mount_tmpfs))
            .unwrap();
        vfs.mount_type("tmpfs", "root", "/").unwrap();
        vfs
    }

    #[test]
    fn resolve_walks_mounted_backends() {
        let vfs = vfs_with_root();
        vfs.mkdir(Creds::ROOT, "/", "/etc", 0o755).unwrap();
        vfs.create(Creds::ROOT, "/", "/etc/hostname", 0o644).unwrap();
        let node = vfs.resolve("/", "/etc/hostname", OpenFlags::empty()).unwrap();
        assert_eq!(node.name, "hostname");
        assert_eq!(
            vfs.resolve("/", "/etc/missing", OpenFlags::empty()).unwrap_err(),
            Error::NoEntry
        );
    }

    #[test]
    fn dotdot_across_a_mount_point_resolves_identically() {
        let vfs = vfs_with_root();
        vfs.mkdir(Creds::ROOT, "/", "/mnt", 0o755).unwrap();
        vfs.mount_type("tmpfs", "disk", "/mnt").unwrap();
        vfs.create(Creds::ROOT, "/", "/mnt/file", 0o644).unwrap();
        let direct = vfs.resolve("/", "/mnt/file", OpenFlags::empty()).unwrap();
        let dotted = vfs.resolve("/", "/mnt/../mnt/file", OpenFlags::empty()).unwrap();
        assert_eq!(direct.inode, dotted.inode);
        assert_eq!(direct.name, dotted.name);
    }

    #[test]
    fn relative_resolution_uses_the_working_directory() {
        let vfs = vfs_with_root();
        vfs.mkdir(Creds::ROOT, "/", "/home", 0o755).unwrap();
        vfs.create(Creds::ROOT, "/", "/home/notes", 0o644).unwrap();
        let node = vfs.resolve("/home", "notes", OpenFlags::empty()).unwrap();
        assert_eq!(node.name, "notes");
    }

    #[test]
    fn symlink_chain_of_eight_resolves_and_nine_fails() {
        let vfs = vfs_with_root();
        vfs.create(Creds::ROOT, "/", "/real", 0o644).unwrap();
        // link1 -> real, link2 -> link1, ... link9 -> link8.
        vfs.symlink(Creds::ROOT, "/", "/real", "/link1").unwrap();
        for i in 2..=9 {
            let target = alloc::format!("/link{}", i - 1);
            let name = alloc::format!("/link{}", i);
            vfs.symlink(Creds::ROOT, "/", &target, &name).unwrap();
        }
        let eight = vfs.resolve("/", "/link8", OpenFlags::empty()).unwrap();
        assert_eq!(eight.name, "real");
        assert_eq!(
            vfs.resolve("/", "/link9", OpenFlags::empty()).unwrap_err(),
            Error::SymlinkLoop
        );
    }

    #[test]
    fn symlink_with_lying_length_fails_resolution() {
        struct LyingLink;
        impl NodeOps for LyingLink {
            fn readlink(&self, _node: &FsNode) -> crate::errno::Result<String> {
                Ok(String::from("/real"))
            }
        }
        let vfs = vfs_with_root();
        vfs.create(Creds::ROOT, "/", "/real", 0o644).unwrap();
        let meta = Metadata {
            length: 2, // does not match "/real"
            ..Metadata::default()
        };
        let link = FsNode::new("liar", NodeKind::Symlink, 9, meta, Arc::new(LyingLink));
        vfs.mount("/liar", link).unwrap();
        assert_eq!(
            vfs.resolve("/", "/liar", OpenFlags::empty()).unwrap_err(),
            Error::Invalid
        );
    }

    #[test]
    fn open_creates_truncates_and_appends() {
        let vfs = vfs_with_root();
        let flags = OpenFlags::CREAT | OpenFlags::WRONLY;
        let (node, access, offset) = vfs.open(Creds::ROOT, "/", "/log", flags, 0o644).unwrap();
        assert_eq!((access, offset), (0o2, 0));
        node.write(0, b"0123456789").unwrap();

        // Append starts at the stored length.
        let flags = OpenFlags::WRONLY | OpenFlags::APPEND;
        let (_, _, offset) = vfs.open(Creds::ROOT, "/", "/log", flags, 0).unwrap();
        assert_eq!(offset, 10);

        // O_EXCL refuses an existing file.
        let flags = OpenFlags::CREAT | OpenFlags::EXCL;
        assert_eq!(
            vfs.open(Creds::ROOT, "/", "/log", flags, 0o644).unwrap_err(),
            Error::Exists
        );

        // O_TRUNC empties it (and requires write access).
        let flags = OpenFlags::WRONLY | OpenFlags::TRUNC;
        let (node, _, _) = vfs.open(Creds::ROOT, "/", "/log", flags, 0).unwrap();
        assert_eq!(node.meta().length, 0);
        assert_eq!(
            vfs.open(Creds::ROOT, "/", "/log", OpenFlags::TRUNC, 0)
                .unwrap_err(),
            Error::Invalid
        );
    }

    #[test]
    fn write_open_on_a_directory_is_rejected() {
        let vfs = vfs_with_root();
        vfs.mkdir(Creds::ROOT, "/", "/dir", 0o755).unwrap();
        assert_eq!(
            vfs.open(Creds::ROOT, "/", "/dir", OpenFlags::WRONLY, 0)
                .unwrap_err(),
            Error::IsDirectory
        );
        // O_DIRECTORY on a file is the inverse conflict.
        vfs.create(Creds::ROOT, "/", "/file", 0o644).unwrap();
        assert_eq!(
            vfs.open(Creds::ROOT, "/", "/file", OpenFlags::DIRECTORY, 0)
                .unwrap_err(),
            Error::NotDirectory
        );
    }

    #[test]
    fn permission_owner_and_other_triplets() {
        let vfs = vfs_with_root();
        vfs.create(Creds::ROOT, "/", "/secret", 0o640).unwrap();
        let node = vfs.resolve("/", "/secret", OpenFlags::empty()).unwrap();
        node.chown(100, 100).unwrap();

        // Owner read allowed, other read denied.
        let node = vfs.resolve("/", "/secret", OpenFlags::empty()).unwrap();
        assert!(vfs.has_permission(Creds { user: 100 }, &node, node::PERM_READ));
        assert!(!vfs.has_permission(Creds { user: 200 }, &node, node::PERM_READ));
        // Root bypasses read/write but not execute.
        assert!(vfs.has_permission(Creds::ROOT, &node, node::PERM_WRITE));
        assert!(!vfs.has_permission(Creds::ROOT, &node, PERM_EXEC));
    }

    #[test]
    fn known_gap_group_triplet_is_ignored() {
        // The mode grants the group read (0o040) and the node's gid matches
        // the caller's uid-as-group; the check still uses the "other"
        // triplet. This documents intentional behavior, not an oversight.
        let vfs = vfs_with_root();
        vfs.create(Creds::ROOT, "/", "/grouped", 0o640).unwrap();
        let node = vfs.resolve("/", "/grouped", OpenFlags::empty()).unwrap();
        node.chown(100, 200).unwrap();
        let node = vfs.resolve("/", "/grouped", OpenFlags::empty()).unwrap();
        assert!(!vfs.has_permission(Creds { user: 200 }, &node, node::PERM_READ));
    }

    #[test]
    fn create_requires_write_permission_on_the_parent() {
        let vfs = vfs_with_root();
        vfs.mkdir(Creds::ROOT, "/", "/locked", 0o755).unwrap();
        let dir = vfs.resolve("/", "/locked", OpenFlags::empty()).unwrap();
        dir.chown(100, 100).unwrap();
        assert_eq!(
            vfs.create(Creds { user: 200 }, "/", "/locked/nope", 0o644)
                .unwrap_err(),
            Error::Access
        );
        assert!(vfs.create(Creds { user: 100 }, "/", "/locked/yes", 0o644).is_ok());
    }

    #[test]
    fn unknown_type_and_unsupported_backend_fail_by_value() {
        let vfs = vfs_with_root();
        assert_eq!(
            vfs.mount_type("ext2", "/dev/hda", "/mnt").unwrap_err(),
            Error::NoDevice
        );
        // A backend with no create capability reports "not supported".
        let stub = FsNode::new(
            "stub",
            NodeKind::Directory,
            0,
            Metadata::default(),
            Arc::new(NullOps),
        );
        vfs.mount("/stub", stub).unwrap();
        assert_eq!(
            vfs.create(Creds::ROOT, "/", "/stub/x", 0o644).unwrap_err(),
            Error::NotSupported
        );
    }

    #[test]
    fn resolve_root_yields_the_mounted_root() {
        let vfs = vfs_with_root();
        let root = vfs.resolve("/", "/", OpenFlags::empty()).unwrap();
        assert_eq!(root.kind, NodeKind::Directory);
        assert!(vfs.root().is_some());
    }
}
