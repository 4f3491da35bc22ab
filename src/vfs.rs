/// The filesystem contract and the composite that unions an immutable
/// archive with writable host-directory mounts.
///
/// A single rooted namespace is resolved per path: the archive is the
/// default, and a mount overrides it for every path at or beneath its
/// prefix. Mounts are fixed at construction, so routing needs no locks.
///
/// Write-side methods carry deny-by-default implementations; a concrete
/// filesystem overrides only what it supports. Nothing here panics on an
/// unsupported operation.
use crate::archive::ArchiveIndex;
use crate::attr::{DirEntry, FileAttr, FileKind};
use crate::error::FsError;
use log::{debug, warn};
use std::sync::Arc;

/// Hop budget for server-side symlink resolution.
const MAX_LINK_HOPS: usize = 20;

/// What a filesystem will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReadOnly,
    ReadWrite,
}

impl Capability {
    pub fn writable(self) -> bool {
        self == Capability::ReadWrite
    }
}

/// An open file. Positional I/O only: the NFS client always supplies an
/// offset, so there is no seek and no shared cursor to contend on.
pub trait File: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError>;

    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize, FsError> {
        Err(FsError::PermissionDenied)
    }
}

/// Attribute mutation, advertised only by filesystems that can honor it.
pub trait Change: Send + Sync {
    fn chmod(&self, path: &str, perm: u32) -> Result<(), FsError>;
    fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError>;
    fn set_times(&self, path: &str, atime: i64, mtime: i64) -> Result<(), FsError>;
}

/// The POSIX-ish surface every backing filesystem exposes.
///
/// Paths are relative, forward-slash-separated, with no leading slash; the
/// root is the empty string (`.` is accepted as an alias at the NFS
/// boundary). `stat` does **not** follow symlinks on the archive side:
/// the remote kernel performs its own component walk and must see
/// per-component attributes.
pub trait Filesystem: Send + Sync {
    fn capability(&self) -> Capability;

    fn stat(&self, path: &str) -> Result<FileAttr, FsError>;
    fn lstat(&self, path: &str) -> Result<FileAttr, FsError>;
    fn open(&self, path: &str) -> Result<Box<dyn File>, FsError>;
    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError>;
    fn readlink(&self, path: &str) -> Result<String, FsError>;

    fn create(&self, _path: &str) -> Result<Box<dyn File>, FsError> {
        Err(FsError::PermissionDenied)
    }

    fn mkdir_all(&self, _path: &str, _perm: u32) -> Result<(), FsError> {
        Err(FsError::PermissionDenied)
    }

    fn remove(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::PermissionDenied)
    }

    fn rename(&self, _old: &str, _new: &str) -> Result<(), FsError> {
        Err(FsError::PermissionDenied)
    }

    fn symlink(&self, _target: &str, _link: &str) -> Result<(), FsError> {
        Err(FsError::PermissionDenied)
    }

    /// The attribute-change interface, if this filesystem has one.
    fn change(&self) -> Option<&dyn Change> {
        None
    }
}

/// A writable filesystem attached beneath a path prefix.
pub struct MountPoint {
    prefix: String,
    fs: Arc<dyn Filesystem>,
}

impl MountPoint {
    pub fn new(prefix: impl Into<String>, fs: Arc<dyn Filesystem>) -> MountPoint {
        let prefix = prefix.into().trim_matches('/').to_string();
        MountPoint { prefix, fs }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Archive plus an ordered mount list. The list is fixed for the lifetime
/// of the export; the first matching mount wins.
pub struct CompositeFs {
    archive: ArchiveIndex,
    mounts: Vec<MountPoint>,
}

impl CompositeFs {
    /// Construction rejects a mount whose prefix is empty or collides with
    /// (equals, encloses, or sits beneath) an existing one.
    pub fn new(archive: ArchiveIndex, mounts: Vec<MountPoint>) -> Result<CompositeFs, FsError> {
        for (i, m) in mounts.iter().enumerate() {
            if m.prefix.is_empty() {
                return Err(FsError::Invalid);
            }
            for other in &mounts[..i] {
                if strip_prefix(&other.prefix, &m.prefix).is_some()
                    || strip_prefix(&m.prefix, &other.prefix).is_some()
                {
                    return Err(FsError::Invalid);
                }
            }
        }
        Ok(CompositeFs { archive, mounts })
    }

    pub fn archive(&self) -> &ArchiveIndex {
        &self.archive
    }

    /// First mount whose prefix covers `path`, along with the remainder
    /// relative to the mount root (empty for the mount root itself).
    fn match_mount<'a>(&'a self, path: &'a str) -> Option<(&'a MountPoint, &'a str)> {
        self.mounts
            .iter()
            .find_map(|m| strip_prefix(&m.prefix, path).map(|rest| (m, rest)))
    }

    /// Follow a chain of symlinks to its end, within the composite
    /// namespace. Fails with [`FsError::Loop`] past the hop budget, with
    /// [`FsError::Invalid`] when `path` is not a symlink at all, and with
    /// [`FsError::NotFound`] on a dangling link.
    pub fn resolvelink(&self, path: &str) -> Result<String, FsError> {
        let mut name = clean(path).to_string();
        let mut hops = 0usize;
        loop {
            if hops > MAX_LINK_HOPS {
                return Err(FsError::Loop);
            }
            match self.readlink(&name) {
                Ok(target) => {
                    hops += 1;
                    name = join_link(&name, &target);
                }
                // The walk ended at something that exists but is no link.
                Err(FsError::Invalid) if hops > 0 => return Ok(name),
                Err(e) => return Err(e),
            }
        }
    }
}

impl Filesystem for CompositeFs {
    fn capability(&self) -> Capability {
        if self.mounts.iter().any(|m| m.fs.capability().writable()) {
            Capability::ReadWrite
        } else {
            Capability::ReadOnly
        }
    }

    fn stat(&self, path: &str) -> Result<FileAttr, FsError> {
        let path = clean(path);
        debug!("composite: stat {path:?}");
        if let Some((m, rest)) = self.match_mount(path) {
            return m.fs.stat(rest);
        }
        // No resolvelink here: the client kernel walks symlinks itself.
        self.archive.stat(path)
    }

    fn lstat(&self, path: &str) -> Result<FileAttr, FsError> {
        let path = clean(path);
        debug!("composite: lstat {path:?}");
        if let Some((m, rest)) = self.match_mount(path) {
            return m.fs.lstat(rest);
        }
        self.archive.lstat(path)
    }

    fn open(&self, path: &str) -> Result<Box<dyn File>, FsError> {
        let path = clean(path);
        debug!("composite: open {path:?}");
        if let Some((m, rest)) = self.match_mount(path) {
            return m.fs.open(rest);
        }
        self.archive.open(path)
    }

    /// The root listing is the union of the archive's children and one
    /// synthetic entry per mount, named by the mount prefix. A mount whose
    /// backing root cannot be lstat'd is left out of the listing.
    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = clean(path);
        debug!("composite: readdir {path:?}");
        if let Some((m, rest)) = self.match_mount(path) {
            return m.fs.readdir(rest);
        }

        // An archive path that is itself a symlink to a directory gets
        // resolved once so the scan starts at the target.
        let attr = self.archive.lstat(path)?;
        let resolved;
        let dir = if attr.kind == FileKind::Symlink {
            resolved = self.resolvelink(path)?;
            resolved.as_str()
        } else {
            path
        };

        let mut entries = self.archive.readdir(dir)?;
        if path.is_empty() {
            for m in &self.mounts {
                match m.fs.lstat(".") {
                    Ok(attr) => entries.push(DirEntry {
                        name: m.prefix.clone(),
                        attr,
                    }),
                    Err(e) => warn!("composite: mount {:?} omitted from root listing: {e}", m.prefix),
                }
            }
        }
        Ok(entries)
    }

    fn readlink(&self, path: &str) -> Result<String, FsError> {
        let path = clean(path);
        if let Some((m, rest)) = self.match_mount(path) {
            return m.fs.readlink(rest);
        }
        self.archive.readlink(path)
    }

    fn create(&self, path: &str) -> Result<Box<dyn File>, FsError> {
        let path = clean(path);
        debug!("composite: create {path:?}");
        match self.match_mount(path) {
            Some((m, rest)) => m.fs.create(rest),
            None => Err(FsError::PermissionDenied),
        }
    }

    fn mkdir_all(&self, path: &str, perm: u32) -> Result<(), FsError> {
        let path = clean(path);
        debug!("composite: mkdir_all {path:?}");
        match self.match_mount(path) {
            Some((m, rest)) => m.fs.mkdir_all(rest, perm),
            None => Err(FsError::PermissionDenied),
        }
    }

    fn remove(&self, path: &str) -> Result<(), FsError> {
        let path = clean(path);
        debug!("composite: remove {path:?}");
        match self.match_mount(path) {
            Some((m, rest)) => m.fs.remove(rest),
            None => Err(FsError::PermissionDenied),
        }
    }

    /// Both operands must land in the same mount. There is no
    /// copy-then-delete fallback across mounts.
    fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        let old = clean(old);
        let new = clean(new);
        debug!("composite: rename {old:?} -> {new:?}");
        let Some((mo, old_rest)) = self.match_mount(old) else {
            return Err(FsError::PermissionDenied);
        };
        match self.match_mount(new) {
            Some((mn, new_rest)) if mn.prefix == mo.prefix => mo.fs.rename(old_rest, new_rest),
            _ => Err(FsError::CrossDevice),
        }
    }

    fn symlink(&self, target: &str, link: &str) -> Result<(), FsError> {
        let link = clean(link);
        debug!("composite: symlink {link:?} -> {target:?}");
        match self.match_mount(link) {
            Some((m, rest)) => m.fs.symlink(target, rest),
            None => Err(FsError::PermissionDenied),
        }
    }

    fn change(&self) -> Option<&dyn Change> {
        if self.capability().writable() {
            Some(self)
        } else {
            None
        }
    }
}

impl Change for CompositeFs {
    fn chmod(&self, path: &str, perm: u32) -> Result<(), FsError> {
        let (m, rest) = self
            .match_mount(clean(path))
            .ok_or(FsError::PermissionDenied)?;
        m.fs.change().ok_or(FsError::Unsupported)?.chmod(rest, perm)
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError> {
        let (m, rest) = self
            .match_mount(clean(path))
            .ok_or(FsError::PermissionDenied)?;
        m.fs.change().ok_or(FsError::Unsupported)?.chown(rest, uid, gid)
    }

    fn set_times(&self, path: &str, atime: i64, mtime: i64) -> Result<(), FsError> {
        let (m, rest) = self
            .match_mount(clean(path))
            .ok_or(FsError::PermissionDenied)?;
        m.fs
            .change()
            .ok_or(FsError::Unsupported)?
            .set_times(rest, atime, mtime)
    }
}

/// `path` relative to `prefix`, provided `path` is `prefix` itself or sits
/// beneath it at a component boundary (`home` does not cover `homework`).
fn strip_prefix<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    if path == prefix {
        return Some("");
    }
    path.strip_prefix(prefix)?.strip_prefix('/')
}

/// Normalize an incoming path: tolerate `.`, a leading `./`, and stray
/// slashes at either end.
fn clean(path: &str) -> &str {
    let p = path.strip_prefix("./").unwrap_or(path);
    let p = p.trim_start_matches('/').trim_end_matches('/');
    if p == "." {
        ""
    } else {
        p
    }
}

/// Join a symlink target onto the link's parent directory. An absolute
/// target is re-rooted at the top of the composite namespace.
fn join_link(link: &str, target: &str) -> String {
    if let Some(abs) = target.strip_prefix('/') {
        return normalize(abs);
    }
    match link.rfind('/') {
        Some(i) => normalize(&format!("{}/{}", &link[..i], target)),
        None => normalize(target),
    }
}

/// Lexically resolve `.` and `..` components; `..` above the root clamps
/// to the root.
fn normalize(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            c => out.push(c),
        }
    }
    out.join("/")
}
