/// MOUNT admission and the read-only export wrapper.
use super::{AuthFlavor, FsStat, Handler, MountReply, MountRequest, MountStatus};
use crate::attr::{DirEntry, FileAttr};
use crate::error::FsError;
use crate::vfs::{Capability, Change, File, Filesystem};
use log::debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// The nonce-gated, one-shot export handler.
///
/// Exactly one MOUNT may ever succeed. The counter advances on every
/// call, so a first attempt with the wrong nonce burns the one allowed
/// mount. That is the admission defense: even a failed probe closes the
/// door.
pub struct ExportHandler {
    fs: Arc<dyn Filesystem>,
    nonce: String,
    mounts: AtomicU32,
}

impl ExportHandler {
    pub fn new(fs: Arc<dyn Filesystem>, nonce: impl Into<String>) -> ExportHandler {
        ExportHandler {
            fs,
            nonce: nonce.into(),
            mounts: AtomicU32::new(0),
        }
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }
}

impl Handler for ExportHandler {
    fn mount(&self, req: &MountRequest) -> MountReply {
        // "Give me a ping, Vasili. One ping only, please."
        let count = self.mounts.fetch_add(1, Ordering::SeqCst) + 1;
        if count > 1 {
            return MountReply::denied(MountStatus::ErrPerm);
        }
        if req.dirpath != self.nonce.as_bytes() {
            debug!("mount: dirpath does not match the export nonce");
            return MountReply::denied(MountStatus::ErrNoEnt);
        }
        debug!("mount: accepted (client {:?})", req.client);
        MountReply {
            status: MountStatus::Ok,
            fs: Some(self.fs.clone()),
            auth: vec![AuthFlavor::Null],
        }
    }

    fn change<'a>(&self, fs: &'a dyn Filesystem) -> Option<&'a dyn Change> {
        fs.change()
    }

    /// Free space is not meaningfully reportable for this export; the
    /// fields stay unset.
    fn fs_stat(&self, _fs: &Arc<dyn Filesystem>, _out: &mut FsStat) -> Result<(), FsError> {
        Ok(())
    }

    // Handle identity belongs to the caching layer.
    fn to_handle(&self, _fs: &Arc<dyn Filesystem>, _path: &[String]) -> Vec<u8> {
        Vec::new()
    }

    fn from_handle(&self, _handle: &[u8]) -> Option<(Arc<dyn Filesystem>, Vec<String>)> {
        None
    }

    fn handle_limit(&self) -> i64 {
        -1
    }
}

/// Caps a filesystem to read-only without touching the filesystem itself.
///
/// Applied when the export carries no writable mount: the advertised
/// capability keeps the dispatch layer from ever routing writes or
/// attribute changes this way. Write methods fall through to the trait's
/// permission-denied defaults.
pub struct ReadOnlyFs {
    inner: Arc<dyn Filesystem>,
}

impl ReadOnlyFs {
    pub fn new(inner: Arc<dyn Filesystem>) -> ReadOnlyFs {
        ReadOnlyFs { inner }
    }
}

impl Filesystem for ReadOnlyFs {
    fn capability(&self) -> Capability {
        Capability::ReadOnly
    }

    fn stat(&self, path: &str) -> Result<FileAttr, FsError> {
        self.inner.stat(path)
    }

    fn lstat(&self, path: &str) -> Result<FileAttr, FsError> {
        self.inner.lstat(path)
    }

    fn open(&self, path: &str) -> Result<Box<dyn File>, FsError> {
        Ok(Box::new(ReadOnlyFile(self.inner.open(path)?)))
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        self.inner.readdir(path)
    }

    fn readlink(&self, path: &str) -> Result<String, FsError> {
        self.inner.readlink(path)
    }
}

struct ReadOnlyFile(Box<dyn File>);

impl File for ReadOnlyFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        self.0.read_at(buf, offset)
    }
}
