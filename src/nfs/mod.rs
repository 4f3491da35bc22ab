/// Contract with the NFSv3 dispatch layer.
///
/// The wire codec and the RPC dispatcher live outside this crate; this
/// module defines the vocabulary the two sides share. The dispatcher
/// decodes MOUNT and NFS program calls and drives them into a [`Handler`]:
/// MOUNT admission goes through [`Handler::mount`], per-file operations go
/// straight at the [`Filesystem`] the successful mount returned, and
/// file-handle identity is negotiated through `to_handle`/`from_handle`
/// (which the core delegates outward; see [`HandleCache`]).
///
/// Status enums carry their protocol discriminants so a codec can emit
/// them directly.
mod cache;
mod handler;

pub use cache::HandleCache;
pub use handler::{ExportHandler, ReadOnlyFs};

use crate::error::FsError;
use crate::vfs::{Change, Filesystem};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

/// MOUNT protocol status (RFC 1813 §5.1.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MountStatus {
    Ok = 0,
    ErrPerm = 1,
    ErrNoEnt = 2,
    ErrIo = 5,
    ErrAccess = 13,
    ErrNotDir = 20,
    ErrInval = 22,
    ErrNameTooLong = 63,
    ErrNotSupp = 10004,
    ErrServerFault = 10006,
}

/// RPC authentication flavors the server admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthFlavor {
    Null = 0,
    Unix = 1,
}

/// A decoded MOUNT call. The dirpath is the raw wire string; for this
/// server it must carry the export nonce.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub dirpath: Vec<u8>,
    pub client: Option<SocketAddr>,
}

impl MountRequest {
    pub fn new(dirpath: impl Into<Vec<u8>>) -> MountRequest {
        MountRequest {
            dirpath: dirpath.into(),
            client: None,
        }
    }
}

/// Reply to a MOUNT call. `fs` is present exactly when `status` is
/// [`MountStatus::Ok`].
pub struct MountReply {
    pub status: MountStatus,
    pub fs: Option<Arc<dyn Filesystem>>,
    pub auth: Vec<AuthFlavor>,
}

impl MountReply {
    pub fn denied(status: MountStatus) -> MountReply {
        MountReply {
            status,
            fs: None,
            auth: Vec::new(),
        }
    }
}

/// FSSTAT output. Fields left at zero are simply not reported; clients
/// that need accurate free-space figures are unsupported here.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStat {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub avail_files: u64,
}

/// NFSv3 status codes this server produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NfsStat {
    Ok = 0,
    Perm = 1,
    NoEnt = 2,
    Io = 5,
    Access = 13,
    XDev = 18,
    Inval = 22,
    /// RFC 1813 defines no loop status; the historical errno-passthrough
    /// value is used.
    Loop = 62,
    NotSupp = 10004,
    ServerFault = 10006,
}

impl From<&FsError> for NfsStat {
    fn from(e: &FsError) -> NfsStat {
        match e {
            FsError::NotFound => NfsStat::NoEnt,
            FsError::Invalid | FsError::ArchiveEmpty => NfsStat::Inval,
            FsError::PermissionDenied => NfsStat::Perm,
            FsError::Loop => NfsStat::Loop,
            FsError::CrossDevice => NfsStat::XDev,
            FsError::Unsupported => NfsStat::NotSupp,
            FsError::Io(_) => NfsStat::Io,
        }
    }
}

/// The handler half of the seam: everything the dispatch layer asks of the
/// core besides plain file operations.
pub trait Handler: Send + Sync {
    /// MOUNT admission. Called once per MOUNT RPC, concurrently from any
    /// number of worker threads.
    fn mount(&self, req: &MountRequest) -> MountReply;

    /// The writable-attribute interface of an exported filesystem, if it
    /// advertises one.
    fn change<'a>(&self, fs: &'a dyn Filesystem) -> Option<&'a dyn Change>;

    /// Fill in filesystem statistics. Leaving `out` untouched is a valid,
    /// honest answer.
    fn fs_stat(&self, fs: &Arc<dyn Filesystem>, out: &mut FsStat) -> Result<(), FsError>;

    /// Encode a path into an opaque file handle. An empty result delegates
    /// handle identity to the caching layer.
    fn to_handle(&self, fs: &Arc<dyn Filesystem>, path: &[String]) -> Vec<u8>;

    /// Decode an opaque handle back to a filesystem and path. `None`
    /// delegates to the caching layer.
    fn from_handle(&self, handle: &[u8]) -> Option<(Arc<dyn Filesystem>, Vec<String>)>;

    /// Upper bound on retained handles; -1 leaves the choice to the
    /// caching layer.
    fn handle_limit(&self) -> i64;
}

/// The wire half of the seam: an NFSv3/MOUNT codec that decodes RPCs from
/// one connection and drives them into the handler until the peer hangs
/// up. Implementations live outside this crate.
pub trait Dispatcher: Send + Sync {
    fn serve_conn(&self, conn: TcpStream, handler: Arc<dyn Handler>) -> io::Result<()>;
}
