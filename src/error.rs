/// Error kinds of the filesystem contract.
///
/// Every operation on a [`Filesystem`](crate::vfs::Filesystem) surfaces one
/// of these; the NFS boundary maps them onto protocol status codes (see
/// [`NfsStat`](crate::nfs::NfsStat)).
use std::io;
use thiserror::Error;

/// EXDEV, identical on Linux and the BSDs.
const EXDEV: i32 = 18;

#[derive(Debug, Error)]
pub enum FsError {
    /// Name absent from the archive index, no mount matches, or the
    /// backing filesystem reported ENOENT.
    #[error("not found")]
    NotFound,

    /// Readlink on a non-symlink, a malformed archive, or a path the
    /// contract does not admit.
    #[error("invalid argument")]
    Invalid,

    /// A write-side operation against an archive-backed path, or an
    /// operation the backing filesystem refused.
    #[error("permission denied")]
    PermissionDenied,

    /// Symlink resolution exceeded the hop budget.
    #[error("too many levels of symbolic links")]
    Loop,

    /// Rename with operands in distinct mounts.
    #[error("cross-device rename")]
    CrossDevice,

    /// The filesystem does not implement this operation at all.
    #[error("operation not supported")]
    Unsupported,

    /// The CPIO archive decoded to zero records.
    #[error("archive contains no records")]
    ArchiveEmpty,

    #[error("i/o error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => FsError::NotFound,
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
            _ if e.raw_os_error() == Some(EXDEV) => FsError::CrossDevice,
            _ => FsError::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_classification() {
        let e: FsError = io::Error::from(io::ErrorKind::NotFound).into();
        assert!(matches!(e, FsError::NotFound));

        let e: FsError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(e, FsError::PermissionDenied));

        let e: FsError = io::Error::from_raw_os_error(EXDEV).into();
        assert!(matches!(e, FsError::CrossDevice));

        let e: FsError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(e, FsError::Io(_)));
    }
}
