/// Materialize archive records into a writable filesystem.
///
/// Used when the remote side wants a real on-disk copy rather than a
/// served view (e.g. seeding a scratch root). Extraction is unprivileged:
/// device nodes and IPC endpoints are skipped with a warning, and
/// ownership/permission restoration is best-effort through the target's
/// change interface.
use crate::archive::ArchiveIndex;
use crate::attr::{FileKind, MODE_PERM_MASK};
use crate::error::FsError;
use crate::vfs::Filesystem;
use log::{debug, warn};

const COPY_CHUNK: usize = 64 * 1024;

/// Unpack every record of `archive` into `target`. Parent directories the
/// archive never names are created mode 0755, since plenty of archives specify
/// whole paths without their directories.
pub fn extract(archive: &ArchiveIndex, target: &dyn Filesystem) -> Result<(), FsError> {
    for idx in 0..archive.len() {
        let rec = archive.record(idx)?.clone();
        if rec.name == "." {
            continue; // the target root already exists
        }
        let perm = rec.mode & MODE_PERM_MASK;

        debug!("extract: {} ({:?})", rec.name, rec.kind());
        match rec.kind() {
            FileKind::Dir => target.mkdir_all(&rec.name, perm)?,
            FileKind::Symlink => {
                let link_target = archive.readlink(&rec.name)?;
                ensure_parent(target, &rec.name)?;
                target.symlink(&link_target, &rec.name)?;
            }
            FileKind::Regular => {
                ensure_parent(target, &rec.name)?;
                let out = target.create(&rec.name)?;
                let mut buf = vec![0u8; COPY_CHUNK];
                let mut off = 0u64;
                loop {
                    let n = archive.read_at(idx, &mut buf, off)?;
                    if n == 0 {
                        break;
                    }
                    let mut written = 0;
                    while written < n {
                        let w = out.write_at(&buf[written..n], off + written as u64)?;
                        if w == 0 {
                            return Err(FsError::Io(std::io::Error::new(
                                std::io::ErrorKind::WriteZero,
                                "short write",
                            )));
                        }
                        written += w;
                    }
                    off += n as u64;
                }
            }
            FileKind::Fifo | FileKind::Socket => {
                warn!("extract: skipping IPC endpoint {}", rec.name);
                continue;
            }
            FileKind::CharDevice | FileKind::BlockDevice => {
                warn!("extract: skipping device node {}", rec.name);
                continue;
            }
        }

        // Symlink modes are meaningless; everything else gets its bits
        // back if the target allows it.
        if rec.kind() != FileKind::Symlink {
            if let Some(ch) = target.change() {
                if let Err(e) = ch.chmod(&rec.name, perm) {
                    debug!("extract: chmod {}: {e}", rec.name);
                }
            }
        }
    }
    Ok(())
}

fn ensure_parent(target: &dyn Filesystem, name: &str) -> Result<(), FsError> {
    if let Some(i) = name.rfind('/') {
        let parent = &name[..i];
        if target.lstat(parent).is_err() {
            target.mkdir_all(parent, 0o755)?;
        }
    }
    Ok(())
}
