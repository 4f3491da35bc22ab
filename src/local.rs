/// Writable passthrough to a host directory.
///
/// Every contract operation forwards one-to-one to the OS filesystem,
/// rooted at the directory given at construction. This is the sole write
/// path of the composite. Paths handed in are relative; `..` components
/// are refused so a client cannot walk out of the root.
use crate::attr::{DirEntry, FileAttr};
use crate::error::FsError;
use crate::vfs::{Capability, Change, File, Filesystem};
use log::debug;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> LocalFs {
        LocalFs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &str) -> Result<PathBuf, FsError> {
        let path = path.trim_matches('/');
        if path.split('/').any(|c| c == "..") {
            return Err(FsError::Invalid);
        }
        if path.is_empty() || path == "." {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(path))
        }
    }
}

impl Filesystem for LocalFs {
    fn capability(&self) -> Capability {
        Capability::ReadWrite
    }

    fn stat(&self, path: &str) -> Result<FileAttr, FsError> {
        let meta = fs::metadata(self.full(path)?)?;
        Ok(FileAttr::from_metadata(&meta))
    }

    fn lstat(&self, path: &str) -> Result<FileAttr, FsError> {
        let meta = fs::symlink_metadata(self.full(path)?)?;
        Ok(FileAttr::from_metadata(&meta))
    }

    fn open(&self, path: &str) -> Result<Box<dyn File>, FsError> {
        let f = fs::File::open(self.full(path)?)?;
        Ok(Box::new(LocalFile(f)))
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.full(path)?)? {
            let entry = entry?;
            // DirEntry::metadata does not traverse symlinks, which is what
            // the per-component walk wants.
            let meta = entry.metadata()?;
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                attr: FileAttr::from_metadata(&meta),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn readlink(&self, path: &str) -> Result<String, FsError> {
        let target = fs::read_link(self.full(path)?).map_err(|e| {
            // ENOENT from a present non-link comes back as EINVAL
            if e.raw_os_error() == Some(22) {
                FsError::Invalid
            } else {
                FsError::from(e)
            }
        })?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn create(&self, path: &str) -> Result<Box<dyn File>, FsError> {
        debug!("local: create {path:?}");
        let f = fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.full(path)?)?;
        Ok(Box::new(LocalFile(f)))
    }

    fn mkdir_all(&self, path: &str, perm: u32) -> Result<(), FsError> {
        debug!("local: mkdir_all {path:?}");
        fs::DirBuilder::new()
            .recursive(true)
            .mode(perm)
            .create(self.full(path)?)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), FsError> {
        debug!("local: remove {path:?}");
        let full = self.full(path)?;
        if fs::symlink_metadata(&full)?.is_dir() {
            fs::remove_dir(full)?;
        } else {
            fs::remove_file(full)?;
        }
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> Result<(), FsError> {
        debug!("local: rename {old:?} -> {new:?}");
        fs::rename(self.full(old)?, self.full(new)?)?;
        Ok(())
    }

    fn symlink(&self, target: &str, link: &str) -> Result<(), FsError> {
        debug!("local: symlink {link:?} -> {target:?}");
        std::os::unix::fs::symlink(target, self.full(link)?)?;
        Ok(())
    }

    fn change(&self) -> Option<&dyn Change> {
        Some(self)
    }
}

impl Change for LocalFs {
    fn chmod(&self, path: &str, perm: u32) -> Result<(), FsError> {
        fs::set_permissions(self.full(path)?, fs::Permissions::from_mode(perm))?;
        Ok(())
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), FsError> {
        std::os::unix::fs::chown(self.full(path)?, Some(uid), Some(gid))?;
        Ok(())
    }

    fn set_times(&self, path: &str, atime: i64, mtime: i64) -> Result<(), FsError> {
        let f = fs::File::open(self.full(path)?)?;
        let times = fs::FileTimes::new()
            .set_accessed(epoch_time(atime))
            .set_modified(epoch_time(mtime));
        f.set_times(times)?;
        Ok(())
    }
}

fn epoch_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

struct LocalFile(fs::File);

impl File for LocalFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        Ok(self.0.read_at(buf, offset)?)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        Ok(self.0.write_at(buf, offset)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::FileKind;
    use std::io::Write;

    fn fixture() -> (LocalFs, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (LocalFs::new(dir.path()), dir)
    }

    #[test]
    fn create_write_read_roundtrip() {
        let (fs, dir) = fixture();
        let f = fs.create("greeting").unwrap();
        assert_eq!(f.write_at(b"hello, world", 0).unwrap(), 12);
        drop(f);

        let f = fs.open("greeting").unwrap();
        let mut buf = [0u8; 32];
        let n = f.read_at(&mut buf, 7).unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(fs.stat("greeting").unwrap().size, 12);
        assert!(dir.path().join("greeting").is_file());
    }

    #[test]
    fn mkdir_all_and_readdir() {
        let (fs, _dir) = fixture();
        fs.mkdir_all("x/y/z", 0o755).unwrap();
        let mut out = std::fs::File::create(_dir.path().join("x/file")).unwrap();
        out.write_all(b"f").unwrap();

        let names: Vec<_> = fs
            .readdir("x")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["file", "y"]);
        assert!(fs.stat("x/y/z").unwrap().is_dir());
    }

    #[test]
    fn symlinks_lstat_versus_stat() {
        let (fs, _dir) = fixture();
        drop(fs.create("target").unwrap());
        fs.symlink("target", "link").unwrap();

        assert_eq!(fs.lstat("link").unwrap().kind, FileKind::Symlink);
        assert_eq!(fs.stat("link").unwrap().kind, FileKind::Regular);
        assert_eq!(fs.readlink("link").unwrap(), "target");
        assert!(matches!(fs.readlink("target"), Err(FsError::Invalid)));
    }

    #[test]
    fn remove_file_and_dir() {
        let (fs, dir) = fixture();
        drop(fs.create("f").unwrap());
        fs.mkdir_all("d", 0o755).unwrap();
        fs.remove("f").unwrap();
        fs.remove("d").unwrap();
        assert!(!dir.path().join("f").exists());
        assert!(!dir.path().join("d").exists());
        assert!(matches!(fs.remove("f"), Err(FsError::NotFound)));
    }

    #[test]
    fn rename_within_root() {
        let (fs, dir) = fixture();
        drop(fs.create("before").unwrap());
        fs.rename("before", "after").unwrap();
        assert!(dir.path().join("after").exists());
    }

    #[test]
    fn parent_escape_refused() {
        let (fs, _dir) = fixture();
        assert!(matches!(fs.stat("../outside"), Err(FsError::Invalid)));
        assert!(matches!(fs.create("a/../../x"), Err(FsError::Invalid)));
    }

    #[test]
    fn chmod_through_change() {
        let (fs, _dir) = fixture();
        drop(fs.create("f").unwrap());
        let ch = fs.change().unwrap();
        ch.chmod("f", 0o640).unwrap();
        assert_eq!(fs.stat("f").unwrap().perm, 0o640);
        ch.set_times("f", 5, 7).unwrap();
        assert_eq!(fs.stat("f").unwrap().mtime, 7);
    }
}
