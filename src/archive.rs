/// In-memory index over a CPIO "newc" archive.
///
/// The archive is decoded once at startup into a vector of records (kept in
/// archive order) plus a name→index map. Payloads are never copied out:
/// reads are served positionally from a read-only mmap of the archive file,
/// so concurrent readers share no cursor. A gzip-compressed archive
/// (`.cpio.gz`, detected by magic) is inflated into memory instead and
/// served from the buffer.
///
/// Record 0 is the archive root (a directory, conventionally named `.`).
/// Hard links are not reconstructed: inode numbers in the wild are
/// unreliable (reproducible builds write 0 for every record).
use crate::attr::{DirEntry, FileAttr, FileKind, MODE_PERM_MASK};
use crate::error::FsError;
use crate::vfs::{Capability, File, Filesystem};
use flate2::read::GzDecoder;
use log::debug;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

const NEWC_MAGIC: &[u8] = b"070701";
const NEWC_HEADER_LEN: usize = 110;
const TRAILER_NAME: &str = "TRAILER!!!";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A single archive member. Immutable after load.
#[derive(Debug, Clone)]
pub struct Record {
    /// Full slash-separated path, relative, no leading `/`.
    pub name: String,
    /// Raw Unix mode word (type + permission bits).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    /// Payload length in bytes. For a symlink this is the target length.
    pub size: u64,
    /// Byte offset of the payload within the (decompressed) archive.
    pub offset: u64,
}

impl Record {
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    pub fn attr(&self) -> FileAttr {
        FileAttr {
            kind: self.kind(),
            perm: self.mode & MODE_PERM_MASK,
            size: self.size,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            mtime: 0,
        }
    }

    /// Final path component.
    pub fn base_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

enum Backing {
    Mapped(Mmap),
    Buffered(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(m) => m,
            Backing::Buffered(v) => v,
        }
    }
}

struct Inner {
    backing: Backing,
    recs: Vec<Record>,
    index: HashMap<String, usize>,
}

/// Read-only filesystem view of a newc archive. Cheap to clone; all clones
/// share the same mapping and record vector.
#[derive(Clone)]
pub struct ArchiveIndex {
    inner: Arc<Inner>,
}

impl ArchiveIndex {
    /// Open and fully index an archive file. Fails with
    /// [`FsError::ArchiveEmpty`] when the archive holds no records and
    /// [`FsError::Invalid`] on a malformed header.
    pub fn open(path: &Path) -> Result<ArchiveIndex, FsError> {
        let file = fs::File::open(path)?;

        let mut magic = [0u8; 2];
        let n = file.read_at(&mut magic, 0)?;
        let backing = if n == 2 && magic == GZIP_MAGIC {
            let mut buf = Vec::new();
            GzDecoder::new(&file).read_to_end(&mut buf)?;
            Backing::Buffered(buf)
        } else {
            // Safety: the archive is opened read-only and never truncated
            // while mapped.
            Backing::Mapped(unsafe { Mmap::map(&file)? })
        };

        let recs = parse_newc(backing.bytes())?;
        if recs.is_empty() {
            return Err(FsError::ArchiveEmpty);
        }

        let mut index = HashMap::with_capacity(recs.len());
        for (i, r) in recs.iter().enumerate() {
            index.insert(r.name.clone(), i);
        }

        debug!("archive: {} records from {}", recs.len(), path.display());
        Ok(ArchiveIndex {
            inner: Arc::new(Inner { backing, recs, index }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.recs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.recs.is_empty()
    }

    /// Bounds-checked record access.
    pub fn record(&self, index: usize) -> Result<&Record, FsError> {
        self.inner.recs.get(index).ok_or(FsError::NotFound)
    }

    /// Resolve a path to its record index. The empty path (and `.`) is the
    /// archive root, record 0.
    pub fn lookup(&self, path: &str) -> Result<usize, FsError> {
        if path.is_empty() || path == "." {
            return Ok(0);
        }
        self.inner.index.get(path).copied().ok_or(FsError::NotFound)
    }

    /// Positional payload read. Returns the number of bytes copied, which
    /// is short when `offset + buf.len()` runs past end-of-payload.
    pub fn read_at(&self, index: usize, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        let rec = self.record(index)?;
        if offset >= rec.size {
            return Ok(0);
        }
        let n = ((rec.size - offset) as usize).min(buf.len());
        let start = (rec.offset + offset) as usize;
        buf[..n].copy_from_slice(&self.inner.backing.bytes()[start..start + n]);
        Ok(n)
    }

    fn payload(&self, index: usize) -> Result<&[u8], FsError> {
        let rec = self.record(index)?;
        let start = rec.offset as usize;
        Ok(&self.inner.backing.bytes()[start..start + rec.size as usize])
    }

    fn readlink_at(&self, index: usize) -> Result<String, FsError> {
        let rec = self.record(index)?;
        if rec.kind() != FileKind::Symlink {
            return Err(FsError::Invalid);
        }
        Ok(String::from_utf8_lossy(self.payload(index)?).into_owned())
    }

    /// Enumerate the direct children of a directory by scanning forward
    /// from the directory's own record. Children need not be contiguous:
    /// deeper descendants and unrelated names are skipped rather than
    /// terminating the scan. `.` and `..` are omitted.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let idx = self.lookup(path)?;
        let dir_name = self.inner.recs[idx].name.clone();
        let mut out = Vec::new();
        for rec in &self.inner.recs[idx + 1..] {
            if let Some(base) = direct_child(&dir_name, &rec.name) {
                out.push(DirEntry {
                    name: base.to_string(),
                    attr: rec.attr(),
                });
            }
        }
        Ok(out)
    }
}

impl Filesystem for ArchiveIndex {
    fn capability(&self) -> Capability {
        Capability::ReadOnly
    }

    /// Does not follow symlinks: the remote kernel walks path components
    /// itself and expects per-component attributes.
    fn stat(&self, path: &str) -> Result<FileAttr, FsError> {
        let idx = self.lookup(path)?;
        Ok(self.inner.recs[idx].attr())
    }

    fn lstat(&self, path: &str) -> Result<FileAttr, FsError> {
        self.stat(path)
    }

    fn open(&self, path: &str) -> Result<Box<dyn File>, FsError> {
        let index = self.lookup(path)?;
        Ok(Box::new(ArchiveFile {
            archive: self.clone(),
            index,
        }))
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        ArchiveIndex::readdir(self, path)
    }

    fn readlink(&self, path: &str) -> Result<String, FsError> {
        let index = self.lookup(path)?;
        self.readlink_at(index)
    }
}

/// An open archive member. Positional reads only; the write side falls
/// through to the trait's permission-denied defaults.
struct ArchiveFile {
    archive: ArchiveIndex,
    index: usize,
}

impl File for ArchiveFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        self.archive.read_at(self.index, buf, offset)
    }
}

/// If `name` names a direct child of directory `dir`, return its final
/// component. `dir` is `.` or `""` for the archive root.
fn direct_child<'a>(dir: &str, name: &'a str) -> Option<&'a str> {
    let rest = if dir.is_empty() || dir == "." {
        name
    } else {
        name.strip_prefix(dir)?.strip_prefix('/')?
    };
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn hex_field(bytes: &[u8]) -> Result<u32, FsError> {
    let s = std::str::from_utf8(bytes).map_err(|_| FsError::Invalid)?;
    u32::from_str_radix(s, 16).map_err(|_| FsError::Invalid)
}

/// Decode newc records up to the trailer. Header layout: 6-byte magic
/// `070701`, then 13 fields of 8 ASCII-hex chars (ino, mode, uid, gid,
/// nlink, mtime, filesize, devmajor, devminor, rdevmajor, rdevminor,
/// namesize, check); the name (NUL included in namesize) and the payload
/// are each padded to a 4-byte boundary.
fn parse_newc(data: &[u8]) -> Result<Vec<Record>, FsError> {
    let mut recs = Vec::new();
    let mut pos = 0usize;

    while pos + NEWC_HEADER_LEN <= data.len() {
        let header = &data[pos..pos + NEWC_HEADER_LEN];
        if &header[..6] != NEWC_MAGIC {
            return Err(FsError::Invalid);
        }

        let mode = hex_field(&header[14..22])?;
        let uid = hex_field(&header[22..30])?;
        let gid = hex_field(&header[30..38])?;
        let nlink = hex_field(&header[38..46])?;
        let filesize = hex_field(&header[54..62])? as usize;
        let namesize = hex_field(&header[94..102])? as usize;
        if namesize == 0 {
            return Err(FsError::Invalid);
        }

        let name_start = pos + NEWC_HEADER_LEN;
        let name_end = name_start + namesize;
        if name_end > data.len() {
            return Err(FsError::Invalid);
        }
        // namesize counts the trailing NUL
        let name = std::str::from_utf8(&data[name_start..name_end - 1])
            .map_err(|_| FsError::Invalid)?
            .to_string();

        if name == TRAILER_NAME {
            break;
        }

        let data_start = align4(name_end);
        let data_end = data_start + filesize;
        if data_end > data.len() {
            return Err(FsError::Invalid);
        }

        recs.push(Record {
            name,
            mode,
            uid,
            gid,
            nlink,
            size: filesize as u64,
            offset: data_start as u64,
        });
        pos = align4(data_end);
    }

    Ok(recs)
}

#[cfg(test)]
pub(crate) mod testdata {
    //! Fixture archive shared by tests across the crate.
    use super::ArchiveIndex;
    use std::io::Write;

    /// Append one newc entry; the inverse of the parser above.
    pub(crate) fn write_entry(archive: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
        let namesize = name.len() + 1;
        let header = format!(
            "070701{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}{:08X}",
            1u32,       // ino (meaningless, see module docs)
            mode,
            0u32,       // uid
            0u32,       // gid
            1u32,       // nlink
            0u32,       // mtime
            data.len(), // filesize
            0u32,       // devmajor
            0u32,       // devminor
            0u32,       // rdevmajor
            0u32,       // rdevminor
            namesize,
            0u32, // check (always 0 for newc)
        );
        assert_eq!(header.len(), 110);
        archive.extend_from_slice(header.as_bytes());
        archive.extend_from_slice(name.as_bytes());
        archive.push(0);
        let pad = (4 - (110 + namesize) % 4) % 4;
        archive.extend(std::iter::repeat(0u8).take(pad));
        archive.extend_from_slice(data);
        let pad = (4 - data.len() % 4) % 4;
        archive.extend(std::iter::repeat(0u8).take(pad));
    }

    pub(crate) const HOSTS: &[u8] = b"127.0.0.1 localhost\n";
    pub(crate) const LIB_B: &[u8] = b"library\n";

    /// Directory tree:
    /// `a/b/c/d/hosts` (file), `a/b/hosts -> c/d/hosts`, self-looping
    /// `a/b/22 -> 22`, device nodes under `dev/`, `etc/`, `lib/b` (file),
    /// `usr -> a`.
    pub(crate) fn sample_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        write_entry(&mut buf, ".", 0o040755, &[]);
        write_entry(&mut buf, "a", 0o040755, &[]);
        write_entry(&mut buf, "a/b", 0o040755, &[]);
        write_entry(&mut buf, "a/b/22", 0o120777, b"22");
        write_entry(&mut buf, "a/b/c", 0o040755, &[]);
        write_entry(&mut buf, "a/b/c/d", 0o040755, &[]);
        write_entry(&mut buf, "a/b/c/d/hosts", 0o100644, HOSTS);
        write_entry(&mut buf, "a/b/hosts", 0o120777, b"c/d/hosts");
        write_entry(&mut buf, "dev", 0o040755, &[]);
        write_entry(&mut buf, "dev/null", 0o020666, &[]);
        write_entry(&mut buf, "dev/pipe", 0o010644, &[]);
        write_entry(&mut buf, "dev/sda", 0o060660, &[]);
        write_entry(&mut buf, "etc", 0o040755, &[]);
        write_entry(&mut buf, "lib", 0o040755, &[]);
        write_entry(&mut buf, "lib/b", 0o100644, LIB_B);
        write_entry(&mut buf, "usr", 0o120777, b"a");
        write_entry(&mut buf, "TRAILER!!!", 0, &[]);
        buf
    }

    pub(crate) fn sample_index() -> ArchiveIndex {
        index_from(&sample_bytes())
    }

    /// Write bytes to a temp file and open them; the mapping stays valid
    /// after the path is unlinked.
    pub(crate) fn index_from(bytes: &[u8]) -> ArchiveIndex {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(bytes).unwrap();
        tmp.flush().unwrap();
        ArchiveIndex::open(tmp.path()).unwrap()
    }
}
