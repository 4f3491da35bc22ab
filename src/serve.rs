/// Export assembly and the serve loop.
///
/// The caller brings a pre-bound loopback listener (usually an ephemeral
/// port forwarded through the SSH session) and an archive; this module
/// wires up the composite filesystem, the nonce-gated handler, and the
/// handle cache, and produces the fstab fragment the remote side needs to
/// mount the export.
use crate::archive::ArchiveIndex;
use crate::local::LocalFs;
use crate::nfs::{Dispatcher, ExportHandler, Handler, HandleCache, ReadOnlyFs};
use crate::vfs::{CompositeFs, Filesystem, MountPoint};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::io;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

/// Handles retained by the cache before eviction sets in.
pub const HANDLE_CACHE_SIZE: usize = 1024;

/// Environment variable carrying fstab lines to the spawned remote
/// process.
pub const FSTAB_ENV: &str = "CPU_FSTAB";

/// Where the remote mounts the export.
const REMOTE_MOUNTPOINT: &str = "/tmp/cpu";

/// A fully assembled NFS export: listener, handler chain, and the fstab
/// line a remote client mounts it with.
pub struct Export {
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    fstab: String,
    port: u16,
}

impl Export {
    /// Build an export from an archive plus at most one host directory to
    /// union-mount. `overlay` must be absolute; it appears in the
    /// namespace at its path relative to `/` and makes the export
    /// read-write. With no overlay the archive is exported read-only.
    pub fn new(
        listener: TcpListener,
        archive_path: &Path,
        overlay: Option<&Path>,
    ) -> Result<Export> {
        let archive = ArchiveIndex::open(archive_path)
            .with_context(|| format!("opening archive {}", archive_path.display()))?;

        let mut mounts = Vec::new();
        if let Some(dir) = overlay {
            let prefix = dir
                .strip_prefix("/")
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
                .with_context(|| format!("overlay directory {} must be absolute", dir.display()))?;
            debug!("export: mounting {} at {prefix:?}", dir.display());
            mounts.push(MountPoint::new(prefix, Arc::new(LocalFs::new(dir))));
        }

        let composite = CompositeFs::new(archive, mounts).context("assembling composite")?;
        let writable = composite.capability().writable();
        let fs: Arc<dyn Filesystem> = if writable {
            Arc::new(composite)
        } else {
            Arc::new(ReadOnlyFs::new(Arc::new(composite)))
        };

        let nonce = Uuid::new_v4().to_string();
        let handler = Arc::new(HandleCache::new(
            Arc::new(ExportHandler::new(fs, nonce.clone())),
            HANDLE_CACHE_SIZE,
        ));

        let port = listener.local_addr().context("reading listener address")?.port();
        let fstab = fstab_line(&nonce, port, writable);
        info!("nfs export ready on port {port}");

        Ok(Export {
            listener,
            handler,
            fstab,
            port,
        })
    }

    /// The fstab line for the remote's `CPU_FSTAB`.
    pub fn fstab(&self) -> &str {
        &self.fstab
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }

    /// Accept connections forever, one worker thread per connection,
    /// handing each to the dispatcher. Returns only when accept fails.
    pub fn serve(&self, dispatcher: Arc<dyn Dispatcher>) -> io::Result<()> {
        loop {
            let (conn, peer) = self.listener.accept()?;
            debug!("nfs: connection from {peer}");
            let handler = self.handler.clone();
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                if let Err(e) = dispatcher.serve_conn(conn, handler) {
                    warn!("nfs: connection ended: {e}");
                }
            });
        }
    }
}

/// Bind an ephemeral loopback listener. IPv4 is preferred: the remote end
/// may lack it, but so may we; fall back to [::1] rather than fail.
pub fn bind_loopback() -> io::Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", 0)).or_else(|_| TcpListener::bind(("::1", 0)))
}

/// The mount description the remote kernel consumes, newline-terminated.
/// The nonce rides in the device field: it becomes the MOUNT dirpath.
pub fn fstab_line(nonce: &str, port: u16, writable: bool) -> String {
    let mode = if writable { "rw" } else { "ro" };
    format!(
        "127.0.0.1:{nonce} {REMOTE_MOUNTPOINT} nfs \
         {mode},relatime,vers=3,rsize=1048576,wsize=1048576,namlen=255,hard,nolock,\
         proto=tcp,port={port},timeo=600,retrans=2,sec=sys,mountaddr=127.0.0.1,\
         mountvers=3,mountport={port},mountproto=tcp,local_lock=all,addr=127.0.0.1 0 0\n"
    )
}

/// Compose a `CPU_FSTAB` value: the new line first, any existing content
/// preserved after it.
pub fn fstab_env(line: &str, existing: Option<&str>) -> String {
    match existing {
        Some(old) if !old.is_empty() => format!("{line}{old}"),
        _ => line.to_string(),
    }
}

/// Render a colon-separated list of directories as bind-mount fstab lines,
/// sourced from under the remote mountpoint.
pub fn bind_fstab(namespace: &str) -> String {
    let mut out = String::new();
    for ent in namespace.split(':').filter(|e| !e.is_empty()) {
        let under = format!("{REMOTE_MOUNTPOINT}/{}", ent.trim_start_matches('/'));
        out.push_str(&format!("{under} {ent} none defaults,bind 0 0\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::testdata::sample_bytes;
    use crate::nfs::{MountRequest, MountStatus};
    use std::io::Write;
    use std::net::TcpStream;
    use std::sync::mpsc;

    fn logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn archive_file() -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&sample_bytes()).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    /// Pull the nonce back out of the fstab device field.
    fn nonce_of(fstab: &str) -> String {
        let device = fstab.split_whitespace().next().unwrap();
        device.strip_prefix("127.0.0.1:").unwrap().to_string()
    }

    #[test]
    fn read_only_export() {
        logs();
        let tmp = archive_file();
        let export = Export::new(bind_loopback().unwrap(), tmp.path(), None).unwrap();

        let port = export.port();
        assert!(port != 0);
        let fstab = export.fstab();
        assert!(fstab.contains(" /tmp/cpu nfs ro,relatime,"));
        assert!(fstab.contains(&format!("port={port},")));
        assert!(fstab.contains(&format!("mountport={port},")));
        assert!(fstab.ends_with(" 0 0\n"));

        // the admitted filesystem refuses writes
        let reply = export.handler().mount(&MountRequest::new(nonce_of(fstab)));
        assert_eq!(reply.status, MountStatus::Ok);
        let fs = reply.fs.unwrap();
        assert!(fs.create("x").is_err());
        assert!(fs.stat("a/b/c/d/hosts").is_ok());
    }

    #[test]
    fn writable_export_with_overlay() {
        let tmp = archive_file();
        let dir = tempfile::tempdir().unwrap();
        let export = Export::new(bind_loopback().unwrap(), tmp.path(), Some(dir.path())).unwrap();
        assert!(export.fstab().contains(" nfs rw,relatime,"));

        let reply = export.handler().mount(&MountRequest::new(nonce_of(export.fstab())));
        assert_eq!(reply.status, MountStatus::Ok);
        let fs = reply.fs.unwrap();

        // the overlay shows up at its path relative to /
        let prefix = dir.path().to_string_lossy();
        let prefix = prefix.trim_start_matches('/');
        fs.mkdir_all(&format!("{prefix}/made/here"), 0o755).unwrap();
        assert!(dir.path().join("made/here").is_dir());
    }

    #[test]
    fn relative_overlay_rejected() {
        let tmp = archive_file();
        assert!(Export::new(
            bind_loopback().unwrap(),
            tmp.path(),
            Some(Path::new("relative/dir"))
        )
        .is_err());
    }

    #[test]
    fn second_mount_refused_through_the_whole_chain() {
        let tmp = archive_file();
        let export = Export::new(bind_loopback().unwrap(), tmp.path(), None).unwrap();
        let nonce = nonce_of(export.fstab());
        let h = export.handler();
        assert_eq!(h.mount(&MountRequest::new(nonce.clone())).status, MountStatus::Ok);
        assert_eq!(h.mount(&MountRequest::new(nonce)).status, MountStatus::ErrPerm);
    }

    #[test]
    fn fstab_env_prepends() {
        assert_eq!(fstab_env("new line\n", None), "new line\n");
        assert_eq!(fstab_env("new line\n", Some("")), "new line\n");
        assert_eq!(
            fstab_env("new line\n", Some("old line\n")),
            "new line\nold line\n"
        );
    }

    #[test]
    fn bind_fstab_lines() {
        assert_eq!(
            bind_fstab("/home:/usr"),
            "/tmp/cpu/home /home none defaults,bind 0 0\n\
             /tmp/cpu/usr /usr none defaults,bind 0 0\n"
        );
        assert_eq!(bind_fstab(""), "");
    }

    #[test]
    fn serve_hands_connections_to_the_dispatcher() {
        struct Probe(mpsc::Sender<()>);
        impl Dispatcher for Probe {
            fn serve_conn(&self, _conn: TcpStream, _h: Arc<dyn Handler>) -> io::Result<()> {
                self.0.send(()).ok();
                Ok(())
            }
        }

        let tmp = archive_file();
        let export = Export::new(bind_loopback().unwrap(), tmp.path(), None).unwrap();
        let addr = format!("127.0.0.1:{}", export.port());

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = export.serve(Arc::new(Probe(tx)));
        });

        let _conn = TcpStream::connect(&addr).unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("dispatcher saw the connection");
    }
}
