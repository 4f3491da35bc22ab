/// File-handle identity for handlers that delegate handle ownership
/// outward.
///
/// NFSv3 handles must stay valid across RPCs, but the core deliberately
/// carries no file-identity state (`to_handle` returns an empty string).
/// This wrapper supplies the identity: an 8-byte handle per distinct path
/// vector, kept in a bounded least-recently-used table. A handle evicted
/// under pressure simply stops resolving; the client then re-walks the
/// path, which NFS clients do anyway on stale handles.
use super::{FsStat, Handler, MountReply, MountRequest};
use crate::error::FsError;
use crate::vfs::{Change, Filesystem};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct HandleCache {
    inner: Arc<dyn Handler>,
    limit: usize,
    state: Mutex<CacheState>,
}

struct CacheState {
    next_id: u64,
    by_id: HashMap<u64, Entry>,
    by_key: HashMap<String, u64>,
    /// Ids in access order, least recent first. Handle counts stay small
    /// (the limit is ~1k), so linear maintenance is fine.
    order: Vec<u64>,
}

struct Entry {
    fs: Arc<dyn Filesystem>,
    path: Vec<String>,
    key: String,
}

impl HandleCache {
    pub fn new(inner: Arc<dyn Handler>, limit: usize) -> HandleCache {
        HandleCache {
            inner,
            limit: limit.max(1),
            state: Mutex::new(CacheState {
                next_id: 1,
                by_id: HashMap::new(),
                by_key: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// A poisoned lock only means some thread died mid-update; the table
    /// itself stays usable.
    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.state().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheState {
    fn touch(&mut self, id: u64) {
        if let Some(pos) = self.order.iter().position(|&x| x == id) {
            self.order.remove(pos);
        }
        self.order.push(id);
    }

    fn evict_to(&mut self, limit: usize) {
        while self.by_id.len() > limit {
            let oldest = self.order.remove(0);
            if let Some(entry) = self.by_id.remove(&oldest) {
                debug!("handle cache: evicting {:?}", entry.key);
                self.by_key.remove(&entry.key);
            }
        }
    }
}

impl Handler for HandleCache {
    fn mount(&self, req: &MountRequest) -> MountReply {
        self.inner.mount(req)
    }

    fn change<'a>(&self, fs: &'a dyn Filesystem) -> Option<&'a dyn Change> {
        self.inner.change(fs)
    }

    fn fs_stat(&self, fs: &Arc<dyn Filesystem>, out: &mut FsStat) -> Result<(), FsError> {
        self.inner.fs_stat(fs, out)
    }

    fn to_handle(&self, fs: &Arc<dyn Filesystem>, path: &[String]) -> Vec<u8> {
        // A handler that owns its handles wins; this one never does.
        let encoded = self.inner.to_handle(fs, path);
        if !encoded.is_empty() {
            return encoded;
        }

        let key = path.join("/");
        let mut state = self.state();
        let id = match state.by_key.get(&key).copied() {
            Some(id) => id,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                state.by_id.insert(
                    id,
                    Entry {
                        fs: fs.clone(),
                        path: path.to_vec(),
                        key: key.clone(),
                    },
                );
                state.by_key.insert(key, id);
                id
            }
        };
        state.touch(id);
        state.evict_to(self.limit);
        id.to_be_bytes().to_vec()
    }

    fn from_handle(&self, handle: &[u8]) -> Option<(Arc<dyn Filesystem>, Vec<String>)> {
        if let Some(found) = self.inner.from_handle(handle) {
            return Some(found);
        }
        let id = u64::from_be_bytes(handle.try_into().ok()?);
        let mut state = self.state();
        let (fs, path) = {
            let entry = state.by_id.get(&id)?;
            (entry.fs.clone(), entry.path.clone())
        };
        state.touch(id);
        Some((fs, path))
    }

    fn handle_limit(&self) -> i64 {
        self.limit as i64
    }
}
