//! The write-back cache engine.
//!
//! Mediates between a POSIX-style interface and a remote object storage
//! driver: lazy downloads, deferred uploads, time-based eviction. All
//! handle-based operations are keyed by ino; resolve one with [`Cache::open`].

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use objstore::{ObjError, ObjResult, ObjectInfo, ObjectStorage, StorageInfo};

use crate::config::CacheConfig;
use crate::index_db::CacheIndexDb;
use crate::lru::LruQueues;
use crate::neg_path::NegPathCache;
use crate::node::Node;
use crate::path::{join_key, normalize_case, path_key_has_prefix};
use crate::path_lock::{PathLockGuard, PathLockMap};

const INDEX_FILE_NAME: &str = "index";
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Progress callback for sweeps: `+path` on upload, `-path` on evict.
pub type Progress<'a> = Option<&'a (dyn Fn(&str) + Send + Sync)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail unless the cache directory already holds an index.
    OpenIfExists,
    /// Open or create the cache, without the background loop.
    Open,
    /// Open or create the cache and start the background loop.
    Activate,
}

/// In-memory state of an open node.
struct NodeState {
    node: Node,
    /// Tombstoned by a successful remove; terminal.
    deleted: bool,
    /// Open local content file, present once content is resident.
    file: Option<std::fs::File>,
}

struct OpenEntry {
    state: Arc<Mutex<NodeState>>,
    refcnt: u32,
}

struct InfoSlot {
    info: Option<StorageInfo>,
    fetched: SystemTime,
}

struct LoopHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct Cache {
    path: PathBuf,
    db: CacheIndexDb,
    storage: Arc<dyn ObjectStorage>,
    config: CacheConfig,
    is_case_ins: bool,
    path_locks: Arc<PathLockMap>,
    open_table: Mutex<HashMap<u64, OpenEntry>>,
    neg_paths: Mutex<NegPathCache>,
    lru: Mutex<LruQueues>,
    info_slot: tokio::sync::Mutex<InfoSlot>,
    loop_handle: Mutex<Option<LoopHandle>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("path", &self.path).finish()
    }
}

// Lock hierarchy (acquire in this order, never invert):
//   path lock -> open-table mutex -> LRU mutex -> KV transaction
//   -> negative-path mutex; info mutex independent of everything else.

impl Cache {
    pub async fn open_cache(
        path: impl AsRef<Path>,
        storage: Arc<dyn ObjectStorage>,
        config: Option<CacheConfig>,
        mode: OpenMode,
    ) -> ObjResult<Arc<Cache>> {
        let path = std::path::absolute(path.as_ref())?;
        let index_path = path.join(INDEX_FILE_NAME);

        if mode == OpenMode::OpenIfExists && !index_path.exists() {
            return Err(ObjError::NotFound(index_path.display().to_string()));
        }

        // Case-sensitivity must be known before any path-key is computed.
        let info = storage.info(false).await?;
        let is_case_ins = info.is_case_insensitive;

        make_dir_all(&path)?;
        let db = CacheIndexDb::open(&index_path)?;
        let config = config.unwrap_or_default().normalized();

        let cache = Arc::new(Cache {
            path,
            db,
            storage,
            neg_paths: Mutex::new(NegPathCache::new(
                config.neg_path_max_count,
                config.neg_path_timeout,
            )),
            config,
            is_case_ins,
            path_locks: PathLockMap::new(),
            open_table: Mutex::new(HashMap::new()),
            lru: Mutex::new(LruQueues::new()),
            info_slot: tokio::sync::Mutex::new(InfoSlot {
                info: None,
                fetched: UNIX_EPOCH,
            }),
            loop_handle: Mutex::new(None),
        });

        cache.sweep_orphan_files();
        cache.seed_lru_from_catalog();

        if mode == OpenMode::Activate {
            let _ = cache.reset_cache_inner(true, None).await;
            cache.spawn_loop();
        }

        info!(
            "cache open at {} (case_insensitive={})",
            cache.path.display(),
            is_case_ins
        );
        Ok(cache)
    }

    pub fn storage(&self) -> Arc<dyn ObjectStorage> {
        self.storage.clone()
    }

    /// Stop the background loop and run one final forced reset. The index
    /// database closes when the last reference to the cache drops.
    pub async fn close_cache(&self) -> ObjResult<()> {
        let handle = self.loop_handle.lock().unwrap().take();
        let mut result = Ok(());
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(());
            let _ = handle.task.await;
            result = self.reset_cache_inner(true, None).await;
        }
        info!("cache closed at {}", self.path.display());
        result
    }

    /// Upload everything dirty, then evict everything clean, regardless of
    /// delays.
    pub async fn reset_cache(&self, progress: Progress<'_>) -> ObjResult<()> {
        self.reset_cache_inner(true, progress).await
    }

    /// One line per cached node: `=path` clean, `+path` dirty, `-path`
    /// local content missing.
    pub fn list_cache(&self) -> Vec<String> {
        let entries = self.db.with_view(|tx| tx.scan_all()).unwrap_or_default();
        entries
            .iter()
            .map(|(_, node)| match hash_file(&self.file_path(node.ino)) {
                Err(_) => format!("-{}", node.path),
                Ok(hash) if hash == node.hash => format!("={}", node.path),
                Ok(_) => format!("+{}", node.path),
            })
            .collect()
    }

    /// Storage information, served from a short-lived cache.
    pub async fn statfs(&self) -> ObjResult<StorageInfo> {
        let now = SystemTime::now();
        let mut slot = self.info_slot.lock().await;
        if let Some(info) = &slot.info {
            if slot.fetched + self.config.evict_delay >= now {
                return Ok(info.clone());
            }
        }
        let info = self.storage.info(true).await?;
        slot.info = Some(info.clone());
        slot.fetched = now;
        Ok(info)
    }

    /// Resolve `path` to an ino and enter it into the open table. Never
    /// contacts the remote: an unknown path gets a fresh, unreconciled
    /// node.
    pub async fn open(&self, path: &str) -> ObjResult<u64> {
        let state = self.open_node(path).await?;
        let ino = state.lock().unwrap().node.ino;

        let mut table = self.open_table.lock().unwrap();
        let entry = table
            .entry(ino)
            .or_insert_with(|| OpenEntry { state, refcnt: 0 });
        entry.refcnt += 1;
        Ok(ino)
    }

    pub async fn make(&self, ino: u64, dir: bool) -> ObjResult<()> {
        let state = self.get_open_state(ino)?;
        self.make_node(&state, dir).await
    }

    pub async fn remove(&self, ino: u64, dir: bool) -> ObjResult<()> {
        let state = self.get_open_state(ino)?;
        self.remove_node(&state, dir).await
    }

    pub async fn rename(&self, ino: u64, new_path: &str) -> ObjResult<()> {
        let state = self.get_open_state(ino)?;
        self.rename_node(&state, new_path).await
    }

    pub async fn stat(&self, ino: u64) -> ObjResult<ObjectInfo> {
        let state = self.get_open_state(ino)?;
        self.stat_node(&state).await
    }

    pub async fn chtime(&self, ino: u64, _mtime: SystemTime) -> ObjResult<()> {
        let _ = self.get_open_state(ino)?;
        Err(ObjError::NotSupported("chtime".to_string()))
    }

    pub async fn readdir(&self, ino: u64, max_count: usize) -> ObjResult<Vec<ObjectInfo>> {
        let state = self.get_open_state(ino)?;
        self.readdir_node(&state, max_count).await
    }

    pub async fn read_at(&self, ino: u64, buf: &mut [u8], offset: u64) -> ObjResult<usize> {
        let state = self.get_open_state(ino)?;
        let n = self
            .perform_file_io_on_node(&state, true, None, |file| read_at_all(file, offset, buf))
            .await?;
        Ok(n.unwrap_or(0))
    }

    pub async fn write_at(&self, ino: u64, buf: &[u8], offset: u64) -> ObjResult<usize> {
        let state = self.get_open_state(ino)?;
        let n = self
            .perform_file_io_on_node(&state, true, None, |file| {
                write_at_all(file, offset, buf)?;
                self.touch_ino(ino, true);
                Ok(buf.len())
            })
            .await?;
        Ok(n.unwrap_or(0))
    }

    pub async fn truncate(&self, ino: u64, size: u64) -> ObjResult<()> {
        let state = self.get_open_state(ino)?;
        self.perform_file_io_on_node(&state, true, Some(size), |file| {
            file.set_len(size)?;
            self.touch_ino(ino, true);
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn sync(&self, ino: u64) -> ObjResult<()> {
        let state = self.get_open_state(ino)?;
        self.perform_file_io_on_node(&state, false, None, |file| file.sync_all())
            .await?;
        Ok(())
    }

    /// Drop one reference to `ino`. The last reference persists the local
    /// file's size/mtime, closes it, and leaves the node as an eviction
    /// candidate. Closing always succeeds for a known ino.
    pub async fn close(&self, ino: u64) -> ObjResult<()> {
        let last = {
            let mut table = self.open_table.lock().unwrap();
            let entry = table
                .get_mut(&ino)
                .ok_or_else(|| ObjError::BadHandle(format!("ino {}", ino)))?;
            entry.refcnt = entry.refcnt.saturating_sub(1);
            if entry.refcnt == 0 {
                table.remove(&ino).map(|e| e.state)
            } else {
                None
            }
        };
        if let Some(state) = last {
            let _ = self.close_node(&state).await;
        }
        Ok(())
    }

    // ========== node resolution ==========

    fn get_open_state(&self, ino: u64) -> ObjResult<Arc<Mutex<NodeState>>> {
        let table = self.open_table.lock().unwrap();
        table
            .get(&ino)
            .map(|e| e.state.clone())
            .ok_or_else(|| ObjError::BadHandle(format!("ino {}", ino)))
    }

    async fn open_node(&self, path: &str) -> ObjResult<Arc<Mutex<NodeState>>> {
        if !path.starts_with('/') {
            return Err(ObjError::NotFound(path.to_string()));
        }

        let path_key = self.path_key(path);
        let _guard = self.path_locks.lock(&path_key).await;

        let node = match self.db.with_view(|tx| tx.get_node(path_key.as_bytes())) {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                let ino = self.db.with_txn(|tx| tx.next_ino())?;
                Node::new(ino, path)
            }
            Err(e) => return Err(e),
        };

        Ok(Arc::new(Mutex::new(NodeState {
            node,
            deleted: false,
            file: None,
        })))
    }

    // ========== make / remove / rename / stat / readdir ==========

    async fn make_node(&self, state: &Arc<Mutex<NodeState>>, dir: bool) -> ObjResult<()> {
        let path = state.lock().unwrap().node.path.clone();
        let path_key = self.path_key(&path);
        let _guard = self.path_locks.lock(&path_key).await;

        if state.lock().unwrap().deleted {
            return Err(ObjError::NotPermitted(path));
        }

        // Best-effort existence probe; a failure just means we go by what
        // we already know.
        let _ = self.stat_node_locked(state, &path_key).await;

        if state.lock().unwrap().node.valid {
            return Err(ObjError::AlreadyExists(path));
        }

        let info = if dir {
            self.storage.mkdir(&path).await?
        } else {
            let mut writer = self.storage.open_write(&path, 0).await?;
            let info = writer.wait().await;
            let _ = writer.shutdown().await;
            info?
        };

        let mut node = state.lock().unwrap().node.clone();
        node.copy_stat(&info);
        self.db
            .with_txn(|tx| tx.put_node(path_key.as_bytes(), &node))?;
        state.lock().unwrap().node.copy_stat(&info);

        self.remove_neg_path(&path_key);
        Ok(())
    }

    async fn remove_node(&self, state: &Arc<Mutex<NodeState>>, dir: bool) -> ObjResult<()> {
        let path = state.lock().unwrap().node.path.clone();
        let path_key = self.path_key(&path);
        let _guard = self.path_locks.lock(&path_key).await;

        let (deleted, valid, is_dir) = {
            let st = state.lock().unwrap();
            (st.deleted, st.node.valid, st.node.is_dir)
        };
        if deleted {
            return Err(ObjError::NotPermitted(path));
        }

        if valid {
            if dir && !is_dir {
                return Err(ObjError::NotDir(path));
            }
            if !dir && is_dir {
                return Err(ObjError::IsDir(path));
            }
            let count = self
                .db
                .with_view(|tx| tx.count_prefix(path_key.as_bytes(), 2))?;
            if count > 1 {
                return Err(ObjError::NotEmpty(path));
            }
        }

        // A remote not-found means our view of the namespace drifted: clean
        // up the local state anyway, but still surface the error.
        let mut pending = Ok(());
        let remote = if dir {
            self.storage.rmdir(&path).await
        } else {
            self.storage.remove(&path).await
        };
        if let Err(e) = remote {
            if e.is_not_found() {
                pending = Err(e);
            } else {
                return Err(e);
            }
        }

        let db_result = self.db.with_txn(|tx| tx.delete_node(path_key.as_bytes()));
        if db_result.is_ok() {
            state.lock().unwrap().deleted = true;
            self.add_neg_path(&path_key);
        }
        pending.and(db_result)
    }

    async fn rename_node(&self, state: &Arc<Mutex<NodeState>>, new_path: &str) -> ObjResult<()> {
        let old_path = state.lock().unwrap().node.path.clone();
        let path_key = self.path_key(&old_path);
        let new_path_key = self.path_key(new_path);

        if path_key != new_path_key {
            let (k, nk) = (path_key.as_bytes(), new_path_key.as_bytes());
            if path_key_has_prefix(k, nk) || path_key_has_prefix(nk, k) {
                // would create a directory loop
                return Err(ObjError::InvalidParam(format!(
                    "{} -> {}",
                    old_path, new_path
                )));
            }
        }

        let _old_guard = self.path_locks.lock(&path_key).await;

        if state.lock().unwrap().deleted {
            return Err(ObjError::NotPermitted(old_path));
        }

        // Lock the destination only when it is a distinct key; a case-only
        // rename on an insensitive backend would deadlock against itself.
        let _new_guard = if path_key != new_path_key {
            Some(self.path_locks.lock(&new_path_key).await)
        } else {
            None
        };

        match self.storage.rename(&old_path, new_path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                // The object vanished remotely while still visible here;
                // not-found would only confuse the caller.
                return Err(ObjError::NotPermitted(format!(
                    "{} -> {}",
                    old_path, new_path
                )));
            }
            Err(e) => return Err(e),
        }

        let mut renamed = Vec::new();
        self.db.with_txn(|tx| {
            for (key, mut node) in tx.scan_prefix(path_key.as_bytes())? {
                tx.delete_node(&key)?;

                let mut new_key = Vec::with_capacity(new_path_key.len() + key.len() - path_key.len());
                new_key.extend_from_slice(new_path_key.as_bytes());
                new_key.extend_from_slice(&key[path_key.len()..]);
                tx.delete_node(&new_key)?;

                let suffix = node.path.get(old_path.len()..).unwrap_or_default();
                node.path = format!("{}{}", new_path, suffix);
                tx.put_node(&new_key, &node)?;
                renamed.push(node.ino);
            }
            Ok(())
        })?;

        {
            let table = self.open_table.lock().unwrap();
            for ino in &renamed {
                if let Some(entry) = table.get(ino) {
                    let mut st = entry.state.lock().unwrap();
                    let suffix = st.node.path.get(old_path.len()..).unwrap_or_default();
                    st.node.path = format!("{}{}", new_path, suffix);
                }
            }
        }

        if path_key != new_path_key {
            self.neg_paths.lock().unwrap().clear();
            self.add_neg_path(&path_key);
        }

        debug!("renamed {} -> {} ({} nodes)", old_path, new_path, renamed.len());
        Ok(())
    }

    async fn stat_node(&self, state: &Arc<Mutex<NodeState>>) -> ObjResult<ObjectInfo> {
        let path = state.lock().unwrap().node.path.clone();
        let path_key = self.path_key(&path);
        let _guard = self.path_locks.lock(&path_key).await;

        let (valid, deleted) = {
            let st = state.lock().unwrap();
            (st.node.valid, st.deleted)
        };
        if deleted {
            return Err(ObjError::NotPermitted(path));
        }
        if !valid {
            self.stat_node_locked(state, &path_key).await?;
        }

        let st = state.lock().unwrap();
        let mut info = st.node.object_info()?;
        if let Some(file) = &st.file {
            let md = file.metadata()?;
            info.size = md.len();
            info.mtime = md.modified()?;
        }
        Ok(info)
    }

    /// Fetch remote metadata for the node, with the path lock already
    /// held. Consults and maintains the negative path cache, and persists
    /// the node on success.
    async fn stat_node_locked(
        &self,
        state: &Arc<Mutex<NodeState>>,
        path_key: &str,
    ) -> ObjResult<()> {
        if self.is_neg_path(path_key) {
            return Err(ObjError::NotFound(path_key.to_string()));
        }

        let path = state.lock().unwrap().node.path.clone();
        let info = match self.storage.stat(&path).await {
            Ok(info) => info,
            Err(e) => {
                if e.is_not_found() {
                    self.add_neg_path(path_key);
                }
                return Err(e);
            }
        };

        let mut node = state.lock().unwrap().node.clone();
        node.copy_stat(&info);
        self.db
            .with_txn(|tx| tx.put_node(path_key.as_bytes(), &node))?;
        state.lock().unwrap().node.copy_stat(&info);

        self.remove_neg_path(path_key);
        Ok(())
    }

    async fn readdir_node(
        &self,
        state: &Arc<Mutex<NodeState>>,
        max_count: usize,
    ) -> ObjResult<Vec<ObjectInfo>> {
        let path = state.lock().unwrap().node.path.clone();
        let path_key = self.path_key(&path);
        let _guard = self.path_locks.lock(&path_key).await;

        if state.lock().unwrap().deleted {
            return Err(ObjError::NotPermitted(path));
        }

        let mut infos = Vec::new();
        let mut marker = String::new();
        let mut count = max_count;
        loop {
            let (next_marker, batch) = self.storage.list(&path, &marker, count).await?;
            let batch_len = batch.len();
            infos.extend(batch);
            marker = next_marker;
            if marker.is_empty() {
                break;
            }
            if max_count > 0 {
                count = count.saturating_sub(batch_len);
                if count == 0 {
                    break;
                }
            }
        }

        // Cache the listed children: a flurry of stat calls usually follows.
        let mut new_inos = Vec::new();
        self.db.with_txn(|tx| {
            for info in &infos {
                let child_key = join_key(&path_key, &self.path_key(&info.name));
                if tx.get_node(child_key.as_bytes()).is_ok() {
                    continue;
                }
                let ino = tx.next_ino()?;
                let mut node = Node::new(ino, &join_key(&path, &info.name));
                node.copy_stat(info);
                tx.put_node(child_key.as_bytes(), &node)?;
                new_inos.push(ino);
            }
            Ok(())
        })?;

        for ino in new_inos {
            self.touch_ino(ino, false);
        }
        self.remove_neg_path(&path_key);
        Ok(infos)
    }

    // ========== content I/O ==========

    /// Run `op` against the node's local content file, downloading it
    /// first when `ensure` is set and no file is resident. Returns `None`
    /// when there is no file to operate on (possible only without
    /// `ensure`).
    async fn perform_file_io_on_node<T>(
        &self,
        state: &Arc<Mutex<NodeState>>,
        ensure: bool,
        size: Option<u64>,
        op: impl FnOnce(&std::fs::File) -> std::io::Result<T>,
    ) -> ObjResult<Option<T>> {
        let path = state.lock().unwrap().node.path.clone();
        let path_key = self.path_key(&path);
        let _guard = self.path_locks.lock(&path_key).await;

        let needs_content = ensure && state.lock().unwrap().file.is_none();
        if needs_content {
            let (ino, sig, deleted) = {
                let st = state.lock().unwrap();
                (st.node.ino, st.node.sig.clone(), st.deleted)
            };
            if deleted {
                return Err(ObjError::NotPermitted(path));
            }

            let (info, hash, file) = self.read_node_from_storage(ino, &path, &sig, size).await?;
            if let Some(info) = &info {
                let mut node = state.lock().unwrap().node.clone();
                node.copy_stat(info);
                node.hash = hash.clone();
                self.db
                    .with_txn(|tx| tx.put_node(path_key.as_bytes(), &node))?;

                let mut st = state.lock().unwrap();
                st.node.copy_stat(info);
                st.node.hash = hash;
            }
            state.lock().unwrap().file = Some(file);

            self.remove_neg_path(&path_key);
        }

        let st = state.lock().unwrap();
        match st.file.as_ref() {
            Some(file) => op(file).map(Some).map_err(ObjError::from),
            None => Ok(None),
        }
    }

    /// Open (or create) the local content file for `ino` and bring it up
    /// to date from the remote. A returned `None` info means the node's
    /// signature still matched and the existing content was reused.
    async fn read_node_from_storage(
        &self,
        ino: u64,
        path: &str,
        sig: &str,
        size: Option<u64>,
    ) -> ObjResult<(Option<ObjectInfo>, Vec<u8>, std::fs::File)> {
        let file_path = self.file_path(ino);
        let mut sig = sig.to_string();
        let mut created = false;

        let file = match open_file(&file_path, false) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // no local copy, so any remembered signature is meaningless
                sig.clear();
                if let Some(parent) = file_path.parent() {
                    make_dir_all(parent)?;
                }
                created = true;
                open_file(&file_path, true)?
            }
            Err(e) => return Err(e.into()),
        };

        match self.download_into(&file, path, &sig, size).await {
            Ok((info, hash)) => Ok((info, hash, file)),
            Err(e) => {
                drop(file);
                if created {
                    let _ = std::fs::remove_file(&file_path);
                }
                Err(e)
            }
        }
    }

    /// Stream remote content into the local file through a SHA-256 tee.
    /// `size` bounds the transfer for truncate-driven downloads; reaching
    /// end of stream early is not an error there.
    async fn download_into(
        &self,
        file: &std::fs::File,
        path: &str,
        sig: &str,
        size: Option<u64>,
    ) -> ObjResult<(Option<ObjectInfo>, Vec<u8>)> {
        let (info, reader) = self.storage.open_read(path, sig).await?;
        let Some(mut reader) = reader else {
            // signature matched: local content is current
            return Ok((None, Vec::new()));
        };

        if size.is_none() {
            // fresh content replaces the file wholesale; a shrunk remote
            // object must not leave a stale tail behind
            file.set_len(0)?;
        }

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut offset = 0u64;
        let mut remaining = size;
        loop {
            let want = match remaining {
                Some(0) => break,
                Some(r) => buf.len().min(r as usize),
                None => buf.len(),
            };
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            write_at_all(file, offset, &buf[..n])?;
            offset += n as u64;
            if let Some(r) = &mut remaining {
                *r -= n as u64;
            }
        }

        let hash = hasher.finalize().to_vec();
        debug!(
            "downloaded {} ({} bytes, hash={})",
            path,
            offset,
            hex::encode(&hash)
        );
        Ok((Some(info), hash))
    }

    async fn close_node(&self, state: &Arc<Mutex<NodeState>>) -> ObjResult<()> {
        let (has_file, valid, deleted, ino) = {
            let st = state.lock().unwrap();
            (st.file.is_some(), st.node.valid, st.deleted, st.node.ino)
        };

        let mut result = Ok(());
        if has_file {
            if valid && !deleted {
                result = self.close_and_update_node(state).await;
            }
            state.lock().unwrap().file = None;
        }

        if valid {
            self.touch_ino(ino, false);
        }
        result
    }

    /// Record the open file's final size and mtime in the catalog before
    /// the file handle goes away.
    async fn close_and_update_node(&self, state: &Arc<Mutex<NodeState>>) -> ObjResult<()> {
        let path = state.lock().unwrap().node.path.clone();
        let path_key = self.path_key(&path);
        let _guard = self.path_locks.lock(&path_key).await;

        let (size, mtime) = {
            let st = state.lock().unwrap();
            let file = st
                .file
                .as_ref()
                .ok_or_else(|| ObjError::BadHandle(path.clone()))?;
            let md = file.metadata()?;
            (md.len(), md.modified()?)
        };

        let mut node = state.lock().unwrap().node.clone();
        node.size = size;
        node.mtime = mtime;
        self.db
            .with_txn(|tx| tx.put_node(path_key.as_bytes(), &node))?;

        let mut st = state.lock().unwrap();
        st.node.size = size;
        st.node.mtime = mtime;
        Ok(())
    }

    // ========== upload / evict ==========

    pub(crate) fn touch_ino(&self, ino: u64, rw: bool) {
        self.lru.lock().unwrap().touch(ino, rw, SystemTime::now());
    }

    /// Upload the head of the dirty list if it is due. `Ok(false)` means
    /// nothing was ready.
    pub(crate) async fn upload_one(&self, force: bool, progress: Progress<'_>) -> ObjResult<bool> {
        let ino = self.lru.lock().unwrap().take_due_head(
            true,
            force,
            self.config.upload_delay,
            SystemTime::now(),
        );
        let Some(ino) = ino else {
            return Ok(false);
        };

        let mut retouch = true;
        let result = self.upload_locked(ino, &mut retouch, progress).await;
        if retouch {
            // errors re-enter the dirty list for a retry; success makes
            // the ino an eviction candidate
            self.touch_ino(ino, result.is_err());
        }
        if let Err(e) = &result {
            warn!("upload of ino {} failed: {}", ino, e);
        }
        result.map(|_| true)
    }

    async fn upload_locked(
        &self,
        ino: u64,
        retouch: &mut bool,
        progress: Progress<'_>,
    ) -> ObjResult<()> {
        let (node, path_key, _guard) = match self.get_locked_node_with_ino(ino).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        if self.lru.lock().unwrap().rw_contains(ino) {
            // fresh writes landed while we were popping; their touch owns
            // the retry
            *retouch = false;
            return Ok(());
        }

        let file_path = self.file_path(ino);
        let file = match std::fs::File::open(&file_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();

        let mut writer = self.storage.open_write(&node.path, size).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut offset = 0u64;
        while offset < size {
            let want = buf.len().min((size - offset) as usize);
            let n = read_at_once(&file, offset, &mut buf[..want])?;
            if n == 0 {
                return Err(ObjError::IoError(format!(
                    "{}: unexpected end of cache file",
                    file_path.display()
                )));
            }
            hasher.update(&buf[..n]);
            writer.write_all(&buf[..n]).await?;
            offset += n as u64;
        }

        let info = writer.wait().await?;
        let _ = writer.shutdown().await;

        // keep the local mtime in step so the file does not look modified
        let times = std::fs::FileTimes::new().set_modified(info.mtime);
        file.set_times(times)?;

        let mut node = node;
        node.copy_stat(&info);
        node.hash = hasher.finalize().to_vec();
        self.db
            .with_txn(|tx| tx.put_node(path_key.as_bytes(), &node))?;

        if let Some(entry) = self.open_table.lock().unwrap().get(&ino) {
            let mut st = entry.state.lock().unwrap();
            st.node.copy_stat(&info);
            st.node.hash = node.hash.clone();
        }

        debug!(
            "uploaded {} ({} bytes, hash={})",
            node.path,
            size,
            hex::encode(&node.hash)
        );
        if let Some(report) = progress {
            report(&format!("+{}", node.path));
        }
        Ok(())
    }

    /// Evict the head of the clean list if it is due. `Ok(false)` means
    /// nothing was ready.
    pub(crate) async fn evict_one(&self, force: bool, progress: Progress<'_>) -> ObjResult<bool> {
        let ino = self.lru.lock().unwrap().take_due_head(
            false,
            force,
            self.config.evict_delay,
            SystemTime::now(),
        );
        let Some(ino) = ino else {
            return Ok(false);
        };

        let result = self.evict_locked(ino, progress).await;
        if result.is_err() {
            self.touch_ino(ino, false);
        }
        if let Err(e) = &result {
            warn!("evict of ino {} failed: {}", ino, e);
        }
        result.map(|_| true)
    }

    async fn evict_locked(&self, ino: u64, progress: Progress<'_>) -> ObjResult<()> {
        let (node, path_key, _guard) = match self.get_locked_node_with_ino(ino).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                // the node is gone already; the local file is an orphan
                let _ = std::fs::remove_file(self.file_path(ino));
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.lru.lock().unwrap().contains(ino) {
            // the ino snuck back into a list; let its new position decide
            return Ok(());
        }
        if self.open_table.lock().unwrap().contains_key(&ino) {
            // still open; it re-enters the clean list on close
            return Ok(());
        }

        self.db
            .with_txn(|tx| tx.delete_node(path_key.as_bytes()))?;
        let _ = std::fs::remove_file(self.file_path(ino));

        debug!("evicted {}", node.path);
        if let Some(report) = progress {
            report(&format!("-{}", node.path));
        }
        Ok(())
    }

    pub(crate) async fn upload_all(&self, force: bool, progress: Progress<'_>) -> ObjResult<()> {
        while self.upload_one(force, progress).await? {}
        Ok(())
    }

    pub(crate) async fn evict_all(&self, force: bool, progress: Progress<'_>) -> ObjResult<()> {
        while self.evict_one(force, progress).await? {}
        Ok(())
    }

    async fn reset_cache_inner(&self, force: bool, progress: Progress<'_>) -> ObjResult<()> {
        self.upload_all(force, progress).await?;
        self.evict_all(force, progress).await
    }

    /// Look up the node for `ino` and lock its path, retrying until the
    /// path observed before locking still holds afterwards (the node may
    /// be renamed between the read and the lock).
    async fn get_locked_node_with_ino(
        &self,
        ino: u64,
    ) -> ObjResult<(Node, String, PathLockGuard)> {
        let mut held: Option<(String, PathLockGuard)> = None;
        loop {
            let node = self.db.with_view(|tx| tx.get_node_by_ino(ino))?;
            let path_key = self.path_key(&node.path);

            if let Some((held_key, guard)) = held.take() {
                if held_key == path_key {
                    return Ok((node, path_key, guard));
                }
            }
            let guard = self.path_locks.lock(&path_key).await;
            held = Some((path_key, guard));
        }
    }

    // ========== background loop ==========

    fn spawn_loop(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let cache = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.loop_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache.reset_cache_inner(false, None).await {
                            warn!("background reset failed: {}", e);
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });
        *self.loop_handle.lock().unwrap() = Some(LoopHandle { stop_tx, task });
    }

    // ========== bootstrap helpers ==========

    /// Remove content files whose ino no longer appears in the index.
    fn sweep_orphan_files(&self) {
        let mut stack = vec![self.path.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let entry_path = entry.path();
                let Ok(md) = entry.metadata() else { continue };
                if md.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                let Some(ino) = self.parse_ino(&entry_path) else {
                    continue;
                };
                if let Err(e) = self.db.with_view(|tx| tx.get_node_by_ino(ino)) {
                    if e.is_not_found() {
                        debug!("removing orphan cache file {}", entry_path.display());
                        let _ = std::fs::remove_file(&entry_path);
                    }
                }
            }
        }
    }

    /// Place every indexed node into a LRU list: clean when its local
    /// content matches the recorded hash (or there is none), dirty
    /// otherwise. The seeded atime makes the first sweep act immediately.
    fn seed_lru_from_catalog(&self) {
        let past = SystemTime::now() - (self.config.upload_delay + self.config.evict_delay);
        let entries = self.db.with_view(|tx| tx.scan_all()).unwrap_or_default();
        let mut lru = self.lru.lock().unwrap();
        for (_, node) in entries {
            match hash_file(&self.file_path(node.ino)) {
                Ok(hash) if hash != node.hash => lru.seed(node.ino, true, past),
                _ => lru.seed(node.ino, false, past),
            }
        }
    }

    // ========== small helpers ==========

    fn path_key(&self, path: &str) -> String {
        if self.is_case_ins {
            normalize_case(path)
        } else {
            path.to_string()
        }
    }

    fn is_neg_path(&self, path_key: &str) -> bool {
        self.neg_paths
            .lock()
            .unwrap()
            .is_neg(path_key, SystemTime::now())
    }

    fn add_neg_path(&self, path_key: &str) {
        self.neg_paths
            .lock()
            .unwrap()
            .add(path_key, SystemTime::now());
    }

    fn remove_neg_path(&self, path_key: &str) {
        self.neg_paths.lock().unwrap().remove(path_key);
    }

    /// Local content file for `ino`: `<cache>/<NN>/<XXXXXXXXXXXXXX>` with
    /// `NN = ino & 0xff` and the rest `ino >> 8`.
    pub(crate) fn file_path(&self, ino: u64) -> PathBuf {
        self.path
            .join(format!("{:02x}", ino & 0xff))
            .join(format!("{:014x}", ino >> 8))
    }

    fn parse_ino(&self, file_path: &Path) -> Option<u64> {
        let rel = file_path.strip_prefix(&self.path).ok()?;
        let mut comps = rel.iter();
        let dir = comps.next()?.to_str()?;
        let base = comps.next()?.to_str()?;
        if comps.next().is_some() || dir.len() != 2 || base.len() != 14 {
            return None;
        }
        u64::from_str_radix(&format!("{}{}", base, dir), 16).ok()
    }

    #[cfg(test)]
    pub(crate) fn lru_state(&self, ino: u64) -> (bool, bool) {
        let lru = self.lru.lock().unwrap();
        (lru.rw_contains(ino), lru.contains(ino) && !lru.rw_contains(ino))
    }

    #[cfg(test)]
    pub(crate) fn neg_path_len(&self) -> usize {
        self.neg_paths.lock().unwrap().len()
    }
}

fn make_dir_all(path: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

fn open_file(path: &Path, create_new: bool) -> std::io::Result<std::fs::File> {
    let mut opts = std::fs::OpenOptions::new();
    opts.read(true).write(true);
    if create_new {
        opts.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

pub(crate) fn hash_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

fn read_at_once(file: &std::fs::File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        file.seek_read(buf, offset)
    }
}

/// Read until `buf` is full or the file ends; returns the bytes read.
fn read_at_all(file: &std::fs::File, mut offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_at_once(file, offset, &mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        offset += n as u64;
    }
    Ok(filled)
}

fn write_at_once(file: &std::fs::File, offset: u64, buf: &[u8]) -> std::io::Result<usize> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_at(buf, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        file.seek_write(buf, offset)
    }
}

fn write_at_all(file: &std::fs::File, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = write_at_once(file, offset, buf)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_at returned zero",
            ));
        }
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}
