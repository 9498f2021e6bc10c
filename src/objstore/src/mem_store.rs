//! In-memory object storage used by engine tests and local experiments.
//!
//! Every call is appended to an operation journal so tests can assert
//! which remote operations actually happened.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::{
    ObjError, ObjResult, ObjectInfo, ObjectReader, ObjectStorage, StorageInfo, WriteWaiter,
};

const TOTAL_SIZE: u64 = 1 << 40;

#[derive(Debug, Clone)]
struct MemObject {
    path: String,
    data: Vec<u8>,
    is_dir: bool,
    btime: SystemTime,
    mtime: SystemTime,
    sig: String,
}

impl MemObject {
    fn info(&self) -> ObjectInfo {
        ObjectInfo {
            name: base_name(&self.path),
            size: self.data.len() as u64,
            btime: self.btime,
            mtime: self.mtime,
            is_dir: self.is_dir,
            sig: self.sig.clone(),
        }
    }
}

struct MemState {
    objects: BTreeMap<String, MemObject>,
    next_sig: u64,
}

pub struct MemStorage {
    state: Arc<Mutex<MemState>>,
    case_insensitive: bool,
    /// When non-zero, `list` returns at most this many items per page so
    /// tests can exercise pagination.
    page_limit: usize,
    ops: Mutex<Vec<String>>,
}

impl MemStorage {
    pub fn new(case_insensitive: bool) -> Self {
        let mut objects = BTreeMap::new();
        let now = SystemTime::now();
        objects.insert(
            "/".to_string(),
            MemObject {
                path: "/".to_string(),
                data: Vec::new(),
                is_dir: true,
                btime: now,
                mtime: now,
                sig: "v0".to_string(),
            },
        );
        Self {
            state: Arc::new(Mutex::new(MemState {
                objects,
                next_sig: 0,
            })),
            case_insensitive,
            page_limit: 0,
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit;
        self
    }

    /// The operation journal so far, one `"<op> <args>"` entry per call.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    /// Number of journal entries for the given operation name.
    pub fn calls(&self, op: &str) -> usize {
        let prefix = format!("{} ", op);
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(&prefix) || e.as_str() == op)
            .count()
    }

    fn record(&self, op: &str, args: &str) {
        self.ops.lock().unwrap().push(if args.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, args)
        });
    }

    fn key(&self, name: &str) -> String {
        if self.case_insensitive {
            name.chars().flat_map(|c| c.to_uppercase()).collect()
        } else {
            name.to_string()
        }
    }
}

fn base_name(path: &str) -> String {
    match path.rsplit('/').next() {
        Some("") | None => "/".to_string(),
        Some(base) => base.to_string(),
    }
}

/// True if `key` names a direct child of the directory `dir`.
fn is_child_of(key: &str, dir: &str) -> bool {
    let rest = match key.strip_prefix(dir) {
        Some(rest) => rest,
        None => return false,
    };
    let rest = if dir.ends_with('/') {
        rest
    } else {
        match rest.strip_prefix('/') {
            Some(rest) => rest,
            None => return false,
        }
    };
    !rest.is_empty() && !rest.contains('/')
}

#[async_trait]
impl ObjectStorage for MemStorage {
    async fn info(&self, get_size: bool) -> ObjResult<StorageInfo> {
        self.record("info", if get_size { "sized" } else { "" });
        let used: u64 = {
            let state = self.state.lock().unwrap();
            state.objects.values().map(|o| o.data.len() as u64).sum()
        };
        Ok(StorageInfo {
            is_case_insensitive: self.case_insensitive,
            is_read_only: false,
            max_component_length: 255,
            total_size: TOTAL_SIZE,
            free_size: TOTAL_SIZE - used,
        })
    }

    async fn list(
        &self,
        prefix: &str,
        marker: &str,
        max_count: usize,
    ) -> ObjResult<(String, Vec<ObjectInfo>)> {
        self.record("list", prefix);
        let dir = self.key(prefix);
        let state = self.state.lock().unwrap();
        if !state.objects.contains_key(&dir) {
            return Err(ObjError::NotFound(prefix.to_string()));
        }

        let mut limit = usize::MAX;
        if max_count > 0 {
            limit = max_count;
        }
        if self.page_limit > 0 {
            limit = limit.min(self.page_limit);
        }

        let mut items = Vec::new();
        let mut last_key = String::new();
        let mut more = false;
        for (key, obj) in state.objects.range(dir.clone()..) {
            if !key.starts_with(&dir) {
                break;
            }
            if !is_child_of(key, &dir) {
                continue;
            }
            if !marker.is_empty() && key.as_str() <= marker {
                continue;
            }
            if items.len() == limit {
                more = true;
                break;
            }
            last_key = key.clone();
            items.push(obj.info());
        }

        let next_marker = if more { last_key } else { String::new() };
        Ok((next_marker, items))
    }

    async fn stat(&self, name: &str) -> ObjResult<ObjectInfo> {
        self.record("stat", name);
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&self.key(name))
            .map(|o| o.info())
            .ok_or_else(|| ObjError::NotFound(name.to_string()))
    }

    async fn mkdir(&self, prefix: &str) -> ObjResult<ObjectInfo> {
        self.record("mkdir", prefix);
        let key = self.key(prefix);
        let mut state = self.state.lock().unwrap();
        if state.objects.contains_key(&key) {
            return Err(ObjError::AlreadyExists(prefix.to_string()));
        }
        let now = SystemTime::now();
        let sig = {
            state.next_sig += 1;
            format!("v{}", state.next_sig)
        };
        let obj = MemObject {
            path: prefix.to_string(),
            data: Vec::new(),
            is_dir: true,
            btime: now,
            mtime: now,
            sig,
        };
        let info = obj.info();
        state.objects.insert(key, obj);
        Ok(info)
    }

    async fn rmdir(&self, prefix: &str) -> ObjResult<()> {
        self.record("rmdir", prefix);
        let key = self.key(prefix);
        let mut state = self.state.lock().unwrap();
        let obj = state
            .objects
            .get(&key)
            .ok_or_else(|| ObjError::NotFound(prefix.to_string()))?;
        if !obj.is_dir {
            return Err(ObjError::NotDir(prefix.to_string()));
        }
        let has_children = state
            .objects
            .keys()
            .any(|k| k != &key && is_child_of(k, &key));
        if has_children {
            return Err(ObjError::NotEmpty(prefix.to_string()));
        }
        state.objects.remove(&key);
        Ok(())
    }

    async fn remove(&self, name: &str) -> ObjResult<()> {
        self.record("remove", name);
        let key = self.key(name);
        let mut state = self.state.lock().unwrap();
        let obj = state
            .objects
            .get(&key)
            .ok_or_else(|| ObjError::NotFound(name.to_string()))?;
        if obj.is_dir {
            return Err(ObjError::IsDir(name.to_string()));
        }
        state.objects.remove(&key);
        Ok(())
    }

    async fn rename(&self, oldname: &str, newname: &str) -> ObjResult<()> {
        self.record("rename", &format!("{} -> {}", oldname, newname));
        let old_key = self.key(oldname);
        let new_key = self.key(newname);
        let mut state = self.state.lock().unwrap();
        if !state.objects.contains_key(&old_key) {
            return Err(ObjError::NotFound(oldname.to_string()));
        }

        let moved: Vec<String> = state
            .objects
            .keys()
            .filter(|k| {
                k.as_str() == old_key
                    || k.strip_prefix(&old_key)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .cloned()
            .collect();
        for key in moved {
            let mut obj = state.objects.remove(&key).unwrap();
            let suffix = &key[old_key.len()..];
            let path_suffix = obj.path.get(oldname.len()..).unwrap_or_default();
            obj.path = format!("{}{}", newname, path_suffix);
            state.objects.insert(format!("{}{}", new_key, suffix), obj);
        }
        Ok(())
    }

    async fn open_read(
        &self,
        name: &str,
        sig: &str,
    ) -> ObjResult<(ObjectInfo, Option<ObjectReader>)> {
        self.record("open_read", name);
        let state = self.state.lock().unwrap();
        let obj = state
            .objects
            .get(&self.key(name))
            .ok_or_else(|| ObjError::NotFound(name.to_string()))?;
        let info = obj.info();
        if !sig.is_empty() && sig == obj.sig {
            return Ok((info, None));
        }
        let reader: ObjectReader = Box::pin(Cursor::new(obj.data.clone()));
        Ok((info, Some(reader)))
    }

    async fn open_write(&self, name: &str, _size: u64) -> ObjResult<Box<dyn WriteWaiter>> {
        self.record("open_write", name);
        Ok(Box::new(MemWriter {
            state: self.state.clone(),
            key: self.key(name),
            path: name.to_string(),
            buf: Vec::new(),
        }))
    }
}

struct MemWriter {
    state: Arc<Mutex<MemState>>,
    key: String,
    path: String,
    buf: Vec<u8>,
}

impl AsyncWrite for MemWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl WriteWaiter for MemWriter {
    async fn wait(&mut self) -> ObjResult<ObjectInfo> {
        let mut state = self.state.lock().unwrap();
        let now = SystemTime::now();
        let sig = {
            state.next_sig += 1;
            format!("v{}", state.next_sig)
        };
        let btime = state
            .objects
            .get(&self.key)
            .map(|o| o.btime)
            .unwrap_or(now);
        let obj = MemObject {
            path: self.path.clone(),
            data: std::mem::take(&mut self.buf),
            is_dir: false,
            btime,
            mtime: now,
            sig,
        };
        let info = obj.info();
        state.objects.insert(self.key.clone(), obj);
        Ok(info)
    }
}
