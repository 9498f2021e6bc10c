//! Tracing wrapper that logs every storage call and its outcome.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::{ObjResult, ObjectInfo, ObjectReader, ObjectStorage, StorageInfo, WriteWaiter};

pub struct TraceStorage {
    inner: Arc<dyn ObjectStorage>,
}

impl TraceStorage {
    pub fn new(inner: Arc<dyn ObjectStorage>) -> Self {
        Self { inner }
    }
}

fn trace<T>(op: &str, args: &str, result: ObjResult<T>) -> ObjResult<T> {
    match &result {
        Ok(_) => debug!("storage {}({}) ok", op, args),
        Err(err) => debug!("storage {}({}) error: {}", op, args, err),
    }
    result
}

#[async_trait]
impl ObjectStorage for TraceStorage {
    async fn info(&self, get_size: bool) -> ObjResult<StorageInfo> {
        trace(
            "info",
            &format!("get_size={}", get_size),
            self.inner.info(get_size).await,
        )
    }

    async fn list(
        &self,
        prefix: &str,
        marker: &str,
        max_count: usize,
    ) -> ObjResult<(String, Vec<ObjectInfo>)> {
        trace(
            "list",
            &format!("{:?}, marker={:?}, max={}", prefix, marker, max_count),
            self.inner.list(prefix, marker, max_count).await,
        )
    }

    async fn stat(&self, name: &str) -> ObjResult<ObjectInfo> {
        trace("stat", &format!("{:?}", name), self.inner.stat(name).await)
    }

    async fn mkdir(&self, prefix: &str) -> ObjResult<ObjectInfo> {
        trace(
            "mkdir",
            &format!("{:?}", prefix),
            self.inner.mkdir(prefix).await,
        )
    }

    async fn rmdir(&self, prefix: &str) -> ObjResult<()> {
        trace(
            "rmdir",
            &format!("{:?}", prefix),
            self.inner.rmdir(prefix).await,
        )
    }

    async fn remove(&self, name: &str) -> ObjResult<()> {
        trace(
            "remove",
            &format!("{:?}", name),
            self.inner.remove(name).await,
        )
    }

    async fn rename(&self, oldname: &str, newname: &str) -> ObjResult<()> {
        trace(
            "rename",
            &format!("{:?} -> {:?}", oldname, newname),
            self.inner.rename(oldname, newname).await,
        )
    }

    async fn open_read(
        &self,
        name: &str,
        sig: &str,
    ) -> ObjResult<(ObjectInfo, Option<ObjectReader>)> {
        trace(
            "open_read",
            &format!("{:?}, sig={:?}", name, sig),
            self.inner.open_read(name, sig).await,
        )
    }

    async fn open_write(&self, name: &str, size: u64) -> ObjResult<Box<dyn WriteWaiter>> {
        trace(
            "open_write",
            &format!("{:?}, size={}", name, size),
            self.inner.open_write(name, size).await,
        )
    }
}
