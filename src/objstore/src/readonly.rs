//! Read-only guard over another storage driver.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    ObjError, ObjResult, ObjectInfo, ObjectReader, ObjectStorage, StorageInfo, WriteWaiter,
};

/// Passes reads through to the wrapped driver and fails every mutating
/// call. `info` reports the storage as read-only regardless of what the
/// wrapped driver says.
pub struct ReadOnlyStorage {
    inner: Arc<dyn ObjectStorage>,
}

impl ReadOnlyStorage {
    pub fn new(inner: Arc<dyn ObjectStorage>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ObjectStorage for ReadOnlyStorage {
    async fn info(&self, get_size: bool) -> ObjResult<StorageInfo> {
        let mut info = self.inner.info(get_size).await?;
        info.is_read_only = true;
        Ok(info)
    }

    async fn list(
        &self,
        prefix: &str,
        marker: &str,
        max_count: usize,
    ) -> ObjResult<(String, Vec<ObjectInfo>)> {
        self.inner.list(prefix, marker, max_count).await
    }

    async fn stat(&self, name: &str) -> ObjResult<ObjectInfo> {
        self.inner.stat(name).await
    }

    async fn mkdir(&self, prefix: &str) -> ObjResult<ObjectInfo> {
        Err(ObjError::ReadOnly(prefix.to_string()))
    }

    async fn rmdir(&self, prefix: &str) -> ObjResult<()> {
        Err(ObjError::ReadOnly(prefix.to_string()))
    }

    async fn remove(&self, name: &str) -> ObjResult<()> {
        Err(ObjError::ReadOnly(name.to_string()))
    }

    async fn rename(&self, oldname: &str, _newname: &str) -> ObjResult<()> {
        Err(ObjError::ReadOnly(oldname.to_string()))
    }

    async fn open_read(
        &self,
        name: &str,
        sig: &str,
    ) -> ObjResult<(ObjectInfo, Option<ObjectReader>)> {
        self.inner.open_read(name, sig).await
    }

    async fn open_write(&self, name: &str, _size: u64) -> ObjResult<Box<dyn WriteWaiter>> {
        Err(ObjError::ReadOnly(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStorage;

    #[tokio::test]
    async fn test_reads_pass_mutations_fail() {
        let mem = Arc::new(MemStorage::new(false));
        let mut w = mem.open_write("/a", 0).await.unwrap();
        w.wait().await.unwrap();

        let store = ReadOnlyStorage::new(mem);
        assert!(store.info(false).await.unwrap().is_read_only);
        assert_eq!(store.stat("/a").await.unwrap().name, "a");
        assert!(matches!(
            store.remove("/a").await,
            Err(ObjError::ReadOnly(_))
        ));
        assert!(matches!(
            store.open_write("/b", 0).await.err(),
            Some(ObjError::ReadOnly(_))
        ));
    }
}
