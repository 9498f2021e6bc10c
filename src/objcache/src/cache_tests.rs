//! End-to-end tests of the cache engine against the in-memory storage.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep, timeout};

use objstore::{MemStorage, ObjError, ObjectStorage};

use crate::cache::{hash_file, Cache, OpenMode};
use crate::config::CacheConfig;

const UPLOAD_DELAY: Duration = Duration::from_millis(200);
const EVICT_DELAY: Duration = Duration::from_millis(400);
const NEG_TIMEOUT: Duration = Duration::from_millis(150);

fn test_config() -> CacheConfig {
    CacheConfig {
        neg_path_timeout: NEG_TIMEOUT,
        neg_path_max_count: 100,
        loop_period: Duration::from_millis(100),
        upload_delay: UPLOAD_DELAY,
        evict_delay: EVICT_DELAY,
    }
}

async fn open_test_cache(store: &Arc<MemStorage>, dir: &TempDir) -> Arc<Cache> {
    Cache::open_cache(
        dir.path().join("cache"),
        store.clone(),
        Some(test_config()),
        OpenMode::Open,
    )
    .await
    .unwrap()
}

async fn remote_content(store: &MemStorage, name: &str) -> Vec<u8> {
    let (_, reader) = store.open_read(name, "").await.unwrap();
    let mut data = Vec::new();
    reader.unwrap().read_to_end(&mut data).await.unwrap();
    data
}

fn info_sized_calls(store: &MemStorage) -> usize {
    store.ops().iter().filter(|e| e.as_str() == "info sized").count()
}

#[tokio::test]
async fn test_make_persists_node() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    assert_eq!(ino, 1);

    cache.make(ino, false).await.unwrap();
    assert_eq!(store.calls("open_write"), 1);
    assert_eq!(cache.neg_path_len(), 0);

    // metadata is now cached; stat must not hit the remote again
    let stats_before = store.calls("stat");
    let info = cache.stat(ino).await.unwrap();
    assert_eq!(info.name, "a");
    assert!(!info.is_dir);
    assert_eq!(store.calls("stat"), stats_before);

    // the catalog entry survives a reopen under the same ino
    cache.close(ino).await.unwrap();
    cache.close_cache().await.unwrap();
    drop(cache);
    let cache = open_test_cache(&store, &dir).await;
    assert_eq!(cache.open("/a").await.unwrap(), ino);
}

#[tokio::test]
async fn test_make_existing_is_eexist() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    assert!(matches!(
        cache.make(ino, false).await,
        Err(ObjError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn test_negative_path_short_circuits_stat() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    assert!(cache.stat(ino).await.unwrap_err().is_not_found());
    assert_eq!(store.calls("stat"), 1);

    // within the timeout the negative entry answers
    assert!(cache.stat(ino).await.unwrap_err().is_not_found());
    assert_eq!(store.calls("stat"), 1);

    sleep(NEG_TIMEOUT + Duration::from_millis(50)).await;
    assert!(cache.stat(ino).await.unwrap_err().is_not_found());
    assert_eq!(store.calls("stat"), 2);
}

#[tokio::test]
async fn test_write_close_upload_cycle() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    assert_eq!(cache.write_at(ino, b"hello", 0).await.unwrap(), 5);
    let (dirty, clean) = cache.lru_state(ino);
    assert!(dirty && !clean);

    // closing must not downgrade a dirty node to clean
    cache.close(ino).await.unwrap();
    let (dirty, _) = cache.lru_state(ino);
    assert!(dirty);

    // not due yet
    assert!(!cache.upload_one(false, None).await.unwrap());

    sleep(UPLOAD_DELAY + Duration::from_millis(50)).await;
    assert!(cache.upload_one(false, None).await.unwrap());
    assert_eq!(store.calls("open_write"), 2); // make + upload
    assert_eq!(remote_content(&store, "/a").await, b"hello");

    let (dirty, clean) = cache.lru_state(ino);
    assert!(!dirty && clean);

    // local content now matches the recorded hash
    let expected = Sha256::digest(b"hello").to_vec();
    assert_eq!(hash_file(&cache.file_path(ino)).unwrap(), expected);
    assert_eq!(cache.list_cache(), vec!["=/a".to_string()]);
}

#[tokio::test]
async fn test_rename_rewrites_subtree_keys() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let dir_ino = cache.open("/d").await.unwrap();
    cache.make(dir_ino, true).await.unwrap();
    let file_ino = cache.open("/d/x").await.unwrap();
    cache.make(file_ino, false).await.unwrap();

    cache.rename(dir_ino, "/e").await.unwrap();
    assert_eq!(store.calls("rename"), 1);

    // descendants keep their inos under the new prefix
    assert_eq!(cache.open("/e").await.unwrap(), dir_ino);
    assert_eq!(cache.open("/e/x").await.unwrap(), file_ino);

    // the open node was patched in place
    let info = cache.stat(file_ino).await.unwrap();
    assert_eq!(info.name, "x");

    // the old name is negatively cached: stat answers without the remote
    let stats_before = store.calls("stat");
    let stale_ino = cache.open("/d").await.unwrap();
    assert_ne!(stale_ino, dir_ino);
    assert!(cache.stat(stale_ino).await.unwrap_err().is_not_found());
    assert_eq!(store.calls("stat"), stats_before);
}

#[tokio::test]
async fn test_rename_into_own_subtree_is_einval() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/d").await.unwrap();
    cache.make(ino, true).await.unwrap();
    assert!(matches!(
        cache.rename(ino, "/d/sub").await,
        Err(ObjError::InvalidParam(_))
    ));
    assert_eq!(store.calls("rename"), 0);
}

#[tokio::test]
async fn test_rename_missing_remote_is_eperm() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    store.remove("/a").await.unwrap();

    assert!(matches!(
        cache.rename(ino, "/b").await,
        Err(ObjError::NotPermitted(_))
    ));
}

#[tokio::test]
async fn test_case_only_rename_takes_single_lock() {
    let store = Arc::new(MemStorage::new(true));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();

    // locking the destination too would deadlock against ourselves
    timeout(Duration::from_secs(2), cache.rename(ino, "/A"))
        .await
        .expect("case-only rename must not deadlock")
        .unwrap();

    assert_eq!(cache.open("/A").await.unwrap(), ino);
    let info = cache.stat(ino).await.unwrap();
    assert_eq!(info.name, "A");
}

#[tokio::test]
async fn test_remove_nonempty_dir_preflights() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let dir_ino = cache.open("/d").await.unwrap();
    cache.make(dir_ino, true).await.unwrap();
    let file_ino = cache.open("/d/x").await.unwrap();
    cache.make(file_ino, false).await.unwrap();

    assert!(matches!(
        cache.remove(dir_ino, true).await,
        Err(ObjError::NotEmpty(_))
    ));
    // the pre-flight never reached the remote
    assert_eq!(store.calls("rmdir"), 0);
}

#[tokio::test]
async fn test_remove_tombstones_and_caches_negatively() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    cache.remove(ino, false).await.unwrap();
    assert_eq!(store.calls("remove"), 1);

    // the tombstoned handle refuses everything but close
    assert!(matches!(
        cache.stat(ino).await,
        Err(ObjError::NotPermitted(_))
    ));
    assert!(matches!(
        cache.make(ino, false).await,
        Err(ObjError::NotPermitted(_))
    ));

    // a fresh lookup sees the negative entry, no remote round trip
    let stats_before = store.calls("stat");
    let ino2 = cache.open("/a").await.unwrap();
    assert_ne!(ino2, ino);
    assert!(cache.stat(ino2).await.unwrap_err().is_not_found());
    assert_eq!(store.calls("stat"), stats_before);
}

#[tokio::test]
async fn test_remove_suppressed_remote_enoent_still_tombstones() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    store.remove("/a").await.unwrap();

    // the remote view drifted: the error surfaces, but local state is
    // cleaned up as if the remove succeeded
    assert!(cache.remove(ino, false).await.unwrap_err().is_not_found());
    assert!(matches!(
        cache.stat(ino).await,
        Err(ObjError::NotPermitted(_))
    ));
    let ino2 = cache.open("/a").await.unwrap();
    assert_ne!(ino2, ino);
}

#[tokio::test]
async fn test_remove_type_mismatch() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let dir_ino = cache.open("/d").await.unwrap();
    cache.make(dir_ino, true).await.unwrap();
    let file_ino = cache.open("/f").await.unwrap();
    cache.make(file_ino, false).await.unwrap();

    assert!(matches!(
        cache.remove(dir_ino, false).await,
        Err(ObjError::IsDir(_))
    ));
    assert!(matches!(
        cache.remove(file_ino, true).await,
        Err(ObjError::NotDir(_))
    ));
}

#[tokio::test]
async fn test_readdir_materializes_children() {
    let store = Arc::new(MemStorage::new(false));
    store.mkdir("/d").await.unwrap();
    for name in ["/d/a", "/d/b", "/d/c"] {
        let mut w = store.open_write(name, 0).await.unwrap();
        w.wait().await.unwrap();
    }

    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let dir_ino = cache.open("/d").await.unwrap();
    let infos = cache.readdir(dir_ino, 0).await.unwrap();
    let mut names: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a", "b", "c"]);

    // listed children were cached; the following stat burst is local
    let stats_before = store.calls("stat");
    for name in ["/d/a", "/d/b", "/d/c"] {
        let ino = cache.open(name).await.unwrap();
        let info = cache.stat(ino).await.unwrap();
        assert!(!info.is_dir);
        // materialized children are eviction candidates
        let (dirty, clean) = cache.lru_state(ino);
        assert!(!dirty && clean);
    }
    assert_eq!(store.calls("stat"), stats_before);
}

#[tokio::test]
async fn test_readdir_pages_and_honors_max_count() {
    let store = Arc::new(MemStorage::new(false).with_page_limit(2));
    store.mkdir("/d").await.unwrap();
    for name in ["/d/a", "/d/b", "/d/c", "/d/e", "/d/f"] {
        let mut w = store.open_write(name, 0).await.unwrap();
        w.wait().await.unwrap();
    }

    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;
    let dir_ino = cache.open("/d").await.unwrap();

    let all = cache.readdir(dir_ino, 0).await.unwrap();
    assert_eq!(all.len(), 5);

    let some = cache.readdir(dir_ino, 3).await.unwrap();
    assert_eq!(some.len(), 3);
}

#[tokio::test]
async fn test_read_at_downloads_lazily_and_reuses_signature() {
    let store = Arc::new(MemStorage::new(false));
    let mut w = store.open_write("/a", 10).await.unwrap();
    {
        use tokio::io::AsyncWriteExt;
        w.write_all(b"0123456789").await.unwrap();
    }
    w.wait().await.unwrap();

    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(cache.read_at(ino, &mut buf, 0).await.unwrap(), 10);
    assert_eq!(&buf, b"0123456789");
    assert_eq!(store.calls("open_read"), 1);

    // partial read from an offset
    let mut buf = [0u8; 4];
    assert_eq!(cache.read_at(ino, &mut buf, 6).await.unwrap(), 4);
    assert_eq!(&buf, b"6789");
    // content was already resident
    assert_eq!(store.calls("open_read"), 1);
}

#[tokio::test]
async fn test_truncate_bounds_the_download() {
    let store = Arc::new(MemStorage::new(false));
    let mut w = store.open_write("/a", 10).await.unwrap();
    {
        use tokio::io::AsyncWriteExt;
        w.write_all(b"0123456789").await.unwrap();
    }
    w.wait().await.unwrap();

    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.truncate(ino, 4).await.unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(cache.read_at(ino, &mut buf, 0).await.unwrap(), 4);
    assert_eq!(&buf[..4], b"0123");

    let (dirty, _) = cache.lru_state(ino);
    assert!(dirty);
}

#[tokio::test]
async fn test_evict_removes_catalog_entry_and_file() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    cache.write_at(ino, b"data", 0).await.unwrap();
    cache.close(ino).await.unwrap();
    assert!(cache.upload_one(true, None).await.unwrap());

    // not due yet
    assert!(!cache.evict_one(false, None).await.unwrap());
    sleep(EVICT_DELAY + Duration::from_millis(50)).await;
    assert!(cache.evict_one(false, None).await.unwrap());

    assert!(!cache.file_path(ino).exists());
    assert!(cache.list_cache().is_empty());
    // the path resolves to a fresh ino now
    assert_ne!(cache.open("/a").await.unwrap(), ino);
}

#[tokio::test]
async fn test_evict_skips_open_node() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    cache.write_at(ino, b"data", 0).await.unwrap();
    assert!(cache.upload_one(true, None).await.unwrap());

    // still open: the sweep consumes the entry but must not evict
    assert!(cache.evict_one(true, None).await.unwrap());
    assert!(cache.file_path(ino).exists());
    assert_eq!(cache.list_cache().len(), 1);

    cache.close(ino).await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_marks_tampered_content_dirty() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();

    let ino;
    let file_path;
    {
        let cache = open_test_cache(&store, &dir).await;
        ino = cache.open("/a").await.unwrap();
        cache.make(ino, false).await.unwrap();
        cache.write_at(ino, b"hello", 0).await.unwrap();
        cache.close(ino).await.unwrap();
        assert!(cache.upload_one(true, None).await.unwrap());
        file_path = cache.file_path(ino);
        cache.close_cache().await.unwrap();
    }

    // modify the cached content behind the engine's back
    std::fs::write(&file_path, b"tampered").unwrap();

    let cache = open_test_cache(&store, &dir).await;
    let (dirty, clean) = cache.lru_state(ino);
    assert!(dirty && !clean);

    assert!(cache.upload_one(true, None).await.unwrap());
    assert_eq!(remote_content(&store, "/a").await, b"tampered");
    let (dirty, clean) = cache.lru_state(ino);
    assert!(!dirty && clean);
}

#[tokio::test]
async fn test_bootstrap_removes_orphan_files() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();

    let orphan = {
        let cache = open_test_cache(&store, &dir).await;
        let orphan = cache.file_path(99);
        std::fs::create_dir_all(orphan.parent().unwrap()).unwrap();
        std::fs::write(&orphan, b"junk").unwrap();
        cache.close_cache().await.unwrap();
        orphan
    };
    assert!(orphan.exists());

    let _cache = open_test_cache(&store, &dir).await;
    assert!(!orphan.exists());
}

#[tokio::test]
async fn test_open_if_exists_requires_index() {
    let store: Arc<MemStorage> = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let missing = Cache::open_cache(
        dir.path().join("cache"),
        store.clone() as Arc<dyn ObjectStorage>,
        Some(test_config()),
        OpenMode::OpenIfExists,
    )
    .await;
    assert!(missing.unwrap_err().is_not_found());

    {
        let cache = open_test_cache(&store, &dir).await;
        cache.close_cache().await.unwrap();
    }
    Cache::open_cache(
        dir.path().join("cache"),
        store as Arc<dyn ObjectStorage>,
        Some(test_config()),
        OpenMode::OpenIfExists,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_background_loop_uploads_without_prompting() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = Cache::open_cache(
        dir.path().join("cache"),
        store.clone() as Arc<dyn ObjectStorage>,
        Some(CacheConfig {
            neg_path_timeout: NEG_TIMEOUT,
            neg_path_max_count: 100,
            loop_period: Duration::from_millis(50),
            upload_delay: Duration::from_millis(50),
            evict_delay: Duration::from_secs(60),
        }),
        OpenMode::Activate,
    )
    .await
    .unwrap();

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    cache.write_at(ino, b"looped", 0).await.unwrap();
    cache.close(ino).await.unwrap();

    // the periodic reset picks the node up once the delay passes
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if remote_content(&store, "/a").await == b"looped" {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "background loop never uploaded"
        );
        sleep(Duration::from_millis(25)).await;
    }

    cache.close_cache().await.unwrap();
}

#[tokio::test]
async fn test_statfs_serves_from_info_cache() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let a = cache.statfs().await.unwrap();
    let b = cache.statfs().await.unwrap();
    assert_eq!(a.total_size, b.total_size);
    assert_eq!(info_sized_calls(&store), 1);

    sleep(EVICT_DELAY + Duration::from_millis(50)).await;
    cache.statfs().await.unwrap();
    assert_eq!(info_sized_calls(&store), 2);
}

#[tokio::test]
async fn test_list_cache_tags() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    cache.write_at(ino, b"x", 0).await.unwrap();
    assert_eq!(cache.list_cache(), vec!["+/a".to_string()]);

    assert!(cache.upload_one(true, None).await.unwrap());
    assert_eq!(cache.list_cache(), vec!["=/a".to_string()]);

    cache.close(ino).await.unwrap();
    std::fs::remove_file(cache.file_path(ino)).unwrap();
    assert_eq!(cache.list_cache(), vec!["-/a".to_string()]);
}

#[tokio::test]
async fn test_chtime_is_unsupported() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    assert!(matches!(
        cache.chtime(ino, std::time::SystemTime::now()).await,
        Err(ObjError::NotSupported(_))
    ));
}

#[tokio::test]
async fn test_bad_handles_are_rejected() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    assert!(matches!(cache.stat(42).await, Err(ObjError::BadHandle(_))));
    assert!(matches!(cache.close(42).await, Err(ObjError::BadHandle(_))));
    assert!(cache.open("relative/path").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_open_refcounts_share_one_node() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    assert_eq!(cache.open("/a").await.unwrap(), ino);

    // first close keeps the handle alive
    cache.close(ino).await.unwrap();
    cache.stat(ino).await.unwrap();

    cache.close(ino).await.unwrap();
    assert!(matches!(cache.stat(ino).await, Err(ObjError::BadHandle(_))));
}

#[tokio::test]
async fn test_sync_without_content_is_a_noop() {
    let store = Arc::new(MemStorage::new(false));
    let dir = TempDir::new().unwrap();
    let cache = open_test_cache(&store, &dir).await;

    let ino = cache.open("/a").await.unwrap();
    cache.make(ino, false).await.unwrap();
    cache.sync(ino).await.unwrap();
    assert_eq!(store.calls("open_read"), 0);
}
