//! Persistent namespace index over an embedded SQLite database.
//!
//! Three tables stand in for the three buckets of the index format:
//! `meta` holds the format version and the ino sequence, `idx` maps
//! ino to the catalog key currently holding its node, and `cat` maps
//! canonical path-key to the encoded node. Catalog keys are BLOBs so
//! range scans follow raw byte order.

use std::path::Path;
use std::sync::Mutex;

use log::warn;
use rusqlite::{params, Connection, OptionalExtension};

use objstore::{ObjError, ObjResult};

use crate::node::Node;
use crate::path::path_key_has_prefix;

/// Bump when the database format changes.
pub const VERSION: u64 = 1;

const VERSION_KEY: &str = "version";
const INO_SEQ_KEY: &str = "ino_seq";

fn db_err(err: rusqlite::Error) -> ObjError {
    ObjError::DbError(err.to_string())
}

pub struct CacheIndexDb {
    conn: Mutex<Connection>,
}

impl CacheIndexDb {
    /// Open (or create) the index file, asserting the format version.
    pub fn open(path: &Path) -> ObjResult<Self> {
        let mut conn = Connection::open(path).map_err(|e| {
            warn!("index db: open {} failed: {}", path.display(), e);
            db_err(e)
        })?;

        let tx = conn.transaction().map_err(db_err)?;
        let had_idx = tx
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'idx'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(db_err)?
            > 0;

        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                name TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS idx (
                ino INTEGER PRIMARY KEY,
                path_key BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS cat (
                path_key BLOB PRIMARY KEY,
                node BLOB NOT NULL
            );",
        )
        .map_err(db_err)?;

        let want = VERSION.to_be_bytes().to_vec();
        let stored: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM meta WHERE name = ?1",
                params![VERSION_KEY],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match stored {
            Some(v) if v == want => {}
            Some(_) => return Err(ObjError::DbError("incorrect database version".to_string())),
            None if had_idx => {
                return Err(ObjError::DbError("incorrect database version".to_string()))
            }
            None => {
                tx.execute(
                    "INSERT INTO meta (name, value) VALUES (?1, ?2)",
                    params![VERSION_KEY, want],
                )
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run read-only work against the index.
    pub fn with_view<T>(&self, f: impl FnOnce(&NodeTxn) -> ObjResult<T>) -> ObjResult<T> {
        let conn = self.conn.lock().unwrap();
        f(&NodeTxn { conn: &conn })
    }

    /// Run mutating work inside one transaction. Commits on `Ok`, rolls
    /// back on `Err` so no partial state is ever exposed.
    pub fn with_txn<T>(&self, f: impl FnOnce(&NodeTxn) -> ObjResult<T>) -> ObjResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        let out = f(&NodeTxn { conn: &tx })?;
        tx.commit().map_err(db_err)?;
        Ok(out)
    }
}

pub struct NodeTxn<'a> {
    conn: &'a Connection,
}

impl NodeTxn<'_> {
    pub fn get_node(&self, key: &[u8]) -> ObjResult<Node> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT node FROM cat WHERE path_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match blob {
            Some(v) => Node::decode(&v),
            None => Err(ObjError::NotFound(
                String::from_utf8_lossy(key).into_owned(),
            )),
        }
    }

    pub fn get_node_by_ino(&self, ino: u64) -> ObjResult<Node> {
        let key: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT path_key FROM idx WHERE ino = ?1",
                params![ino as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match key {
            Some(k) => self.get_node(&k),
            None => Err(ObjError::NotFound(format!("ino {}", ino))),
        }
    }

    /// Write the node under `key`. The index row is rewritten only when
    /// the previous ino mapping disagrees; a stale mapping left behind by
    /// a re-keying is the caller's business (rename re-keys explicitly).
    pub fn put_node(&self, key: &[u8], node: &Node) -> ObjResult<()> {
        let v = node.encode()?;
        let prev: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT path_key FROM idx WHERE ino = ?1",
                params![node.ino as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if prev.as_deref() != Some(key) {
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO idx (ino, path_key) VALUES (?1, ?2)",
                    params![node.ino as i64, key],
                )
                .map_err(db_err)?;
        }
        self.conn
            .execute(
                "INSERT OR REPLACE INTO cat (path_key, node) VALUES (?1, ?2)",
                params![key, v],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Remove the node under `key` together with its index row. An absent
    /// node is not an error.
    pub fn delete_node(&self, key: &[u8]) -> ObjResult<()> {
        let node = match self.get_node(key) {
            Ok(node) => node,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        self.conn
            .execute("DELETE FROM idx WHERE ino = ?1", params![node.ino as i64])
            .map_err(db_err)?;
        self.conn
            .execute("DELETE FROM cat WHERE path_key = ?1", params![key])
            .map_err(db_err)?;
        Ok(())
    }

    /// Draw the next value from the monotonic ino sequence. Must run
    /// inside a write transaction. Inos start at 1 and are never reused.
    pub fn next_ino(&self) -> ObjResult<u64> {
        let stored: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE name = ?1",
                params![INO_SEQ_KEY],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let current = match stored {
            Some(v) if v.len() == 8 => u64::from_be_bytes(v[..8].try_into().unwrap()),
            Some(_) => return Err(ObjError::DbError("bad ino sequence record".to_string())),
            None => 0,
        };
        let next = current + 1;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO meta (name, value) VALUES (?1, ?2)",
                params![INO_SEQ_KEY, next.to_be_bytes().to_vec()],
            )
            .map_err(db_err)?;
        Ok(next)
    }

    /// All catalog entries whose key equals `key` or lives underneath it,
    /// in key order.
    pub fn scan_prefix(&self, key: &[u8]) -> ObjResult<Vec<(Vec<u8>, Node)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path_key, node FROM cat WHERE path_key >= ?1 ORDER BY path_key")
            .map_err(db_err)?;
        let mut rows = stmt.query(params![key]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let k: Vec<u8> = row.get(0).map_err(db_err)?;
            if !path_key_has_prefix(&k, key) {
                break;
            }
            let v: Vec<u8> = row.get(1).map_err(db_err)?;
            out.push((k, Node::decode(&v)?));
        }
        Ok(out)
    }

    /// Count catalog entries under `key`, stopping early at `limit`.
    pub fn count_prefix(&self, key: &[u8], limit: usize) -> ObjResult<usize> {
        let mut stmt = self
            .conn
            .prepare("SELECT path_key FROM cat WHERE path_key >= ?1 ORDER BY path_key")
            .map_err(db_err)?;
        let mut rows = stmt.query(params![key]).map_err(db_err)?;
        let mut count = 0;
        while let Some(row) = rows.next().map_err(db_err)? {
            let k: Vec<u8> = row.get(0).map_err(db_err)?;
            if !path_key_has_prefix(&k, key) || count >= limit {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Every decodable catalog entry, in key order. Undecodable records
    /// are skipped.
    pub fn scan_all(&self) -> ObjResult<Vec<(Vec<u8>, Node)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path_key, node FROM cat ORDER BY path_key")
            .map_err(db_err)?;
        let mut rows = stmt.query([]).map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(db_err)? {
            let k: Vec<u8> = row.get(0).map_err(db_err)?;
            let v: Vec<u8> = row.get(1).map_err(db_err)?;
            if let Ok(node) = Node::decode(&v) {
                out.push((k, node));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use objstore::ObjectInfo;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn make_node(ino: u64, path: &str) -> Node {
        let mut node = Node::new(ino, path);
        node.copy_stat(&ObjectInfo {
            name: crate::node::base_name(path),
            size: 7,
            btime: SystemTime::now(),
            mtime: SystemTime::now(),
            is_dir: false,
            sig: "v1".to_string(),
        });
        node
    }

    #[test]
    fn test_put_get_by_key_and_ino() {
        let dir = TempDir::new().unwrap();
        let db = CacheIndexDb::open(&dir.path().join("index")).unwrap();

        let ino = db.with_txn(|tx| {
            let ino = tx.next_ino()?;
            tx.put_node(b"/a", &make_node(ino, "/a"))?;
            Ok(ino)
        })
        .unwrap();
        assert_eq!(ino, 1);

        let node = db.with_view(|tx| tx.get_node(b"/a")).unwrap();
        assert_eq!(node.ino, 1);
        assert_eq!(node.path, "/a");

        let node = db.with_view(|tx| tx.get_node_by_ino(1)).unwrap();
        assert_eq!(node.path, "/a");

        assert!(db
            .with_view(|tx| tx.get_node(b"/missing"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_ino_sequence_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let db = CacheIndexDb::open(&dir.path().join("index")).unwrap();
        let inos = db
            .with_txn(|tx| Ok((tx.next_ino()?, tx.next_ino()?, tx.next_ino()?)))
            .unwrap();
        assert_eq!(inos, (1, 2, 3));
    }

    #[test]
    fn test_delete_node_absent_is_ok() {
        let dir = TempDir::new().unwrap();
        let db = CacheIndexDb::open(&dir.path().join("index")).unwrap();
        db.with_txn(|tx| tx.delete_node(b"/nope")).unwrap();

        db.with_txn(|tx| tx.put_node(b"/a", &make_node(1, "/a")))
            .unwrap();
        db.with_txn(|tx| tx.delete_node(b"/a")).unwrap();
        assert!(db
            .with_view(|tx| tx.get_node_by_ino(1))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_scan_prefix_respects_component_boundary() {
        let dir = TempDir::new().unwrap();
        let db = CacheIndexDb::open(&dir.path().join("index")).unwrap();
        db.with_txn(|tx| {
            tx.put_node(b"/a", &make_node(1, "/a"))?;
            tx.put_node(b"/a/b", &make_node(2, "/a/b"))?;
            tx.put_node(b"/ab", &make_node(3, "/ab"))?;
            Ok(())
        })
        .unwrap();

        let entries = db.with_view(|tx| tx.scan_prefix(b"/a")).unwrap();
        let keys: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"/a".as_slice(), b"/a/b".as_slice()]);

        assert_eq!(db.with_view(|tx| tx.count_prefix(b"/a", 2)).unwrap(), 2);
        assert_eq!(db.with_view(|tx| tx.count_prefix(b"/ab", 2)).unwrap(), 1);
    }

    #[test]
    fn test_version_survives_reopen_and_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index");
        {
            let db = CacheIndexDb::open(&path).unwrap();
            db.with_txn(|tx| tx.put_node(b"/a", &make_node(1, "/a")))
                .unwrap();
        }
        let db = CacheIndexDb::open(&path).unwrap();
        assert_eq!(db.with_view(|tx| tx.get_node(b"/a")).unwrap().ino, 1);

        // Corrupt the stored version; the next open must refuse.
        db.with_txn(|tx| {
            tx.conn
                .execute(
                    "UPDATE meta SET value = ?1 WHERE name = ?2",
                    params![99u64.to_be_bytes().to_vec(), VERSION_KEY],
                )
                .map_err(db_err)?;
            Ok(())
        })
        .unwrap();
        drop(db);
        assert!(matches!(
            CacheIndexDb::open(&path),
            Err(ObjError::DbError(_))
        ));
    }

    #[test]
    fn test_put_node_moves_index_row() {
        let dir = TempDir::new().unwrap();
        let db = CacheIndexDb::open(&dir.path().join("index")).unwrap();
        db.with_txn(|tx| tx.put_node(b"/a", &make_node(5, "/a")))
            .unwrap();
        db.with_txn(|tx| {
            tx.delete_node(b"/a")?;
            tx.put_node(b"/b", &make_node(5, "/b"))
        })
        .unwrap();
        let node = db.with_view(|tx| tx.get_node_by_ino(5)).unwrap();
        assert_eq!(node.path, "/b");
    }
}
