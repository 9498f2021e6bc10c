//! The persistent per-object record and its binary codec.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use objstore::{ObjError, ObjResult, ObjectInfo};

/// A cached object. Persisted in the catalog under its canonical path-key;
/// `path` keeps the user-visible spelling.
#[derive(Debug, Clone)]
pub struct Node {
    /// Stable 64-bit identity, assigned once and never recycled.
    pub ino: u64,
    pub path: String,
    pub size: u64,
    pub btime: SystemTime,
    pub mtime: SystemTime,
    pub is_dir: bool,
    /// Opaque remote signature, presented on download to elide transfers.
    pub sig: String,
    /// SHA-256 of the locally cached content at the last reconciled point.
    /// Empty if no content has been reconciled.
    pub hash: Vec<u8>,
    /// Remote metadata has been observed for this node.
    pub valid: bool,
}

impl Node {
    pub fn new(ino: u64, path: &str) -> Self {
        Self {
            ino,
            path: path.to_string(),
            size: 0,
            btime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            is_dir: false,
            sig: String::new(),
            hash: Vec::new(),
            valid: false,
        }
    }

    /// Take over the remote metadata from `info` and mark the node valid.
    pub fn copy_stat(&mut self, info: &ObjectInfo) {
        self.size = info.size;
        self.btime = info.btime;
        self.mtime = info.mtime;
        self.is_dir = info.is_dir;
        self.sig = info.sig.clone();
        self.valid = true;
    }

    /// The node's metadata as an [`ObjectInfo`]. Fails on a node that was
    /// never reconciled with the remote.
    pub fn object_info(&self) -> ObjResult<ObjectInfo> {
        if self.ino == 0 || self.path.is_empty() || !self.valid {
            return Err(ObjError::InvalidParam(format!(
                "node {} has no valid metadata",
                self.path
            )));
        }
        Ok(ObjectInfo {
            name: base_name(&self.path),
            size: self.size,
            btime: self.btime,
            mtime: self.mtime,
            is_dir: self.is_dir,
            sig: self.sig.clone(),
        })
    }

    /// Length in bytes of the encoded form.
    pub fn encode_len(&self) -> usize {
        8 + 8 + 8 + 8 + 2 + 2 + 1 + 1 + self.path.len() + self.sig.len() + self.hash.len()
    }

    /// Encode into the fixed big-endian layout:
    /// ino, size, btime, mtime, len(path) u16, len(sig) u16, is_dir u8,
    /// len(hash) u8, path, sig, hash.
    pub fn encode(&self) -> ObjResult<Vec<u8>> {
        if self.ino == 0 || self.path.is_empty() || !self.valid {
            return Err(ObjError::InvalidParam(format!(
                "cannot encode unreconciled node {}",
                self.path
            )));
        }
        if self.path.len() > u16::MAX as usize
            || self.sig.len() > u16::MAX as usize
            || self.hash.len() > u8::MAX as usize
        {
            return Err(ObjError::InvalidParam(format!(
                "node {} has oversized fields",
                self.path
            )));
        }

        let mut v = Vec::with_capacity(self.encode_len());
        v.extend_from_slice(&self.ino.to_be_bytes());
        v.extend_from_slice(&self.size.to_be_bytes());
        v.extend_from_slice(&unix_nanos(self.btime).to_be_bytes());
        v.extend_from_slice(&unix_nanos(self.mtime).to_be_bytes());
        v.extend_from_slice(&(self.path.len() as u16).to_be_bytes());
        v.extend_from_slice(&(self.sig.len() as u16).to_be_bytes());
        v.push(self.is_dir as u8);
        v.push(self.hash.len() as u8);
        v.extend_from_slice(self.path.as_bytes());
        v.extend_from_slice(self.sig.as_bytes());
        v.extend_from_slice(&self.hash);
        Ok(v)
    }

    /// Decode an encoded node. Any malformed input is an I/O error.
    pub fn decode(v: &[u8]) -> ObjResult<Node> {
        let mut r = Reader { b: v, i: 0 };
        let ino = r.u64()?;
        let size = r.u64()?;
        let btime = from_unix_nanos(r.u64()?);
        let mtime = from_unix_nanos(r.u64()?);
        let path_len = r.u16()? as usize;
        let sig_len = r.u16()? as usize;
        let is_dir = r.u8()? != 0;
        let hash_len = r.u8()? as usize;
        let path = String::from_utf8(r.bytes(path_len)?.to_vec())
            .map_err(|e| ObjError::IoError(format!("bad node path encoding: {}", e)))?;
        let sig = String::from_utf8(r.bytes(sig_len)?.to_vec())
            .map_err(|e| ObjError::IoError(format!("bad node sig encoding: {}", e)))?;
        let hash = r.bytes(hash_len)?.to_vec();

        Ok(Node {
            ino,
            path,
            size,
            btime,
            mtime,
            is_dir,
            sig,
            hash,
            valid: true,
        })
    }
}

pub fn base_name(path: &str) -> String {
    match path.rsplit('/').next() {
        Some("") | None => "/".to_string(),
        Some(base) => base.to_string(),
    }
}

fn unix_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn from_unix_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

struct Reader<'a> {
    b: &'a [u8],
    i: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> ObjResult<&'a [u8]> {
        let end = self
            .i
            .checked_add(len)
            .filter(|&end| end <= self.b.len())
            .ok_or_else(|| ObjError::IoError("truncated node record".to_string()))?;
        let out = &self.b[self.i..end];
        self.i = end;
        Ok(out)
    }

    fn u8(&mut self) -> ObjResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> ObjResult<u16> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> ObjResult<u64> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}
