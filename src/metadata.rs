//! Location records of the metadata service.
//!
//! For each logical file the service keeps an interval map from logical byte
//! ranges to the address of the last client that posted them. Overlapping
//! posts resolve last-writer-wins, so the map reuses the extent-index algebra
//! (the scratch offset slot is unused here).

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use parking_lot::Mutex;

use crate::addr::ClientAddr;
use crate::extent::ExtentIndex;

struct FileRecord {
    owners: ExtentIndex,
    mtime: i64,
}

/// The "who last wrote byte `b` of file `F`" store.
pub struct MetadataStore {
    files: Mutex<HashMap<String, FileRecord>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        MetadataStore {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `writer` now backs the given `(offset, count)` ranges.
    /// Later posts overwrite earlier claims on any intersection.
    pub fn post(&self, path: &str, writer: &ClientAddr, intervals: &[(u64, u64)]) {
        let mut files = self.files.lock();
        let record = files.entry(path.to_owned()).or_insert_with(|| FileRecord {
            owners: ExtentIndex::new(),
            mtime: 0,
        });
        for &(offset, count) in intervals {
            if count == 0 {
                continue;
            }
            record.owners.add(offset, offset + count - 1, 0, writer.clone());
        }
        record.mtime = unix_now();
        debug!(
            "post {path}: {} interval(s) from {writer}, {} span(s) total",
            intervals.len(),
            record.owners.count()
        );
    }

    /// The client whose claim intersects `[offset, offset + count)`, if any.
    pub fn query(&self, path: &str, offset: u64, count: u64) -> Option<ClientAddr> {
        let end = if count == 0 { offset } else { offset + count - 1 };
        let files = self.files.lock();
        let record = files.get(path)?;
        record
            .owners
            .read()
            .find(offset, end)
            .map(|span| span.owner.clone())
    }

    /// Size (highest posted logical end + 1) and post mtime for a file the
    /// service has records of; falls back to a PFS `stat` otherwise.
    pub fn stat(&self, path: &str) -> Option<(u64, i64)> {
        {
            let files = self.files.lock();
            if let Some(record) = files.get(path) {
                let size = record.owners.max_end().map_or(0, |end| end + 1);
                return Some((size, record.mtime));
            }
        }
        pfs_stat(Path::new(path))
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

fn pfs_stat(path: &Path) -> Option<(u64, i64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64);
    Some((meta.len(), mtime))
}
