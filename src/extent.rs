//! Per-file extent index.
//!
//! Maps logical byte ranges of one logical file to regions of the owning
//! client's scratch file. Stored extents are disjoint and ordered; a newer
//! write replaces coverage over any overlap (the authoritative extent for a
//! byte is the most recent insertion covering it). Readers iterate under a
//! shared lock; writers take the index exclusively.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::addr::ClientAddr;

/// A contiguous logical byte range backed by a contiguous scratch region.
/// Bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    pub logical_start: u64,
    pub logical_end: u64,
    /// Offset of the backing bytes in the owner's scratch file.
    pub local_offset: u64,
    /// Client authoritative for these bytes.
    pub owner: ClientAddr,
}

impl Extent {
    /// Number of bytes the extent covers.
    pub fn len(&self) -> u64 {
        self.logical_end - self.logical_start + 1
    }

    /// True when the extent intersects `[a, b]`.
    pub fn intersects(&self, a: u64, b: u64) -> bool {
        self.logical_start <= b && self.logical_end >= a
    }
}

/// One step of a planned local read: copy
/// `[logical_start, logical_end]` from `local_offset` in the scratch file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyChunk {
    pub logical_start: u64,
    pub logical_end: u64,
    pub local_offset: u64,
}

/// The per-file extent index (concurrent readers, exclusive writer).
#[derive(Debug, Default)]
pub struct ExtentIndex {
    // keyed by logical_start; disjointness makes the key unique per byte
    extents: RwLock<BTreeMap<u64, Extent>>,
}

impl ExtentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an extent, deleting any existing coverage over the overlap.
    ///
    /// Overlapped extents are truncated or split; the right-hand remainder of
    /// a split keeps its backing bytes by advancing `local_offset` past the
    /// trimmed prefix.
    pub fn add(&self, logical_start: u64, logical_end: u64, local_offset: u64, owner: ClientAddr) {
        assert!(logical_start <= logical_end, "inverted extent bounds");
        let mut map = self.extents.write();

        let mut stale: Vec<u64> = Vec::new();
        if let Some((&key, prev)) = map.range(..logical_start).next_back() {
            if prev.logical_end >= logical_start {
                stale.push(key);
            }
        }
        stale.extend(map.range(logical_start..=logical_end).map(|(&key, _)| key));

        for key in stale {
            let old = map.remove(&key).expect("stale key vanished");
            if old.logical_start < logical_start {
                let mut left = old.clone();
                left.logical_end = logical_start - 1;
                map.insert(left.logical_start, left);
            }
            if old.logical_end > logical_end {
                let trimmed = logical_end + 1 - old.logical_start;
                map.insert(
                    logical_end + 1,
                    Extent {
                        logical_start: logical_end + 1,
                        logical_end: old.logical_end,
                        local_offset: old.local_offset + trimmed,
                        owner: old.owner,
                    },
                );
            }
        }

        map.insert(
            logical_start,
            Extent {
                logical_start,
                logical_end,
                local_offset,
                owner,
            },
        );

        debug_assert!(disjoint_and_ordered(&map), "extent overlap after add");
    }

    /// Number of stored extents.
    pub fn count(&self) -> usize {
        self.extents.read().len()
    }

    /// Largest stored `logical_end`, if any extent exists.
    pub fn max_end(&self) -> Option<u64> {
        self.extents
            .read()
            .values()
            .next_back()
            .map(|ext| ext.logical_end)
    }

    /// Take the shared lock for iteration and coverage checks.
    pub fn read(&self) -> ExtentView<'_> {
        ExtentView {
            guard: self.extents.read(),
        }
    }
}

/// A read-locked view of the index. Holding the view blocks writers.
pub struct ExtentView<'a> {
    guard: RwLockReadGuard<'a, BTreeMap<u64, Extent>>,
}

impl ExtentView<'_> {
    /// Any extent intersecting `[a, b]`, favoring the left-most.
    pub fn find(&self, a: u64, b: u64) -> Option<&Extent> {
        if let Some((_, ext)) = self.guard.range(..=a).next_back() {
            if ext.logical_end >= a {
                return Some(ext);
            }
        }
        self.guard
            .range((Bound::Excluded(a), Bound::Included(b)))
            .next()
            .map(|(_, ext)| ext)
    }

    /// In-order traversal of all extents.
    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.guard.values()
    }

    /// Plan a fully-local read of `[req_start, req_end]` (inclusive).
    ///
    /// Walks the extents forward from the one covering `req_start`, tracking
    /// the next byte still unaccounted for. Returns the copy plan when the
    /// stored extents cover the whole range, `None` on any gap.
    pub fn covering_chunks(&self, req_start: u64, req_end: u64) -> Option<Vec<CopyChunk>> {
        let mut chunks = Vec::new();
        let mut expected = req_start;

        let first_key = match self.guard.range(..=req_start).next_back() {
            Some((&key, ext)) if ext.logical_end >= req_start => key,
            _ => req_start,
        };

        for node in self.guard.range(first_key..).map(|(_, ext)| ext) {
            if node.logical_start > req_end {
                break;
            }
            if expected < node.logical_start {
                // hole between extents
                return None;
            }
            let chunk_start = node.logical_start.max(req_start);
            let chunk_end = node.logical_end.min(req_end);
            chunks.push(CopyChunk {
                logical_start: chunk_start,
                logical_end: chunk_end,
                local_offset: node.local_offset + (chunk_start - node.logical_start),
            });
            if node.logical_end >= req_end {
                return Some(chunks);
            }
            expected = node.logical_end + 1;
        }

        None
    }
}

fn disjoint_and_ordered(map: &BTreeMap<u64, Extent>) -> bool {
    let mut prev_end: Option<u64> = None;
    for ext in map.values() {
        if ext.logical_start > ext.logical_end {
            return false;
        }
        if let Some(end) = prev_end {
            if ext.logical_start <= end {
                return false;
            }
        }
        prev_end = Some(ext.logical_end);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(tag: &str) -> ClientAddr {
        ClientAddr::new(tag.as_bytes().to_vec(), Vec::new())
    }

    fn ranges(index: &ExtentIndex) -> Vec<(u64, u64, u64)> {
        index
            .read()
            .iter()
            .map(|e| (e.logical_start, e.logical_end, e.local_offset))
            .collect()
    }

    #[test]
    fn disjoint_after_overlapping_adds() {
        let index = ExtentIndex::new();
        index.add(0, 99, 0, addr("a"));
        index.add(50, 149, 100, addr("a"));
        index.add(25, 74, 200, addr("a"));
        index.add(0, 9, 250, addr("a"));

        let view = index.read();
        let mut prev_end = None;
        for ext in view.iter() {
            if let Some(end) = prev_end {
                assert!(ext.logical_start > end);
            }
            prev_end = Some(ext.logical_end);
        }
    }

    #[test]
    fn newer_write_replaces_overlap() {
        // "AAAA" at 0, then "BB" at 1: extents must expose A|BB|A
        let index = ExtentIndex::new();
        index.add(0, 3, 0, addr("a"));
        index.add(1, 2, 4, addr("a"));
        assert_eq!(ranges(&index), vec![(0, 0, 0), (1, 2, 4), (3, 3, 3)]);
    }

    #[test]
    fn split_advances_local_offset() {
        let index = ExtentIndex::new();
        index.add(10, 29, 0, addr("a"));
        index.add(15, 19, 100, addr("a"));
        // right remainder [20,29] must point 10 bytes into the original run
        assert_eq!(ranges(&index), vec![(10, 14, 0), (15, 19, 100), (20, 29, 10)]);
    }

    #[test]
    fn one_extent_engulfs_many() {
        let index = ExtentIndex::new();
        index.add(0, 9, 0, addr("a"));
        index.add(20, 29, 10, addr("a"));
        index.add(40, 49, 20, addr("a"));
        index.add(0, 60, 30, addr("a"));
        assert_eq!(ranges(&index), vec![(0, 60, 30)]);
    }

    #[test]
    fn find_intersecting() {
        let index = ExtentIndex::new();
        index.add(10, 19, 0, addr("a"));
        index.add(30, 39, 10, addr("a"));
        let view = index.read();
        assert_eq!(view.find(0, 5).map(|e| e.logical_start), None);
        assert_eq!(view.find(15, 15).map(|e| e.logical_start), Some(10));
        assert_eq!(view.find(20, 35).map(|e| e.logical_start), Some(30));
        assert_eq!(view.find(19, 30).map(|e| e.logical_start), Some(10));
    }

    #[test]
    fn coverage_complete_iff_union_covers() {
        let index = ExtentIndex::new();
        index.add(0, 9, 0, addr("a"));
        index.add(10, 19, 10, addr("a"));
        index.add(30, 39, 20, addr("a"));

        let view = index.read();
        assert!(view.covering_chunks(0, 19).is_some());
        assert!(view.covering_chunks(5, 12).is_some());
        assert!(view.covering_chunks(0, 25).is_none());
        assert!(view.covering_chunks(20, 29).is_none());
        assert!(view.covering_chunks(5, 35).is_none());
        // single byte at an extent boundary
        assert!(view.covering_chunks(10, 10).is_some());
        assert!(view.covering_chunks(39, 39).is_some());
        assert!(view.covering_chunks(40, 40).is_none());
    }

    #[test]
    fn chunk_plan_offsets() {
        let index = ExtentIndex::new();
        index.add(0, 9, 100, addr("a"));
        index.add(10, 19, 200, addr("a"));
        let view = index.read();
        let plan = view.covering_chunks(5, 14).unwrap();
        assert_eq!(
            plan,
            vec![
                CopyChunk {
                    logical_start: 5,
                    logical_end: 9,
                    local_offset: 105,
                },
                CopyChunk {
                    logical_start: 10,
                    logical_end: 14,
                    local_offset: 200,
                },
            ]
        );
    }

    #[test]
    fn count_and_max() {
        let index = ExtentIndex::new();
        assert_eq!(index.count(), 0);
        assert_eq!(index.max_end(), None);
        index.add(100, 199, 0, addr("a"));
        index.add(0, 9, 100, addr("a"));
        assert_eq!(index.count(), 2);
        assert_eq!(index.max_end(), Some(199));
    }
}
