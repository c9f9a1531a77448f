//! Byte-range lock tokens.
//!
//! A token grants one client RD or WR access to an inclusive byte range of
//! one logical file. Token lifecycle per range and owner is
//! `absent -> RD -> WR -> absent`: RD upgrades to WR in place, a downgrade is
//! modeled as release + reacquire.

use crate::addr::ClientAddr;
use crate::wire::FrameError;

pub(crate) mod delegator;
pub(crate) mod server;

pub use delegator::LockDelegator;
pub use server::LockServer;

/// Lock flavor. `Write` is incompatible with everything held by others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
}

impl LockType {
    pub(crate) fn to_wire(self) -> i32 {
        match self {
            LockType::Read => 0,
            LockType::Write => 1,
        }
    }

    pub(crate) fn from_wire(raw: i32) -> Result<Self, FrameError> {
        match raw {
            0 => Ok(LockType::Read),
            1 => Ok(LockType::Write),
            other => Err(FrameError::BadLockType(other)),
        }
    }
}

/// Inclusive byte range; `end == u64::MAX` means file-unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Range for the half-open request `[offset, offset + count)`.
    pub fn from_offset_count(offset: u64, count: u64) -> Self {
        let end = match count {
            0 => offset,
            n => offset.checked_add(n - 1).unwrap_or(u64::MAX),
        };
        ByteRange { start: offset, end }
    }

    /// `[offset, infinity)`.
    pub fn unbounded_from(offset: u64) -> Self {
        ByteRange {
            start: offset,
            end: u64::MAX,
        }
    }

    pub fn covers(&self, other: ByteRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    pub fn overlaps(&self, other: ByteRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn union(&self, other: ByteRange) -> ByteRange {
        ByteRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub range: ByteRange,
    pub typ: LockType,
    pub owner: ClientAddr,
}

/// Per-file list of granted tokens.
#[derive(Debug, Default)]
pub(crate) struct TokenList {
    tokens: Vec<LockToken>,
}

impl TokenList {
    pub(crate) fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &LockToken> {
        self.tokens.iter()
    }

    pub(crate) fn push(&mut self, token: LockToken) {
        self.tokens.push(token);
    }

    /// Index of a token owned by `owner` covering the whole `range`.
    pub(crate) fn position_cover_owned(
        &self,
        range: ByteRange,
        owner: &ClientAddr,
    ) -> Option<usize> {
        self.tokens
            .iter()
            .position(|tok| tok.owner == *owner && tok.range.covers(range))
    }

    pub(crate) fn get(&self, index: usize) -> &LockToken {
        &self.tokens[index]
    }

    pub(crate) fn set_type(&mut self, index: usize, typ: LockType) {
        self.tokens[index].typ = typ;
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> LockToken {
        self.tokens.remove(index)
    }

    /// A token that makes a grant of (`range`, `typ`) to `requester`
    /// inadmissible: held by someone else, overlapping, and at least one of
    /// the two sides is WR.
    pub(crate) fn find_conflict(
        &self,
        range: ByteRange,
        typ: LockType,
        requester: &ClientAddr,
    ) -> Option<&LockToken> {
        self.tokens.iter().find(|tok| {
            tok.owner != *requester
                && tok.range.overlaps(range)
                && (tok.typ == LockType::Write || typ == LockType::Write)
        })
    }

    /// Delete every token owned by `owner` that covers `range`. Idempotent.
    pub(crate) fn remove_covering_owned(&mut self, range: ByteRange, owner: &ClientAddr) {
        self.tokens
            .retain(|tok| !(tok.owner == *owner && tok.range.covers(range)));
    }

    /// Delete every token owned by `owner`.
    pub(crate) fn remove_client(&mut self, owner: &ClientAddr) {
        self.tokens.retain(|tok| tok.owner != *owner);
    }

    /// Absorb `owner`'s tokens that a grant over `range` subsumes.
    ///
    /// Tokens covered by `range` are dropped. For a WR grant, a partially
    /// overlapping WR token of the same owner is merged into the grant range
    /// (two overlapping WR tokens may not coexist, even same-owner). Returns
    /// the possibly widened grant range.
    pub(crate) fn absorb_own(
        &mut self,
        mut range: ByteRange,
        typ: LockType,
        owner: &ClientAddr,
    ) -> ByteRange {
        loop {
            let mut changed = false;
            self.tokens.retain(|tok| {
                if tok.owner != *owner || !tok.range.overlaps(range) {
                    return true;
                }
                if range.covers(tok.range) {
                    changed = true;
                    return false;
                }
                if typ == LockType::Write && tok.typ == LockType::Write {
                    range = range.union(tok.range);
                    changed = true;
                    return false;
                }
                true
            });
            if !changed {
                return range;
            }
        }
    }
}
