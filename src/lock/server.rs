//! Server tier of the lock manager: the authority for every token.
//!
//! Handlers run on worker threads, but the table is taken as a whole for
//! each operation, which serializes lock decisions the way the progress
//! thread serialized them in the wire protocol's reference deployment.

use std::collections::HashMap;

use log::debug;
use parking_lot::Mutex;

use super::{ByteRange, LockToken, LockType, TokenList};
use crate::addr::ClientAddr;
use crate::error::TfsError;

/// The authoritative lock table: `path -> token list`.
#[derive(Default)]
pub struct LockServer {
    tables: Mutex<HashMap<String, TokenList>>,
}

impl LockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant (or refuse) a token over `[offset, offset + count)`.
    ///
    /// Already-covered requests return the held token, upgrading RD to WR in
    /// place when asked. A request conflicting with another owner's token is
    /// refused with [`TfsError::LockConflict`]; nothing is ever granted over
    /// a conflicting range. The first grant on an untouched file extends to
    /// `[offset, infinity)`.
    pub fn acquire(
        &self,
        requester: &ClientAddr,
        path: &str,
        offset: u64,
        count: u64,
        typ: LockType,
    ) -> Result<LockToken, TfsError> {
        let mut tables = self.tables.lock();
        let list = tables.entry(path.to_owned()).or_default();
        let range = ByteRange::from_offset_count(offset, count);

        if let Some(idx) = list.position_cover_owned(range, requester) {
            let held = list.get(idx);
            if !(held.typ == LockType::Read && typ == LockType::Write) {
                return Ok(held.clone());
            }
            // RD -> WR upgrade flips the whole token; refuse when any other
            // owner still reads inside it
            let held_range = held.range;
            if list
                .find_conflict(held_range, LockType::Write, requester)
                .is_some()
            {
                return Err(conflict(path, offset, count));
            }
            list.set_type(idx, LockType::Write);
            debug!("lock upgrade {path} [{offset}, +{count}) for {requester}");
            return Ok(list.get(idx).clone());
        }

        if list.find_conflict(range, typ, requester).is_some() {
            debug!("lock refuse {path} [{offset}, +{count}) for {requester}");
            return Err(conflict(path, offset, count));
        }

        let grant_range = if list.is_empty() {
            ByteRange::unbounded_from(offset)
        } else {
            list.absorb_own(range, typ, requester)
        };
        let token = LockToken {
            range: grant_range,
            typ,
            owner: requester.clone(),
        };
        list.push(token.clone());
        debug!(
            "lock grant {path} [{}, {}] {:?} to {requester}",
            grant_range.start, grant_range.end, typ
        );
        Ok(token)
    }

    /// Delete any token of `requester` covering `[offset, offset + count)`.
    pub fn release(&self, requester: &ClientAddr, path: &str, offset: u64, count: u64) {
        let mut tables = self.tables.lock();
        if let Some(list) = tables.get_mut(path) {
            list.remove_covering_owned(ByteRange::from_offset_count(offset, count), requester);
        }
    }

    /// Delete every token `requester` holds in `path`.
    pub fn release_file(&self, requester: &ClientAddr, path: &str) {
        let mut tables = self.tables.lock();
        if let Some(list) = tables.get_mut(path) {
            list.remove_client(requester);
        }
    }

    /// Delete every token `requester` holds, across all files. Invoked on
    /// client crash or finalize.
    pub fn release_client(&self, requester: &ClientAddr) {
        let mut tables = self.tables.lock();
        for list in tables.values_mut() {
            list.remove_client(requester);
        }
    }

    /// Tokens currently granted for `path` (diagnostics and tests).
    pub fn tokens(&self, path: &str) -> Vec<LockToken> {
        let tables = self.tables.lock();
        tables
            .get(path)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn conflict(path: &str, offset: u64, count: u64) -> TfsError {
    TfsError::LockConflict {
        path: path.to_owned(),
        offset,
        count,
    }
}
