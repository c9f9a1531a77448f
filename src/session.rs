//! File sessions.
//!
//! A session runs the distributed I/O plane for one process: it owns the
//! per-file state (extent index, scratch file, cursor), talks to the
//! metadata/lock server through the RPC plane and serves peer RMA requests
//! out of its scratch files. Sessions persist across close/reopen within the
//! job; everything dies at finalize.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::sys::uio::{pread, pwrite};
use parking_lot::Mutex;
use zerocopy::IntoBytes;
use zerocopy::little_endian::U64;

use crate::addr::ClientAddr;
use crate::config::{self, Config, Semantics};
use crate::error::TfsError;
use crate::extent::ExtentIndex;
use crate::lock::{LockDelegator, LockType};
use crate::rma::RmaClient;
use crate::rpc::RpcClient;
use crate::transport::Transport;
use crate::wire::request::RpcRequest;
use crate::wire::{FrameError, MsgId, WireInterval, WireStat};

/// Pause between retries while another client holds a conflicting lock.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Per-client, per-open-file state.
pub struct FileSession {
    path: String,
    scratch_path: PathBuf,
    index: ExtentIndex,
    cursor: AtomicU64,
    scratch: Mutex<Option<File>>,
    pfs: Mutex<Option<File>>,
}

impl FileSession {
    /// Logical path of the file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The extent index (exposed for inspection).
    pub fn extents(&self) -> &ExtentIndex {
        &self.index
    }

    /// Current logical offset.
    pub fn tell(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    fn set_cursor(&self, value: u64) {
        self.cursor.store(value, Ordering::Relaxed);
    }

    fn with_scratch<T>(&self, f: impl FnOnce(&File) -> Result<T, TfsError>) -> Result<T, TfsError> {
        let mut guard = self.scratch.lock();
        if guard.is_none() {
            // reopened after close: the scratch bytes must survive, no truncate
            *guard = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.scratch_path)
                    .map_err(TfsError::Io)?,
            );
        }
        let file = guard.as_ref().ok_or_else(|| {
            TfsError::Io(io::Error::other("scratch file unavailable"))
        })?;
        f(file)
    }

    fn with_pfs<T>(&self, f: impl FnOnce(&File) -> Result<T, TfsError>) -> Result<T, TfsError> {
        let mut guard = self.pfs.lock();
        if guard.is_none() {
            *guard = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.path)
                    .map_err(TfsError::Io)?,
            );
        }
        let file = guard.as_ref().ok_or_else(|| {
            TfsError::Io(io::Error::other("backing file unavailable"))
        })?;
        f(file)
    }
}

#[derive(Default)]
pub(crate) struct FileRegistry {
    files: Mutex<HashMap<String, Arc<FileSession>>>,
}

/// A process's handle on the distributed I/O plane, created by
/// [`TangramFs::init`] and threaded through every operation.
pub struct TangramFs {
    config: Config,
    rank: u32,
    rpc: Arc<RpcClient>,
    rma: RmaClient,
    delegator: LockDelegator,
    files: Arc<FileRegistry>,
}

impl TangramFs {
    /// Join the job: locate the server through its address file, wire up the
    /// RPC client and start serving peer RMA requests. Rank 0 announces the
    /// job size to the server.
    pub fn init(
        config: Config,
        rank: u32,
        size: u32,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<TangramFs>, TfsError> {
        let server_addr = config::read_server_addr(&config)?;
        let rpc = RpcClient::new(transport.clone(), server_addr);
        let files = Arc::new(FileRegistry::default());

        let registry = files.clone();
        transport.set_rma_handler(Box::new(move |payload| serve_rma_data(&registry, payload)));

        if rank == 0 {
            rpc.send_server(MsgId::MpiSize, U64::new(size as u64).as_bytes())?;
        }

        debug!("client {rank}/{size} up, server {}", rpc.server_addr());
        Ok(Arc::new(TangramFs {
            config,
            rank,
            rma: RmaClient::new(transport),
            delegator: LockDelegator::new(rpc.clone()),
            rpc,
            files,
        }))
    }

    /// The consistency mode this process runs under.
    pub fn semantics(&self) -> Semantics {
        self.config.semantics
    }

    /// Address peers use to reach this client.
    pub fn self_addr(&self) -> &ClientAddr {
        self.rpc.client_addr()
    }

    /// True iff `path` resolves under the persist dir, i.e. I/O on it is
    /// managed by this session rather than passed through.
    pub fn should_intercept(&self, path: &str) -> bool {
        let resolved = fs::canonicalize(path).unwrap_or_else(|_| PathBuf::from(path));
        resolved.starts_with(&self.config.persist_dir)
    }

    /// Open (or re-open) the logical file `path`.
    ///
    /// Re-opening resets the cursor and reuses the cached extent index and
    /// scratch bytes; the index is only dropped at finalize, the way a page
    /// cache outlives a close.
    pub fn open(&self, path: &str) -> Result<Arc<FileSession>, TfsError> {
        let mut files = self.files.files.lock();
        if let Some(tf) = files.get(path) {
            tf.set_cursor(0);
            return Ok(tf.clone());
        }

        let scratch_path = scratch_file_path(&self.config.buffer_dir, path, self.rank);
        // a stale scratch file would alias dead bytes from an earlier job
        match fs::remove_file(&scratch_path) {
            Ok(()) => debug!("removed stale scratch {}", scratch_path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(TfsError::Io(err)),
        }
        let scratch = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&scratch_path)
            .map_err(TfsError::Io)?;

        let tf = Arc::new(FileSession {
            path: path.to_owned(),
            scratch_path,
            index: ExtentIndex::new(),
            cursor: AtomicU64::new(0),
            scratch: Mutex::new(Some(scratch)),
            pfs: Mutex::new(None),
        });
        files.insert(path.to_owned(), tf.clone());
        Ok(tf)
    }

    /// Append `buf` to the scratch file and record the extent at the cursor.
    /// No RPC happens on the write itself.
    pub fn write(&self, tf: &FileSession, buf: &[u8]) -> Result<usize, TfsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let offset = tf.tell();
        if self.config.semantics == Semantics::Strong {
            self.acquire_blocking(tf, offset, buf.len() as u64, LockType::Write)?;
        }

        let local_offset = tf.with_scratch(|file| {
            let local_offset = file.metadata().map_err(TfsError::Io)?.len();
            pwrite_full(file, buf, local_offset)?;
            Ok(local_offset)
        })?;

        tf.index.add(
            offset,
            offset + buf.len() as u64 - 1,
            local_offset,
            self.self_addr().clone(),
        );
        tf.set_cursor(offset + buf.len() as u64);
        Ok(buf.len())
    }

    /// Read at the cursor: ask the metadata service who owns the range,
    /// fetch from that peer over RMA, or read locally with a PFS fallback.
    pub fn read(&self, tf: &FileSession, buf: &mut [u8]) -> Result<usize, TfsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let offset = tf.tell();
        let count = buf.len() as u64;
        if self.config.semantics == Semantics::Strong {
            self.acquire_blocking(tf, offset, count, LockType::Read)?;
        }

        let owner = match self.query(tf, offset, count) {
            Ok(owner) => owner,
            Err(err) => {
                warn!("query {} [{offset}, +{count}) failed: {err}", tf.path);
                None
            }
        };

        // prefer self when both sides could serve: skip the RPC entirely
        match owner {
            Some(owner) if owner != *self.self_addr() => {
                match self.rma.fetch(&owner, &tf.path, offset, count, buf) {
                    Ok(_) => {
                        tf.set_cursor(offset + count);
                        Ok(buf.len())
                    }
                    Err(err) => {
                        warn!("rma fetch from {owner} failed ({err}), falling back");
                        self.read_local(tf, buf)
                    }
                }
            }
            _ => self.read_local(tf, buf),
        }
    }

    /// The local-read path: copy from the scratch file when the extents
    /// cover the request, otherwise flush and read from the PFS.
    fn read_local(&self, tf: &FileSession, buf: &mut [u8]) -> Result<usize, TfsError> {
        let req_start = tf.tell();
        let req_end = req_start + buf.len() as u64 - 1;

        let plan = tf.index.read().covering_chunks(req_start, req_end);
        match plan {
            Some(chunks) => {
                tf.with_scratch(|file| {
                    for chunk in &chunks {
                        let dst = (chunk.logical_start - req_start) as usize;
                        let len = (chunk.logical_end - chunk.logical_start + 1) as usize;
                        pread_exact(file, &mut buf[dst..dst + len], chunk.local_offset)?;
                    }
                    Ok(())
                })?;
                tf.set_cursor(req_start + buf.len() as u64);
                Ok(buf.len())
            }
            None => {
                debug!(
                    "read {} [{req_start}, {req_end}] not local, trying PFS",
                    tf.path
                );
                self.flush(tf)?;
                let n = tf.with_pfs(|file| pread_to_end(file, buf, req_start))?;
                tf.set_cursor(req_start + n as u64);
                Ok(n)
            }
        }
    }

    /// Ask the metadata service who last wrote `[offset, offset + count)`.
    pub fn query(
        &self,
        tf: &FileSession,
        offset: u64,
        count: u64,
    ) -> Result<Option<ClientAddr>, TfsError> {
        let payload = RpcRequest::encode_one(&tf.path, offset, count, 0);
        let resp = self.rpc.sendrecv_server(MsgId::QueryReq, &payload)?;
        if resp.is_empty() {
            return Ok(None);
        }
        Ok(Some(ClientAddr::from_bytes(&resp)?))
    }

    /// Tell the metadata service this client now backs one range.
    pub fn post(&self, tf: &FileSession, offset: u64, count: u64) -> Result<(), TfsError> {
        if count == 0 {
            return Ok(());
        }
        let payload = RpcRequest::encode_one(&tf.path, offset, count, 0);
        self.rpc.sendrecv_server(MsgId::PostReq, &payload).map(drop)
    }

    /// Post every current extent in a single RPC.
    // TODO track extents posted since the last call and send only the delta;
    // re-posts are idempotent on the server, so this is a bandwidth matter.
    pub fn post_all(&self, tf: &FileSession) -> Result<(), TfsError> {
        let intervals: Vec<WireInterval> = tf
            .index
            .read()
            .iter()
            .map(|ext| WireInterval::new(ext.logical_start, ext.len(), 0))
            .collect();
        if intervals.is_empty() {
            return Ok(());
        }
        let payload = RpcRequest::encode(&tf.path, &intervals);
        self.rpc.sendrecv_server(MsgId::PostReq, &payload).map(drop)
    }

    /// Make this client's writes visible under COMMIT semantics.
    pub fn commit(&self, tf: &FileSession) -> Result<(), TfsError> {
        if self.config.semantics == Semantics::Commit {
            self.post_all(tf)?;
        }
        Ok(())
    }

    /// Stat a logical file through the metadata service.
    pub fn stat(&self, path: &str) -> Result<(u64, i64), TfsError> {
        let payload = RpcRequest::encode(path, &[]);
        let resp = self.rpc.sendrecv_server(MsgId::StatReq, &payload)?;
        if resp.is_empty() {
            return Err(TfsError::NotFound);
        }
        let stat =
            <WireStat as zerocopy::FromBytes>::read_from_bytes(&resp).map_err(|_| {
                TfsError::Frame(FrameError::ShortRead {
                    have: resp.len(),
                    need: size_of::<WireStat>(),
                })
            })?;
        Ok((stat.size.get(), stat.mtime.get()))
    }

    /// Reposition the cursor. `End` resolves against the local extent
    /// maximum, assuming the local end is the global end.
    pub fn seek(&self, tf: &FileSession, pos: SeekFrom) -> u64 {
        let cursor = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => tf.tell().saturating_add_signed(delta),
            SeekFrom::End(delta) => {
                let end = tf.index.max_end().map_or(0, |end| end + 1);
                end.saturating_add_signed(delta)
            }
        };
        tf.set_cursor(cursor);
        cursor
    }

    /// Current logical offset of the file's cursor.
    pub fn tell(&self, tf: &FileSession) -> u64 {
        tf.tell()
    }

    /// Write every extent back to the backing PFS file, in page-sized
    /// chunks. Positional and idempotent.
    pub fn flush(&self, tf: &FileSession) -> Result<(), TfsError> {
        let chunk_size = page_size::get();
        let mut copy = vec![0u8; chunk_size];

        let view = tf.index.read();
        for ext in view.iter() {
            let mut done = 0u64;
            while done < ext.len() {
                let want = chunk_size.min((ext.len() - done) as usize);
                let n = tf.with_scratch(|file| {
                    pread_to_end(file, &mut copy[..want], ext.local_offset + done)
                })?;
                if n == 0 {
                    // scratch shorter than the index claims; was it deleted?
                    warn!("flush {}: scratch ends inside an extent", tf.path);
                    break;
                }
                tf.with_pfs(|file| {
                    pwrite_full(file, &copy[..n], ext.logical_start + done)?;
                    Ok(())
                })?;
                done += n as u64;
            }
        }
        Ok(())
    }

    /// Close the file. COMMIT and RELAXED post the extent set (the lock path
    /// already serialized visibility under STRONG, which instead drops this
    /// file's tokens). The extent index survives for a later re-open.
    pub fn close(&self, tf: &FileSession) -> Result<(), TfsError> {
        if self.config.semantics == Semantics::Strong {
            self.delegator.release_file(&tf.path)?;
        } else {
            self.post_all(tf)?;
        }
        tf.scratch.lock().take();
        tf.pfs.lock().take();
        Ok(())
    }

    /// Leave the job: drop every lock this client holds and all per-file
    /// state.
    pub fn finalize(&self) -> Result<(), TfsError> {
        self.delegator.release_client()?;
        self.files.files.lock().clear();
        Ok(())
    }

    /// Ask the server to exit its progress loop (normally rank 0, at job
    /// teardown).
    pub fn stop_server(&self) -> Result<(), TfsError> {
        self.rpc.send_server(MsgId::StopReq, &[])
    }

    fn acquire_blocking(
        &self,
        tf: &FileSession,
        offset: u64,
        count: u64,
        typ: LockType,
    ) -> Result<(), TfsError> {
        loop {
            match self.delegator.acquire(&tf.path, offset, count, typ) {
                Ok(_token) => return Ok(()),
                Err(TfsError::LockConflict { .. }) => {
                    // the holder has to release first; keep asking
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Serve one peer RMA request out of the local scratch files. Registered as
/// the transport's bulk callback at init.
fn serve_rma_data(files: &FileRegistry, payload: &[u8]) -> Result<Vec<u8>, TfsError> {
    let req = RpcRequest::parse(payload)?;
    let [iv] = req.intervals else {
        warn!(
            "rma request for {} carries {} intervals, expected 1",
            req.path,
            req.intervals.len()
        );
        return Err(TfsError::IndexGap);
    };

    let tf = files
        .files
        .lock()
        .get(req.path)
        .cloned()
        .ok_or(TfsError::IndexGap)?;

    let req_start = iv.offset.get();
    let count = iv.count.get();
    if count == 0 {
        return Ok(Vec::new());
    }
    let req_end = req_start + count - 1;

    let plan = tf
        .index
        .read()
        .covering_chunks(req_start, req_end)
        .ok_or(TfsError::IndexGap)?;

    let mut data = vec![0u8; count as usize];
    tf.with_scratch(|file| {
        for chunk in &plan {
            let dst = (chunk.logical_start - req_start) as usize;
            let len = (chunk.logical_end - chunk.logical_start + 1) as usize;
            pread_exact(file, &mut data[dst..dst + len], chunk.local_offset)?;
        }
        Ok(())
    })?;
    Ok(data)
}

/// Scratch file for one (open, process):
/// `<buffer_dir>/tfs_tmp.<escaped>.<rank>` with `/` escaped to `_`.
fn scratch_file_path(buffer_dir: &Path, logical: &str, rank: u32) -> PathBuf {
    let escaped: String = logical
        .chars()
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    buffer_dir.join(format!("tfs_tmp.{escaped}.{rank}"))
}

fn pwrite_full(file: &File, buf: &[u8], offset: u64) -> Result<(), TfsError> {
    let mut written = 0;
    while written < buf.len() {
        let n = pwrite(file, &buf[written..], (offset + written as u64) as i64)?;
        if n == 0 {
            return Err(TfsError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "pwrite returned 0",
            )));
        }
        written += n;
    }
    Ok(())
}

/// Fill `buf` exactly; the backing bytes are known to exist.
fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> Result<(), TfsError> {
    let mut read = 0;
    while read < buf.len() {
        let n = pread(file, &mut buf[read..], (offset + read as u64) as i64)?;
        if n == 0 {
            return Err(TfsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "scratch file ends inside an indexed extent",
            )));
        }
        read += n;
    }
    Ok(())
}

/// Read as much of `buf` as the file has, stopping at EOF.
fn pread_to_end(file: &File, buf: &mut [u8], offset: u64) -> Result<usize, TfsError> {
    let mut read = 0;
    while read < buf.len() {
        let n = pread(file, &mut buf[read..], (offset + read as u64) as i64)?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read)
}
