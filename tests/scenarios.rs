//! End-to-end scenarios: a whole job (server + clients) wired through the
//! loopback transport, with real scratch files and a tempdir standing in for
//! the PFS.

use std::io::SeekFrom;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tangramfs::{
    ClientAddr, Config, DEFAULT_WORKERS, LoopbackHub, LockType, Semantics, TangramFs,
    TangramServer, config,
};
use tempfile::TempDir;

struct Job {
    hub: LoopbackHub,
    server: TangramServer,
    // stops the dispatch loop when the job is dropped
    _running: tangramfs::BackgroundServer,
    config: Config,
    _persist: TempDir,
    _buffer: TempDir,
}

impl Job {
    fn start(semantics: Semantics) -> Job {
        let _ = env_logger::builder().is_test(true).try_init();

        let persist = tempfile::tempdir().unwrap();
        let buffer = tempfile::tempdir().unwrap();
        let mut config = Config::new(persist.path(), buffer.path()).unwrap();
        config.semantics = semantics;

        let hub = LoopbackHub::new();
        let server_addr = ClientAddr::new(b"node0".to_vec(), b"server".to_vec());
        config::write_server_addr(&config, &server_addr).unwrap();

        let server = TangramServer::new();
        let running = server
            .start(Arc::new(hub.endpoint(server_addr)), DEFAULT_WORKERS)
            .unwrap()
            .spawn()
            .unwrap();

        Job {
            hub,
            server,
            _running: running,
            config,
            _persist: persist,
            _buffer: buffer,
        }
    }

    fn client(&self, rank: u32, size: u32) -> Arc<TangramFs> {
        let addr = ClientAddr::new(b"node0".to_vec(), format!("rank{rank}").into_bytes());
        let transport = Arc::new(self.hub.endpoint(addr));
        TangramFs::init(self.config.clone(), rank, size, transport).unwrap()
    }

    fn path(&self, name: &str) -> String {
        self.config.persist_dir.join(name).to_string_lossy().into_owned()
    }

    fn overlapping_write_tokens(&self, path: &str) -> bool {
        let tokens = self.server.locks().tokens(path);
        for (i, a) in tokens.iter().enumerate() {
            for b in tokens.iter().skip(i + 1) {
                if a.typ == LockType::Write
                    && b.typ == LockType::Write
                    && a.range.overlaps(b.range)
                {
                    return true;
                }
            }
        }
        false
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

const MIB: usize = 1024 * 1024;

// S1: a rank reads back exactly what it wrote, without any peer involved.
#[test]
fn single_writer_local_read() {
    let job = Job::start(Semantics::Relaxed);
    let fs = job.client(0, 1);
    let path = job.path("s1");

    let tf = fs.open(&path).unwrap();
    let data = pattern(MIB, 7);
    assert_eq!(fs.write(&tf, &data).unwrap(), MIB);
    assert_eq!(fs.tell(&tf), MIB as u64);

    fs.seek(&tf, SeekFrom::Start(0));
    let mut back = vec![0u8; MIB];
    assert_eq!(fs.read(&tf, &mut back).unwrap(), MIB);
    assert_eq!(back, data);
}

// S2: after the writer posts, a peer's read resolves the owner and pulls the
// bytes over RMA.
#[test]
fn peer_rma_read() {
    let job = Job::start(Semantics::Relaxed);
    let fs0 = job.client(0, 2);
    let fs1 = job.client(1, 2);
    let path = job.path("s2");

    let data = pattern(MIB, 3);
    let tf0 = fs0.open(&path).unwrap();
    fs0.write(&tf0, &data).unwrap();
    fs0.post_all(&tf0).unwrap();

    let tf1 = fs1.open(&path).unwrap();
    let owner = fs1.query(&tf1, 0, MIB as u64).unwrap();
    assert_eq!(owner.as_ref(), Some(fs0.self_addr()));

    fs1.seek(&tf1, SeekFrom::Start(0));
    let mut back = vec![0u8; MIB];
    assert_eq!(fs1.read(&tf1, &mut back).unwrap(), MIB);
    assert_eq!(back, data);
    assert_eq!(fs1.tell(&tf1), MIB as u64);
}

// S3: a range nobody wrote comes from the backing PFS file (possibly
// zero-length).
#[test]
fn pfs_fallback_read() {
    let job = Job::start(Semantics::Relaxed);
    let fs = job.client(0, 1);
    let path = job.path("s3");
    std::fs::write(&path, b"backing bytes").unwrap();

    let tf = fs.open(&path).unwrap();
    let mut buf = vec![0u8; 4096];
    let n = fs.read(&tf, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"backing bytes");
    assert_eq!(fs.tell(&tf), n as u64);

    // past the end of the backing file: a zero-length read
    assert_eq!(fs.read(&tf, &mut buf).unwrap(), 0);
}

// S4: a later overlapping write shadows the middle of an earlier one.
#[test]
fn overlap_overwrite() {
    let job = Job::start(Semantics::Relaxed);
    let fs = job.client(0, 1);
    let path = job.path("s4");

    let tf = fs.open(&path).unwrap();
    fs.write(&tf, b"AAAA").unwrap();
    fs.seek(&tf, SeekFrom::Start(1));
    fs.write(&tf, b"BB").unwrap();

    fs.seek(&tf, SeekFrom::Start(0));
    let mut back = [0u8; 4];
    assert_eq!(fs.read(&tf, &mut back).unwrap(), 4);
    assert_eq!(&back, b"ABBA");

    // extent union covers [0, 3] and nothing overlaps
    let index = tf.extents();
    assert_eq!(index.max_end(), Some(3));
    assert!(index.read().covering_chunks(0, 3).is_some());
}

// S5: under STRONG, a conflicting writer waits and the server never holds
// two overlapping WR tokens.
#[test]
fn strong_write_lock_conflict() {
    let job = Job::start(Semantics::Strong);
    let fs0 = job.client(0, 2);
    let fs1 = job.client(1, 2);
    let path = job.path("s5");

    let tf0 = fs0.open(&path).unwrap();
    fs0.write(&tf0, &[0u8; 101]).unwrap();

    let writer = {
        let fs1 = fs1.clone();
        let path = path.clone();
        thread::spawn(move || {
            let tf1 = fs1.open(&path).unwrap();
            fs1.seek(&tf1, SeekFrom::Start(50));
            fs1.write(&tf1, &[1u8; 101]).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!writer.is_finished(), "conflicting write went through");
    assert!(!job.overlapping_write_tokens(&path));

    // releasing rank 0's tokens lets the blocked writer in
    fs0.close(&tf0).unwrap();
    writer.join().unwrap();
    assert!(!job.overlapping_write_tokens(&path));
}

// S6: post_all ships every extent of a fragmented file in one request.
#[test]
fn post_all_enumerates_every_extent() {
    let job = Job::start(Semantics::Relaxed);
    let fs = job.client(0, 1);
    let path = job.path("s6");

    let tf = fs.open(&path).unwrap();
    for i in 0..1000u64 {
        fs.write(&tf, &[i as u8]).unwrap();
        fs.seek(&tf, SeekFrom::Current(1));
    }
    assert_eq!(tf.extents().count(), 1000);

    fs.post_all(&tf).unwrap();

    let me = Some(fs.self_addr().clone());
    for probe in [0u64, 2, 500, 1998] {
        assert_eq!(fs.query(&tf, probe, 1).unwrap(), me);
    }
    // odd offsets were skipped over and never written
    assert_eq!(fs.query(&tf, 1, 1).unwrap(), None);
    assert_eq!(fs.query(&tf, 999, 1).unwrap(), None);
}

#[test]
fn commit_publishes_under_commit_semantics() {
    let job = Job::start(Semantics::Commit);
    let fs0 = job.client(0, 2);
    let fs1 = job.client(1, 2);
    let path = job.path("commit");

    let tf0 = fs0.open(&path).unwrap();
    fs0.write(&tf0, b"published at commit").unwrap();

    let tf1 = fs1.open(&path).unwrap();
    assert_eq!(fs1.query(&tf1, 0, 4).unwrap(), None);

    fs0.commit(&tf0).unwrap();
    assert_eq!(fs1.query(&tf1, 0, 4).unwrap().as_ref(), Some(fs0.self_addr()));
}

#[test]
fn relaxed_close_publishes() {
    let job = Job::start(Semantics::Relaxed);
    let fs0 = job.client(0, 2);
    let fs1 = job.client(1, 2);
    let path = job.path("close-posts");

    let data = pattern(8192, 11);
    let tf0 = fs0.open(&path).unwrap();
    fs0.write(&tf0, &data).unwrap();
    fs0.close(&tf0).unwrap();

    // the peer reads through RMA; the writer's scratch outlives its close
    let tf1 = fs1.open(&path).unwrap();
    let mut back = vec![0u8; 8192];
    assert_eq!(fs1.read(&tf1, &mut back).unwrap(), 8192);
    assert_eq!(back, data);
}

#[test]
fn reopen_reuses_cached_extents() {
    let job = Job::start(Semantics::Relaxed);
    let fs = job.client(0, 1);
    let path = job.path("reopen");

    let tf = fs.open(&path).unwrap();
    fs.write(&tf, b"sticky").unwrap();
    fs.close(&tf).unwrap();

    let tf = fs.open(&path).unwrap();
    assert_eq!(fs.tell(&tf), 0);
    assert_eq!(tf.extents().count(), 1);
    let mut back = [0u8; 6];
    assert_eq!(fs.read(&tf, &mut back).unwrap(), 6);
    assert_eq!(&back, b"sticky");
}

#[test]
fn flush_writes_extents_to_pfs() {
    let job = Job::start(Semantics::Relaxed);
    let fs = job.client(0, 1);
    let path = job.path("flush");

    let data = pattern(3 * 4096 + 17, 5);
    let tf = fs.open(&path).unwrap();
    fs.write(&tf, &data).unwrap();
    fs.flush(&tf).unwrap();
    // idempotent
    fs.flush(&tf).unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[test]
fn stat_reflects_posted_size() {
    let job = Job::start(Semantics::Relaxed);
    let fs = job.client(0, 1);
    let path = job.path("stat");

    let tf = fs.open(&path).unwrap();
    fs.write(&tf, &[0u8; 4096]).unwrap();
    fs.post(&tf, 0, 4096).unwrap();

    let (size, mtime) = fs.stat(&path).unwrap();
    assert_eq!(size, 4096);
    assert!(mtime > 0);
}

#[test]
fn seek_end_uses_local_extent_max() {
    let job = Job::start(Semantics::Relaxed);
    let fs = job.client(0, 1);
    let path = job.path("seek");

    let tf = fs.open(&path).unwrap();
    assert_eq!(fs.seek(&tf, SeekFrom::End(0)), 0);
    fs.write(&tf, &[0u8; 100]).unwrap();
    fs.seek(&tf, SeekFrom::Start(500));
    fs.write(&tf, &[0u8; 10]).unwrap();
    assert_eq!(fs.seek(&tf, SeekFrom::End(0)), 510);
    assert_eq!(fs.seek(&tf, SeekFrom::End(-10)), 500);
    assert_eq!(fs.seek(&tf, SeekFrom::Current(4)), 504);
    assert_eq!(fs.tell(&tf), 504);
}

#[test]
fn intercept_rule_matches_persist_prefix() {
    let job = Job::start(Semantics::Relaxed);
    let fs = job.client(0, 1);
    assert!(fs.should_intercept(&job.path("anything")));
    assert!(!fs.should_intercept("/etc/hosts"));
}

#[test]
fn finalize_releases_client_locks() {
    let job = Job::start(Semantics::Strong);
    let fs = job.client(0, 1);
    let path = job.path("fin");

    let tf = fs.open(&path).unwrap();
    fs.write(&tf, &[0u8; 10]).unwrap();
    assert!(!job.server.locks().tokens(&path).is_empty());

    fs.finalize().unwrap();
    assert!(job.server.locks().tokens(&path).is_empty());
}
