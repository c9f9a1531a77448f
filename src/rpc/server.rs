//! Server half of the RPC plane.
//!
//! Incoming requests land on per-worker FIFO queues in round-robin order; a
//! fixed pool of workers pops, runs the registered service handler and sends
//! the reply as a separate active message back to the requester. The
//! dispatch loop is single-threaded and is the sole progress driver of the
//! transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use zerocopy::FromBytes;
use zerocopy::little_endian::U64;

use crate::addr::ClientAddr;
use crate::error::TfsError;
use crate::transport::{Transport, unpack_envelope};
use crate::wire::MsgId;
use crate::wire::reply::Response;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 8;

const PROGRESS_TICK: Duration = Duration::from_millis(1);

/// The service behind the pool: maps one request to an optional reply.
pub(crate) type ServiceHandler =
    Arc<dyn Fn(MsgId, &ClientAddr, &[u8]) -> Option<(MsgId, Response)> + Send + Sync>;

struct Task {
    id: MsgId,
    client: ClientAddr,
    payload: Vec<u8>,
}

#[derive(Default)]
struct WorkerQueue {
    tasks: Mutex<VecDeque<Task>>,
    available: Condvar,
}

struct ServerShared {
    running: AtomicBool,
    queues: Vec<WorkerQueue>,
    next_worker: AtomicUsize,
    expected_clients: AtomicU64,
}

impl ServerShared {
    fn append_task(&self, task: Task) {
        let who = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        let queue = &self.queues[who];
        queue.tasks.lock().push_back(task);
        queue.available.notify_one();
    }

    fn shut_down(&self) {
        self.running.store(false, Ordering::SeqCst);
        for queue in &self.queues {
            queue.available.notify_all();
        }
    }
}

/// Worker-pool RPC server bound to one transport endpoint.
pub struct RpcServer {
    transport: Arc<dyn Transport>,
    shared: Arc<ServerShared>,
    workers: Vec<JoinHandle<()>>,
}

impl RpcServer {
    /// Register receive handlers and start `workers` worker threads.
    ///
    /// Fails when the OS refuses to create a thread; workers already started
    /// are wound down before the error is returned.
    pub(crate) fn start(
        transport: Arc<dyn Transport>,
        handler: ServiceHandler,
        workers: usize,
    ) -> Result<RpcServer, TfsError> {
        let workers = workers.max(1);
        let shared = Arc::new(ServerShared {
            running: AtomicBool::new(true),
            queues: (0..workers).map(|_| WorkerQueue::default()).collect(),
            next_worker: AtomicUsize::new(0),
            expected_clients: AtomicU64::new(0),
        });

        for id in [
            MsgId::PostReq,
            MsgId::QueryReq,
            MsgId::StatReq,
            MsgId::AcquireLockReq,
            MsgId::ReleaseLockReq,
            MsgId::ReleaseLockFileReq,
            MsgId::ReleaseLockClientReq,
        ] {
            debug_assert!(id.is_server_request());
            let shared = shared.clone();
            transport.set_am_handler(
                id,
                Box::new(move |envelope| match unpack_envelope(envelope) {
                    Ok((client, payload)) => shared.append_task(Task {
                        id,
                        client,
                        payload: payload.to_vec(),
                    }),
                    Err(err) => warn!("dropping malformed {id:?}: {err}"),
                }),
            );
        }

        {
            let shared = shared.clone();
            transport.set_am_handler(
                MsgId::MpiSize,
                Box::new(move |envelope| {
                    if let Ok((_, payload)) = unpack_envelope(envelope) {
                        if let Ok(count) = U64::read_from_bytes(payload) {
                            shared.expected_clients.store(count.get(), Ordering::SeqCst);
                            info!("serving {} clients", count.get());
                        }
                    }
                }),
            );
        }
        {
            let shared = shared.clone();
            transport.set_am_handler(
                MsgId::StopReq,
                Box::new(move |_envelope| {
                    info!("stop requested");
                    shared.shut_down();
                }),
            );
        }

        let mut threads = Vec::with_capacity(workers);
        for tid in 0..workers {
            let worker_shared = shared.clone();
            let worker_transport = transport.clone();
            let worker_handler = handler.clone();
            let spawned = thread::Builder::new()
                .name(format!("tfs-worker-{tid}"))
                .spawn(move || worker_main(tid, worker_shared, worker_transport, worker_handler));
            match spawned {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    // wind down the part of the pool that did start
                    shared.shut_down();
                    for thread in threads {
                        if thread.join().is_err() {
                            error!("worker thread panicked");
                        }
                    }
                    return Err(TfsError::Io(err));
                }
            }
        }

        Ok(RpcServer {
            transport,
            shared,
            workers: threads,
        })
    }

    /// True until a `STOP_REQ` arrives or [`stop`](RpcServer::stop) is called.
    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Ask the dispatch loop and the workers to exit.
    pub fn stop(&self) {
        self.shared.shut_down();
    }

    /// Drive the transport until stopped, then drain the pool.
    pub fn run(mut self) {
        while self.running() {
            self.transport.progress_wait(PROGRESS_TICK);
        }
        // deliver whatever was queued before the stop arrived
        while self.transport.progress() {}
        self.shared.shut_down();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    /// Run the dispatch loop on a background thread.
    ///
    /// Fails when the OS refuses to create the thread; the worker pool is
    /// wound down before the error is returned.
    pub fn spawn(self) -> Result<BackgroundServer, TfsError> {
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("tfs-server".to_owned())
            .spawn(move || self.run());
        match spawned {
            Ok(guard) => Ok(BackgroundServer {
                shared,
                guard: Some(guard),
            }),
            Err(err) => {
                // the workers never get a dispatch loop; wake them up to exit
                shared.shut_down();
                Err(TfsError::Io(err))
            }
        }
    }
}

fn worker_main(
    tid: usize,
    shared: Arc<ServerShared>,
    transport: Arc<dyn Transport>,
    handler: ServiceHandler,
) {
    let queue = &shared.queues[tid];
    loop {
        let task = {
            let mut tasks = queue.tasks.lock();
            while tasks.is_empty() && shared.running.load(Ordering::SeqCst) {
                queue.available.wait(&mut tasks);
            }
            match tasks.pop_front() {
                Some(task) => task,
                // woke up because the server stopped
                None => return,
            }
        };

        if let Some((respond_id, response)) = handler(task.id, &task.client, &task.payload) {
            if let Err(err) = transport.send_am(&task.client, respond_id, response.bytes()) {
                warn!("worker {tid}: failed to answer {:?}: {err}", task.id);
            }
        }
    }
}

/// Handle to a server running on a background thread. Dropping it stops the
/// server and joins the dispatch loop.
pub struct BackgroundServer {
    shared: Arc<ServerShared>,
    guard: Option<JoinHandle<()>>,
}

impl BackgroundServer {
    /// Stop the server and wait for the dispatch loop to finish.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shared.shut_down();
        if let Some(guard) = self.guard.take() {
            if guard.join().is_err() {
                error!("server thread panicked");
            }
        }
    }
}

impl Drop for BackgroundServer {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
