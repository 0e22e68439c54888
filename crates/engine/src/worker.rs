//! Named pools of cooperative workers.
//!
//! A worker owns a FIFO notification queue and runs a loop: pop one
//! notification, acquire the store's global lock, run it, release. An
//! execution is pinned to one worker from first schedule until it is
//! terminal, which is what guarantees single-worker advancement.
//!
//! Two pool kinds exist: threaded pools own their OS threads; external
//! pools only produce jobs for an implementer-supplied scheduler and
//! never spawn threads.

use host::LockHandler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler contract of an external pool.
pub trait JobScheduler: Send + Sync {
    fn add_job(&self, job: Job);
}

/// A named worker pool.
#[derive(Clone)]
pub struct Pool {
    name: Arc<str>,
    kind: PoolKind,
}

#[derive(Clone)]
enum PoolKind {
    Threaded(Arc<ThreadedPool>),
    External {
        scheduler: Arc<dyn JobScheduler>,
        lock: LockHandler,
    },
}

impl Pool {
    pub(crate) fn threaded(name: &str, size: usize, lock: LockHandler) -> Pool {
        Pool {
            name: name.into(),
            kind: PoolKind::Threaded(ThreadedPool::spawn(name, size.max(1), lock)),
        }
    }

    pub(crate) fn external(name: &str, scheduler: Arc<dyn JobScheduler>, lock: LockHandler) -> Pool {
        Pool {
            name: name.into(),
            kind: PoolKind::External { scheduler, lock },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pick a worker for a new execution. Threaded pools rotate over
    /// their workers; external pools hand out a forwarding worker.
    pub fn assign_worker(&self) -> WorkerHandle {
        match &self.kind {
            PoolKind::Threaded(pool) => pool.next_worker(),
            PoolKind::External { scheduler, lock } => WorkerHandle {
                inner: Arc::new(WorkerInner::External {
                    scheduler: scheduler.clone(),
                    lock: lock.clone(),
                }),
            },
        }
    }

    pub fn shutdown(&self) {
        if let PoolKind::Threaded(pool) = &self.kind {
            pool.shutdown();
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pool({})", self.name)
    }
}

struct ThreadedPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
    stop: Arc<std::sync::atomic::AtomicBool>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl ThreadedPool {
    fn spawn(name: &str, size: usize, lock: LockHandler) -> Arc<ThreadedPool> {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut workers = Vec::with_capacity(size);
        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, rx) = crossbeam_channel::unbounded::<Job>();
            let thread_lock = lock.clone();
            let thread_stop = stop.clone();
            let thread_name = format!("sluice-{name}-{index}");
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    // One notification per lock window.
                    while let Ok(job) = rx.recv() {
                        if thread_stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let _guard = thread_lock.acquire();
                        job();
                    }
                    tracing::debug!(worker = %thread_name, "worker shutting down");
                })
                .expect("spawning worker thread");
            workers.push(WorkerHandle {
                inner: Arc::new(WorkerInner::Thread { tx }),
            });
            threads.push(handle);
        }
        Arc::new(ThreadedPool {
            workers,
            next: AtomicUsize::new(0),
            stop,
            threads: Mutex::new(threads),
        })
    }

    fn next_worker(&self) -> WorkerHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].clone()
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake every worker so it observes the stop flag. Notifications
        // enqueued after this point are dropped.
        for worker in &self.workers {
            if let WorkerInner::Thread { tx } = &*worker.inner {
                let _ = tx.send(Box::new(|| {}));
            }
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

/// A cooperative execution context. Notifications enqueued here run in
/// FIFO order, one at a time, under the host lock.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

enum WorkerInner {
    Thread { tx: crossbeam_channel::Sender<Job> },
    External {
        scheduler: Arc<dyn JobScheduler>,
        lock: LockHandler,
    },
}

impl WorkerHandle {
    pub fn enqueue(&self, job: Job) {
        match &*self.inner {
            WorkerInner::Thread { tx } => {
                if tx.send(job).is_err() {
                    tracing::warn!("notification dropped: worker pool is shut down");
                }
            }
            WorkerInner::External { scheduler, lock } => {
                // The core never spawns threads for external pools; it
                // only wraps the job so the lock discipline still holds.
                let lock = lock.clone();
                scheduler.add_job(Box::new(move || {
                    let _guard = lock.acquire();
                    job();
                }));
            }
        }
    }

    /// Two handles naming the same underlying worker.
    pub fn same_worker(&self, other: &WorkerHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.inner {
            WorkerInner::Thread { .. } => f.write_str("WorkerHandle(thread)"),
            WorkerInner::External { .. } => f.write_str("WorkerHandle(external)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::mpsc;

    fn noop_lock() -> LockHandler {
        struct NoopHost;
        impl host::Host for NoopHost {
            fn raw_lock(&self) {}
            fn raw_unlock(&self) {}
            fn scan_keys(&self, _: u64) -> (u64, Vec<bytes::Bytes>) {
                (0, Vec::new())
            }
            fn open_key(&self, _: &[u8]) -> Option<host::KeyHandle> {
                None
            }
            fn set_string_key(&self, _: &[u8], _: bytes::Bytes) -> Result<(), host::HostError> {
                Ok(())
            }
            fn delete_key(&self, _: &[u8]) -> Result<bool, host::HostError> {
                Ok(false)
            }
            fn stream_create_group(
                &self,
                _: &[u8],
                _: &str,
                _: host::StreamEntryId,
            ) -> Result<(), host::HostError> {
                Ok(())
            }
            fn stream_read_group(
                &self,
                _: &[u8],
                _: &str,
                _: &str,
                _: usize,
            ) -> Result<Vec<host::StreamEntry>, host::HostError> {
                Ok(Vec::new())
            }
            fn stream_ack(
                &self,
                _: &[u8],
                _: &str,
                _: &[host::StreamEntryId],
            ) -> Result<u64, host::HostError> {
                Ok(0)
            }
            fn stream_trim_acked(
                &self,
                _: &[u8],
                _: host::StreamEntryId,
            ) -> Result<u64, host::HostError> {
                Ok(0)
            }
            fn stream_len(&self, _: &[u8]) -> Result<u64, host::HostError> {
                Ok(0)
            }
            fn topology(&self) -> host::HostTopology {
                host::HostTopology::default()
            }
            fn send_to_shard(
                &self,
                _: &host::ShardId,
                _: &str,
                _: &[bytes::Bytes],
            ) -> Result<(), host::HostError> {
                Ok(())
            }
            fn subscribe_keyspace(&self, _: host::KeyspaceCallback) {}
            fn register_command_filter(&self, _: host::CommandFilterFn) {}
            fn command_info(&self, _: &str) -> Option<host::CommandInfo> {
                None
            }
            fn call(&self, _: &[bytes::Bytes]) -> host::Reply {
                host::Reply::Null
            }
            fn set_timer(&self, _: std::time::Duration, _: host::TimerCallback) -> host::TimerId {
                host::TimerId(0)
            }
            fn cancel_timer(&self, _: host::TimerId) -> bool {
                false
            }
            fn now_ms(&self) -> u64 {
                0
            }
            fn is_loading(&self) -> bool {
                false
            }
            fn is_master(&self) -> bool {
                true
            }
            fn memory_ratio(&self) -> f64 {
                0.0
            }
            fn replicate(&self, _: &str, _: &[bytes::Bytes]) {}
        }
        LockHandler::new(Arc::new(NoopHost))
    }

    #[test]
    fn one_worker_runs_notifications_in_fifo_order() {
        let pool = Pool::threaded("t", 1, noop_lock());
        let worker = pool.assign_worker();
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            worker.enqueue(Box::new(move || tx.send(i).unwrap()));
        }
        let got: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn external_pools_produce_jobs_instead_of_threads() {
        struct InlineScheduler(AtomicU64);
        impl JobScheduler for InlineScheduler {
            fn add_job(&self, job: Job) {
                self.0.fetch_add(1, Ordering::SeqCst);
                job();
            }
        }
        let scheduler = Arc::new(InlineScheduler(AtomicU64::new(0)));
        let pool = Pool::external("ext", scheduler.clone(), noop_lock());
        let ran = Arc::new(AtomicU64::new(0));
        let ran2 = ran.clone();
        pool.assign_worker()
            .enqueue(Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }));
        assert_eq!(scheduler.0.load(Ordering::SeqCst), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
