//! The execution subsystem: flat execution plans, running executions,
//! worker pools, the distributed phase machine, registrations, and the
//! management registries behind every pluggable kind.
//!
//! One [`Engine`] exists per host process. It is initialized exactly
//! once at module load and torn down on the host's shutdown event;
//! everything else hangs off it through shared-ownership handles.

use cluster::ClusterView;
use config::Config;
use fxhash::FxHashMap;
use host::{Host, LockHandler, ShardId};
use parking_lot::{Mutex, RwLock};
use record::TypeRegistry;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub mod args;
pub mod builtins;
#[cfg(test)]
mod engine_test;
pub mod execution;
pub mod fep;
pub mod mgmt;
pub mod proto;
pub mod reader;
pub mod registration;
pub mod step;
pub mod worker;

pub use args::{ArgTypeOps, ArgValue, PlainArgType};
pub use execution::{ActionResult, ExecMode, Execution, Outcome, Status};
pub use fep::{FlatPlan, FlatStep, PlanBuilder, StepKind};
pub use mgmt::Mgmt;
pub use proto::Message;
pub use reader::{ReaderInstance, ReaderNext, ReaderPlugin};
pub use registration::{Registration, TriggerArgs};
pub use step::{StepCtx, StepOut};
pub use worker::{JobScheduler, Pool, WorkerHandle};

/// Monotonic encoding version of every serialized payload (plans,
/// registrations, aux data). Deserialize routines gate new fields on it.
pub const ENCODING_VERSION: u32 = 1;

/// Name of the pool sized by the `ExecutionThreads` config option.
pub const DEFAULT_POOL: &str = "default";

/// Internal command carrying inter-shard messages.
pub const INNER_MSG_COMMAND: &str = "sluice.innermsgcommand";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown {kind} callback '{name}'")]
    UnknownCallback { kind: &'static str, name: String },
    #[error("unknown reader '{0}'")]
    UnknownReader(String),
    #[error("unknown thread pool '{0}'")]
    UnknownPool(String),
    #[error("execution {0} not found")]
    ExecutionNotFound(String),
    #[error("execution {0} cannot be aborted")]
    AbortFailed(String),
    #[error("execution {0} is not done yet")]
    NotDone(String),
    #[error("registration {0} not found")]
    RegistrationNotFound(String),
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("unsupported encoding version {0}")]
    UnsupportedEncVer(u32),
    #[error("plugin '{name}' is required at version >= {required}")]
    PluginMissing { name: String, required: u32 },
    #[error("malformed id '{0}'")]
    MalformedId(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Wire(#[from] wire::Error),
    #[error(transparent)]
    Ser(#[from] record::SerError),
    #[error(transparent)]
    Host(#[from] host::HostError),
}

/// Identifier of a plan or execution: the id of the node that created
/// it plus a node-local monotonic counter. The first segment of an
/// execution id therefore always names its initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId {
    pub node: ShardId,
    pub seq: u64,
}

pub type ExecutionId = EngineId;
pub type PlanId = EngineId;

impl EngineId {
    pub fn serialize(&self, w: &mut wire::BufferWriter<'_>) {
        w.write_bytes(self.node.as_bytes());
        w.write_varu64(self.seq);
    }

    pub fn deserialize(r: &mut wire::BufferReader<'_>) -> Result<EngineId, Error> {
        let raw = r.read_bytes()?;
        let node = ShardId::from_bytes(raw)
            .ok_or_else(|| Error::MalformedId(String::from_utf8_lossy(raw).into_owned()))?;
        Ok(EngineId {
            node,
            seq: r.read_varu64()?,
        })
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.node, self.seq)
    }
}

impl std::str::FromStr for EngineId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, seq) = s
            .rsplit_once('-')
            .ok_or_else(|| Error::MalformedId(s.to_string()))?;
        Ok(EngineId {
            node: node
                .parse()
                .map_err(|_| Error::MalformedId(s.to_string()))?,
            seq: seq.parse().map_err(|_| Error::MalformedId(s.to_string()))?,
        })
    }
}

struct EngineInner {
    host: Arc<dyn Host>,
    lock: LockHandler,
    config: Arc<Config>,
    types: Arc<TypeRegistry>,
    mgmt: Mgmt,
    cluster: RwLock<Arc<ClusterView>>,
    pools: Mutex<FxHashMap<String, Pool>>,
    executions: Mutex<FxHashMap<ExecutionId, Arc<Execution>>>,
    // Done executions in completion order, for the MaxExecutions bound.
    done_order: Mutex<VecDeque<ExecutionId>>,
    registrations: Mutex<Vec<Arc<Registration>>>,
    triggers_paused: AtomicBool,
    next_seq: AtomicU64,
    next_async_id: AtomicU64,
    // Async placeholders waiting to be continued, keyed by async id.
    pending_asyncs: Mutex<FxHashMap<u64, std::sync::Weak<Execution>>>,
}

/// Handle over the module-wide engine state. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build the engine and its default thread pool. Called exactly
    /// once at module load, with the host lock held.
    pub fn new(host: Arc<dyn Host>, config: Arc<Config>) -> Engine {
        let lock = LockHandler::new(host.clone());
        let view = Arc::new(ClusterView::refresh(host.as_ref()));
        let engine = Engine {
            inner: Arc::new(EngineInner {
                host,
                lock: lock.clone(),
                config: config.clone(),
                types: Arc::new(TypeRegistry::new()),
                mgmt: Mgmt::new(),
                cluster: RwLock::new(view),
                pools: Mutex::new(FxHashMap::default()),
                executions: Mutex::new(FxHashMap::default()),
                done_order: Mutex::new(VecDeque::new()),
                registrations: Mutex::new(Vec::new()),
                triggers_paused: AtomicBool::new(false),
                next_seq: AtomicU64::new(1),
                next_async_id: AtomicU64::new(1),
                pending_asyncs: Mutex::new(FxHashMap::default()),
            }),
        };
        engine.create_thread_pool(DEFAULT_POOL, config.execution_threads());
        builtins::register(&engine);
        engine
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.inner.host
    }

    pub fn lock(&self) -> &LockHandler {
        &self.inner.lock
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    pub fn mgmt(&self) -> &Mgmt {
        &self.inner.mgmt
    }

    // Cluster view.

    pub fn cluster(&self) -> Arc<ClusterView> {
        self.inner.cluster.read().clone()
    }

    pub fn refresh_cluster(&self) {
        let view = ClusterView::refresh(self.inner.host.as_ref());
        tracing::info!(shards = view.size(), cluster_mode = view.is_cluster_mode(), "refreshed cluster view");
        *self.inner.cluster.write() = Arc::new(view);
    }

    /// Admin topology sync: install an explicit view.
    pub fn set_cluster(&self, view: ClusterView) {
        *self.inner.cluster.write() = Arc::new(view);
    }

    pub fn my_id(&self) -> ShardId {
        *self.cluster().my_id()
    }

    pub fn next_id(&self) -> EngineId {
        EngineId {
            node: self.my_id(),
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    // Worker pools.

    pub fn create_thread_pool(&self, name: &str, size: usize) -> Pool {
        let pool = Pool::threaded(name, size, self.inner.lock.clone());
        self.inner.pools.lock().insert(name.to_string(), pool.clone());
        pool
    }

    /// External pool: the implementer supplies the scheduler and the
    /// core never spawns threads for it.
    pub fn define_external_pool(&self, name: &str, scheduler: Arc<dyn JobScheduler>) -> Pool {
        let pool = Pool::external(name, scheduler, self.inner.lock.clone());
        self.inner.pools.lock().insert(name.to_string(), pool.clone());
        pool
    }

    pub fn pool(&self, name: &str) -> Result<Pool, Error> {
        self.inner
            .pools
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownPool(name.to_string()))
    }

    pub fn default_pool(&self) -> Pool {
        self.pool(DEFAULT_POOL).expect("default pool exists")
    }

    // Execution registry.

    pub fn track_execution(&self, ep: Arc<Execution>) {
        self.inner.executions.lock().insert(ep.id(), ep);
    }

    pub fn find_execution(&self, id: &ExecutionId) -> Option<Arc<Execution>> {
        self.inner.executions.lock().get(id).cloned()
    }

    pub fn find_execution_str(&self, id: &str) -> Option<Arc<Execution>> {
        let id: ExecutionId = id.parse().ok()?;
        self.find_execution(&id)
    }

    pub fn forget_execution(&self, id: &ExecutionId) -> Option<Arc<Execution>> {
        self.inner.done_order.lock().retain(|d| d != id);
        self.inner.executions.lock().remove(id)
    }

    pub fn executions(&self) -> Vec<Arc<Execution>> {
        let mut all: Vec<_> = self.inner.executions.lock().values().cloned().collect();
        all.sort_by_key(|ep| ep.id());
        all
    }

    pub fn execution_count(&self) -> usize {
        self.inner.executions.lock().len()
    }

    /// Record a completed execution and enforce the process-wide
    /// `MaxExecutions` bound, dropping the oldest done execution.
    pub(crate) fn note_done(&self, id: ExecutionId) {
        let mut order = self.inner.done_order.lock();
        order.push_back(id);
        while order.len() > self.inner.config.max_executions() {
            if let Some(oldest) = order.pop_front() {
                tracing::debug!(%oldest, "evicting oldest done execution");
                self.inner.executions.lock().remove(&oldest);
            }
        }
    }

    // Registrations.

    pub fn add_registration(&self, reg: Arc<Registration>) {
        self.inner.registrations.lock().push(reg);
    }

    pub fn registrations(&self) -> Vec<Arc<Registration>> {
        self.inner.registrations.lock().clone()
    }

    pub fn find_registration(&self, id: &str) -> Option<Arc<Registration>> {
        self.inner
            .registrations
            .lock()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn remove_registration(&self, id: &str) -> Option<Arc<Registration>> {
        let mut regs = self.inner.registrations.lock();
        let index = regs.iter().position(|r| r.id == id)?;
        Some(regs.remove(index))
    }

    pub fn clear_registrations(&self) -> Vec<Arc<Registration>> {
        std::mem::take(&mut *self.inner.registrations.lock())
    }

    pub fn triggers_paused(&self) -> bool {
        self.inner.triggers_paused.load(Ordering::SeqCst)
    }

    pub fn set_triggers_paused(&self, paused: bool) {
        self.inner.triggers_paused.store(paused, Ordering::SeqCst);
    }

    // Async records.

    /// Create an async placeholder owned by `ep`; continuing it through
    /// [`Engine::continue_async`] re-enqueues the execution.
    pub fn new_async_record(&self, ep: &Arc<Execution>) -> record::AsyncRecord {
        let id = self.inner.next_async_id.fetch_add(1, Ordering::Relaxed);
        let async_record = record::AsyncRecord::new(id);
        self.inner
            .pending_asyncs
            .lock()
            .insert(id, Arc::downgrade(ep));
        async_record
    }

    /// Continue an async placeholder with its payload and wake the
    /// owning execution.
    pub fn continue_async(&self, placeholder: &record::AsyncRecord, payload: record::Record) {
        if !placeholder.fill(payload) {
            tracing::warn!(id = placeholder.id(), "async record continued twice; ignoring");
            return;
        }
        let ep = self.inner.pending_asyncs.lock().remove(&placeholder.id());
        if let Some(ep) = ep.and_then(|w| w.upgrade()) {
            ep.schedule(self);
        }
    }

    /// Tear down pools and drop all state. Live executions do not
    /// survive this; registrations were persisted separately.
    pub fn shutdown(&self) {
        let pools: Vec<Pool> = self.inner.pools.lock().values().cloned().collect();
        for pool in pools {
            pool.shutdown();
        }
        self.inner.executions.lock().clear();
        self.inner.registrations.lock().clear();
        tracing::info!("engine torn down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("executions", &self.inner.executions.lock().len())
            .field("registrations", &self.inner.registrations.lock().len())
            .finish()
    }
}
