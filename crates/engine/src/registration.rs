//! Registrations: persistent bindings of a plan to a trigger source.
//!
//! A registration owns its plan, its trigger arguments, a worker that
//! every triggered execution is spawned through, statistics, and two
//! bounded lists: executions still in flight and completed ones kept
//! for inspection (trimmed from the head by
//! `MaxExecutionsPerRegistration`).

use crate::execution::{DoneCallback, Execution, Status};
use crate::fep::FlatPlan;
use crate::worker::WorkerHandle;
use crate::{Engine, Error, ExecMode};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wire::BufferWriter;

/// Reader-specific trigger arguments. Each reader downcasts through
/// `as_any`; the engine treats them as an opaque serializable blob.
pub trait TriggerArgs: Send + Sync + std::fmt::Debug {
    fn serialize(&self, w: &mut BufferWriter<'_>) -> Result<(), Error>;
    fn describe(&self) -> serde_json::Value;
    fn as_any(&self) -> &dyn Any;
}

/// Trigger bookkeeping surfaced by `dumpregistrations`.
#[derive(Debug, Default)]
pub struct RegStats {
    pub triggered: AtomicU64,
    pub success: AtomicU64,
    pub failures: AtomicU64,
    pub aborted: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl RegStats {
    pub fn clear(&self) {
        self.triggered.store(0, Ordering::SeqCst);
        self.success.store(0, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        self.aborted.store(0, Ordering::SeqCst);
        *self.last_error.lock() = None;
    }
}

pub struct Registration {
    /// The plan's string id doubles as the registration id.
    pub id: String,
    pub fep: Arc<FlatPlan>,
    pub mode: ExecMode,
    pub args: Arc<dyn TriggerArgs>,
    pub worker: WorkerHandle,
    pub stats: RegStats,
    /// Reader-private runtime state (per-stream contexts, trigger
    /// tables); set once by the reader's `register`.
    pub runtime: std::sync::OnceLock<Box<dyn Any + Send + Sync>>,
    pending: Mutex<VecDeque<Arc<Execution>>>,
    done: Mutex<VecDeque<Arc<Execution>>>,
}

impl Registration {
    pub fn new(
        engine: &Engine,
        fep: Arc<FlatPlan>,
        mode: ExecMode,
        args: Arc<dyn TriggerArgs>,
    ) -> Arc<Registration> {
        let pool = engine
            .pool(&fep.pool)
            .unwrap_or_else(|_| engine.default_pool());
        fep.mark_registered();
        Arc::new(Registration {
            id: fep.id_str.clone(),
            fep,
            mode,
            args,
            worker: pool.assign_worker(),
            stats: RegStats::default(),
            runtime: std::sync::OnceLock::new(),
            pending: Mutex::new(VecDeque::new()),
            done: Mutex::new(VecDeque::new()),
        })
    }

    /// Spawn an execution for one trigger event. Skipped with an error
    /// while trigger dispatch is paused.
    pub fn fire(
        self: &Arc<Self>,
        engine: &Engine,
        reader: Box<dyn crate::ReaderInstance>,
        extra_on_done: Vec<DoneCallback>,
    ) -> Result<Arc<Execution>, Error> {
        if engine.triggers_paused() {
            return Err(Error::Registration("trigger dispatch is paused".into()));
        }
        self.stats.triggered.fetch_add(1, Ordering::SeqCst);

        let id = engine.next_id();
        let ep = Execution::new(
            engine,
            id,
            self.fep.clone(),
            self.mode,
            0,
            reader,
            Status::Created,
            extra_on_done,
        )?;
        ep.bind_registration(self);
        engine.track_execution(ep.clone());
        self.pending.lock().push_back(ep.clone());
        tracing::debug!(registration = %self.id, execution = %ep.id_str(), "trigger fired");
        match self.mode {
            ExecMode::Sync => ep.run_sync(engine),
            ExecMode::Async | ExecMode::AsyncLocal => ep.schedule(engine),
        }
        Ok(ep)
    }

    /// Called by the finish path of every bound execution: settle
    /// statistics and move it to the bounded done list.
    pub(crate) fn execution_finished(&self, engine: &Engine, ep: &Arc<Execution>) {
        if ep.status() == Status::Aborted {
            self.stats.aborted.fetch_add(1, Ordering::SeqCst);
        }
        let errors = ep.outcome().map(|o| &o.errors[..]).unwrap_or(&[]);
        match errors.first() {
            Some(first) => {
                self.stats.failures.fetch_add(1, Ordering::SeqCst);
                *self.stats.last_error.lock() = Some(
                    first
                        .error_message()
                        .map(|m| m.into_owned())
                        .unwrap_or_else(|| "unknown error".to_string()),
                );
            }
            None if ep.status() == Status::Aborted => {}
            None => {
                self.stats.success.fetch_add(1, Ordering::SeqCst);
            }
        }

        self.pending.lock().retain(|p| p.id() != ep.id());
        let mut done = self.done.lock();
        done.push_back(ep.clone());
        // Bounded history: drop the oldest completed execution.
        while done.len() > engine.config().max_executions_per_registration() {
            if let Some(oldest) = done.pop_front() {
                engine.forget_execution(&oldest.id());
            }
        }
    }

    pub fn pending_executions(&self) -> Vec<Arc<Execution>> {
        self.pending.lock().iter().cloned().collect()
    }

    pub fn done_executions(&self) -> Vec<Arc<Execution>> {
        self.done.lock().iter().cloned().collect()
    }

    /// Abort whatever is still in flight (`unregister ... abort`).
    pub fn abort_pending(&self, engine: &Engine) {
        for ep in self.pending_executions() {
            if let Err(err) = ep.abort(engine) {
                tracing::warn!(execution = %ep.id_str(), %err, "failed to abort pending execution");
            }
        }
    }

    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "reader": self.fep.reader,
            "desc": self.fep.desc,
            "mode": self.mode.as_str(),
            "args": self.args.describe(),
            "numTriggered": self.stats.triggered.load(Ordering::SeqCst),
            "numSuccess": self.stats.success.load(Ordering::SeqCst),
            "numFailures": self.stats.failures.load(Ordering::SeqCst),
            "numAborted": self.stats.aborted.load(Ordering::SeqCst),
            "lastError": self.stats.last_error.lock().clone(),
            "numPending": self.pending.lock().len(),
            "numDone": self.done.lock().len(),
        })
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("reader", &self.fep.reader)
            .field("mode", &self.mode)
            .finish()
    }
}
