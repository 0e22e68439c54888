//! Running executions and their distributed phase machine.
//!
//! An execution mirrors its plan's steps, owns per-step operator state,
//! and is advanced by exactly one worker at a time. Worker actions
//! return `Continue` (re-enqueue at the queue tail), `Stop` (park with
//! the max-idle timer armed), `StopWithoutTimeout` (park, reader will
//! notify), or `Completed` (status transition; re-enqueue).

use crate::fep::{FlatPlan, HookStep, StepKind};
use crate::proto::Message;
use crate::registration::Registration;
use crate::step::{self, ShuffleState, Step, StepCtx, StepOut, StepState, SuspendReason};
use crate::worker::WorkerHandle;
use crate::{Engine, Error, ExecutionId};
use host::TimerId;
use parking_lot::Mutex;
use record::Record;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// How an execution runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// On the caller's thread; never enqueued; may not wait.
    Sync,
    /// Distributed across every shard.
    Async,
    /// Asynchronous but pinned to the initiating shard; never emits
    /// cross-shard messages.
    AsyncLocal,
}

impl ExecMode {
    pub fn code(self) -> u64 {
        match self {
            ExecMode::Sync => 0,
            ExecMode::Async => 1,
            ExecMode::AsyncLocal => 2,
        }
    }

    pub fn from_code(code: u64) -> Result<ExecMode, Error> {
        Ok(match code {
            0 => ExecMode::Sync,
            1 => ExecMode::Async,
            2 => ExecMode::AsyncLocal,
            other => return Err(Error::Malformed(format!("unknown execution mode {other}"))),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecMode::Sync => "sync",
            ExecMode::Async => "async",
            ExecMode::AsyncLocal => "async_local",
        }
    }
}

/// Execution statuses. Terminal statuses are sticky: once `Done` or
/// `Aborted` is observed no further transition happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[repr(u8)]
pub enum Status {
    #[strum(serialize = "created")]
    Created = 0,
    #[strum(serialize = "running")]
    Running = 1,
    #[strum(serialize = "pending_receive")]
    WaitingForReceivedNotification = 2,
    #[strum(serialize = "pending_run")]
    WaitingForRunNotification = 3,
    #[strum(serialize = "pending_cluster")]
    WaitingForClusterToComplete = 4,
    #[strum(serialize = "pending_termination")]
    WaitingForInitiatorTermination = 5,
    #[strum(serialize = "done")]
    Done = 6,
    #[strum(serialize = "aborted")]
    Aborted = 7,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Created,
            1 => Status::Running,
            2 => Status::WaitingForReceivedNotification,
            3 => Status::WaitingForRunNotification,
            4 => Status::WaitingForClusterToComplete,
            5 => Status::WaitingForInitiatorTermination,
            6 => Status::Done,
            _ => Status::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Aborted)
    }
}

/// What a status action tells the worker to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    Continue,
    Stop,
    StopWithoutTimeout,
    Completed,
}

/// Execution flag bits.
pub mod flags {
    pub const DONE: u32 = 1 << 0;
    pub const IS_ON_DONE_CALLBACK: u32 = 1 << 1;
    pub const IS_FREED_ON_DONE_CALLBACK: u32 = 1 << 2;
    pub const SENT_RUN_REQUEST: u32 = 1 << 3;
    pub const IS_LOCAL: u32 = 1 << 4;
    pub const IS_LOCALLY_FREED_ON_DONE_CALLBACK: u32 = 1 << 5;
    pub const STARTED: u32 = 1 << 6;
    pub const WAITING: u32 = 1 << 7;
}

pub type DoneCallback = Box<dyn FnOnce(&Engine, &Arc<Execution>) + Send>;
pub type RunCallback = Arc<dyn Fn(&Engine, &Arc<Execution>) + Send + Sync>;

/// Frozen results of a finished execution. Reads require no lock.
#[derive(Debug)]
pub struct Outcome {
    pub results: Vec<Record>,
    pub errors: Vec<Record>,
}

pub(crate) struct RunState {
    pub steps: Vec<Step>,
    pub results: Vec<Record>,
    pub errors: Vec<Record>,
    pub shards_received: usize,
    pub shards_completed: usize,
    pub start_run_received: bool,
    pub on_done: Vec<DoneCallback>,
    pub on_running: Vec<RunCallback>,
    pub on_holding: Vec<RunCallback>,
    pub idle_timer: Option<TimerId>,
    pub private_data: Option<crate::ArgValue>,
    pub created_ms: u64,
    pub finished_ms: Option<u64>,
}

/// A running instance of a flat plan.
pub struct Execution {
    id: ExecutionId,
    id_str: String,
    fep: Arc<FlatPlan>,
    mode: ExecMode,
    run_flags: u32,
    status: AtomicU8,
    flags: AtomicU32,
    abort_requested: AtomicBool,
    worker: OnceLock<WorkerHandle>,
    pub(crate) state: Mutex<RunState>,
    outcome: OnceLock<Outcome>,
    registration: Mutex<Option<Weak<Registration>>>,
}

impl Execution {
    pub(crate) fn new(
        engine: &Engine,
        id: ExecutionId,
        fep: Arc<FlatPlan>,
        mode: ExecMode,
        run_flags: u32,
        reader: Box<dyn crate::ReaderInstance>,
        initial_status: Status,
        on_done: Vec<DoneCallback>,
    ) -> Result<Arc<Execution>, Error> {
        let steps = build_steps(engine, &fep, reader)?;
        let private_data = fep.private_data.as_ref().map(|(_, arg)| arg.clone());
        let ep = Arc::new(Execution {
            id,
            id_str: id.to_string(),
            fep,
            mode,
            run_flags,
            status: AtomicU8::new(initial_status as u8),
            flags: AtomicU32::new(match mode {
                ExecMode::Async => 0,
                // Sync and async-local executions never leave this shard.
                ExecMode::Sync | ExecMode::AsyncLocal => flags::IS_LOCAL,
            }),
            abort_requested: AtomicBool::new(false),
            worker: OnceLock::new(),
            state: Mutex::new(RunState {
                steps,
                results: Vec::new(),
                errors: Vec::new(),
                shards_received: 0,
                shards_completed: 0,
                start_run_received: false,
                on_done,
                on_running: Vec::new(),
                on_holding: Vec::new(),
                idle_timer: None,
                private_data,
                created_ms: engine.host().now_ms(),
                finished_ms: None,
            }),
            outcome: OnceLock::new(),
            registration: Mutex::new(None),
        });
        Ok(ep)
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn id_str(&self) -> &str {
        &self.id_str
    }

    pub fn fep(&self) -> &Arc<FlatPlan> {
        &self.fep
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn run_flags(&self) -> u32 {
        self.run_flags
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, next: Status) {
        // Terminal statuses are sticky.
        let mut cur = self.status.load(Ordering::SeqCst);
        loop {
            if Status::from_u8(cur).is_terminal() {
                return;
            }
            match self.status.compare_exchange(
                cur,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    /// Distributed executions cross shards; local ones never do.
    pub fn is_distributed(&self) -> bool {
        self.mode == ExecMode::Async && !self.has_flag(flags::IS_LOCAL)
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Frozen results; `None` until the execution is done.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.get()
    }

    pub(crate) fn bind_registration(&self, reg: &Arc<Registration>) {
        *self.registration.lock() = Some(Arc::downgrade(reg));
    }

    pub fn registration_id(&self) -> Option<String> {
        self.registration
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|r| r.id.clone())
    }

    /// Attach an on-done callback; runs immediately when the execution
    /// already finished.
    pub fn add_on_done(self: &Arc<Self>, engine: &Engine, cb: DoneCallback) {
        {
            let mut state = self.state.lock();
            if !self.has_flag(flags::DONE) {
                state.on_done.push(cb);
                return;
            }
        }
        cb(engine, self);
    }

    pub fn add_on_running(&self, cb: RunCallback) {
        self.state.lock().on_running.push(cb);
    }

    pub fn add_on_holding(&self, cb: RunCallback) {
        self.state.lock().on_holding.push(cb);
    }

    fn worker(&self, engine: &Engine) -> WorkerHandle {
        self.worker
            .get_or_init(|| {
                let pool = engine
                    .pool(&self.fep.pool)
                    .unwrap_or_else(|_| engine.default_pool());
                pool.assign_worker()
            })
            .clone()
    }

    /// Enqueue one action invocation on the owning worker.
    pub fn schedule(self: &Arc<Self>, engine: &Engine) {
        self.cancel_idle_timer(engine);
        let ep = self.clone();
        let engine_clone = engine.clone();
        self.worker(engine).enqueue(Box::new(move || {
            ep.run_one_action(&engine_clone);
        }));
    }

    /// Drive a sync execution to completion on the calling thread.
    pub(crate) fn run_sync(self: &Arc<Self>, engine: &Engine) {
        loop {
            let status = self.status();
            let result = self.dispatch_action(engine);
            if status.is_terminal() {
                return;
            }
            match result {
                ActionResult::Continue | ActionResult::Completed => {}
                ActionResult::Stop | ActionResult::StopWithoutTimeout => {
                    // Sync executions may not wait.
                    tracing::warn!(id = %self.id_str, "sync execution attempted to wait; aborting");
                    self.state
                        .lock()
                        .errors
                        .push(Record::error_from("sync execution attempted to wait"));
                    self.request_abort();
                    self.set_status(Status::Aborted);
                }
            }
        }
    }

    fn run_one_action(self: &Arc<Self>, engine: &Engine) {
        match self.dispatch_action(engine) {
            ActionResult::Continue | ActionResult::Completed => self.schedule(engine),
            ActionResult::Stop => self.arm_idle_timer(engine),
            ActionResult::StopWithoutTimeout => {}
        }
    }

    fn dispatch_action(self: &Arc<Self>, engine: &Engine) -> ActionResult {
        match self.status() {
            Status::Created => self.created_action(engine),
            Status::Running => self.running_action(engine),
            Status::WaitingForReceivedNotification => self.pending_receive_action(engine),
            Status::WaitingForRunNotification => self.pending_run_action(),
            Status::WaitingForClusterToComplete => self.pending_cluster_action(engine),
            // Parked until the initiator's drop message arrives.
            Status::WaitingForInitiatorTermination => ActionResult::Stop,
            Status::Done | Status::Aborted => self.finish_action(engine),
        }
    }

    fn created_action(self: &Arc<Self>, engine: &Engine) -> ActionResult {
        let view = engine.cluster();
        if !self.is_distributed() || !view.is_cluster_mode() {
            self.set_flag(flags::IS_LOCAL);
            self.set_status(Status::Running);
            return ActionResult::Completed;
        }

        // Initiator announces the execution to every peer and waits for
        // each to acknowledge construction.
        let fep_bytes = match self.fep.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => return self.fail_created(engine, err),
        };
        let reader_bytes = {
            let state = self.state.lock();
            let Some(reader_step) = state.steps.last() else {
                return self.fail_created(engine, Error::UnknownReader(self.fep.reader.clone()));
            };
            let StepState::Reader { instance } = &reader_step.state else {
                return self.fail_created(engine, Error::UnknownReader(self.fep.reader.clone()));
            };
            let mut buf = wire::Buffer::new();
            if let Err(err) = instance.serialize_args(engine, &mut buf.writer()) {
                return self.fail_created(engine, err);
            }
            buf.into_bytes()
        };

        self.state.lock().shards_received = 1; // self
        engine.send_message(
            None,
            &Message::ExecutionCreated {
                id: self.id,
                fep: fep_bytes,
                reader_args: reader_bytes,
                run_flags: self.run_flags,
                mode: self.mode,
                pool: self.fep.pool.clone(),
            },
        );
        self.set_status(Status::WaitingForReceivedNotification);
        ActionResult::Stop
    }

    fn fail_created(self: &Arc<Self>, _engine: &Engine, err: Error) -> ActionResult {
        tracing::warn!(id = %self.id_str, %err, "failed to distribute execution");
        self.state
            .lock()
            .errors
            .push(Record::error_from(format!("failed to distribute execution: {err}")));
        self.set_flag(flags::IS_LOCAL);
        self.set_status(Status::Running);
        ActionResult::Completed
    }

    fn pending_receive_action(self: &Arc<Self>, engine: &Engine) -> ActionResult {
        let size = engine.cluster().size();
        if self.state.lock().shards_received < size {
            return ActionResult::Stop;
        }
        // Every shard holds a mirror; release them all.
        engine.send_message(None, &Message::StartRun { id: self.id });
        self.set_flag(flags::SENT_RUN_REQUEST);
        self.set_status(Status::Running);
        ActionResult::Completed
    }

    fn pending_run_action(self: &Arc<Self>) -> ActionResult {
        if !self.state.lock().start_run_received {
            return ActionResult::Stop;
        }
        self.set_status(Status::Running);
        ActionResult::Completed
    }

    fn pending_cluster_action(self: &Arc<Self>, engine: &Engine) -> ActionResult {
        if self.state.lock().shards_completed < engine.cluster().size() {
            return ActionResult::Stop;
        }
        self.set_status(Status::Done);
        ActionResult::Completed
    }

    fn running_action(self: &Arc<Self>, engine: &Engine) -> ActionResult {
        enum RunOutcome {
            Exhausted,
            Suspend(SuspendReason),
            Abort,
        }

        if !self.has_flag(flags::STARTED) {
            self.set_flag(flags::STARTED);
            self.run_hook(engine, self.fep.on_start.clone(), &engine.mgmt().on_starts);
            let on_running = self.state.lock().on_running.clone();
            for cb in on_running {
                cb(engine, self);
            }
        } else if self.has_flag(flags::WAITING) {
            self.clear_flag(flags::WAITING);
            self.run_hook(engine, self.fep.on_unpaused.clone(), &engine.mgmt().on_unpauseds);
        }

        let outcome = {
            let mut state = self.state.lock();
            let RunState { steps, results, errors, .. } = &mut *state;
            let mut ctx = StepCtx::new(engine, self);
            loop {
                if self.abort_requested() {
                    break RunOutcome::Abort;
                }
                match step::next_record(steps, &mut ctx) {
                    StepOut::Rec(r) if r.is_error() => errors.push(r),
                    StepOut::Rec(r) => results.push(r),
                    StepOut::Exhausted => break RunOutcome::Exhausted,
                    StepOut::Suspend(reason) => break RunOutcome::Suspend(reason),
                }
            }
        };

        match outcome {
            RunOutcome::Abort => {
                self.set_status(Status::Aborted);
                ActionResult::Completed
            }
            RunOutcome::Suspend(reason) => {
                self.set_flag(flags::WAITING);
                let on_holding = self.state.lock().on_holding.clone();
                for cb in on_holding {
                    cb(engine, self);
                }
                match reason {
                    SuspendReason::Reader => ActionResult::StopWithoutTimeout,
                    SuspendReason::Cluster | SuspendReason::Async => ActionResult::Stop,
                }
            }
            RunOutcome::Exhausted => {
                let view = engine.cluster();
                let distributed = self.is_distributed() && view.is_cluster_mode();
                if !distributed {
                    self.set_status(Status::Done);
                    return ActionResult::Completed;
                }
                if self.id.node == *view.my_id() {
                    // Initiator: its own share is complete; wait for
                    // every peer's final results.
                    self.state.lock().shards_completed += 1;
                    self.set_status(Status::WaitingForClusterToComplete);
                    return ActionResult::Completed;
                }
                // Peer: ship results to the initiator and park until
                // it tears us down.
                let (results, errors) = {
                    let mut state = self.state.lock();
                    (
                        serialize_records(engine, state.results.drain(..)),
                        serialize_records(engine, state.errors.drain(..)),
                    )
                };
                engine.send_message(
                    Some(&self.id.node),
                    &Message::ExecutionDone {
                        id: self.id,
                        results,
                        errors,
                    },
                );
                self.set_status(Status::WaitingForInitiatorTermination);
                ActionResult::Stop
            }
        }
    }

    fn run_hook(
        self: &Arc<Self>,
        engine: &Engine,
        hook: Option<HookStep>,
        registry: &crate::mgmt::Registry<crate::mgmt::LifecycleFn>,
    ) {
        let Some(hook) = hook else { return };
        let Some(entry) = registry.get(&hook.name) else {
            tracing::warn!(hook = %hook.name, kind = registry.kind(), "hook callback is not registered");
            return;
        };
        let mut ctx = StepCtx::new(engine, self);
        (entry.callback)(&mut ctx, hook.arg.as_ref());
    }

    /// The terminal action: freeze results, run on-done callbacks
    /// exactly once, settle registration bookkeeping.
    fn finish_action(self: &Arc<Self>, engine: &Engine) -> ActionResult {
        if self.has_flag(flags::DONE) {
            return ActionResult::StopWithoutTimeout;
        }
        self.set_flag(flags::DONE);
        self.cancel_idle_timer(engine);

        let (results, errors, callbacks) = {
            let mut state = self.state.lock();
            state.finished_ms = Some(engine.host().now_ms());
            (
                std::mem::take(&mut state.results),
                std::mem::take(&mut state.errors),
                std::mem::take(&mut state.on_done),
            )
        };
        self.outcome
            .set(Outcome { results, errors })
            .ok()
            .expect("outcome set once");

        engine.note_done(self.id);
        if let Some(reg) = self.registration.lock().as_ref().and_then(Weak::upgrade) {
            reg.execution_finished(engine, self);
        }

        self.set_flag(flags::IS_ON_DONE_CALLBACK);
        for cb in callbacks {
            cb(engine, self);
        }
        self.clear_flag(flags::IS_ON_DONE_CALLBACK);

        if self.has_flag(flags::IS_FREED_ON_DONE_CALLBACK)
            || self.has_flag(flags::IS_LOCALLY_FREED_ON_DONE_CALLBACK)
        {
            engine.forget_execution(&self.id);
        }
        tracing::debug!(id = %self.id_str, status = %self.status(), "execution finished");
        ActionResult::StopWithoutTimeout
    }

    /// Externally requested cancellation. Unstarted local executions
    /// abort immediately; started local ones abort cooperatively;
    /// distributed executions owned elsewhere refuse.
    pub fn abort(self: &Arc<Self>, engine: &Engine) -> Result<(), Error> {
        if self.status().is_terminal() {
            return Ok(()); // already done: no-op
        }
        let owner = self.id.node == engine.my_id();
        if !self.has_flag(flags::STARTED) && (self.has_flag(flags::IS_LOCAL) || owner) {
            self.request_abort();
            self.set_status(Status::Aborted);
            self.finish_action(engine);
            return Ok(());
        }
        if !self.is_distributed() {
            // Local and running: the pipeline observes the request
            // between records; blocking callbacks poll it.
            self.request_abort();
            return Ok(());
        }
        Err(Error::AbortFailed(self.id_str.clone()))
    }

    /// Release this execution: deferred while on-done callbacks run,
    /// broadcast to peers when this shard initiated a distributed run.
    pub fn drop_execution(self: &Arc<Self>, engine: &Engine) {
        if self.has_flag(flags::IS_ON_DONE_CALLBACK) {
            // Deferred: the finish path frees after callbacks return.
            self.set_flag(flags::IS_FREED_ON_DONE_CALLBACK);
            return;
        }
        if self.is_distributed() && self.id.node == engine.my_id() {
            engine.send_message(None, &Message::DropExecution { id: self.id });
        }
        self.cancel_idle_timer(engine);
        engine.forget_execution(&self.id);
    }

    fn arm_idle_timer(self: &Arc<Self>, engine: &Engine) {
        if self.status().is_terminal() {
            return;
        }
        let max_idle = self
            .fep
            .max_idle
            .unwrap_or_else(|| engine.config().execution_max_idle_time());
        let ep = self.clone();
        let engine_clone = engine.clone();
        let timer = engine.host().set_timer(
            max_idle,
            Box::new(move || {
                // Deliver on the owning worker, never a foreign thread.
                let ep2 = ep.clone();
                let engine2 = engine_clone.clone();
                ep.worker(&engine_clone).enqueue(Box::new(move || {
                    ep2.on_idle_timeout(&engine2);
                }));
            }),
        );
        self.state.lock().idle_timer = Some(timer);
    }

    fn cancel_idle_timer(&self, engine: &Engine) {
        if let Some(timer) = self.state.lock().idle_timer.take() {
            engine.host().cancel_timer(timer);
        }
    }

    fn on_idle_timeout(self: &Arc<Self>, engine: &Engine) {
        if self.status().is_terminal() {
            return;
        }
        tracing::warn!(id = %self.id_str, "execution exceeded max idle time; aborting");
        self.state
            .lock()
            .errors
            .push(Record::error_from("execution reached max idle time"));
        self.request_abort();
        self.set_status(Status::Aborted);
        self.finish_action(engine);
    }

    /// Structured dump for `getexecution` / `dumpexecutions`.
    pub fn describe(&self) -> serde_json::Value {
        let state = self.state.lock();
        let steps: Vec<serde_json::Value> = state
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "index": s.index,
                    "kind": s.kind.to_string(),
                    "durationMs": s.duration.as_millis() as u64,
                })
            })
            .collect();
        let (results, errors) = match self.outcome.get() {
            Some(outcome) => (outcome.results.len(), outcome.errors.len()),
            None => (state.results.len(), state.errors.len()),
        };
        serde_json::json!({
            "id": self.id_str,
            "plan": self.fep.id_str,
            "mode": self.mode.as_str(),
            "status": self.status().to_string(),
            "shardsReceived": state.shards_received,
            "shardsCompleted": state.shards_completed,
            "results": results,
            "errors": errors,
            "createdMs": state.created_ms,
            "finishedMs": state.finished_ms,
            "registration": self.registration_id(),
            "steps": steps,
        })
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id_str)
            .field("status", &self.status())
            .field("mode", &self.mode)
            .finish()
    }
}

fn serialize_records(
    engine: &Engine,
    records: impl Iterator<Item = Record>,
) -> bytes::Bytes {
    let records: Vec<Record> = records.collect();
    let mut buf = wire::Buffer::new();
    buf.writer().write_varu64(records.len() as u64);
    for record in &records {
        // Stage each record so a mid-record failure cannot corrupt the
        // shipment framing.
        let mut staged = wire::Buffer::new();
        if let Err(err) = record.serialize(engine.types(), &mut staged.writer()) {
            tracing::warn!(%err, "replacing unserializable record in shipment");
            staged = wire::Buffer::new();
            let fallback = Record::error_from(format!("unserializable record: {err}"));
            fallback
                .serialize(engine.types(), &mut staged.writer())
                .expect("error records always serialize");
        }
        buf.writer().write_raw(staged.as_slice());
    }
    buf.into_bytes()
}

pub(crate) fn deserialize_records(
    engine: &Engine,
    bytes: &[u8],
) -> Result<Vec<Record>, Error> {
    let mut r = wire::BufferReader::new(bytes);
    let count = r.read_varu64()? as usize;
    let mut records = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        records.push(Record::deserialize(&mut r, engine.types())?);
    }
    Ok(records)
}

fn build_steps(
    engine: &Engine,
    fep: &Arc<FlatPlan>,
    reader: Box<dyn crate::ReaderInstance>,
) -> Result<Vec<Step>, Error> {
    let mgmt = engine.mgmt();
    let mut steps = Vec::with_capacity(fep.steps.len() + 1);
    // Physical order is downstream-first; the reader closes the chain.
    for (index, flat) in fep.steps.iter().rev().enumerate() {
        let state = match flat.kind {
            StepKind::Map => StepState::Map {
                cb: mgmt.maps.require(&flat.name)?.callback,
                arg: flat.arg.clone(),
                pending: None,
            },
            StepKind::FlatMap => StepState::FlatMap {
                cb: mgmt.maps.require(&flat.name)?.callback,
                arg: flat.arg.clone(),
                buffered: VecDeque::new(),
                pending: None,
            },
            StepKind::Filter => StepState::Filter {
                cb: mgmt.filters.require(&flat.name)?.callback,
                arg: flat.arg.clone(),
            },
            StepKind::ExtractKey => StepState::ExtractKey {
                cb: mgmt.extractors.require(&flat.name)?.callback,
                arg: flat.arg.clone(),
            },
            StepKind::Repartition => StepState::Repartition(ShuffleState::default()),
            StepKind::Collect => StepState::Collect(ShuffleState::default()),
            StepKind::Group => StepState::Group {
                table: Default::default(),
                grouped: None,
            },
            StepKind::Reduce => StepState::Reduce {
                cb: mgmt.reducers.require(&flat.name)?.callback,
                arg: flat.arg.clone(),
            },
            StepKind::ForEach => StepState::ForEach {
                cb: mgmt.foreachs.require(&flat.name)?.callback,
                arg: flat.arg.clone(),
            },
            StepKind::Limit => {
                let (offset, len) = match flat.arg {
                    Some(crate::ArgValue::Pair(offset, len)) => (offset.max(0) as u64, len.max(0) as u64),
                    _ => return Err(Error::Malformed("limit step without bounds".into())),
                };
                StepState::Limit {
                    offset,
                    len,
                    index: 0,
                }
            }
            StepKind::Accumulate => StepState::Accumulate {
                cb: mgmt.accumulators.require(&flat.name)?.callback,
                arg: flat.arg.clone(),
                acc: None,
                done: false,
            },
            StepKind::AccumulateByKey => StepState::AccumulateByKey {
                cb: mgmt.accumulators_by_key.require(&flat.name)?.callback,
                arg: flat.arg.clone(),
                table: Default::default(),
                drained: None,
            },
            StepKind::Reader => {
                return Err(Error::Malformed("reader among operator steps".into()))
            }
        };
        steps.push(Step {
            kind: flat.kind,
            index,
            duration: Default::default(),
            state,
        });
    }
    steps.push(Step {
        kind: StepKind::Reader,
        index: fep.steps.len(),
        duration: Default::default(),
        state: StepState::Reader { instance: reader },
    });
    Ok(steps)
}

impl Engine {
    /// Instantiate and launch an execution of `fep`.
    pub fn run_plan(
        &self,
        fep: &Arc<FlatPlan>,
        mode: ExecMode,
        reader_args: Option<&[u8]>,
        on_done: Vec<DoneCallback>,
    ) -> Result<Arc<Execution>, Error> {
        let plugin = self.mgmt().reader(&fep.reader)?;
        let default_args = fep.reader_args.clone().unwrap_or_default();
        let args = reader_args.unwrap_or(&default_args);
        let reader = plugin.instantiate(self, args)?;
        self.run_plan_with_reader(fep, mode, reader, on_done)
    }

    /// Launch with an explicit reader instance (trigger contexts).
    pub fn run_plan_with_reader(
        &self,
        fep: &Arc<FlatPlan>,
        mode: ExecMode,
        reader: Box<dyn crate::ReaderInstance>,
        on_done: Vec<DoneCallback>,
    ) -> Result<Arc<Execution>, Error> {
        let id = self.next_id();
        let ep = Execution::new(
            self,
            id,
            fep.clone(),
            mode,
            0,
            reader,
            Status::Created,
            on_done,
        )?;
        self.track_execution(ep.clone());
        tracing::debug!(id = %ep.id_str(), plan = %fep.id_str, mode = mode.as_str(), "launching execution");
        match mode {
            ExecMode::Sync => ep.run_sync(self),
            ExecMode::Async | ExecMode::AsyncLocal => ep.schedule(self),
        }
        Ok(ep)
    }
}
