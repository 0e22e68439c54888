//! Physical pipeline steps and their evaluation.
//!
//! Steps are stored downstream-first with the reader last; evaluation
//! pulls from the head step, which recursively pulls from its upstream
//! slice. Error records travel through the remaining steps untouched so
//! the initiator always observes them. A step may suspend only by
//! returning from `next`; everything it needs to resume lives in its
//! operator state.

use crate::execution::Execution;
use crate::fep::StepKind;
use crate::mgmt::{
    AccumulateByKeyFn, AccumulateFn, ExtractorFn, FilterFn, ForEachFn, MapFn, ReducerFn,
};
use crate::proto::Message;
use crate::reader::{ReaderInstance, ReaderNext};
use crate::{ArgValue, Engine};
use bytes::Bytes;
use cluster::ClusterView;
use fxhash::FxHashMap;
use record::{AsyncRecord, KeyRecord, Record};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why an execution parks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// Awaiting remote records or completion acks; idle timer armed.
    Cluster,
    /// Awaiting an async record continuation; idle timer armed.
    Async,
    /// The reader has nothing yet; parked without a timer.
    Reader,
}

/// Outcome of pulling one record through a step.
pub enum StepOut {
    Rec(Record),
    Exhausted,
    Suspend(SuspendReason),
}

/// Context threaded through step evaluation and into user callbacks.
pub struct StepCtx<'a> {
    engine: &'a Engine,
    ep: &'a Arc<Execution>,
    view: Arc<ClusterView>,
    distributed: bool,
    profile: bool,
}

impl<'a> StepCtx<'a> {
    pub fn new(engine: &'a Engine, ep: &'a Arc<Execution>) -> StepCtx<'a> {
        let view = engine.cluster();
        let distributed = ep.is_distributed() && view.is_cluster_mode();
        StepCtx {
            engine,
            ep,
            profile: engine.config().profile_executions(),
            distributed,
            view,
        }
    }

    pub fn engine(&self) -> &Engine {
        self.engine
    }

    pub fn execution(&self) -> &Arc<Execution> {
        self.ep
    }

    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    /// True once an abort has been requested; long-running callbacks
    /// should poll this and bail out.
    pub fn abort_requested(&self) -> bool {
        self.ep.abort_requested()
    }

    /// Create an async placeholder owned by the running execution.
    pub fn create_async_record(&self) -> AsyncRecord {
        self.engine.new_async_record(self.ep)
    }

    fn is_initiator(&self) -> bool {
        self.ep.id().node == *self.view.my_id()
    }

    fn record_bytes(&self, record: &Record) -> Result<Bytes, record::SerError> {
        let mut buf = wire::Buffer::new();
        record.serialize(self.engine.types(), &mut buf.writer())?;
        Ok(buf.into_bytes())
    }
}

/// A physical step: the mirror of one flat step plus operator state.
pub struct Step {
    pub kind: StepKind,
    pub index: usize,
    /// Cumulative callback time, recorded when profiling is on.
    pub duration: Duration,
    pub state: StepState,
}

/// Inbox and completion tracking shared by repartition and collect.
#[derive(Default)]
pub struct ShuffleState {
    pub stopped: bool,
    pub inbox: VecDeque<Record>,
    /// Acks received; the target is cluster size minus one, the local
    /// contribution being implicit.
    pub peers_done: usize,
}

pub enum StepState {
    Map {
        cb: MapFn,
        arg: Option<ArgValue>,
        pending: Option<AsyncRecord>,
    },
    FlatMap {
        cb: MapFn,
        arg: Option<ArgValue>,
        buffered: VecDeque<Record>,
        pending: Option<AsyncRecord>,
    },
    Filter {
        cb: FilterFn,
        arg: Option<ArgValue>,
    },
    ExtractKey {
        cb: ExtractorFn,
        arg: Option<ArgValue>,
    },
    Repartition(ShuffleState),
    Collect(ShuffleState),
    Group {
        table: FxHashMap<Bytes, Vec<Record>>,
        grouped: Option<Vec<Record>>,
    },
    Reduce {
        cb: ReducerFn,
        arg: Option<ArgValue>,
    },
    ForEach {
        cb: ForEachFn,
        arg: Option<ArgValue>,
    },
    Limit {
        offset: u64,
        len: u64,
        index: u64,
    },
    Accumulate {
        cb: AccumulateFn,
        arg: Option<ArgValue>,
        acc: Option<Record>,
        done: bool,
    },
    AccumulateByKey {
        cb: AccumulateByKeyFn,
        arg: Option<ArgValue>,
        table: FxHashMap<Bytes, Record>,
        drained: Option<Vec<Record>>,
    },
    Reader {
        instance: Box<dyn ReaderInstance>,
    },
}

fn pipeline_error(step: &'static str, got: &Record) -> Record {
    tracing::warn!(step, got = got.type_name(), "unexpected record type in pipeline");
    Record::error_from(format!("{step}: unexpected {} in pipeline", got.type_name()))
}

fn callback_error(err: anyhow::Error) -> Record {
    Record::error_from(format!("{err:#}"))
}

/// Pull the next record out of `steps[0]`, recursively pulling from the
/// upstream slice. The caller owns the returned record.
pub fn next_record(steps: &mut [Step], ctx: &mut StepCtx<'_>) -> StepOut {
    let Some((step, upstream)) = steps.split_first_mut() else {
        return StepOut::Exhausted;
    };
    let Step {
        index,
        duration,
        state,
        ..
    } = step;
    let index = *index;

    match state {
        StepState::Reader { instance } => match instance.next(ctx) {
            ReaderNext::Rec(r) => StepOut::Rec(r),
            ReaderNext::Exhausted => StepOut::Exhausted,
            ReaderNext::Wait => StepOut::Suspend(SuspendReason::Reader),
        },

        StepState::Map { cb, arg, pending } => loop {
            if let Some(ar) = pending {
                match ar.take() {
                    Some(payload) => {
                        *pending = None;
                        return StepOut::Rec(payload);
                    }
                    None => return StepOut::Suspend(SuspendReason::Async),
                }
            }
            match next_record(upstream, ctx) {
                StepOut::Rec(r) if r.is_error() => return StepOut::Rec(r),
                StepOut::Rec(r) => {
                    match timed(ctx, duration, |ctx| (cb)(ctx, r, arg.as_ref())) {
                        Ok(Record::Async(ar)) => {
                            *pending = Some(ar);
                        }
                        Ok(out) => return StepOut::Rec(out),
                        Err(err) => return StepOut::Rec(callback_error(err)),
                    }
                }
                other => return other,
            }
        },

        StepState::FlatMap {
            cb,
            arg,
            buffered,
            pending,
        } => loop {
            if let Some(r) = buffered.pop_front() {
                return StepOut::Rec(r);
            }
            if let Some(ar) = pending {
                match ar.take() {
                    Some(Record::List(items)) => {
                        *pending = None;
                        buffered.extend(items);
                        continue;
                    }
                    Some(payload) => {
                        *pending = None;
                        return StepOut::Rec(payload);
                    }
                    None => return StepOut::Suspend(SuspendReason::Async),
                }
            }
            match next_record(upstream, ctx) {
                StepOut::Rec(r) if r.is_error() => return StepOut::Rec(r),
                StepOut::Rec(r) => {
                    match timed(ctx, duration, |ctx| (cb)(ctx, r, arg.as_ref())) {
                        // One element per downstream call until drained.
                        Ok(Record::List(items)) => buffered.extend(items),
                        Ok(Record::Async(ar)) => *pending = Some(ar),
                        Ok(out) => return StepOut::Rec(out),
                        Err(err) => return StepOut::Rec(callback_error(err)),
                    }
                }
                other => return other,
            }
        },

        StepState::Filter { cb, arg } => loop {
            match next_record(upstream, ctx) {
                StepOut::Rec(r) if r.is_error() => return StepOut::Rec(r),
                StepOut::Rec(r) => {
                    match timed(ctx, duration, |ctx| (cb)(ctx, &r, arg.as_ref())) {
                        Ok(true) => return StepOut::Rec(r),
                        Ok(false) => continue,
                        Err(err) => return StepOut::Rec(callback_error(err)),
                    }
                }
                other => return other,
            }
        },

        StepState::ExtractKey { cb, arg } => match next_record(upstream, ctx) {
            StepOut::Rec(r) if r.is_error() => StepOut::Rec(r),
            StepOut::Rec(r) => match timed(ctx, duration, |ctx| (cb)(ctx, &r, arg.as_ref())) {
                Ok(key) => StepOut::Rec(Record::key(key, Some(r))),
                Err(err) => StepOut::Rec(callback_error(err)),
            },
            other => other,
        },

        StepState::ForEach { cb, arg } => match next_record(upstream, ctx) {
            StepOut::Rec(r) if r.is_error() => StepOut::Rec(r),
            StepOut::Rec(mut r) => {
                match timed(ctx, duration, |ctx| (cb)(ctx, &mut r, arg.as_ref())) {
                    Ok(()) => StepOut::Rec(r),
                    Err(err) => StepOut::Rec(callback_error(err)),
                }
            }
            other => other,
        },

        StepState::Limit { offset, len, index } => loop {
            match next_record(upstream, ctx) {
                StepOut::Rec(r) if r.is_error() => return StepOut::Rec(r),
                StepOut::Rec(r) => {
                    let at = *index;
                    *index += 1;
                    if at < *offset {
                        continue;
                    }
                    if at < *offset + *len {
                        return StepOut::Rec(r);
                    }
                    return StepOut::Exhausted;
                }
                other => return other,
            }
        },

        StepState::Group { table, grouped } => loop {
            if let Some(out) = grouped {
                return match out.pop() {
                    Some(r) => StepOut::Rec(r),
                    None => StepOut::Exhausted,
                };
            }
            match next_record(upstream, ctx) {
                StepOut::Rec(r) if r.is_error() => return StepOut::Rec(r),
                StepOut::Rec(Record::Key(mut kr)) => {
                    let value = kr.take_value().unwrap_or(Record::Null);
                    table.entry(kr.key).or_default().push(value);
                }
                StepOut::Rec(other) => return StepOut::Rec(pipeline_error("group", &other)),
                StepOut::Exhausted => {
                    *grouped = Some(
                        table
                            .drain()
                            .map(|(key, items)| {
                                Record::Key(KeyRecord::new(key, Some(Record::List(items))))
                            })
                            .collect(),
                    );
                }
                suspend => return suspend,
            }
        },

        StepState::Reduce { cb, arg } => match next_record(upstream, ctx) {
            StepOut::Rec(r) if r.is_error() => StepOut::Rec(r),
            StepOut::Rec(Record::Key(mut kr)) => {
                let Some(value) = kr.take_value() else {
                    return StepOut::Rec(pipeline_error("reduce", &Record::Key(kr)));
                };
                match timed(ctx, duration, |ctx| (cb)(ctx, &kr.key, value, arg.as_ref())) {
                    Ok(reduced) => {
                        kr.set_value(Some(reduced));
                        StepOut::Rec(Record::Key(kr))
                    }
                    // A failed reduction terminates this key's chain.
                    Err(err) => StepOut::Rec(callback_error(err)),
                }
            }
            StepOut::Rec(other) => StepOut::Rec(pipeline_error("reduce", &other)),
            other => other,
        },

        StepState::Accumulate { cb, arg, acc, done } => loop {
            if *done {
                return StepOut::Exhausted;
            }
            match next_record(upstream, ctx) {
                StepOut::Rec(r) if r.is_error() => return StepOut::Rec(r),
                StepOut::Rec(r) => {
                    match timed(ctx, duration, |ctx| (cb)(ctx, acc.take(), r, arg.as_ref())) {
                        Ok(next) => *acc = Some(next),
                        Err(err) => return StepOut::Rec(callback_error(err)),
                    }
                }
                StepOut::Exhausted => {
                    *done = true;
                    return match acc.take() {
                        Some(result) => StepOut::Rec(result),
                        None => StepOut::Exhausted,
                    };
                }
                suspend => return suspend,
            }
        },

        StepState::AccumulateByKey {
            cb,
            arg,
            table,
            drained,
        } => loop {
            if let Some(out) = drained {
                return match out.pop() {
                    Some(r) => StepOut::Rec(r),
                    None => StepOut::Exhausted,
                };
            }
            match next_record(upstream, ctx) {
                StepOut::Rec(r) if r.is_error() => return StepOut::Rec(r),
                StepOut::Rec(Record::Key(mut kr)) => {
                    let value = kr.take_value().unwrap_or(Record::Null);
                    let acc = table.remove(&kr.key);
                    match timed(ctx, duration, |ctx| {
                        (cb)(ctx, &kr.key, acc, value, arg.as_ref())
                    }) {
                        Ok(next) => {
                            table.insert(kr.key, next);
                        }
                        Err(err) => return StepOut::Rec(callback_error(err)),
                    }
                }
                StepOut::Rec(other) => {
                    return StepOut::Rec(pipeline_error("accumulate-by-key", &other))
                }
                StepOut::Exhausted => {
                    *drained = Some(
                        table
                            .drain()
                            .map(|(key, acc)| Record::Key(KeyRecord::new(key, Some(acc))))
                            .collect(),
                    );
                }
                suspend => return suspend,
            }
        },

        StepState::Repartition(shuffle) =>

            repartition_next(shuffle, upstream, ctx, index),

        StepState::Collect(shuffle) => collect_next(shuffle, upstream, ctx, index),
    }
}

fn repartition_next(
    shuffle: &mut ShuffleState,
    upstream: &mut [Step],
    ctx: &mut StepCtx<'_>,
    index: usize,
) -> StepOut {
    if !ctx.distributed {
        // Single shard: repartitioning is the identity.
        return next_record(upstream, ctx);
    }
    let my_id = *ctx.view.my_id();
    loop {
        // Serve remote arrivals eagerly to bound the inbox.
        if let Some(r) = shuffle.inbox.pop_front() {
            return StepOut::Rec(r);
        }
        if !shuffle.stopped {
            match next_record(upstream, ctx) {
                StepOut::Rec(r) if r.is_error() => return StepOut::Rec(r),
                StepOut::Rec(Record::Key(kr)) => {
                    let target = *ctx.view.shard_for_key(&kr.key);
                    if target == my_id {
                        // Local destination short-circuits the wire.
                        return StepOut::Rec(Record::Key(kr));
                    }
                    let record = Record::Key(kr);
                    match ctx.record_bytes(&record) {
                        Ok(bytes) => ctx.engine.send_message(
                            Some(&target),
                            &Message::RepartitionRecord {
                                id: ctx.ep.id(),
                                step: index as u32,
                                record: bytes,
                            },
                        ),
                        Err(err) => {
                            return StepOut::Rec(Record::error_from(format!(
                                "repartition serialization failed: {err}"
                            )))
                        }
                    }
                }
                StepOut::Rec(other) => return StepOut::Rec(pipeline_error("repartition", &other)),
                StepOut::Exhausted => {
                    shuffle.stopped = true;
                    ctx.engine.send_message(
                        None,
                        &Message::StepDone {
                            id: ctx.ep.id(),
                            step: index as u32,
                        },
                    );
                }
                suspend => return suspend,
            }
            continue;
        }
        if shuffle.peers_done >= ctx.view.size() - 1 {
            return StepOut::Exhausted;
        }
        return StepOut::Suspend(SuspendReason::Cluster);
    }
}

fn collect_next(
    shuffle: &mut ShuffleState,
    upstream: &mut [Step],
    ctx: &mut StepCtx<'_>,
    index: usize,
) -> StepOut {
    if !ctx.distributed {
        return next_record(upstream, ctx);
    }
    let initiator = ctx.ep.id().node;
    if ctx.is_initiator() {
        loop {
            if let Some(r) = shuffle.inbox.pop_front() {
                return StepOut::Rec(r);
            }
            if !shuffle.stopped {
                match next_record(upstream, ctx) {
                    StepOut::Rec(r) => return StepOut::Rec(r),
                    StepOut::Exhausted => {
                        shuffle.stopped = true;
                        continue;
                    }
                    suspend => return suspend,
                }
            }
            if shuffle.peers_done >= ctx.view.size() - 1 {
                return StepOut::Exhausted;
            }
            return StepOut::Suspend(SuspendReason::Cluster);
        }
    }
    // Non-initiator: ship everything to the initiator, then report the
    // step done. Nothing flows further on this shard.
    if shuffle.stopped {
        return StepOut::Exhausted;
    }
    loop {
        match next_record(upstream, ctx) {
            StepOut::Rec(r) => match ctx.record_bytes(&r) {
                Ok(bytes) => ctx.engine.send_message(
                    Some(&initiator),
                    &Message::CollectRecord {
                        id: ctx.ep.id(),
                        record: bytes,
                    },
                ),
                Err(err) => {
                    // Surface the failure on the initiator instead of
                    // dropping it silently.
                    let fallback =
                        Record::error_from(format!("collect serialization failed: {err}"));
                    if let Ok(bytes) = ctx.record_bytes(&fallback) {
                        ctx.engine.send_message(
                            Some(&initiator),
                            &Message::CollectRecord {
                                id: ctx.ep.id(),
                                record: bytes,
                            },
                        );
                    }
                }
            },
            StepOut::Exhausted => {
                shuffle.stopped = true;
                ctx.engine.send_message(
                    Some(&initiator),
                    &Message::StepDone {
                        id: ctx.ep.id(),
                        step: index as u32,
                    },
                );
                return StepOut::Exhausted;
            }
            suspend => return suspend,
        }
    }
}

fn timed<T>(
    ctx: &mut StepCtx<'_>,
    duration: &mut Duration,
    f: impl FnOnce(&mut StepCtx<'_>) -> T,
) -> T {
    if !ctx.profile {
        return f(ctx);
    }
    let started = Instant::now();
    let out = f(ctx);
    *duration += started.elapsed();
    out
}
