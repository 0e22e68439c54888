//! Stream reader: batched consumer-group reads driven by key-space
//! arrivals, with per-registration failure policy, acking, and
//! optional trimming of the consumed prefix.

use crate::glob_match;
use bytes::Bytes;
use engine::{
    Engine, Error, ReaderInstance, ReaderNext, ReaderPlugin, Registration, StepCtx, TriggerArgs,
};
use fxhash::FxHashMap;
use host::{KeyType, StreamEntry, StreamEntryId, TimerId};
use parking_lot::Mutex;
use record::Record;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use wire::{BufferReader, BufferWriter};

pub const STREAM_READER: &str = "StreamReader";

/// One consumer group per stream, shared by every shard-local reader.
pub const CONSUMER_GROUP: &str = "__sluice_consumer_group__";
const CONSUMER_NAME: &str = "__sluice_consumer__";

/// What to do when a triggered batch execution reports errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Record the error, ack, move on.
    Continue,
    /// Stop triggering further batches.
    Abort,
    /// Stop, then re-arm scanning after the retry interval.
    Retry,
}

impl FailurePolicy {
    pub fn code(self) -> u64 {
        match self {
            FailurePolicy::Continue => 0,
            FailurePolicy::Abort => 1,
            FailurePolicy::Retry => 2,
        }
    }

    pub fn from_code(code: u64) -> Result<FailurePolicy, Error> {
        Ok(match code {
            0 => FailurePolicy::Continue,
            1 => FailurePolicy::Abort,
            2 => FailurePolicy::Retry,
            other => return Err(Error::Malformed(format!("unknown failure policy {other}"))),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Continue => "continue",
            FailurePolicy::Abort => "abort",
            FailurePolicy::Retry => "retry",
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(FailurePolicy::Continue),
            "abort" => Ok(FailurePolicy::Abort),
            "retry" => Ok(FailurePolicy::Retry),
            other => Err(Error::Malformed(format!("unknown failure policy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamTriggerArgs {
    /// Glob over stream key names, e.g. `s*`.
    pub prefix: Bytes,
    pub batch_size: usize,
    /// Debounce window; 0 fires on every arrival.
    pub duration_ms: u64,
    pub policy: FailurePolicy,
    pub retry_interval_s: u64,
    /// Trim acked entries off the stream head.
    pub trim_stream: bool,
}

impl StreamTriggerArgs {
    pub fn new(prefix: impl Into<Bytes>, batch_size: usize) -> StreamTriggerArgs {
        StreamTriggerArgs {
            prefix: prefix.into(),
            batch_size: batch_size.max(1),
            duration_ms: 0,
            policy: FailurePolicy::Continue,
            retry_interval_s: 5,
            trim_stream: false,
        }
    }

    pub fn deserialize(r: &mut BufferReader<'_>, _encver: u32) -> Result<StreamTriggerArgs, Error> {
        Ok(StreamTriggerArgs {
            prefix: Bytes::copy_from_slice(r.read_bytes()?),
            batch_size: r.read_varu64()? as usize,
            duration_ms: r.read_varu64()?,
            policy: FailurePolicy::from_code(r.read_varu64()?)?,
            retry_interval_s: r.read_varu64()?,
            trim_stream: r.read_varu64()? != 0,
        })
    }
}

impl TriggerArgs for StreamTriggerArgs {
    fn serialize(&self, w: &mut BufferWriter<'_>) -> Result<(), Error> {
        w.write_bytes(&self.prefix);
        w.write_varu64(self.batch_size as u64);
        w.write_varu64(self.duration_ms);
        w.write_varu64(self.policy.code());
        w.write_varu64(self.retry_interval_s);
        w.write_varu64(self.trim_stream as u64);
        Ok(())
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "prefix": String::from_utf8_lossy(&self.prefix),
            "batchSize": self.batch_size,
            "durationMs": self.duration_ms,
            "onFailedPolicy": self.policy.as_str(),
            "retryIntervalSeconds": self.retry_interval_s,
            "trimStream": self.trim_stream,
        })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Per-stream debounce state. `busy` refuses to advance past an
/// un-acked batch, preserving per-stream id order.
#[derive(Default)]
struct StreamCtx {
    timer: Option<TimerId>,
    pending: u64,
    busy: bool,
}

/// Registration-private runtime: known streams and the abort latch.
struct StreamRuntime {
    streams: Mutex<FxHashMap<Bytes, StreamCtx>>,
    aborted: AtomicBool,
}

/// An eagerly-read batch replayed through the pipeline. Each entry
/// becomes `{id, key, value: {field: value}}`.
pub struct StreamReaderInstance {
    key: Bytes,
    records: VecDeque<Record>,
}

impl StreamReaderInstance {
    fn from_entries(key: Bytes, entries: &[StreamEntry]) -> StreamReaderInstance {
        let records = entries
            .iter()
            .map(|entry| {
                let mut value = fxhash::FxHashMap::default();
                for (field, payload) in &entry.fields {
                    value.insert(
                        String::from_utf8_lossy(field).into_owned(),
                        Record::String(payload.clone()),
                    );
                }
                let mut top = fxhash::FxHashMap::default();
                top.insert("id".to_string(), Record::string_from(entry.id.to_string()));
                top.insert(
                    "key".to_string(),
                    Record::String(key.clone()),
                );
                top.insert("value".to_string(), Record::HashSet(value));
                Record::HashSet(top)
            })
            .collect();
        StreamReaderInstance { key, records }
    }
}

impl ReaderInstance for StreamReaderInstance {
    fn next(&mut self, _ctx: &mut StepCtx<'_>) -> ReaderNext {
        match self.records.pop_front() {
            Some(record) => ReaderNext::Rec(record),
            None => ReaderNext::Exhausted,
        }
    }

    fn serialize_args(&self, engine: &Engine, w: &mut BufferWriter<'_>) -> Result<(), Error> {
        w.write_bytes(&self.key);
        w.write_varu64(self.records.len() as u64);
        for record in &self.records {
            record.serialize(engine.types(), w)?;
        }
        Ok(())
    }
}

pub struct StreamReaderPlugin;

impl StreamReaderPlugin {
    pub fn new() -> StreamReaderPlugin {
        StreamReaderPlugin
    }

    fn runtime(registration: &Arc<Registration>) -> &StreamRuntime {
        registration
            .runtime
            .get_or_init(|| {
                Box::new(StreamRuntime {
                    streams: Mutex::new(FxHashMap::default()),
                    aborted: AtomicBool::new(false),
                })
            })
            .downcast_ref::<StreamRuntime>()
            .expect("stream runtime slot")
    }

    fn ensure_group(engine: &Engine, key: &[u8]) {
        if let Err(err) =
            engine
                .host()
                .stream_create_group(key, CONSUMER_GROUP, StreamEntryId::ZERO)
        {
            tracing::debug!(%err, "consumer group exists or stream missing");
        }
    }

    /// Read and dispatch one batch; re-fires itself from the on-done
    /// path until the backlog drains.
    fn fire_batch(
        engine: &Engine,
        registration: &Arc<Registration>,
        args: &StreamTriggerArgs,
        key: &Bytes,
    ) {
        let runtime = Self::runtime(registration);
        if runtime.aborted.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut streams = runtime.streams.lock();
            let ctx = streams.entry(key.clone()).or_default();
            if ctx.busy {
                // An un-acked batch is in flight; its settle path will
                // pick the backlog up.
                return;
            }
            ctx.busy = true;
            if let Some(timer) = ctx.timer.take() {
                engine.host().cancel_timer(timer);
            }
            ctx.pending = 0;
        }
        let clear_busy = |runtime: &StreamRuntime| {
            if let Some(ctx) = runtime.streams.lock().get_mut(key) {
                ctx.busy = false;
            }
        };

        let entries = match engine.host().stream_read_group(
            key,
            CONSUMER_GROUP,
            CONSUMER_NAME,
            args.batch_size,
        ) {
            Ok(entries) => entries,
            Err(err) => {
                // Reader storage errors log and stop this batch; the
                // stream stays registered.
                tracing::warn!(%err, key = %String::from_utf8_lossy(key), "stream read failed");
                clear_busy(runtime);
                return;
            }
        };
        if entries.is_empty() {
            clear_busy(runtime);
            return;
        }

        let ids: Vec<StreamEntryId> = entries.iter().map(|e| e.id).collect();
        let reader = StreamReaderInstance::from_entries(key.clone(), &entries);

        let done_key = key.clone();
        let done_args = args.clone();
        let done_reg = Arc::downgrade(registration);
        let on_done: Vec<engine::execution::DoneCallback> =
            vec![Box::new(move |engine, ep| {
                let Some(registration) = done_reg.upgrade() else { return };
                Self::settle_batch(engine, &registration, &done_args, &done_key, &ids, ep);
            })];

        if let Err(err) = registration.fire(engine, Box::new(reader), on_done) {
            tracing::debug!(registration = %registration.id, %err, "stream trigger skipped");
            clear_busy(runtime);
        }
    }

    /// Post-execution bookkeeping: ack, trim, apply the failure policy,
    /// and keep draining the backlog.
    fn settle_batch(
        engine: &Engine,
        registration: &Arc<Registration>,
        args: &StreamTriggerArgs,
        key: &Bytes,
        ids: &[StreamEntryId],
        ep: &Arc<engine::Execution>,
    ) {
        let runtime = Self::runtime(registration);
        if let Some(ctx) = runtime.streams.lock().get_mut(key) {
            ctx.busy = false;
        }
        let failed = ep
            .outcome()
            .map(|outcome| !outcome.errors.is_empty())
            .unwrap_or(false);

        if failed {
            match args.policy {
                FailurePolicy::Continue => {}
                FailurePolicy::Abort | FailurePolicy::Retry => {
                    runtime.aborted.store(true, Ordering::SeqCst);
                    // Clear all per-stream debounce state.
                    let mut streams = runtime.streams.lock();
                    for ctx in streams.values_mut() {
                        if let Some(timer) = ctx.timer.take() {
                            engine.host().cancel_timer(timer);
                        }
                        ctx.pending = 0;
                    }
                    drop(streams);
                    if args.policy == FailurePolicy::Retry {
                        let weak = Arc::downgrade(registration);
                        let engine_clone = engine.clone();
                        let retry_args = args.clone();
                        engine.host().set_timer(
                            Duration::from_secs(args.retry_interval_s),
                            Box::new(move || {
                                let Some(registration) = weak.upgrade() else { return };
                                let _guard = engine_clone.lock().acquire();
                                StreamReaderPlugin::runtime(&registration)
                                    .aborted
                                    .store(false, Ordering::SeqCst);
                                StreamReaderPlugin::rescan(&engine_clone, &registration, &retry_args);
                            }),
                        );
                    }
                    return;
                }
            }
        }

        // Every id in the batch is acked exactly once; trimming drops
        // the consumed prefix.
        match engine.host().stream_ack(key, CONSUMER_GROUP, ids) {
            Ok(acked) => {
                tracing::debug!(key = %String::from_utf8_lossy(key), acked, "acked stream batch");
                if args.trim_stream {
                    if let Some(max) = ids.iter().max() {
                        if let Err(err) = engine.host().stream_trim_acked(key, *max) {
                            tracing::warn!(%err, "stream trim failed");
                        }
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "stream ack failed"),
        }

        // Keep draining whatever arrived while the batch ran.
        Self::fire_batch(engine, registration, args, key);
    }

    /// Enumerate matching streams and drain their backlogs. Runs at
    /// registration and when a retry timer re-arms scanning.
    fn rescan(engine: &Engine, registration: &Arc<Registration>, args: &StreamTriggerArgs) {
        if !engine.host().is_master() {
            return;
        }
        let mut cursor = 0;
        loop {
            let (next, keys) = engine.host().scan_keys(cursor);
            for key in keys {
                if !glob_match(&args.prefix, &key) {
                    continue;
                }
                let Some(handle) = engine.host().open_key(&key) else {
                    continue;
                };
                if handle.0.key_type() != KeyType::Stream {
                    continue;
                }
                Self::ensure_group(engine, &key);
                Self::fire_batch(engine, registration, args, &key);
            }
            if next == 0 {
                return;
            }
            cursor = next;
        }
    }
}

impl Default for StreamReaderPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderPlugin for StreamReaderPlugin {
    fn name(&self) -> &'static str {
        STREAM_READER
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn instantiate(&self, engine: &Engine, args: &[u8]) -> Result<Box<dyn ReaderInstance>, Error> {
        let mut r = BufferReader::new(args);
        let key = Bytes::copy_from_slice(r.read_bytes()?);
        let count = r.read_varu64()? as usize;
        let mut records = VecDeque::with_capacity(count.min(1024));
        for _ in 0..count {
            records.push_back(Record::deserialize(&mut r, engine.types())?);
        }
        Ok(Box::new(StreamReaderInstance { key, records }))
    }

    fn register(&self, engine: &Engine, registration: &Arc<Registration>) -> Result<(), Error> {
        let args = registration
            .args
            .as_any()
            .downcast_ref::<StreamTriggerArgs>()
            .ok_or_else(|| Error::Registration("stream reader given foreign trigger args".into()))?
            .clone();
        Self::runtime(registration); // initialize the slot

        // Drain any backlog present at (re)registration time.
        Self::rescan(engine, registration, &args);

        let weak: Weak<Registration> = Arc::downgrade(registration);
        let sub_engine = engine.clone();
        let sub_args = args.clone();
        engine.host().subscribe_keyspace(Box::new(move |event| {
            if event.event != "xadd" {
                return;
            }
            let Some(registration) = weak.upgrade() else { return };
            if sub_engine.find_registration(&registration.id).is_none() {
                return;
            }
            if !glob_match(&sub_args.prefix, &event.key) {
                return;
            }
            if !sub_engine.host().is_master() {
                return;
            }
            let runtime = StreamReaderPlugin::runtime(&registration);
            if runtime.aborted.load(Ordering::SeqCst) {
                return;
            }
            StreamReaderPlugin::ensure_group(&sub_engine, &event.key);

            let fire_now = {
                let mut streams = runtime.streams.lock();
                let ctx = streams.entry(event.key.clone()).or_default();
                ctx.pending += 1;
                if ctx.pending >= sub_args.batch_size as u64 || sub_args.duration_ms == 0 {
                    true
                } else {
                    // Arm the debounce window once per quiet period.
                    if ctx.timer.is_none() {
                        let timer_engine = sub_engine.clone();
                        let timer_args = sub_args.clone();
                        let timer_key = event.key.clone();
                        let timer_weak = Arc::downgrade(&registration);
                        let timer = sub_engine.host().set_timer(
                            Duration::from_millis(sub_args.duration_ms),
                            Box::new(move || {
                                let Some(registration) = timer_weak.upgrade() else { return };
                                let _guard = timer_engine.lock().acquire();
                                StreamReaderPlugin::fire_batch(
                                    &timer_engine,
                                    &registration,
                                    &timer_args,
                                    &timer_key,
                                );
                            }),
                        );
                        ctx.timer = Some(timer);
                    }
                    false
                }
            };
            if fire_now {
                StreamReaderPlugin::fire_batch(&sub_engine, &registration, &sub_args, &event.key);
            }
        }));

        tracing::info!(
            registration = %registration.id,
            prefix = %String::from_utf8_lossy(&args.prefix),
            batch = args.batch_size,
            policy = args.policy.as_str(),
            "registered stream trigger"
        );
        Ok(())
    }

    fn unregister(&self, engine: &Engine, registration: &Arc<Registration>) {
        let runtime = Self::runtime(registration);
        let mut streams = runtime.streams.lock();
        for ctx in streams.values_mut() {
            if let Some(timer) = ctx.timer.take() {
                engine.host().cancel_timer(timer);
            }
        }
    }

    fn deserialize_trigger_args(
        &self,
        r: &mut BufferReader<'_>,
        encver: u32,
    ) -> Result<Arc<dyn TriggerArgs>, Error> {
        Ok(Arc::new(StreamTriggerArgs::deserialize(r, encver)?))
    }

    fn supports_rdb(&self) -> bool {
        true
    }
}
