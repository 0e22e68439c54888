//! In-memory implementation of the host contracts, plus a loopback
//! multi-shard cluster and a manually advanced clock. Everything the
//! scenario tests drive lives here; production embeddings implement
//! [`host::Host`] over the real store instead.

use bytes::Bytes;
use fxhash::FxHashMap;
use host::{
    AuxProvider, CallContext, ClientPort, CommandFilterFn, CommandInfo, Host, HostError,
    HostTopology, KeyHandle, KeyType, KeyValue, KeyspaceCallback, KeyspaceEvent, OpenKey, RdbPhase,
    Reply, ShardId, StreamEntry, StreamEntryId, TimerCallback, TimerId,
};
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod bus;
pub use bus::{MemBus, MemCluster};

/// A value in the in-memory key space.
#[derive(Debug, Clone)]
pub enum MemValue {
    String(Bytes),
    Stream(MemStream),
}

#[derive(Debug, Clone, Default)]
pub struct MemStream {
    pub entries: Vec<StreamEntry>,
    pub last_id: StreamEntryId,
    pub groups: FxHashMap<String, MemGroup>,
}

#[derive(Debug, Clone, Default)]
pub struct MemGroup {
    /// Entries up to and including this id have been delivered.
    pub delivered: StreamEntryId,
    /// Delivered but not yet acknowledged.
    pub pending: Vec<StreamEntryId>,
}

/// A snapshot of the host produced by [`MemHost::save_rdb`]:
/// the module aux payloads around the key-space data.
#[derive(Debug, Clone)]
pub struct Rdb {
    pub encver: u32,
    pub before_keys: Vec<u8>,
    pub keys: BTreeMap<Vec<u8>, MemValue>,
    pub after_keys: Vec<u8>,
}

pub type Dispatcher = Arc<dyn Fn(&mut CallContext) -> Reply + Send + Sync>;

struct TimerEntry {
    id: u64,
    due_ms: u64,
    callback: Option<TimerCallback>,
}

struct MemHostInner {
    id: ShardId,
    global: parking_lot::RawMutex,
    keys: Mutex<BTreeMap<Vec<u8>, MemValue>>,
    clock_ms: AtomicU64,
    timers: Mutex<Vec<TimerEntry>>,
    next_timer: AtomicU64,
    subscribers: Mutex<Vec<Arc<dyn Fn(&KeyspaceEvent) + Send + Sync>>>,
    filters: Mutex<Vec<Arc<dyn Fn(&mut Vec<Bytes>) + Send + Sync>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    bus: Mutex<Option<MemBus>>,
    aux: Mutex<Option<Arc<dyn AuxProvider>>>,
    topology: Mutex<HostTopology>,
    replicated: Mutex<Vec<(String, Vec<Bytes>)>>,
    loading: AtomicBool,
    master: AtomicBool,
    memory_ratio: Mutex<f64>,
}

/// One in-memory shard.
#[derive(Clone)]
pub struct MemHost {
    inner: Arc<MemHostInner>,
}

impl MemHost {
    pub fn new(id: ShardId) -> MemHost {
        MemHost {
            inner: Arc::new(MemHostInner {
                id,
                global: parking_lot::RawMutex::INIT,
                keys: Mutex::new(BTreeMap::new()),
                clock_ms: AtomicU64::new(1_000),
                timers: Mutex::new(Vec::new()),
                next_timer: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
                filters: Mutex::new(Vec::new()),
                dispatcher: Mutex::new(None),
                bus: Mutex::new(None),
                aux: Mutex::new(None),
                topology: Mutex::new(HostTopology {
                    cluster_mode: false,
                    my_id: Some(id),
                    shards: vec![id],
                    slot_ranges: Vec::new(),
                }),
                replicated: Mutex::new(Vec::new()),
                loading: AtomicBool::new(false),
                master: AtomicBool::new(true),
                memory_ratio: Mutex::new(0.0),
            }),
        }
    }

    pub fn standalone() -> MemHost {
        MemHost::new(ShardId::of("standalone"))
    }

    pub fn id(&self) -> ShardId {
        self.inner.id
    }

    pub fn arc(&self) -> Arc<dyn Host> {
        Arc::new(self.clone())
    }

    // Wiring.

    pub fn set_dispatcher(&self, dispatcher: Dispatcher) {
        *self.inner.dispatcher.lock() = Some(dispatcher);
    }

    pub fn set_topology(&self, topology: HostTopology) {
        *self.inner.topology.lock() = topology;
    }

    pub fn join_bus(&self, bus: &MemBus) {
        *self.inner.bus.lock() = Some(bus.clone());
        bus.add_host(self.clone());
    }

    pub fn set_aux_provider(&self, provider: Arc<dyn AuxProvider>) {
        *self.inner.aux.lock() = Some(provider);
    }

    pub fn set_master(&self, master: bool) {
        self.inner.master.store(master, Ordering::SeqCst);
    }

    pub fn set_memory_ratio(&self, ratio: f64) {
        *self.inner.memory_ratio.lock() = ratio;
    }

    pub fn replicated_commands(&self) -> Vec<(String, Vec<Bytes>)> {
        self.inner.replicated.lock().clone()
    }

    // Clock.

    /// Advance the manual clock and fire every timer that came due.
    pub fn advance(&self, by: Duration) {
        let now = self
            .inner
            .clock_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst)
            + by.as_millis() as u64;
        loop {
            let callback = {
                let mut timers = self.inner.timers.lock();
                let Some(pos) = timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due_ms <= now)
                    .min_by_key(|(_, t)| t.due_ms)
                    .map(|(pos, _)| pos)
                else {
                    break;
                };
                timers.remove(pos).callback
            };
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.timers.lock().len()
    }

    // Client-facing execution (applies command filters).

    pub fn execute(&self, args: &[&str]) -> Reply {
        let argv = args
            .iter()
            .map(|a| Bytes::copy_from_slice(a.as_bytes()))
            .collect();
        self.execute_with_client(argv, None)
    }

    pub fn execute_with_client(
        &self,
        mut argv: Vec<Bytes>,
        client: Option<Arc<dyn ClientPort>>,
    ) -> Reply {
        let filters: Vec<_> = self.inner.filters.lock().clone();
        for filter in filters {
            filter(&mut argv);
        }
        self.invoke(argv, client, false)
    }

    /// Replicated traffic skips filters entirely.
    pub fn execute_from_replica(&self, args: &[&str]) -> Reply {
        let argv = args
            .iter()
            .map(|a| Bytes::copy_from_slice(a.as_bytes()))
            .collect();
        self.execute_replicated(argv)
    }

    /// Deliver raw argv as replication-stream traffic (no filters,
    /// `from_replica` set): what a replica replaying its master's
    /// stream observes, rewritten commands included.
    pub fn execute_replicated(&self, argv: Vec<Bytes>) -> Reply {
        self.invoke(argv, None, true)
    }

    /// Toggle the loading flag, as the host does around an RDB/AOF load.
    pub fn set_loading(&self, loading: bool) {
        self.inner.loading.store(loading, Ordering::SeqCst);
    }

    fn invoke(
        &self,
        argv: Vec<Bytes>,
        client: Option<Arc<dyn ClientPort>>,
        from_replica: bool,
    ) -> Reply {
        let Some(first) = argv.first() else {
            return Reply::error("empty command");
        };
        let Ok(name) = std::str::from_utf8(first) else {
            return Reply::error("malformed command name");
        };
        let name = name.to_ascii_lowercase();

        if name.starts_with("sluice.") {
            let dispatcher = self.inner.dispatcher.lock().clone();
            let Some(dispatcher) = dispatcher else {
                return Reply::error("module is not loaded");
            };
            let mut ctx = CallContext::new(argv, client);
            if from_replica {
                ctx = ctx.replicated();
            }
            return dispatcher(&mut ctx);
        }
        self.builtin(&name, &argv)
    }

    fn builtin(&self, name: &str, argv: &[Bytes]) -> Reply {
        match name {
            "set" => {
                let [_, key, value] = argv else {
                    return Reply::wrong_arity("set");
                };
                self.inner
                    .keys
                    .lock()
                    .insert(key.to_vec(), MemValue::String(value.clone()));
                self.notify("set", key);
                Reply::ok()
            }
            "get" => {
                let [_, key] = argv else {
                    return Reply::wrong_arity("get");
                };
                match self.inner.keys.lock().get(key.as_ref()) {
                    Some(MemValue::String(value)) => Reply::Bulk(value.clone()),
                    Some(_) => Reply::error("WRONGTYPE key holds a stream"),
                    None => Reply::Null,
                }
            }
            "del" => {
                let mut removed = 0;
                for key in &argv[1..] {
                    if self.inner.keys.lock().remove(key.as_ref()).is_some() {
                        removed += 1;
                        self.notify("del", key);
                    }
                }
                Reply::Integer(removed)
            }
            "xadd" => {
                if argv.len() < 5 || argv.len() % 2 == 0 {
                    return Reply::wrong_arity("xadd");
                }
                let key = &argv[1];
                let id_spec = String::from_utf8_lossy(&argv[2]).into_owned();
                let fields: Vec<(Bytes, Bytes)> = argv[3..]
                    .chunks(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                match self.xadd_inner(key, &id_spec, fields) {
                    Ok(id) => {
                        self.notify("xadd", key);
                        Reply::bulk_str(id.to_string())
                    }
                    Err(err) => Reply::error(err.to_string()),
                }
            }
            "xlen" => {
                let [_, key] = argv else {
                    return Reply::wrong_arity("xlen");
                };
                match self.stream_len(key) {
                    Ok(len) => Reply::Integer(len as i64),
                    Err(err) => Reply::error(err.to_string()),
                }
            }
            other => Reply::error(format!("unknown command '{other}'")),
        }
    }

    /// Append an entry, auto-assigning the id for `*`.
    pub fn xadd(&self, key: &[u8], fields: Vec<(Bytes, Bytes)>) -> StreamEntryId {
        let id = self
            .xadd_inner(key, "*", fields)
            .expect("auto ids always apply");
        self.notify("xadd", key);
        id
    }

    fn xadd_inner(
        &self,
        key: &[u8],
        id_spec: &str,
        fields: Vec<(Bytes, Bytes)>,
    ) -> Result<StreamEntryId, HostError> {
        let now = self.now_ms();
        let mut keys = self.inner.keys.lock();
        let value = keys
            .entry(key.to_vec())
            .or_insert_with(|| MemValue::Stream(MemStream::default()));
        let MemValue::Stream(stream) = value else {
            return Err(HostError::WrongType);
        };
        let id = if id_spec == "*" {
            if now > stream.last_id.ms {
                StreamEntryId::new(now, 0)
            } else {
                stream.last_id.next()
            }
        } else {
            id_spec
                .parse()
                .map_err(|_| HostError::Command(format!("malformed stream id '{id_spec}'")))?
        };
        if id <= stream.last_id {
            return Err(HostError::Command(
                "stream ids must be monotonically increasing".to_string(),
            ));
        }
        stream.last_id = id;
        stream.entries.push(StreamEntry { id, fields });
        Ok(id)
    }

    /// Delivered-but-unacked ids of a consumer group.
    pub fn stream_pending(&self, key: &[u8], group: &str) -> Vec<StreamEntryId> {
        let keys = self.inner.keys.lock();
        match keys.get(key) {
            Some(MemValue::Stream(stream)) => stream
                .groups
                .get(group)
                .map(|g| g.pending.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Entry count of a stream key (0 when absent).
    pub fn stream_length(&self, key: &[u8]) -> usize {
        let keys = self.inner.keys.lock();
        match keys.get(key) {
            Some(MemValue::Stream(stream)) => stream.entries.len(),
            _ => 0,
        }
    }

    fn notify(&self, event: &str, key: &[u8]) {
        let event = KeyspaceEvent {
            event: event.to_string(),
            key: Bytes::copy_from_slice(key),
        };
        let subscribers: Vec<_> = self.inner.subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(&event);
        }
    }

    // Persistence.

    /// Produce the module's aux payloads around a key-space snapshot.
    pub fn save_rdb(&self, encver: u32) -> Rdb {
        let aux = self.inner.aux.lock().clone().expect("aux provider set");
        let mut before = wire::Buffer::new();
        aux.aux_save(RdbPhase::BeforeKeys, &mut before);
        let keys = self.inner.keys.lock().clone();
        let mut after = wire::Buffer::new();
        aux.aux_save(RdbPhase::AfterKeys, &mut after);
        Rdb {
            encver,
            before_keys: before.as_slice().to_vec(),
            keys,
            after_keys: after.as_slice().to_vec(),
        }
    }

    /// Load a snapshot into this (fresh) host.
    pub fn load_rdb(&self, rdb: &Rdb) -> Result<(), HostError> {
        let aux = self.inner.aux.lock().clone().expect("aux provider set");
        self.inner.loading.store(true, Ordering::SeqCst);
        let result = (|| {
            aux.aux_load(
                RdbPhase::BeforeKeys,
                &mut wire::BufferReader::new(&rdb.before_keys),
                rdb.encver,
            )?;
            *self.inner.keys.lock() = rdb.keys.clone();
            aux.aux_load(
                RdbPhase::AfterKeys,
                &mut wire::BufferReader::new(&rdb.after_keys),
                rdb.encver,
            )
        })();
        self.inner.loading.store(false, Ordering::SeqCst);
        result
    }
}

impl Host for MemHost {
    fn raw_lock(&self) {
        self.inner.global.lock();
    }

    fn raw_unlock(&self) {
        unsafe { self.inner.global.unlock() }
    }

    fn scan_keys(&self, cursor: u64) -> (u64, Vec<Bytes>) {
        // One scan step returns a bounded batch; the cursor is the
        // index of the next key in iteration order.
        const BATCH: usize = 8;
        let keys = self.inner.keys.lock();
        let batch: Vec<Bytes> = keys
            .keys()
            .skip(cursor as usize)
            .take(BATCH)
            .map(|k| Bytes::copy_from_slice(k))
            .collect();
        let consumed = cursor as usize + batch.len();
        let next = if consumed >= keys.len() {
            0
        } else {
            consumed as u64
        };
        (next, batch)
    }

    fn open_key(&self, key: &[u8]) -> Option<KeyHandle> {
        let keys = self.inner.keys.lock();
        let value = keys.get(key)?;
        Some(KeyHandle(Arc::new(MemOpenKey {
            name: Bytes::copy_from_slice(key),
            value: value.clone(),
        })))
    }

    fn set_string_key(&self, key: &[u8], value: Bytes) -> Result<(), HostError> {
        self.inner
            .keys
            .lock()
            .insert(key.to_vec(), MemValue::String(value));
        self.notify("set", key);
        Ok(())
    }

    fn delete_key(&self, key: &[u8]) -> Result<bool, HostError> {
        let removed = self.inner.keys.lock().remove(key).is_some();
        if removed {
            self.notify("del", key);
        }
        Ok(removed)
    }

    fn stream_create_group(
        &self,
        key: &[u8],
        group: &str,
        start: StreamEntryId,
    ) -> Result<(), HostError> {
        let mut keys = self.inner.keys.lock();
        let Some(MemValue::Stream(stream)) = keys.get_mut(key) else {
            return Err(HostError::NoSuchKey);
        };
        stream.groups.entry(group.to_string()).or_insert(MemGroup {
            delivered: start,
            pending: Vec::new(),
        });
        Ok(())
    }

    fn stream_read_group(
        &self,
        key: &[u8],
        group: &str,
        _consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, HostError> {
        let mut keys = self.inner.keys.lock();
        let Some(MemValue::Stream(stream)) = keys.get_mut(key) else {
            return Err(HostError::NoSuchKey);
        };
        let group_state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| HostError::NoSuchGroup(group.to_string()))?;
        // At-least-once: delivered-but-unacked entries re-deliver ahead
        // of anything new.
        let mut batch: Vec<StreamEntry> = stream
            .entries
            .iter()
            .filter(|e| group_state.pending.contains(&e.id))
            .take(count)
            .cloned()
            .collect();
        let fresh: Vec<StreamEntry> = stream
            .entries
            .iter()
            .filter(|e| e.id > group_state.delivered)
            .take(count - batch.len().min(count))
            .cloned()
            .collect();
        if let Some(last) = fresh.last() {
            group_state.delivered = last.id;
            group_state.pending.extend(fresh.iter().map(|e| e.id));
        }
        batch.extend(fresh);
        Ok(batch)
    }

    fn stream_ack(&self, key: &[u8], group: &str, ids: &[StreamEntryId]) -> Result<u64, HostError> {
        let mut keys = self.inner.keys.lock();
        let Some(MemValue::Stream(stream)) = keys.get_mut(key) else {
            return Err(HostError::NoSuchKey);
        };
        let group_state = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| HostError::NoSuchGroup(group.to_string()))?;
        let before = group_state.pending.len();
        group_state.pending.retain(|id| !ids.contains(id));
        Ok((before - group_state.pending.len()) as u64)
    }

    fn stream_trim_acked(&self, key: &[u8], upto: StreamEntryId) -> Result<u64, HostError> {
        let mut keys = self.inner.keys.lock();
        let Some(MemValue::Stream(stream)) = keys.get_mut(key) else {
            return Err(HostError::NoSuchKey);
        };
        let before = stream.entries.len();
        stream.entries.retain(|e| e.id > upto);
        Ok((before - stream.entries.len()) as u64)
    }

    fn stream_len(&self, key: &[u8]) -> Result<u64, HostError> {
        let keys = self.inner.keys.lock();
        match keys.get(key) {
            Some(MemValue::Stream(stream)) => Ok(stream.entries.len() as u64),
            Some(_) => Err(HostError::WrongType),
            None => Ok(0),
        }
    }

    fn topology(&self) -> HostTopology {
        self.inner.topology.lock().clone()
    }

    fn send_to_shard(
        &self,
        target: &ShardId,
        command: &str,
        args: &[Bytes],
    ) -> Result<(), HostError> {
        let bus = self.inner.bus.lock().clone();
        let Some(bus) = bus else {
            return Err(HostError::UnknownShard(*target));
        };
        bus.send(*target, command, args)
    }

    fn subscribe_keyspace(&self, f: KeyspaceCallback) {
        self.inner.subscribers.lock().push(Arc::from(f));
    }

    fn register_command_filter(&self, f: CommandFilterFn) {
        self.inner.filters.lock().push(Arc::from(f));
    }

    fn command_info(&self, name: &str) -> Option<CommandInfo> {
        let info = |noscript, denyoom, movable_keys, write, first, last, jump| CommandInfo {
            noscript,
            denyoom,
            movable_keys,
            write,
            first_key: first,
            last_key: last,
            jump,
        };
        Some(match name.to_ascii_lowercase().as_str() {
            "set" => info(false, true, false, true, 1, 1, 1),
            "get" => info(false, false, false, false, 1, 1, 1),
            "del" => info(false, false, false, true, 1, -1, 1),
            "mset" => info(false, true, false, true, 1, -1, 2),
            "xadd" => info(false, true, false, true, 1, 1, 1),
            "xlen" => info(false, false, false, false, 1, 1, 1),
            // For hook-validation tests.
            "subscribe" => info(true, false, false, false, 0, 0, 0),
            "georadius" => info(false, true, true, true, 1, 1, 1),
            _ => return None,
        })
    }

    fn call(&self, args: &[Bytes]) -> Reply {
        // Direct invocation bypasses command filters.
        self.invoke(args.to_vec(), None, false)
    }

    fn set_timer(&self, delay: Duration, f: TimerCallback) -> TimerId {
        let id = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        let due_ms = self.now_ms() + delay.as_millis() as u64;
        self.inner.timers.lock().push(TimerEntry {
            id,
            due_ms,
            callback: Some(f),
        });
        TimerId(id)
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        let mut timers = self.inner.timers.lock();
        let before = timers.len();
        timers.retain(|t| t.id != id.0);
        before != timers.len()
    }

    fn now_ms(&self) -> u64 {
        self.inner.clock_ms.load(Ordering::SeqCst)
    }

    fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::SeqCst)
    }

    fn is_master(&self) -> bool {
        self.inner.master.load(Ordering::SeqCst)
    }

    fn memory_ratio(&self) -> f64 {
        *self.inner.memory_ratio.lock()
    }

    fn replicate(&self, command: &str, args: &[Bytes]) {
        self.inner
            .replicated
            .lock()
            .push((command.to_string(), args.to_vec()));
    }
}

struct MemOpenKey {
    name: Bytes,
    value: MemValue,
}

impl OpenKey for MemOpenKey {
    fn name(&self) -> Bytes {
        self.name.clone()
    }

    fn key_type(&self) -> KeyType {
        match &self.value {
            MemValue::String(_) => KeyType::String,
            MemValue::Stream(_) => KeyType::Stream,
        }
    }

    fn value(&self) -> Option<KeyValue> {
        match &self.value {
            MemValue::String(s) => Some(KeyValue::String(s.clone())),
            MemValue::Stream(_) => None,
        }
    }
}

/// A client that can be blocked and later unblocked with a reply.
#[derive(Clone, Default)]
pub struct TestClient {
    state: Arc<(Mutex<Vec<Reply>>, Condvar)>,
}

impl TestClient {
    pub fn new() -> TestClient {
        TestClient::default()
    }

    pub fn port(&self) -> Arc<dyn ClientPort> {
        Arc::new(self.clone())
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.state.0.lock().clone()
    }

    /// Wait (wall clock) for the next asynchronous reply.
    pub fn wait_reply(&self, timeout: Duration) -> Option<Reply> {
        let (lock, cond) = &*self.state;
        let mut replies = lock.lock();
        if replies.is_empty() {
            cond.wait_for(&mut replies, timeout);
        }
        replies.first().cloned()
    }
}

impl ClientPort for TestClient {
    fn unblock(&self, reply: Reply) {
        let (lock, cond) = &*self.state;
        lock.lock().push(reply);
        cond.notify_all();
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
