//! Contracts of the embedding key-value store.
//!
//! The engine never talks to the store directly: key scans, stream reads,
//! cluster membership, the message bus, key-space events, command filters,
//! blocked clients, timers, and the process-wide execution lock are all
//! reached through the [`Host`] trait. A production embedding implements it
//! over the real store; tests use the in-memory host from `test-support`.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

mod lock;
pub use lock::{LockGuard, LockHandler};

mod reply;
pub use reply::Reply;

mod shard;
pub use shard::{ShardId, SHARD_ID_LEN};

mod stream;
pub use stream::{StreamEntry, StreamEntryId};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("no such key")]
    NoSuchKey,
    #[error("key holds the wrong type of value")]
    WrongType,
    #[error("no such consumer group '{0}'")]
    NoSuchGroup(String),
    #[error("unknown shard '{0}'")]
    UnknownShard(ShardId),
    #[error("operation not supported by this host: {0}")]
    Unsupported(&'static str),
    #[error("host command failed: {0}")]
    Command(String),
}

/// The type of value a key currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    String,
    List,
    Hash,
    Set,
    Stream,
    Module,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::List => "list",
            KeyType::Hash => "hash",
            KeyType::Set => "set",
            KeyType::Stream => "stream",
            KeyType::Module => "module",
        }
    }
}

/// Point-in-time read of a key's value.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    String(Bytes),
    List(Vec<Bytes>),
    Hash(Vec<(Bytes, Bytes)>),
    Set(Vec<Bytes>),
}

/// A live, opened key. Handles are not serializable and must be
/// materialized before any cross-shard transit.
#[derive(Clone)]
pub struct KeyHandle(pub Arc<dyn OpenKey>);

pub trait OpenKey: Send + Sync {
    fn name(&self) -> Bytes;
    fn key_type(&self) -> KeyType;
    fn value(&self) -> Option<KeyValue>;
}

impl std::fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KeyHandle")
            .field(&String::from_utf8_lossy(&self.0.name()))
            .finish()
    }
}

/// A key-space notification: `event` is the host's event name ("set",
/// "del", "xadd", ...) and `key` the touched key.
#[derive(Debug, Clone)]
pub struct KeyspaceEvent {
    pub event: String,
    pub key: Bytes,
}

/// Host-declared metadata of a registered command, used by the
/// command-hook layer to validate hooks and declare key positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub noscript: bool,
    pub denyoom: bool,
    pub movable_keys: bool,
    pub write: bool,
    pub first_key: i32,
    pub last_key: i32,
    pub jump: i32,
}

/// Delivery port of a client that has been taken off the event loop.
pub trait ClientPort: Send + Sync {
    fn unblock(&self, reply: Reply);
}

/// Owning handle over a blocked client; unblocking consumes it.
pub struct BlockedClient {
    port: Arc<dyn ClientPort>,
}

impl BlockedClient {
    pub fn new(port: Arc<dyn ClientPort>) -> Self {
        Self { port }
    }

    pub fn unblock(self, reply: Reply) {
        self.port.unblock(reply);
    }
}

impl std::fmt::Debug for BlockedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlockedClient")
    }
}

/// An in-flight client command as seen by the module dispatcher.
/// `args[0]` is the command name.
pub struct CallContext {
    pub args: Vec<Bytes>,
    pub from_replica: bool,
    client: Option<Arc<dyn ClientPort>>,
}

impl CallContext {
    pub fn new(args: Vec<Bytes>, client: Option<Arc<dyn ClientPort>>) -> Self {
        Self {
            args,
            from_replica: false,
            client,
        }
    }

    pub fn replicated(mut self) -> Self {
        self.from_replica = true;
        self
    }

    /// Block the calling client. Fails for detached contexts
    /// (replication links, internal invocations).
    pub fn block_client(&self) -> Option<BlockedClient> {
        self.client.clone().map(BlockedClient::new)
    }

    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args
            .get(index)
            .and_then(|a| std::str::from_utf8(a).ok())
    }
}

/// One contiguous range of key-space slots owned by a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub shard: ShardId,
}

/// The host's current view of cluster membership.
#[derive(Debug, Clone, Default)]
pub struct HostTopology {
    pub cluster_mode: bool,
    pub my_id: Option<ShardId>,
    pub shards: Vec<ShardId>,
    pub slot_ranges: Vec<SlotRange>,
}

/// Phase of an RDB aux save or load relative to the key-space payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdbPhase {
    BeforeKeys,
    AfterKeys,
}

/// Module-side provider of aux-save/-load payloads; the host invokes it
/// once per phase.
pub trait AuxProvider: Send + Sync {
    fn aux_save(&self, phase: RdbPhase, buf: &mut wire::Buffer);
    fn aux_load(
        &self,
        phase: RdbPhase,
        reader: &mut wire::BufferReader<'_>,
        encver: u32,
    ) -> Result<(), HostError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;
pub type KeyspaceCallback = Box<dyn Fn(&KeyspaceEvent) + Send + Sync + 'static>;
pub type CommandFilterFn = Box<dyn Fn(&mut Vec<Bytes>) + Send + Sync + 'static>;

/// The embedding store. Every method may be called from any engine
/// thread; implementations synchronize internally. Methods that touch
/// key-space state are only invoked while the caller holds the
/// process-wide lock (see [`LockHandler`]).
pub trait Host: Send + Sync {
    // Process-wide execution lock. Callers go through `LockHandler`,
    // which counts per-thread re-entries; these two are the raw edges.
    fn raw_lock(&self);
    fn raw_unlock(&self);

    // Key space.
    /// One scan step: feed the cursor from the previous call (0 to
    /// start); a returned cursor of 0 means the scan is complete.
    fn scan_keys(&self, cursor: u64) -> (u64, Vec<Bytes>);
    fn open_key(&self, key: &[u8]) -> Option<KeyHandle>;
    fn set_string_key(&self, key: &[u8], value: Bytes) -> Result<(), HostError>;
    fn delete_key(&self, key: &[u8]) -> Result<bool, HostError>;

    // Streams.
    fn stream_create_group(
        &self,
        key: &[u8],
        group: &str,
        start: StreamEntryId,
    ) -> Result<(), HostError>;
    fn stream_read_group(
        &self,
        key: &[u8],
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, HostError>;
    fn stream_ack(&self, key: &[u8], group: &str, ids: &[StreamEntryId]) -> Result<u64, HostError>;
    /// Drop entries with id <= `upto` (trimming the consumed prefix).
    fn stream_trim_acked(&self, key: &[u8], upto: StreamEntryId) -> Result<u64, HostError>;
    fn stream_len(&self, key: &[u8]) -> Result<u64, HostError>;

    // Cluster.
    fn topology(&self) -> HostTopology;
    /// Deliver `command args...` to `target`'s module dispatcher.
    /// Fire-and-forget; retry policy is the caller's concern.
    fn send_to_shard(&self, target: &ShardId, command: &str, args: &[Bytes])
        -> Result<(), HostError>;

    // Events, filters, direct invocation.
    fn subscribe_keyspace(&self, f: KeyspaceCallback);
    fn register_command_filter(&self, f: CommandFilterFn);
    fn command_info(&self, name: &str) -> Option<CommandInfo>;
    /// Invoke a command directly, bypassing command filters.
    fn call(&self, args: &[Bytes]) -> Reply;

    // Timers.
    fn set_timer(&self, delay: Duration, f: TimerCallback) -> TimerId;
    fn cancel_timer(&self, id: TimerId) -> bool;
    fn now_ms(&self) -> u64;

    // Process state.
    fn is_loading(&self) -> bool;
    fn is_master(&self) -> bool;
    /// Used memory over maxmemory; 0.0 when no limit is configured.
    fn memory_ratio(&self) -> f64;
    /// Propagate a command verbatim to replicas and the AOF.
    fn replicate(&self, command: &str, args: &[Bytes]);
}
