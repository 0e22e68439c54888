use crate::Host;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// Each LockHandler gets a process-unique token so that one thread may
// interleave acquisitions against several hosts (the loopback test
// cluster does exactly that) without the counters bleeding together.
static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static LOCK_COUNTS: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

/// Counted, per-thread re-entrant acquisition of the host's global
/// execution lock. Nested acquisitions on one thread are cheap; the raw
/// lock is taken on the 0 -> 1 edge and released on the 1 -> 0 edge.
/// Every acquisition is scoped: the guard releases on all paths.
#[derive(Clone)]
pub struct LockHandler {
    host: Arc<dyn Host>,
    token: usize,
}

impl LockHandler {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn acquire(&self) -> LockGuard<'_> {
        let first = LOCK_COUNTS.with(|c| {
            let mut counts = c.borrow_mut();
            let count = counts.entry(self.token).or_insert(0);
            *count += 1;
            *count == 1
        });
        if first {
            self.host.raw_lock();
        }
        LockGuard { handler: self }
    }

    /// Whether the calling thread currently holds this lock.
    pub fn is_held(&self) -> bool {
        LOCK_COUNTS.with(|c| c.borrow().get(&self.token).copied().unwrap_or(0) > 0)
    }

    /// Run `f` with this thread's hold fully released, re-acquiring to
    /// the same depth afterwards. Long blocking user callbacks use this
    /// so the rest of the store keeps making progress.
    pub fn unlocked<R>(&self, f: impl FnOnce() -> R) -> R {
        let depth = LOCK_COUNTS.with(|c| {
            let mut counts = c.borrow_mut();
            counts.remove(&self.token).unwrap_or(0)
        });
        if depth > 0 {
            self.host.raw_unlock();
        }
        let out = f();
        if depth > 0 {
            self.host.raw_lock();
            LOCK_COUNTS.with(|c| {
                c.borrow_mut().insert(self.token, depth);
            });
        }
        out
    }
}

impl std::fmt::Debug for LockHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandler").field("token", &self.token).finish()
    }
}

pub struct LockGuard<'a> {
    handler: &'a LockHandler,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let last = LOCK_COUNTS.with(|c| {
            let mut counts = c.borrow_mut();
            let count = counts
                .get_mut(&self.handler.token)
                .expect("lock released without acquisition");
            *count -= 1;
            *count == 0
        });
        if last {
            self.handler.host.raw_unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CommandInfo, HostError, HostTopology, KeyHandle, Reply, ShardId, StreamEntry,
        StreamEntryId, TimerId,
    };
    use bytes::Bytes;
    use std::sync::atomic::AtomicI64;

    // A host that only counts raw lock edges.
    #[derive(Default)]
    struct EdgeHost {
        edges: AtomicI64,
    }

    impl Host for EdgeHost {
        fn raw_lock(&self) {
            self.edges.fetch_add(1, Ordering::SeqCst);
        }
        fn raw_unlock(&self) {
            self.edges.fetch_sub(1, Ordering::SeqCst);
        }
        fn scan_keys(&self, _: u64) -> (u64, Vec<Bytes>) {
            (0, Vec::new())
        }
        fn open_key(&self, _: &[u8]) -> Option<KeyHandle> {
            None
        }
        fn set_string_key(&self, _: &[u8], _: Bytes) -> Result<(), HostError> {
            Ok(())
        }
        fn delete_key(&self, _: &[u8]) -> Result<bool, HostError> {
            Ok(false)
        }
        fn stream_create_group(
            &self,
            _: &[u8],
            _: &str,
            _: StreamEntryId,
        ) -> Result<(), HostError> {
            Ok(())
        }
        fn stream_read_group(
            &self,
            _: &[u8],
            _: &str,
            _: &str,
            _: usize,
        ) -> Result<Vec<StreamEntry>, HostError> {
            Ok(Vec::new())
        }
        fn stream_ack(&self, _: &[u8], _: &str, _: &[StreamEntryId]) -> Result<u64, HostError> {
            Ok(0)
        }
        fn stream_trim_acked(&self, _: &[u8], _: StreamEntryId) -> Result<u64, HostError> {
            Ok(0)
        }
        fn stream_len(&self, _: &[u8]) -> Result<u64, HostError> {
            Ok(0)
        }
        fn topology(&self) -> HostTopology {
            HostTopology::default()
        }
        fn send_to_shard(&self, _: &ShardId, _: &str, _: &[Bytes]) -> Result<(), HostError> {
            Ok(())
        }
        fn subscribe_keyspace(&self, _: crate::KeyspaceCallback) {}
        fn register_command_filter(&self, _: crate::CommandFilterFn) {}
        fn command_info(&self, _: &str) -> Option<CommandInfo> {
            None
        }
        fn call(&self, _: &[Bytes]) -> Reply {
            Reply::Null
        }
        fn set_timer(&self, _: std::time::Duration, _: crate::TimerCallback) -> TimerId {
            TimerId(0)
        }
        fn cancel_timer(&self, _: TimerId) -> bool {
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
        fn replicate(&self, _: &str, _: &[Bytes]) {}
    }

    #[test]
    fn nested_acquisitions_balance() {
        let host = Arc::new(EdgeHost::default());
        let handler = LockHandler::new(host.clone());

        assert!(!handler.is_held());
        {
            let _outer = handler.acquire();
            assert_eq!(host.edges.load(Ordering::SeqCst), 1);
            {
                let _inner = handler.acquire();
                // Nested acquisition must not re-take the raw lock.
                assert_eq!(host.edges.load(Ordering::SeqCst), 1);
            }
            assert!(handler.is_held());
            assert_eq!(host.edges.load(Ordering::SeqCst), 1);
        }
        assert!(!handler.is_held());
        assert_eq!(host.edges.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn two_handlers_do_not_share_counts() {
        let host = Arc::new(EdgeHost::default());
        let a = LockHandler::new(host.clone());
        let b = LockHandler::new(host.clone());

        let _ga = a.acquire();
        assert!(!b.is_held());
        let _gb = b.acquire();
        assert_eq!(host.edges.load(Ordering::SeqCst), 2);
    }
}
