//! Loopback cluster bus: N in-memory shards joined by a delivery
//! thread, mirroring the host's asynchronous point-to-point messaging.

use crate::MemHost;
use bytes::Bytes;
use fxhash::FxHashMap;
use host::{Host, HostError, HostTopology, ShardId, SlotRange};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Delivery {
    target: ShardId,
    argv: Vec<Bytes>,
}

struct BusInner {
    queue: Mutex<VecDeque<Delivery>>,
    cond: Condvar,
    hosts: Mutex<FxHashMap<ShardId, MemHost>>,
    stop: AtomicBool,
}

/// Asynchronous message transport between [`MemHost`]s. Deliveries run
/// on a dedicated thread, as the real bus would.
#[derive(Clone)]
pub struct MemBus {
    inner: Arc<BusInner>,
}

impl MemBus {
    pub fn start() -> MemBus {
        let bus = MemBus {
            inner: Arc::new(BusInner {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                hosts: Mutex::new(FxHashMap::default()),
                stop: AtomicBool::new(false),
            }),
        };
        let inner = bus.inner.clone();
        std::thread::Builder::new()
            .name("mem-bus".to_string())
            .spawn(move || loop {
                let delivery = {
                    let mut queue = inner.queue.lock();
                    while queue.is_empty() {
                        if inner.stop.load(Ordering::SeqCst) {
                            return;
                        }
                        inner.cond.wait_for(&mut queue, Duration::from_millis(20));
                    }
                    queue.pop_front()
                };
                let Some(delivery) = delivery else { continue };
                let host = inner.hosts.lock().get(&delivery.target).cloned();
                match host {
                    // Delivered messages run the target's module
                    // command, exactly like remote bus traffic.
                    Some(host) => {
                        let _ = host.call(&delivery.argv);
                    }
                    None => tracing::warn!(target = %delivery.target, "message to unknown shard"),
                }
            })
            .expect("spawning bus thread");
        bus
    }

    pub(crate) fn add_host(&self, host: MemHost) {
        self.inner.hosts.lock().insert(host.id(), host);
    }

    pub fn send(&self, target: ShardId, command: &str, args: &[Bytes]) -> Result<(), HostError> {
        if !self.inner.hosts.lock().contains_key(&target) {
            return Err(HostError::UnknownShard(target));
        }
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(Bytes::copy_from_slice(command.as_bytes()));
        argv.extend_from_slice(args);
        self.inner.queue.lock().push_back(Delivery { target, argv });
        self.inner.cond.notify_one();
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }

    /// True when no deliveries are waiting.
    pub fn is_idle(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }
}

/// N shards with an evenly split slot space, joined by one bus.
pub struct MemCluster {
    hosts: Vec<MemHost>,
    bus: MemBus,
}

impl MemCluster {
    pub fn new(size: usize) -> MemCluster {
        assert!(size >= 1);
        let ids: Vec<ShardId> = (0..size)
            .map(|i| ShardId::of(&format!("shard-{}", (b'a' + i as u8) as char)))
            .collect();

        let slots = cluster::SLOT_COUNT as u16;
        let per_shard = slots / size as u16;
        let slot_ranges: Vec<SlotRange> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| SlotRange {
                start: i as u16 * per_shard,
                end: if i == size - 1 {
                    slots - 1
                } else {
                    (i as u16 + 1) * per_shard - 1
                },
                shard: *id,
            })
            .collect();

        let bus = MemBus::start();
        let hosts: Vec<MemHost> = ids
            .iter()
            .map(|id| {
                let host = MemHost::new(*id);
                host.set_topology(HostTopology {
                    cluster_mode: size > 1,
                    my_id: Some(*id),
                    shards: ids.clone(),
                    slot_ranges: slot_ranges.clone(),
                });
                host.join_bus(&bus);
                host
            })
            .collect();

        MemCluster { hosts, bus }
    }

    pub fn size(&self) -> usize {
        self.hosts.len()
    }

    pub fn host(&self, index: usize) -> &MemHost {
        &self.hosts[index]
    }

    pub fn hosts(&self) -> &[MemHost] {
        &self.hosts
    }

    pub fn bus(&self) -> &MemBus {
        &self.bus
    }

    /// The shard owning `key` under the cluster's slot split.
    pub fn owner_of(&self, key: &[u8]) -> usize {
        let slot = cluster::key_hash_slot(key);
        let per_shard = (cluster::SLOT_COUNT / self.hosts.len()) as u16;
        ((slot / per_shard) as usize).min(self.hosts.len() - 1)
    }
}

impl Drop for MemCluster {
    fn drop(&mut self) {
        self.bus.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host::Host as _;

    #[test]
    fn cluster_splits_all_slots() {
        let cluster = MemCluster::new(3);
        let topology = cluster.host(0).topology();
        assert_eq!(topology.shards.len(), 3);
        assert_eq!(topology.slot_ranges.first().unwrap().start, 0);
        assert_eq!(
            topology.slot_ranges.last().unwrap().end,
            cluster::SLOT_COUNT as u16 - 1
        );
    }

    #[test]
    fn bus_delivers_to_named_shard() {
        let cluster = MemCluster::new(2);
        let target = cluster.host(1).id();
        // An unknown command still routes and answers on the target.
        cluster
            .bus()
            .send(target, "set", &[Bytes::from_static(b"k"), Bytes::from_static(b"v")])
            .unwrap();
        assert!(crate::wait_until(Duration::from_secs(1), || {
            matches!(
                cluster.host(1).execute(&["get", "k"]),
                host::Reply::Bulk(ref b) if b.as_ref() == b"v"
            )
        }));
    }
}
