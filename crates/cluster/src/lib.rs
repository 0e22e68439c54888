//! Cached snapshot of the host cluster used for routing.
//!
//! The engine never queries the host's topology on the hot path: a
//! [`ClusterView`] is rebuilt on demand (`refreshcluster`, admin
//! topology sync, role transitions) and shared behind an `Arc`. Every
//! shard derives the same key -> shard mapping from the same view, which
//! is what makes repartition routing agree cluster-wide.

use host::{Host, HostTopology, ShardId, SlotRange};
use std::sync::Arc;

mod slots;
pub use slots::{key_hash_slot, SLOT_COUNT};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shard {0} does not serve any slots in the supplied topology")]
    EmptyShard(ShardId),
    #[error("slot {0} is not covered by the supplied topology")]
    UncoveredSlot(u16),
    #[error("topology does not name this shard's own id")]
    MissingSelf,
}

/// An immutable snapshot of cluster membership: the local shard id, all
/// shard ids, and the slot -> shard table.
#[derive(Debug, Clone)]
pub struct ClusterView {
    my_id: ShardId,
    shards: Vec<ShardId>,
    // Indexes into `shards`, one entry per slot; u16::MAX when uncovered.
    slots: Arc<[u16]>,
    cluster_mode: bool,
}

impl ClusterView {
    /// A single-shard view for non-cluster deployments.
    pub fn standalone(my_id: ShardId) -> ClusterView {
        ClusterView {
            my_id,
            shards: vec![my_id],
            slots: vec![0u16; SLOT_COUNT].into(),
            cluster_mode: false,
        }
    }

    /// Rebuild from the host's reported topology.
    pub fn refresh(host: &dyn Host) -> ClusterView {
        let HostTopology {
            cluster_mode,
            my_id,
            shards,
            slot_ranges,
        } = host.topology();

        let my_id = my_id.unwrap_or_else(|| ShardId::of("standalone"));
        if !cluster_mode || shards.len() <= 1 {
            return ClusterView::standalone(my_id);
        }

        match ClusterView::from_parts(my_id, shards, &slot_ranges) {
            Ok(view) => view,
            Err(err) => {
                tracing::warn!(%err, "host topology is incomplete, falling back to standalone");
                ClusterView::standalone(my_id)
            }
        }
    }

    /// Build a view from explicit parts (admin topology sync).
    pub fn from_parts(
        my_id: ShardId,
        shards: Vec<ShardId>,
        ranges: &[SlotRange],
    ) -> Result<ClusterView, Error> {
        if !shards.contains(&my_id) {
            return Err(Error::MissingSelf);
        }
        let mut slots = vec![u16::MAX; SLOT_COUNT];
        for range in ranges {
            let owner = shards
                .iter()
                .position(|s| *s == range.shard)
                .ok_or(Error::EmptyShard(range.shard))? as u16;
            for slot in range.start..=range.end.min(SLOT_COUNT as u16 - 1) {
                slots[slot as usize] = owner;
            }
        }
        if let Some(slot) = slots.iter().position(|s| *s == u16::MAX) {
            return Err(Error::UncoveredSlot(slot as u16));
        }
        Ok(ClusterView {
            my_id,
            shards,
            slots: slots.into(),
            cluster_mode: true,
        })
    }

    pub fn my_id(&self) -> &ShardId {
        &self.my_id
    }

    pub fn size(&self) -> usize {
        self.shards.len()
    }

    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    pub fn peers(&self) -> impl Iterator<Item = &ShardId> {
        self.shards.iter().filter(move |s| **s != self.my_id)
    }

    /// Whether distributed executions are meaningful under this view.
    pub fn is_cluster_mode(&self) -> bool {
        self.cluster_mode && self.shards.len() > 1
    }

    pub fn shard_for_slot(&self, slot: u16) -> &ShardId {
        &self.shards[self.slots[slot as usize] as usize]
    }

    /// The shard owning `key` under this view.
    pub fn shard_for_key(&self, key: &[u8]) -> &ShardId {
        self.shard_for_slot(key_hash_slot(key))
    }

    pub fn key_is_local(&self, key: &[u8]) -> bool {
        !self.is_cluster_mode() || *self.shard_for_key(key) == self.my_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_shard_view(me: &str) -> ClusterView {
        let a = ShardId::of("shard-a");
        let b = ShardId::of("shard-b");
        let c = ShardId::of("shard-c");
        ClusterView::from_parts(
            ShardId::of(me),
            vec![a, b, c],
            &[
                SlotRange { start: 0, end: 5460, shard: a },
                SlotRange { start: 5461, end: 10922, shard: b },
                SlotRange { start: 10923, end: 16383, shard: c },
            ],
        )
        .unwrap()
    }

    #[test]
    fn shards_agree_on_key_ownership() {
        let views = [
            three_shard_view("shard-a"),
            three_shard_view("shard-b"),
            three_shard_view("shard-c"),
        ];
        for key in [&b"user:1"[..], b"user:2", b"{tag}k1", b"{tag}k2", b""] {
            let owners: Vec<_> = views.iter().map(|v| *v.shard_for_key(key)).collect();
            assert_eq!(owners[0], owners[1]);
            assert_eq!(owners[1], owners[2]);
        }
    }

    #[test]
    fn uncovered_slots_are_rejected() {
        let a = ShardId::of("shard-a");
        let err = ClusterView::from_parts(
            a,
            vec![a],
            &[SlotRange { start: 0, end: 100, shard: a }],
        )
        .unwrap_err();
        assert!(matches!(err, Error::UncoveredSlot(101)));
    }

    #[test]
    fn standalone_owns_everything() {
        let view = ClusterView::standalone(ShardId::of("only"));
        assert!(!view.is_cluster_mode());
        assert!(view.key_is_local(b"anything"));
        assert_eq!(view.peers().count(), 0);
    }
}
