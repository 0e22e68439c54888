/// Width of a shard identifier, matching the host's fixed-width cluster
/// node ids.
pub const SHARD_ID_LEN: usize = 40;

/// A single node in the host cluster. Ids are fixed-width printable
/// ASCII; short names are right-padded with '0' for test ergonomics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId([u8; SHARD_ID_LEN]);

impl ShardId {
    /// Build an id from up to `SHARD_ID_LEN` printable bytes, padding
    /// the remainder with '0'.
    pub fn of(name: &str) -> ShardId {
        let bytes = name.as_bytes();
        assert!(
            bytes.len() <= SHARD_ID_LEN && bytes.iter().all(|b| b.is_ascii_graphic()),
            "shard id must be at most {SHARD_ID_LEN} printable bytes"
        );
        let mut id = [b'0'; SHARD_ID_LEN];
        id[..bytes.len()].copy_from_slice(bytes);
        ShardId(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<ShardId> {
        if bytes.len() != SHARD_ID_LEN || !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return None;
        }
        let mut id = [0u8; SHARD_ID_LEN];
        id.copy_from_slice(bytes);
        Some(ShardId(id))
    }

    pub fn as_bytes(&self) -> &[u8; SHARD_ID_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Construction guarantees printable ASCII.
        std::str::from_utf8(&self.0).expect("shard id is ASCII")
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShardId({})", self.as_str())
    }
}

impl std::str::FromStr for ShardId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShardId::from_bytes(s.as_bytes())
            .ok_or_else(|| format!("malformed shard id '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_construction_round_trips() {
        let id = ShardId::of("node-a");
        assert_eq!(id.as_str().len(), SHARD_ID_LEN);
        assert!(id.as_str().starts_with("node-a"));
        assert_eq!(id.as_str().parse::<ShardId>().unwrap(), id);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(ShardId::from_bytes(b"short").is_none());
        assert!("x".parse::<ShardId>().is_err());
    }
}
