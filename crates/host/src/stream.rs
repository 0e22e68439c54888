use bytes::Bytes;

/// A stream entry id: milliseconds timestamp plus a per-millisecond
/// sequence number, ordered lexicographically as `(ms, seq)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamEntryId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamEntryId {
    pub const ZERO: StreamEntryId = StreamEntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    pub fn next(&self) -> StreamEntryId {
        match self.seq.checked_add(1) {
            Some(seq) => StreamEntryId { ms: self.ms, seq },
            None => StreamEntryId {
                ms: self.ms + 1,
                seq: 0,
            },
        }
    }
}

impl std::fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl std::str::FromStr for StreamEntryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| format!("malformed stream id '{s}'"))?;
        Ok(StreamEntryId {
            ms: ms.parse().map_err(|_| format!("malformed stream id '{s}'"))?,
            seq: seq
                .parse()
                .map_err(|_| format!("malformed stream id '{s}'"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamEntryId,
    pub fields: Vec<(Bytes, Bytes)>,
}
