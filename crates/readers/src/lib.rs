//! The pluggable record sources: scan-based keys reader, stream
//! reader, command reader, and shard-id reader, together with their
//! event registrations and persistence hooks.

use engine::Engine;
use hooks::HookRegistry;
use std::sync::Arc;

pub mod command;
pub mod keys;
pub mod shard_id;
pub mod stream;

pub use command::{CommandReaderPlugin, CommandTriggerArgs, COMMAND_READER};
pub use keys::{KeysReaderPlugin, KeysTriggerArgs, KEYS_READER};
pub use shard_id::{ShardIdReaderPlugin, SHARD_ID_READER};
pub use stream::{FailurePolicy, StreamReaderPlugin, StreamTriggerArgs, CONSUMER_GROUP, STREAM_READER};

/// Register the four built-in readers. `hooks` backs the command
/// reader's hook registrations and the keys reader's hook-commands.
pub fn register_all(engine: &Engine, hooks: &Arc<HookRegistry>) {
    let mgmt = engine.mgmt();
    mgmt.readers
        .add(KEYS_READER, Arc::new(KeysReaderPlugin::new(hooks.clone())), None);
    mgmt.readers
        .add(STREAM_READER, Arc::new(StreamReaderPlugin::new()), None);
    mgmt.readers.add(
        COMMAND_READER,
        Arc::new(CommandReaderPlugin::new(hooks.clone())),
        None,
    );
    mgmt.readers
        .add(SHARD_ID_READER, Arc::new(ShardIdReaderPlugin), None);
}

/// Simple glob over bytes: `*` matches any run, `?` one byte.
pub(crate) fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(c), Some(d)) if c == d => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_basics() {
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"s*", b"s1"));
        assert!(!glob_match(b"s*", b"x1"));
        assert!(glob_match(b"user:?", b"user:7"));
        assert!(!glob_match(b"user:?", b"user:77"));
        assert!(glob_match(b"a*c", b"abbbc"));
    }
}
