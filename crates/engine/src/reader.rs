//! Reader plugin contracts.
//!
//! A reader plugin is a named factory: it creates reader instances
//! (the pull source at the tail of every pipeline), reconstructs them
//! from serialized arguments when an execution is mirrored onto other
//! shards, and optionally supports event registration and RDB
//! persistence of its registrations.

use crate::registration::{Registration, TriggerArgs};
use crate::step::StepCtx;
use crate::{Engine, Error};
use record::Record;
use std::sync::Arc;
use wire::{BufferReader, BufferWriter};

/// Outcome of one reader pull.
pub enum ReaderNext {
    Rec(Record),
    /// The source is drained; the pipeline may complete.
    Exhausted,
    /// Nothing available right now; the execution parks without an
    /// idle timer and resumes on the reader's own notification.
    Wait,
}

/// A live pull source. Exactly one execution drives an instance.
pub trait ReaderInstance: Send {
    fn next(&mut self, ctx: &mut StepCtx<'_>) -> ReaderNext;

    /// Serialize the arguments a peer shard needs to reconstruct this
    /// reader for the mirrored execution.
    fn serialize_args(&self, engine: &Engine, w: &mut BufferWriter<'_>) -> Result<(), Error>;
}

/// A pluggable source kind. `instantiate` and `serialize`/`deserialize`
/// are mandatory; registration and RDB persistence are opt-in.
pub trait ReaderPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Downcast support for reader-specific command paths
    /// (`trigger`, hook dispatch).
    fn as_any(&self) -> &dyn std::any::Any;

    /// Build an instance from serialized arguments (the inverse of
    /// [`ReaderInstance::serialize_args`]).
    fn instantiate(&self, engine: &Engine, args: &[u8]) -> Result<Box<dyn ReaderInstance>, Error>;

    /// Wire a registration's trigger source (key-space events, stream
    /// scans, command table). Readers that cannot be registered keep
    /// the default.
    fn register(&self, _engine: &Engine, _registration: &Arc<Registration>) -> Result<(), Error> {
        Err(Error::Registration(format!(
            "reader '{}' does not support registration",
            self.name()
        )))
    }

    /// Tear down whatever `register` wired.
    fn unregister(&self, _engine: &Engine, _registration: &Arc<Registration>) {}

    /// Reconstruct trigger arguments from a persisted registration.
    fn deserialize_trigger_args(
        &self,
        _r: &mut BufferReader<'_>,
        _encver: u32,
    ) -> Result<Arc<dyn TriggerArgs>, Error> {
        Err(Error::Registration(format!(
            "reader '{}' does not persist registrations",
            self.name()
        )))
    }

    /// Whether this reader's registrations ride the RDB aux payload.
    fn supports_rdb(&self) -> bool {
        false
    }
}
