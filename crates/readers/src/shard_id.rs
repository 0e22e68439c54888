//! Shard-id reader: every participating shard emits its own id. The
//! canonical way to fan one record out per shard.

use engine::{Engine, Error, ReaderInstance, ReaderNext, ReaderPlugin, StepCtx};
use record::Record;
use wire::BufferWriter;

pub const SHARD_ID_READER: &str = "ShardIDReader";

pub struct ShardIdReaderInstance {
    emitted: bool,
}

impl ReaderInstance for ShardIdReaderInstance {
    fn next(&mut self, ctx: &mut StepCtx<'_>) -> ReaderNext {
        if self.emitted {
            return ReaderNext::Exhausted;
        }
        self.emitted = true;
        ReaderNext::Rec(Record::string_from(ctx.view().my_id().as_str()))
    }

    fn serialize_args(&self, _engine: &Engine, _w: &mut BufferWriter<'_>) -> Result<(), Error> {
        Ok(())
    }
}

pub struct ShardIdReaderPlugin;

impl ReaderPlugin for ShardIdReaderPlugin {
    fn name(&self) -> &'static str {
        SHARD_ID_READER
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn instantiate(
        &self,
        _engine: &Engine,
        _args: &[u8],
    ) -> Result<Box<dyn ReaderInstance>, Error> {
        Ok(Box::new(ShardIdReaderInstance { emitted: false }))
    }
}
