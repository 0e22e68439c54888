//! Command reader: executions triggered by `sluice.trigger <name>` or
//! by hooking an existing host command.

use bytes::Bytes;
use engine::{
    Engine, Error, ReaderInstance, ReaderNext, ReaderPlugin, Registration, StepCtx, TriggerArgs,
};
use fxhash::FxHashMap;
use hooks::{HookOutcome, HookRegistry};
use host::{CallContext, Reply};
use parking_lot::Mutex;
use record::Record;
use std::sync::{Arc, Weak};
use wire::{BufferReader, BufferWriter};

pub const COMMAND_READER: &str = "CommandReader";

/// Either a fresh trigger name or a hook over an existing command.
#[derive(Debug, Clone)]
pub enum CommandTriggerArgs {
    Trigger { name: String },
    Hook {
        command: String,
        prefix: Option<Bytes>,
    },
}

impl CommandTriggerArgs {
    pub fn trigger(name: &str) -> CommandTriggerArgs {
        CommandTriggerArgs::Trigger {
            name: name.to_string(),
        }
    }

    pub fn hook(command: &str, prefix: Option<Bytes>) -> CommandTriggerArgs {
        CommandTriggerArgs::Hook {
            command: command.to_string(),
            prefix,
        }
    }

    pub fn deserialize(r: &mut BufferReader<'_>, _encver: u32) -> Result<CommandTriggerArgs, Error> {
        Ok(match r.read_varu64()? {
            0 => CommandTriggerArgs::Trigger {
                name: r.read_str()?.to_string(),
            },
            1 => CommandTriggerArgs::Hook {
                command: r.read_str()?.to_string(),
                prefix: match r.read_varu64()? {
                    0 => None,
                    _ => Some(Bytes::copy_from_slice(r.read_bytes()?)),
                },
            },
            shape => return Err(Error::Malformed(format!("unknown command trigger shape {shape}"))),
        })
    }
}

impl TriggerArgs for CommandTriggerArgs {
    fn serialize(&self, w: &mut BufferWriter<'_>) -> Result<(), Error> {
        match self {
            CommandTriggerArgs::Trigger { name } => {
                w.write_varu64(0);
                w.write_str(name);
            }
            CommandTriggerArgs::Hook { command, prefix } => {
                w.write_varu64(1);
                w.write_str(command);
                match prefix {
                    Some(prefix) => {
                        w.write_varu64(1);
                        w.write_bytes(prefix);
                    }
                    None => w.write_varu64(0),
                }
            }
        }
        Ok(())
    }

    fn describe(&self) -> serde_json::Value {
        match self {
            CommandTriggerArgs::Trigger { name } => serde_json::json!({"trigger": name}),
            CommandTriggerArgs::Hook { command, prefix } => serde_json::json!({
                "hook": command,
                "keyPrefix": prefix.as_ref().map(|p| String::from_utf8_lossy(p).into_owned()),
            }),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Yields the invoking command's arguments as one list record.
pub struct CommandReaderInstance {
    args: Option<Vec<Bytes>>,
}

impl CommandReaderInstance {
    pub fn new(args: Vec<Bytes>) -> CommandReaderInstance {
        CommandReaderInstance { args: Some(args) }
    }
}

impl ReaderInstance for CommandReaderInstance {
    fn next(&mut self, _ctx: &mut StepCtx<'_>) -> ReaderNext {
        match self.args.take() {
            Some(args) => ReaderNext::Rec(Record::List(
                args.into_iter().map(Record::String).collect(),
            )),
            None => ReaderNext::Exhausted,
        }
    }

    fn serialize_args(&self, _engine: &Engine, w: &mut BufferWriter<'_>) -> Result<(), Error> {
        let args = self.args.as_deref().unwrap_or(&[]);
        w.write_varu64(args.len() as u64);
        for arg in args {
            w.write_bytes(arg);
        }
        Ok(())
    }
}

pub struct CommandReaderPlugin {
    hooks: Arc<HookRegistry>,
    triggers: Mutex<FxHashMap<String, Weak<Registration>>>,
}

impl CommandReaderPlugin {
    pub fn new(hooks: Arc<HookRegistry>) -> CommandReaderPlugin {
        CommandReaderPlugin {
            hooks,
            triggers: Mutex::new(FxHashMap::default()),
        }
    }

    /// `sluice.trigger <name> <args...>`: run the named registration,
    /// blocking the client until results are ready.
    pub fn trigger(&self, engine: &Engine, ctx: &mut CallContext) -> Reply {
        let Some(name) = ctx.arg_str(1).map(str::to_ascii_lowercase) else {
            return Reply::error("malformed trigger name");
        };
        let Some(registration) = self.triggers.lock().get(&name).and_then(Weak::upgrade) else {
            return Reply::error(format!("unknown trigger '{name}'"));
        };
        let reader = CommandReaderInstance::new(ctx.args[1..].to_vec());
        match ctx.block_client() {
            Some(client) => {
                let on_done: Vec<engine::execution::DoneCallback> =
                    vec![Box::new(move |_engine, ep| {
                        client.unblock(execution_reply(ep));
                    })];
                match registration.fire(engine, Box::new(reader), on_done) {
                    Ok(_) => Reply::Null, // answered on unblock
                    Err(err) => Reply::error(err.to_string()),
                }
            }
            None => match registration.fire(engine, Box::new(reader), Vec::new()) {
                Ok(ep) => Reply::bulk_str(ep.id_str()),
                Err(err) => Reply::error(err.to_string()),
            },
        }
    }
}

/// The reply of a finished triggered execution: its results, or the
/// first error as a client error.
fn execution_reply(ep: &Arc<engine::Execution>) -> Reply {
    match ep.outcome() {
        Some(outcome) => match outcome.errors.first() {
            Some(first) => first.reply(),
            None => Reply::Array(outcome.results.iter().map(Record::reply).collect()),
        },
        None => Reply::error("execution produced no outcome"),
    }
}

impl ReaderPlugin for CommandReaderPlugin {
    fn name(&self) -> &'static str {
        COMMAND_READER
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn instantiate(&self, _engine: &Engine, args: &[u8]) -> Result<Box<dyn ReaderInstance>, Error> {
        let mut r = BufferReader::new(args);
        let count = r.read_varu64()? as usize;
        let mut out = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            out.push(Bytes::copy_from_slice(r.read_bytes()?));
        }
        Ok(Box::new(CommandReaderInstance::new(out)))
    }

    fn register(&self, engine: &Engine, registration: &Arc<Registration>) -> Result<(), Error> {
        let args = registration
            .args
            .as_any()
            .downcast_ref::<CommandTriggerArgs>()
            .ok_or_else(|| {
                Error::Registration("command reader given foreign trigger args".into())
            })?
            .clone();

        match args {
            CommandTriggerArgs::Trigger { name } => {
                let name = name.to_ascii_lowercase();
                let mut triggers = self.triggers.lock();
                if triggers.get(&name).and_then(Weak::upgrade).is_some() {
                    return Err(Error::Registration(format!(
                        "trigger '{name}' already registered"
                    )));
                }
                triggers.insert(name.clone(), Arc::downgrade(registration));
                tracing::info!(trigger = %name, registration = %registration.id, "registered command trigger");
            }
            CommandTriggerArgs::Hook { command, prefix } => {
                let weak = Arc::downgrade(registration);
                let callback: hooks::HookFn = Arc::new(move |engine, ctx, _hook| {
                    let Some(registration) = weak.upgrade() else {
                        // Hook outlived its registration; behave as if
                        // unhooked.
                        return HookOutcome::Reply(engine.host().call(&ctx.args));
                    };
                    let reader = CommandReaderInstance::new(ctx.args.clone());
                    match ctx.block_client() {
                        Some(client) => {
                            let on_done: Vec<engine::execution::DoneCallback> =
                                vec![Box::new(move |_engine, ep| {
                                    client.unblock(execution_reply(ep));
                                })];
                            match registration.fire(engine, Box::new(reader), on_done) {
                                Ok(_) => HookOutcome::Blocked,
                                Err(err) => HookOutcome::Reply(Reply::error(err.to_string())),
                            }
                        }
                        None => match registration.fire(engine, Box::new(reader), Vec::new()) {
                            Ok(_) => HookOutcome::Reply(Reply::ok()),
                            Err(err) => HookOutcome::Reply(Reply::error(err.to_string())),
                        },
                    }
                });
                self.hooks
                    .register_hook(engine.host().as_ref(), &command, prefix, callback)
                    .map_err(|err| Error::Registration(err.to_string()))?;
                tracing::info!(command = %command, registration = %registration.id, "registered command hook");
            }
        }
        Ok(())
    }

    fn unregister(&self, _engine: &Engine, registration: &Arc<Registration>) {
        if let Some(CommandTriggerArgs::Trigger { name }) = registration
            .args
            .as_any()
            .downcast_ref::<CommandTriggerArgs>()
            .cloned()
        {
            self.triggers.lock().remove(&name.to_ascii_lowercase());
        }
    }

    fn deserialize_trigger_args(
        &self,
        r: &mut BufferReader<'_>,
        encver: u32,
    ) -> Result<Arc<dyn TriggerArgs>, Error> {
        Ok(Arc::new(CommandTriggerArgs::deserialize(r, encver)?))
    }

    fn supports_rdb(&self) -> bool {
        true
    }
}
