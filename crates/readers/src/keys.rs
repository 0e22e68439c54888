//! Scan-based keys reader and its key-space event registrations.

use crate::glob_match;
use bytes::Bytes;
use engine::{
    Engine, Error, ReaderInstance, ReaderNext, ReaderPlugin, Registration, StepCtx, TriggerArgs,
};
use hooks::{HookOutcome, HookRegistry};
use host::{KeyType, KeyspaceEvent, Reply};
use record::Record;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use wire::{BufferReader, BufferWriter};

pub const KEYS_READER: &str = "KeysReader";

/// Arguments of a one-shot (scan) run.
#[derive(Debug, Clone)]
struct ScanArgs {
    pattern: Bytes,
    read_value: bool,
    /// Name of a registered keys-reader-read-record override.
    read_record: Option<String>,
}

impl ScanArgs {
    fn serialize(&self, w: &mut BufferWriter<'_>) {
        w.write_varu64(0); // scan shape
        w.write_bytes(&self.pattern);
        w.write_varu64(self.read_value as u64);
        w.write_str(self.read_record.as_deref().unwrap_or(""));
    }

    fn deserialize(r: &mut BufferReader<'_>) -> Result<ScanArgs, Error> {
        Ok(ScanArgs {
            pattern: Bytes::copy_from_slice(r.read_bytes()?),
            read_value: r.read_varu64()? != 0,
            read_record: match r.read_str()? {
                "" => None,
                name => Some(name.to_string()),
            },
        })
    }
}

/// The lazy, finite, non-restartable key sequence. The scan cursor is
/// internal state opaque to consumers.
enum Source {
    Scan {
        args: ScanArgs,
        cursor: u64,
        batch: VecDeque<Bytes>,
        done: bool,
    },
    /// A single key touched by a key-space event.
    Event {
        key: Bytes,
        event: String,
        read_value: bool,
        emitted: bool,
    },
}

pub struct KeysReaderInstance {
    source: Source,
}

impl KeysReaderInstance {
    pub fn scan(pattern: impl Into<Bytes>, read_value: bool) -> KeysReaderInstance {
        KeysReaderInstance {
            source: Source::Scan {
                args: ScanArgs {
                    pattern: pattern.into(),
                    read_value,
                    read_record: None,
                },
                cursor: 0,
                batch: VecDeque::new(),
                done: false,
            },
        }
    }

    pub fn for_event(key: Bytes, event: String, read_value: bool) -> KeysReaderInstance {
        KeysReaderInstance {
            source: Source::Event {
                key,
                event,
                read_value,
                emitted: false,
            },
        }
    }

    fn read_key(ctx: &mut StepCtx<'_>, key: &[u8], read_record: Option<&str>) -> Record {
        let host = ctx.engine().host().clone();
        let Some(handle) = host.open_key(key) else {
            return Record::key(Bytes::copy_from_slice(key), None);
        };
        if let Some(name) = read_record {
            // Registered override decides how the key materializes.
            if let Some(entry) = ctx.engine().mgmt().key_readers.get(name) {
                return match (entry.callback)(ctx, &handle) {
                    Ok(record) => record,
                    Err(err) => Record::error_from(format!("{err:#}")),
                };
            }
            tracing::warn!(name, "keys-reader read-record override is not registered");
        }
        let value = handle.0.value().map(Record::from);
        Record::key(Bytes::copy_from_slice(key), value)
    }
}

impl ReaderInstance for KeysReaderInstance {
    fn next(&mut self, ctx: &mut StepCtx<'_>) -> ReaderNext {
        match &mut self.source {
            Source::Scan {
                args,
                cursor,
                batch,
                done,
            } => loop {
                if let Some(key) = batch.pop_front() {
                    if !glob_match(&args.pattern, &key) {
                        continue;
                    }
                    // In cluster mode every shard scans only its own
                    // key space; foreign keys are skipped defensively.
                    if !ctx.view().key_is_local(&key) {
                        continue;
                    }
                    if !args.read_value {
                        return ReaderNext::Rec(Record::String(key));
                    }
                    return ReaderNext::Rec(Self::read_key(ctx, &key, args.read_record.as_deref()));
                }
                if *done {
                    return ReaderNext::Exhausted;
                }
                let (next_cursor, keys) = ctx.engine().host().scan_keys(*cursor);
                *cursor = next_cursor;
                if next_cursor == 0 {
                    *done = true;
                }
                batch.extend(keys);
                if batch.is_empty() && *done {
                    return ReaderNext::Exhausted;
                }
            },
            Source::Event {
                key,
                event,
                read_value,
                emitted,
            } => {
                if *emitted {
                    return ReaderNext::Exhausted;
                }
                *emitted = true;
                if !*read_value {
                    return ReaderNext::Rec(Record::String(key.clone()));
                }
                let mut record = Self::read_key(ctx, key, None);
                // Deleted keys still notify; the event name says why.
                if event == "del" || event == "expired" {
                    record = Record::key(key.clone(), None);
                }
                ReaderNext::Rec(record)
            }
        }
    }

    fn serialize_args(&self, _engine: &Engine, w: &mut BufferWriter<'_>) -> Result<(), Error> {
        match &self.source {
            Source::Scan { args, .. } => args.serialize(w),
            Source::Event {
                key,
                event,
                read_value,
                ..
            } => {
                w.write_varu64(1); // event shape
                w.write_bytes(key);
                w.write_str(event);
                w.write_varu64(*read_value as u64);
            }
        }
        Ok(())
    }
}

/// Trigger arguments of a key-space registration.
#[derive(Debug, Clone)]
pub struct KeysTriggerArgs {
    pub prefix: Bytes,
    /// Event names to react to; empty means all.
    pub event_types: Vec<String>,
    /// Key types to react to; empty means all.
    pub key_types: Vec<KeyType>,
    pub read_value: bool,
    /// Commands additionally routed through the command-hook layer.
    pub hook_commands: Vec<String>,
}

impl KeysTriggerArgs {
    pub fn prefix(prefix: impl Into<Bytes>) -> KeysTriggerArgs {
        KeysTriggerArgs {
            prefix: prefix.into(),
            event_types: Vec::new(),
            key_types: Vec::new(),
            read_value: true,
            hook_commands: Vec::new(),
        }
    }

    fn matches(&self, engine: &Engine, event: &KeyspaceEvent) -> bool {
        if !event.key.starts_with(&self.prefix) {
            return false;
        }
        if !self.event_types.is_empty()
            && !self.event_types.iter().any(|e| e.eq_ignore_ascii_case(&event.event))
        {
            return false;
        }
        if !self.key_types.is_empty() {
            let Some(handle) = engine.host().open_key(&event.key) else {
                return false;
            };
            if !self.key_types.contains(&handle.0.key_type()) {
                return false;
            }
        }
        true
    }

    pub fn deserialize(r: &mut BufferReader<'_>, _encver: u32) -> Result<KeysTriggerArgs, Error> {
        let prefix = Bytes::copy_from_slice(r.read_bytes()?);
        let mut event_types = Vec::new();
        for _ in 0..r.read_varu64()? {
            event_types.push(r.read_str()?.to_string());
        }
        let mut key_types = Vec::new();
        for _ in 0..r.read_varu64()? {
            key_types.push(match r.read_varu64()? {
                0 => KeyType::String,
                1 => KeyType::List,
                2 => KeyType::Hash,
                3 => KeyType::Set,
                4 => KeyType::Stream,
                _ => KeyType::Module,
            });
        }
        let read_value = r.read_varu64()? != 0;
        let mut hook_commands = Vec::new();
        for _ in 0..r.read_varu64()? {
            hook_commands.push(r.read_str()?.to_string());
        }
        Ok(KeysTriggerArgs {
            prefix,
            event_types,
            key_types,
            read_value,
            hook_commands,
        })
    }
}

impl TriggerArgs for KeysTriggerArgs {
    fn serialize(&self, w: &mut BufferWriter<'_>) -> Result<(), Error> {
        w.write_bytes(&self.prefix);
        w.write_varu64(self.event_types.len() as u64);
        for event in &self.event_types {
            w.write_str(event);
        }
        w.write_varu64(self.key_types.len() as u64);
        for kt in &self.key_types {
            w.write_varu64(match kt {
                KeyType::String => 0,
                KeyType::List => 1,
                KeyType::Hash => 2,
                KeyType::Set => 3,
                KeyType::Stream => 4,
                KeyType::Module => 5,
            });
        }
        w.write_varu64(self.read_value as u64);
        w.write_varu64(self.hook_commands.len() as u64);
        for cmd in &self.hook_commands {
            w.write_str(cmd);
        }
        Ok(())
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "prefix": String::from_utf8_lossy(&self.prefix),
            "eventTypes": self.event_types,
            "keyTypes": self.key_types.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "readValue": self.read_value,
            "hookCommands": self.hook_commands,
        })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct KeysReaderPlugin {
    hooks: Arc<HookRegistry>,
}

impl KeysReaderPlugin {
    pub fn new(hooks: Arc<HookRegistry>) -> KeysReaderPlugin {
        KeysReaderPlugin { hooks }
    }

    fn fire_event(
        engine: &Engine,
        registration: &Arc<Registration>,
        args: &KeysTriggerArgs,
        event: &KeyspaceEvent,
    ) {
        let reader = KeysReaderInstance::for_event(
            event.key.clone(),
            event.event.clone(),
            args.read_value,
        );
        if let Err(err) = registration.fire(engine, Box::new(reader), Vec::new()) {
            tracing::debug!(registration = %registration.id, %err, "key-space trigger skipped");
        }
    }
}

impl ReaderPlugin for KeysReaderPlugin {
    fn name(&self) -> &'static str {
        KEYS_READER
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn instantiate(&self, _engine: &Engine, args: &[u8]) -> Result<Box<dyn ReaderInstance>, Error> {
        if args.is_empty() {
            return Ok(Box::new(KeysReaderInstance::scan(
                Bytes::from_static(b"*"),
                true,
            )));
        }
        let mut r = BufferReader::new(args);
        match r.read_varu64()? {
            0 => {
                let args = ScanArgs::deserialize(&mut r)?;
                Ok(Box::new(KeysReaderInstance {
                    source: Source::Scan {
                        args,
                        cursor: 0,
                        batch: VecDeque::new(),
                        done: false,
                    },
                }))
            }
            1 => {
                let key = Bytes::copy_from_slice(r.read_bytes()?);
                let event = r.read_str()?.to_string();
                let read_value = r.read_varu64()? != 0;
                Ok(Box::new(KeysReaderInstance::for_event(key, event, read_value)))
            }
            shape => Err(Error::Malformed(format!("unknown keys reader shape {shape}"))),
        }
    }

    fn register(&self, engine: &Engine, registration: &Arc<Registration>) -> Result<(), Error> {
        let args = registration
            .args
            .as_any()
            .downcast_ref::<KeysTriggerArgs>()
            .ok_or_else(|| Error::Registration("keys reader given foreign trigger args".into()))?
            .clone();

        // Key-space subscription: the closure holds a weak handle so an
        // unregistered registration goes inert.
        let weak: Weak<Registration> = Arc::downgrade(registration);
        let sub_engine = engine.clone();
        let sub_args = args.clone();
        engine.host().subscribe_keyspace(Box::new(move |event| {
            let Some(registration) = weak.upgrade() else {
                return;
            };
            if sub_engine.find_registration(&registration.id).is_none() {
                return;
            }
            if !sub_args.matches(&sub_engine, event) {
                return;
            }
            KeysReaderPlugin::fire_event(&sub_engine, &registration, &sub_args, event);
        }));

        // Hook-commands route the command through the hook layer and
        // block its client until the triggered execution completes.
        for command in &args.hook_commands {
            let weak = Arc::downgrade(registration);
            let hook_args = args.clone();
            let callback: hooks::HookFn = Arc::new(move |engine, ctx, hook| {
                let reply = {
                    // Forward the original command first.
                    let host = engine.host();
                    host.call(&ctx.args)
                };
                let Some(registration) = weak.upgrade() else {
                    return HookOutcome::Reply(reply);
                };
                let key = hook
                    .key_positions(ctx.args.len())
                    .first()
                    .and_then(|pos| ctx.args.get(*pos).cloned());
                let Some(key) = key else {
                    return HookOutcome::Reply(reply);
                };
                let reader = KeysReaderInstance::for_event(
                    key,
                    hook.command.clone(),
                    hook_args.read_value,
                );
                match ctx.block_client() {
                    Some(client) => {
                        let on_done: Vec<engine::execution::DoneCallback> =
                            vec![Box::new(move |_engine, _ep| client.unblock(reply))];
                        match registration.fire(engine, Box::new(reader), on_done) {
                            Ok(_) => HookOutcome::Blocked,
                            Err(err) => {
                                tracing::warn!(%err, "hooked command trigger failed");
                                HookOutcome::Reply(Reply::error(format!("{err}")))
                            }
                        }
                    }
                    None => {
                        let _ = registration.fire(engine, Box::new(reader), Vec::new());
                        HookOutcome::Reply(reply)
                    }
                }
            });
            self.hooks
                .register_hook(
                    engine.host().as_ref(),
                    command,
                    Some(args.prefix.clone()),
                    callback,
                )
                .map_err(|err| Error::Registration(err.to_string()))?;
        }

        tracing::info!(
            registration = %registration.id,
            prefix = %String::from_utf8_lossy(&args.prefix),
            "registered key-space trigger"
        );
        Ok(())
    }

    fn deserialize_trigger_args(
        &self,
        r: &mut BufferReader<'_>,
        encver: u32,
    ) -> Result<Arc<dyn TriggerArgs>, Error> {
        Ok(Arc::new(KeysTriggerArgs::deserialize(r, encver)?))
    }

    fn supports_rdb(&self) -> bool {
        true
    }
}

/// Convenience constructor for scan-based runs.
pub fn scan_reader(pattern: &str, read_value: bool) -> KeysReaderInstance {
    KeysReaderInstance::scan(Bytes::copy_from_slice(pattern.as_bytes()), read_value)
}
