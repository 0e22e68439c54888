//! The tagged, polymorphic record carried by execution pipelines.
//!
//! Records are exclusively owned: a pipeline step either forwards a
//! record, consumes it and emits a replacement, or drops it, never two
//! of those. The wire format is self-describing: a varint type id
//! followed by a type-specific payload, recursively for containers.
//! Type ids are stable for the life of a process and new variants only
//! ever append; extension descriptors registered at startup take ids
//! after the built-ins.

use bytes::Bytes;
use fxhash::FxHashMap;
use host::{KeyHandle, Reply};
use wire::{BufferReader, BufferWriter};

mod registry;
pub use registry::{ExtensionType, TypeRegistry, FIRST_EXTENSION_TYPE_ID};

mod asynch;
pub use asynch::AsyncRecord;

#[cfg(test)]
mod record_test;

#[derive(Debug, thiserror::Error)]
pub enum SerError {
    #[error(transparent)]
    Wire(#[from] wire::Error),
    #[error("unknown record type id {0}")]
    UnknownTypeId(u64),
    #[error("async record serialized before being continued")]
    UnfilledAsync,
    #[error("extension record type '{0}' was never registered")]
    UnregisteredType(String),
    #[error("hash-set key is not valid UTF-8")]
    BadHashSetKey,
}

// Wire type ids. Stable across the process lifetime; append only.
const LIST_ID: u64 = 0;
const STRING_ID: u64 = 1;
const ERROR_ID: u64 = 2;
const LONG_ID: u64 = 3;
const DOUBLE_ID: u64 = 4;
const KEY_ID: u64 = 5;
const KEY_HANDLER_ID: u64 = 6;
const HASH_SET_ID: u64 = 7;
const NULL_ID: u64 = 8;
const ASYNC_ID: u64 = 9;

/// A key paired with the record read (or computed) for it. Key bytes
/// are always present; the value may be absent only after an explicit
/// `set_value(None)`.
#[derive(Debug, PartialEq)]
pub struct KeyRecord {
    pub key: Bytes,
    pub value: Option<Box<Record>>,
}

impl KeyRecord {
    pub fn new(key: impl Into<Bytes>, value: Option<Record>) -> Self {
        Self {
            key: key.into(),
            value: value.map(Box::new),
        }
    }

    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    pub fn take_value(&mut self) -> Option<Record> {
        self.value.take().map(|v| *v)
    }

    pub fn set_value(&mut self, value: Option<Record>) {
        self.value = value.map(Box::new);
    }
}

/// Records produced by readers and transformed by pipeline steps.
///
/// `Extension` carries implementer-registered variants; their
/// descriptors live in a [`TypeRegistry`] and their wire ids append
/// after the built-ins.
#[derive(Debug)]
pub enum Record {
    Null,
    String(Bytes),
    /// Terminates the pipeline at reducer/reply boundaries; steps
    /// forward error records untouched.
    Error(Bytes),
    Long(i64),
    Double(f64),
    Key(KeyRecord),
    List(Vec<Record>),
    HashSet(FxHashMap<String, Record>),
    /// Opaque live key reference. Not serializable.
    KeyHandler(KeyHandle),
    /// Pending slot filled later by an asynchronous producer.
    Async(AsyncRecord),
    Extension(Box<dyn ExtensionRecord>),
}

/// Implementer-defined record payloads. A value's `type_name` must
/// match a descriptor registered in the [`TypeRegistry`] before any
/// serialization happens.
pub trait ExtensionRecord: Send + Sync + std::fmt::Debug {
    fn type_name(&self) -> &str;
    fn serialize(&self, w: &mut BufferWriter<'_>) -> Result<(), SerError>;
    fn reply(&self) -> Reply {
        Reply::bulk_str(self.type_name())
    }
    fn eq_record(&self, _other: &dyn ExtensionRecord) -> bool {
        false
    }
}

impl Record {
    pub fn string(s: impl Into<Bytes>) -> Record {
        Record::String(s.into())
    }

    pub fn string_from(s: impl AsRef<str>) -> Record {
        Record::String(Bytes::copy_from_slice(s.as_ref().as_bytes()))
    }

    pub fn error_from(msg: impl AsRef<str>) -> Record {
        Record::Error(Bytes::copy_from_slice(msg.as_ref().as_bytes()))
    }

    pub fn key(key: impl Into<Bytes>, value: Option<Record>) -> Record {
        Record::Key(KeyRecord::new(key, value))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Record::Error(_))
    }

    pub fn error_message(&self) -> Option<std::borrow::Cow<'_, str>> {
        match self {
            Record::Error(msg) => Some(String::from_utf8_lossy(msg)),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Record::Null => "NullRecord",
            Record::String(_) => "StringRecord",
            Record::Error(_) => "ErrorRecord",
            Record::Long(_) => "LongRecord",
            Record::Double(_) => "DoubleRecord",
            Record::Key(_) => "KeyRecord",
            Record::List(_) => "ListRecord",
            Record::HashSet(_) => "HashSetRecord",
            Record::KeyHandler(_) => "KeysHandlerRecord",
            Record::Async(_) => "AsyncRecord",
            Record::Extension(ext) => ext.type_name(),
        }
    }

    /// Serialize as `<type-id:varint><payload>`. Key-handler records
    /// are a caller bug (materialize before transit) and abort;
    /// unfilled async placeholders are a recoverable error.
    pub fn serialize(
        &self,
        types: &TypeRegistry,
        w: &mut BufferWriter<'_>,
    ) -> Result<(), SerError> {
        match self {
            Record::Null => w.write_varu64(NULL_ID),
            Record::String(s) => {
                w.write_varu64(STRING_ID);
                w.write_bytes(s);
            }
            Record::Error(s) => {
                w.write_varu64(ERROR_ID);
                w.write_bytes(s);
            }
            Record::Long(v) => {
                w.write_varu64(LONG_ID);
                w.write_vari64(*v);
            }
            Record::Double(v) => {
                w.write_varu64(DOUBLE_ID);
                w.write_f64(*v);
            }
            Record::Key(kr) => {
                w.write_varu64(KEY_ID);
                w.write_bytes(&kr.key);
                match &kr.value {
                    Some(value) => {
                        w.write_varu64(1);
                        value.serialize(types, w)?;
                    }
                    None => w.write_varu64(0),
                }
            }
            Record::List(items) => {
                w.write_varu64(LIST_ID);
                w.write_varu64(items.len() as u64);
                for item in items {
                    item.serialize(types, w)?;
                }
            }
            Record::HashSet(map) => {
                w.write_varu64(HASH_SET_ID);
                w.write_varu64(map.len() as u64);
                // Deterministic order on the wire; insertion order is
                // irrelevant to the variant's semantics.
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for key in keys {
                    w.write_str(key);
                    map[key].serialize(types, w)?;
                }
            }
            Record::KeyHandler(_) => {
                panic!("key-handler records cannot be serialized; materialize the key first")
            }
            Record::Async(a) => {
                return a
                    .with_filled(|inner| inner.serialize(types, w))
                    .unwrap_or(Err(SerError::UnfilledAsync));
            }
            Record::Extension(ext) => {
                let id = types
                    .id_of(ext.type_name())
                    .ok_or_else(|| SerError::UnregisteredType(ext.type_name().to_string()))?;
                w.write_varu64(id);
                ext.serialize(w)?;
            }
        }
        Ok(())
    }

    pub fn deserialize(
        r: &mut BufferReader<'_>,
        types: &TypeRegistry,
    ) -> Result<Record, SerError> {
        let type_id = r.read_varu64()?;
        Ok(match type_id {
            NULL_ID => Record::Null,
            STRING_ID => Record::String(Bytes::copy_from_slice(r.read_bytes()?)),
            ERROR_ID => Record::Error(Bytes::copy_from_slice(r.read_bytes()?)),
            LONG_ID => Record::Long(r.read_vari64()?),
            DOUBLE_ID => Record::Double(r.read_f64()?),
            KEY_ID => {
                let key = Bytes::copy_from_slice(r.read_bytes()?);
                let value = match r.read_varu64()? {
                    0 => None,
                    _ => Some(Record::deserialize(r, types)?),
                };
                Record::Key(KeyRecord::new(key, value))
            }
            LIST_ID => {
                let len = r.read_varu64()? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(Record::deserialize(r, types)?);
                }
                Record::List(items)
            }
            HASH_SET_ID => {
                let len = r.read_varu64()? as usize;
                let mut map = FxHashMap::default();
                for _ in 0..len {
                    let key = r.read_str().map_err(|_| SerError::BadHashSetKey)?.to_string();
                    let value = Record::deserialize(r, types)?;
                    map.insert(key, value);
                }
                Record::HashSet(map)
            }
            KEY_HANDLER_ID | ASYNC_ID => return Err(SerError::UnknownTypeId(type_id)),
            id => {
                let ext = types.by_id(id).ok_or(SerError::UnknownTypeId(id))?;
                (ext.deserialize)(r)?
            }
        })
    }

    /// The client-facing reply shape of this record.
    pub fn reply(&self) -> Reply {
        match self {
            Record::Null => Reply::Null,
            Record::String(s) => Reply::Bulk(s.clone()),
            Record::Error(msg) => Reply::Error(String::from_utf8_lossy(msg).into_owned()),
            Record::Long(v) => Reply::Integer(*v),
            Record::Double(v) => Reply::Double(*v),
            Record::List(items) => Reply::Array(items.iter().map(Record::reply).collect()),
            Record::Key(kr) => Reply::Array(vec![
                Reply::Bulk(kr.key.clone()),
                kr.value.as_deref().map_or(Reply::Null, Record::reply),
            ]),
            Record::HashSet(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                Reply::Array(
                    keys.into_iter()
                        .map(|k| Reply::Array(vec![Reply::bulk_str(k), map[k].reply()]))
                        .collect(),
                )
            }
            // Variants without a reply shape answer with their type name.
            Record::KeyHandler(_) | Record::Async(_) => Reply::bulk_str(self.type_name()),
            Record::Extension(ext) => ext.reply(),
        }
    }
}

impl From<host::KeyValue> for Record {
    fn from(value: host::KeyValue) -> Record {
        match value {
            host::KeyValue::String(s) => Record::String(s),
            host::KeyValue::List(items) => {
                Record::List(items.into_iter().map(Record::String).collect())
            }
            host::KeyValue::Set(items) => {
                Record::List(items.into_iter().map(Record::String).collect())
            }
            host::KeyValue::Hash(fields) => {
                let mut map = FxHashMap::default();
                for (field, value) in fields {
                    map.insert(
                        String::from_utf8_lossy(&field).into_owned(),
                        Record::String(value),
                    );
                }
                Record::HashSet(map)
            }
        }
    }
}

// Structural equality: doubles compare by bit pattern (round-trip tests
// must hold for NaN), key handlers by key name, async records by slot
// identity.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Record::Null, Record::Null) => true,
            (Record::String(a), Record::String(b)) => a == b,
            (Record::Error(a), Record::Error(b)) => a == b,
            (Record::Long(a), Record::Long(b)) => a == b,
            (Record::Double(a), Record::Double(b)) => a.to_bits() == b.to_bits(),
            (Record::Key(a), Record::Key(b)) => a == b,
            (Record::List(a), Record::List(b)) => a == b,
            (Record::HashSet(a), Record::HashSet(b)) => a == b,
            (Record::KeyHandler(a), Record::KeyHandler(b)) => a.0.name() == b.0.name(),
            (Record::Async(a), Record::Async(b)) => a.same_slot(b),
            (Record::Extension(a), Record::Extension(b)) => a.eq_record(b.as_ref()),
            _ => false,
        }
    }
}
