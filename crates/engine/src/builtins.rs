//! Stock operator callbacks registered at engine startup: the
//! extractors, mappers, reducers, and accumulators that most plans are
//! built from, plus the key-writer for-each.

use crate::Engine;
use anyhow::{anyhow, bail};
use bytes::Bytes;
use record::Record;
use std::sync::Arc;

pub const KEY_EXTRACTOR: &str = "key_extractor";
pub const VALUE_EXTRACTOR: &str = "value_extractor";
pub const VALUE_MAPPER: &str = "value_mapper";
pub const COUNT_REDUCER: &str = "count_reducer";
pub const TO_LIST_REDUCER: &str = "to_list_reducer";
pub const COUNT_ACCUMULATOR: &str = "count_accumulator";
pub const LIST_ACCUMULATOR: &str = "list_accumulator";
pub const COUNT_BY_KEY_ACCUMULATOR: &str = "count_by_key";
pub const KEY_WRITER: &str = "key_writer";

fn string_payload(record: &Record) -> anyhow::Result<Bytes> {
    match record {
        Record::String(s) => Ok(s.clone()),
        Record::Long(v) => Ok(Bytes::from(v.to_string())),
        Record::Double(v) => Ok(Bytes::from(v.to_string())),
        other => Err(anyhow!("expected a string-like record, got {}", other.type_name())),
    }
}

pub(crate) fn register(engine: &Engine) {
    let mgmt = engine.mgmt();

    mgmt.extractors.add(
        KEY_EXTRACTOR,
        Arc::new(|_, record, _| match record {
            Record::Key(kr) => Ok(kr.key.to_vec()),
            other => bail!("key extractor expects key records, got {}", other.type_name()),
        }),
        None,
    );

    mgmt.extractors.add(
        VALUE_EXTRACTOR,
        Arc::new(|_, record, _| match record {
            Record::Key(kr) => {
                let value = kr
                    .value
                    .as_deref()
                    .ok_or_else(|| anyhow!("value extractor on a key without a value"))?;
                Ok(string_payload(value)?.to_vec())
            }
            other => Ok(string_payload(other)?.to_vec()),
        }),
        None,
    );

    mgmt.maps.add(
        VALUE_MAPPER,
        Arc::new(|_, record, _| match record {
            Record::Key(mut kr) => Ok(kr.take_value().unwrap_or(Record::Null)),
            other => Ok(other),
        }),
        None,
    );

    mgmt.reducers.add(
        COUNT_REDUCER,
        Arc::new(|_, _key, values, _| match values {
            Record::List(items) => Ok(Record::Long(items.len() as i64)),
            other => bail!("count reducer expects a list, got {}", other.type_name()),
        }),
        None,
    );

    mgmt.reducers.add(
        TO_LIST_REDUCER,
        Arc::new(|_, _key, values, _| Ok(values)),
        None,
    );

    mgmt.accumulators.add(
        COUNT_ACCUMULATOR,
        Arc::new(|_, acc, _record, _| {
            let count = match acc {
                Some(Record::Long(v)) => v,
                Some(other) => bail!("count accumulator holds {}", other.type_name()),
                None => 0,
            };
            Ok(Record::Long(count + 1))
        }),
        None,
    );

    mgmt.accumulators.add(
        LIST_ACCUMULATOR,
        Arc::new(|_, acc, record, _| {
            let mut items = match acc {
                Some(Record::List(items)) => items,
                Some(other) => bail!("list accumulator holds {}", other.type_name()),
                None => Vec::new(),
            };
            items.push(record);
            Ok(Record::List(items))
        }),
        None,
    );

    mgmt.accumulators_by_key.add(
        COUNT_BY_KEY_ACCUMULATOR,
        Arc::new(|_, _key, acc, _record, _| {
            let count = match acc {
                Some(Record::Long(v)) => v,
                Some(other) => bail!("count-by-key accumulator holds {}", other.type_name()),
                None => 0,
            };
            Ok(Record::Long(count + 1))
        }),
        None,
    );

    // Writes key records back into the store: a string value sets the
    // key, an absent value deletes it.
    mgmt.foreachs.add(
        KEY_WRITER,
        Arc::new(|ctx, record, _| {
            let Record::Key(kr) = record else {
                bail!("key writer expects key records, got {}", record.type_name());
            };
            let host = ctx.engine().host().clone();
            match kr.value.as_deref() {
                Some(value) => {
                    let payload = string_payload(value)?;
                    host.set_string_key(&kr.key, payload)
                        .map_err(|err| anyhow!("write failed: {err}"))?;
                }
                None => {
                    host.delete_key(&kr.key)
                        .map_err(|err| anyhow!("delete failed: {err}"))?;
                }
            }
            Ok(())
        }),
        None,
    );
}
