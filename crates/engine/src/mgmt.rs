//! Process-wide registries of every pluggable kind: readers, maps,
//! filters, extractors, reducers, accumulators, for-eachs, lifecycle
//! callbacks, private-data types, and key-read overrides. Lookups are
//! case-insensitive; names are stable identities used on the wire.

use crate::args::{ArgTypeOps, ArgValue};
use crate::reader::ReaderPlugin;
use crate::step::StepCtx;
use fxhash::FxHashMap;
use host::KeyHandle;
use parking_lot::RwLock;
use record::Record;
use std::sync::Arc;

/// User callbacks surface failures as values; the engine wraps them
/// into error records without unwinding.
pub type CallbackResult<T> = Result<T, anyhow::Error>;

pub type MapFn =
    Arc<dyn Fn(&mut StepCtx<'_>, Record, Option<&ArgValue>) -> CallbackResult<Record> + Send + Sync>;
pub type FilterFn =
    Arc<dyn Fn(&mut StepCtx<'_>, &Record, Option<&ArgValue>) -> CallbackResult<bool> + Send + Sync>;
pub type ExtractorFn = Arc<
    dyn Fn(&mut StepCtx<'_>, &Record, Option<&ArgValue>) -> CallbackResult<Vec<u8>> + Send + Sync,
>;
pub type ReducerFn = Arc<
    dyn Fn(&mut StepCtx<'_>, &[u8], Record, Option<&ArgValue>) -> CallbackResult<Record>
        + Send
        + Sync,
>;
pub type AccumulateFn = Arc<
    dyn Fn(&mut StepCtx<'_>, Option<Record>, Record, Option<&ArgValue>) -> CallbackResult<Record>
        + Send
        + Sync,
>;
pub type AccumulateByKeyFn = Arc<
    dyn Fn(
            &mut StepCtx<'_>,
            &[u8],
            Option<Record>,
            Record,
            Option<&ArgValue>,
        ) -> CallbackResult<Record>
        + Send
        + Sync,
>;
pub type ForEachFn =
    Arc<dyn Fn(&mut StepCtx<'_>, &mut Record, Option<&ArgValue>) -> CallbackResult<()> + Send + Sync>;
/// On-start / on-unpaused execution lifecycle hooks.
pub type LifecycleFn = Arc<dyn Fn(&mut StepCtx<'_>, Option<&ArgValue>) + Send + Sync>;
/// On-registered / on-unregistered registration lifecycle hooks.
pub type RegistrationHookFn = Arc<dyn Fn(&crate::Engine, Option<&ArgValue>) + Send + Sync>;
/// Override of how the keys reader materializes a record from an open key.
pub type KeyReadFn =
    Arc<dyn Fn(&mut StepCtx<'_>, &KeyHandle) -> CallbackResult<Record> + Send + Sync>;

/// A registered callback with the argument type interpreting its
/// opaque argument, if any.
#[derive(Clone)]
pub struct Entry<T: Clone> {
    pub callback: T,
    pub arg_type: Option<Arc<dyn ArgTypeOps>>,
}

/// One name -> callback table. Registration is first-wins, matching the
/// host convention that re-registering a name is a deployment bug.
pub struct Registry<T: Clone> {
    kind: &'static str,
    entries: RwLock<FxHashMap<String, Entry<T>>>,
}

impl<T: Clone> Registry<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Returns false (and leaves the table unchanged) when the name is
    /// already taken.
    pub fn add(&self, name: &str, callback: T, arg_type: Option<Arc<dyn ArgTypeOps>>) -> bool {
        let mut entries = self.entries.write();
        let key = name.to_ascii_lowercase();
        if entries.contains_key(&key) {
            tracing::warn!(kind = self.kind, name, "callback already registered");
            return false;
        }
        entries.insert(key, Entry { callback, arg_type });
        true
    }

    pub fn get(&self, name: &str) -> Option<Entry<T>> {
        self.entries.read().get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Entry<T>, crate::Error> {
        self.get(name).ok_or_else(|| crate::Error::UnknownCallback {
            kind: self.kind,
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// The full registry set, one table per pluggable kind.
pub struct Mgmt {
    pub readers: Registry<Arc<dyn ReaderPlugin>>,
    pub maps: Registry<MapFn>,
    pub filters: Registry<FilterFn>,
    pub extractors: Registry<ExtractorFn>,
    pub reducers: Registry<ReducerFn>,
    pub accumulators: Registry<AccumulateFn>,
    pub accumulators_by_key: Registry<AccumulateByKeyFn>,
    pub foreachs: Registry<ForEachFn>,
    pub on_starts: Registry<LifecycleFn>,
    pub on_unpauseds: Registry<LifecycleFn>,
    pub on_registereds: Registry<RegistrationHookFn>,
    pub on_unregistereds: Registry<RegistrationHookFn>,
    pub private_data_types: Registry<Arc<dyn ArgTypeOps>>,
    pub key_readers: Registry<KeyReadFn>,
}

impl Mgmt {
    pub fn new() -> Mgmt {
        Mgmt {
            readers: Registry::new("reader"),
            maps: Registry::new("map"),
            filters: Registry::new("filter"),
            extractors: Registry::new("extractor"),
            reducers: Registry::new("reducer"),
            accumulators: Registry::new("accumulator"),
            accumulators_by_key: Registry::new("accumulate-by-key"),
            foreachs: Registry::new("for-each"),
            on_starts: Registry::new("on-start"),
            on_unpauseds: Registry::new("on-unpaused"),
            on_registereds: Registry::new("on-registered"),
            on_unregistereds: Registry::new("on-unregistered"),
            private_data_types: Registry::new("flat-execution-private-data"),
            key_readers: Registry::new("keys-reader-read-record"),
        }
    }

    pub fn reader(&self, name: &str) -> Result<Arc<dyn ReaderPlugin>, crate::Error> {
        self.readers
            .get(name)
            .map(|e| e.callback)
            .ok_or_else(|| crate::Error::UnknownReader(name.to_string()))
    }
}

impl Default for Mgmt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive_and_first_wins() {
        let registry: Registry<MapFn> = Registry::new("map");
        let cb: MapFn = Arc::new(|_, r, _| Ok(r));
        assert!(registry.add("ToUpper", cb.clone(), None));
        assert!(!registry.add("toupper", cb, None));
        assert!(registry.get("TOUPPER").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.require("missing").is_err());
        assert_eq!(registry.names(), vec!["toupper".to_string()]);
    }
}
