use bytes::Bytes;
use fxhash::FxHashMap;
use host::Host;
use parking_lot::Mutex;
use std::sync::Arc;
use wire::{BufferReader, BufferWriter};

/// Internal command used to set store entries; also the replication
/// vehicle. Takes `<key> <value>` in that order.
pub const INNER_CONFIG_SET_COMMAND: &str = "sluice.innersetconfigstore";

/// A refcounted store entry; readers hold the `Arc` while the map may
/// move on underneath them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub value: Bytes,
}

/// Replicated string-blob map. Writes propagate to replicas and the
/// AOF through the internal command; the whole map rides the RDB aux
/// payload.
#[derive(Debug, Default)]
pub struct ConfigStore {
    entries: Mutex<FxHashMap<String, Arc<StoreEntry>>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or delete (`None`) an entry, replicating unless the store is
    /// loading.
    pub fn set(&self, host: &dyn Host, key: &str, value: Option<Bytes>) {
        match value {
            Some(value) => {
                self.entries
                    .lock()
                    .insert(key.to_string(), Arc::new(StoreEntry { value: value.clone() }));
                if !host.is_loading() {
                    host.replicate(
                        INNER_CONFIG_SET_COMMAND,
                        &[Bytes::copy_from_slice(key.as_bytes()), value],
                    );
                }
            }
            None => {
                if self.entries.lock().remove(key).is_some() && !host.is_loading() {
                    host.replicate(
                        INNER_CONFIG_SET_COMMAND,
                        &[Bytes::copy_from_slice(key.as_bytes())],
                    );
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<StoreEntry>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn save(&self, w: &mut BufferWriter<'_>) {
        let entries = self.entries.lock();
        w.write_varu64(entries.len() as u64);
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        for key in keys {
            w.write_str(key);
            w.write_bytes(&entries[key].value);
        }
    }

    pub fn load(&self, r: &mut BufferReader<'_>) -> Result<(), wire::Error> {
        let len = r.read_varu64()?;
        let mut entries = self.entries.lock();
        for _ in 0..len {
            let key = r.read_str()?.to_string();
            let value = Bytes::copy_from_slice(r.read_bytes()?);
            entries.insert(key, Arc::new(StoreEntry { value }));
        }
        Ok(())
    }
}
