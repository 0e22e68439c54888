use crate::Record;
use std::sync::{Arc, Mutex};

/// A placeholder record whose payload is produced later, possibly from
/// another thread. The owning execution parks until the producer calls
/// [`AsyncRecord::fill`]; the engine then resumes the pipeline and
/// swaps the payload in via [`AsyncRecord::take`].
#[derive(Clone)]
pub struct AsyncRecord {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    slot: Mutex<Slot>,
}

enum Slot {
    Pending,
    Filled(Record),
    Taken,
}

impl AsyncRecord {
    pub fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                slot: Mutex::new(Slot::Pending),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Continue the record with its payload. Returns false if it was
    /// already continued.
    pub fn fill(&self, record: Record) -> bool {
        let mut slot = self.inner.slot.lock().unwrap();
        match *slot {
            Slot::Pending => {
                *slot = Slot::Filled(record);
                true
            }
            _ => false,
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(*self.inner.slot.lock().unwrap(), Slot::Filled(_))
    }

    /// Take the payload out, leaving the slot consumed.
    pub fn take(&self) -> Option<Record> {
        let mut slot = self.inner.slot.lock().unwrap();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Filled(record) => Some(record),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Serialization support: a filled-but-untaken payload may be
    /// written to the wire in place of the placeholder.
    pub fn with_filled<R>(&self, f: impl FnOnce(&Record) -> R) -> Option<R> {
        let slot = self.inner.slot.lock().unwrap();
        match &*slot {
            Slot::Filled(record) => Some(f(record)),
            _ => None,
        }
    }

    pub fn same_slot(&self, other: &AsyncRecord) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for AsyncRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.inner.slot.lock().unwrap() {
            Slot::Pending => "pending",
            Slot::Filled(_) => "filled",
            Slot::Taken => "taken",
        };
        write!(f, "AsyncRecord(id={}, {state})", self.inner.id)
    }
}
