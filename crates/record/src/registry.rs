use crate::{Record, SerError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use wire::BufferReader;

/// Extension record ids start here; everything below is a built-in.
pub const FIRST_EXTENSION_TYPE_ID: u64 = 10;

/// Descriptor of an implementer-registered record variant. The name is
/// the identity; the wire id is assigned at registration time and is
/// stable for the process lifetime.
pub struct ExtensionType {
    pub name: String,
    pub deserialize:
        Box<dyn Fn(&mut BufferReader<'_>) -> Result<Record, SerError> + Send + Sync>,
}

/// Process-wide record type table. Registration appends; ids are never
/// reused or reordered.
#[derive(Default)]
pub struct TypeRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    types: Vec<Arc<ExtensionType>>,
    by_name: HashMap<String, u64>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new extension descriptor and return its wire id.
    /// Re-registering a name is a startup bug.
    pub fn register(&self, ext: ExtensionType) -> u64 {
        let mut inner = self.inner.write().unwrap();
        assert!(
            !inner.by_name.contains_key(&ext.name),
            "record type '{}' registered twice",
            ext.name
        );
        let id = FIRST_EXTENSION_TYPE_ID + inner.types.len() as u64;
        inner.by_name.insert(ext.name.clone(), id);
        inner.types.push(Arc::new(ext));
        id
    }

    pub fn id_of(&self, name: &str) -> Option<u64> {
        self.inner.read().unwrap().by_name.get(name).copied()
    }

    pub fn by_id(&self, id: u64) -> Option<Arc<ExtensionType>> {
        let index = id.checked_sub(FIRST_EXTENSION_TYPE_ID)? as usize;
        self.inner.read().unwrap().types.get(index).cloned()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("TypeRegistry")
            .field("extensions", &inner.types.iter().map(|t| &t.name).collect::<Vec<_>>())
            .finish()
    }
}
