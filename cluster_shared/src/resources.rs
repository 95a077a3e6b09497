//! Named resource store.
//!
//! The master keeps raw resource bytes (textures, meshes, shader sources)
//! under a path-like name and serves them to slaves on `REG_RESOURCE`.
//! Bytes are reference counted, so serving a resource never copies it.

use std::collections::BTreeMap;

use bytes::Bytes;

/// In-memory resource store keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ResourceStore {
    by_name: BTreeMap<String, Bytes>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a resource. Returns the previous bytes.
    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Option<Bytes> {
        self.by_name.insert(name.into(), data.into())
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.by_name.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) -> Option<Bytes> {
        self.by_name.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Total bytes held.
    pub fn size(&self) -> usize {
        self.by_name.values().map(Bytes::len).sum()
    }
}
