//! In-memory search index over tag fields.
//!
//! An [`Index`] maps field names to categories. Each category keeps a
//! sorted slice of `(key, value)` entries maintained by binary insertion,
//! so equality lookups are logarithmic and range or prefix queries are a
//! bounded scan from the lower bound. Search results are aggregated into a
//! caller-supplied [`ResultBuffer`], once per matching field, which lets
//! the caller rank multi-field hits by how many fields matched.
//!
//! The stored value is an opaque copyable handle (the match id in
//! practice); removal deletes the first entry under the key whose handle
//! compares equal.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::query::{Field, FieldValue};

/// Receives one call per matching field of every hit.
pub trait ResultBuffer<V> {
    fn add(&mut self, value: &V);
}

/// Counting buffer: value → number of fields that matched it.
impl<V: Copy + Eq + std::hash::Hash> ResultBuffer<V> for HashMap<V, u32> {
    fn add(&mut self, value: &V) {
        *self.entry(*value).or_default() += 1;
    }
}

/// One per-field container. Implementations ignore fields of a kind they
/// do not store.
pub trait IndexCategory<V>: Send + Sync {
    fn insert(&self, field: &Field, value: V);
    fn remove(&self, field: &Field, value: &V);
    fn search(&self, field: &Field, buffer: &mut dyn ResultBuffer<V>);
}

pub struct Index<V> {
    categories: RwLock<HashMap<String, Box<dyn IndexCategory<V>>>>,
}

impl<V: Copy + PartialEq + Send + Sync + 'static> Index<V> {
    pub fn new() -> Index<V> {
        Index { categories: RwLock::new(HashMap::new()) }
    }

    pub fn add_category(&self, name: impl Into<String>, category: Box<dyn IndexCategory<V>>) {
        self.categories.write().insert(name.into(), category);
    }

    /// Routes each field to its category; fields with unregistered names
    /// are skipped.
    pub fn insert(&self, fields: &[Field], value: V) {
        let categories = self.categories.read();
        for field in fields {
            if let Some(category) = categories.get(&field.name) {
                category.insert(field, value);
            }
        }
    }

    pub fn remove(&self, fields: &[Field], value: &V) {
        let categories = self.categories.read();
        for field in fields {
            if let Some(category) = categories.get(&field.name) {
                category.remove(field, value);
            }
        }
    }

    pub fn search(&self, fields: &[Field], buffer: &mut dyn ResultBuffer<V>) {
        let categories = self.categories.read();
        for field in fields {
            if let Some(category) = categories.get(&field.name) {
                category.search(field, buffer);
            }
        }
    }
}

impl<V: Copy + PartialEq + Send + Sync + 'static> Default for Index<V> {
    fn default() -> Index<V> {
        Index::new()
    }
}

/// Sorted `(i32, value)` entries. Stores `Int` fields; answers `Int`
/// equality and `Range` windows.
pub struct IntCategory<V> {
    entries: RwLock<Vec<(i32, V)>>,
}

impl<V> IntCategory<V> {
    pub fn new() -> IntCategory<V> {
        IntCategory { entries: RwLock::new(Vec::new()) }
    }
}

impl<V> Default for IntCategory<V> {
    fn default() -> IntCategory<V> {
        IntCategory::new()
    }
}

impl<V: Copy + PartialEq + Send + Sync> IndexCategory<V> for IntCategory<V> {
    fn insert(&self, field: &Field, value: V) {
        let FieldValue::Int(key) = field.value else { return };

        let mut entries = self.entries.write();
        let idx = entries.partition_point(|e| e.0 < key);
        entries.insert(idx, (key, value));
    }

    fn remove(&self, field: &Field, value: &V) {
        let FieldValue::Int(key) = field.value else { return };

        let mut entries = self.entries.write();
        let mut idx = entries.partition_point(|e| e.0 < key);
        while idx < entries.len() && entries[idx].0 == key {
            if entries[idx].1 == *value {
                entries.remove(idx);
                return;
            }
            idx += 1;
        }
    }

    fn search(&self, field: &Field, buffer: &mut dyn ResultBuffer<V>) {
        let entries = self.entries.read();
        match field.value {
            FieldValue::Int(key) => {
                let idx = entries.partition_point(|e| e.0 < key);
                if idx < entries.len() && entries[idx].0 == key {
                    buffer.add(&entries[idx].1);
                }
            }
            FieldValue::Range(lo, hi) => {
                let start = entries.partition_point(|e| e.0 < lo);
                // `[lo, hi)`, except that `hi == i32::MAX` closes the
                // range so `>n` can reach the top value.
                let end = if hi == i32::MAX {
                    entries.len()
                } else {
                    entries.partition_point(|e| e.0 < hi)
                };
                for entry in &entries[start..end] {
                    buffer.add(&entry.1);
                }
            }
            _ => {}
        }
    }
}

/// Sorted `(String, value)` entries in lexicographic order. Stores
/// `String` fields; answers `ExactString` equality and `String` prefix
/// scans.
pub struct StringCategory<V> {
    entries: RwLock<Vec<(String, V)>>,
}

impl<V> StringCategory<V> {
    pub fn new() -> StringCategory<V> {
        StringCategory { entries: RwLock::new(Vec::new()) }
    }
}

impl<V> Default for StringCategory<V> {
    fn default() -> StringCategory<V> {
        StringCategory::new()
    }
}

impl<V: Copy + PartialEq + Send + Sync> IndexCategory<V> for StringCategory<V> {
    fn insert(&self, field: &Field, value: V) {
        let FieldValue::String(ref key) = field.value else { return };

        let mut entries = self.entries.write();
        let idx = entries.partition_point(|e| e.0.as_str() < key.as_str());
        entries.insert(idx, (key.clone(), value));
    }

    fn remove(&self, field: &Field, value: &V) {
        let FieldValue::String(ref key) = field.value else { return };

        let mut entries = self.entries.write();
        let mut idx = entries.partition_point(|e| e.0.as_str() < key.as_str());
        while idx < entries.len() && entries[idx].0 == *key {
            if entries[idx].1 == *value {
                entries.remove(idx);
                return;
            }
            idx += 1;
        }
    }

    fn search(&self, field: &Field, buffer: &mut dyn ResultBuffer<V>) {
        let entries = self.entries.read();
        match field.value {
            FieldValue::ExactString(ref key) => {
                let idx = entries.partition_point(|e| e.0.as_str() < key.as_str());
                if idx < entries.len() && entries[idx].0 == *key {
                    buffer.add(&entries[idx].1);
                }
            }
            FieldValue::String(ref prefix) => {
                let mut idx = entries.partition_point(|e| e.0.as_str() < prefix.as_str());
                while idx < entries.len() && entries[idx].0.starts_with(prefix.as_str()) {
                    buffer.add(&entries[idx].1);
                    idx += 1;
                }
            }
            _ => {}
        }
    }
}
