//! Metadata string interning and metadata batches.
//!
//! Each connection owns a [`MetadataContext`]; every header string seen on
//! that connection is interned into it, yielding [`MdStr`] handles that are
//! identity-comparable and carry a precomputed hash. Registered-method lookup
//! relies on this: the per-connection method table stores handles interned in
//! the same context as incoming headers, so a pointer comparison decides a
//! match. The discipline must hold on both build and lookup paths.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

struct MdStrData {
    value: String,
    hash: u32,
}

/// An interned metadata string: cheap to clone, identity-comparable within
/// one [`MetadataContext`], hash computed once at intern time.
#[derive(Clone)]
pub struct MdStr(Arc<MdStrData>);

impl MdStr {
    pub fn as_str(&self) -> &str {
        &self.0.value
    }

    pub fn hash(&self) -> u32 {
        self.0.hash
    }

    /// Identity comparison. Two handles from the same context interning the
    /// same string are the same allocation.
    pub fn same(&self, other: &MdStr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// Equality is identity, matching the interning discipline: within one context
// identity and value equality coincide, and cross-context comparison is a bug
// this makes loud in tests.
impl PartialEq for MdStr {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for MdStr {}

impl Deref for MdStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for MdStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MdStr({:?})", self.as_str())
    }
}

impl fmt::Display for MdStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FNV-1a over the string bytes; stable across contexts.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Combine a key hash and value hash for the registered-method table.
#[inline]
pub(crate) fn kv_hash(key: u32, value: u32) -> u32 {
    key.rotate_left(2) ^ value
}

/// A per-connection interning table for metadata strings.
#[derive(Default)]
pub struct MetadataContext {
    table: Mutex<HashMap<String, MdStr>>,
}

impl MetadataContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Intern `s`, returning the canonical handle for this context.
    pub fn intern(&self, s: &str) -> MdStr {
        let mut table = self.table.lock();
        if let Some(existing) = table.get(s) {
            return existing.clone();
        }
        let handle = MdStr(Arc::new(MdStrData {
            value: s.to_owned(),
            hash: fnv1a(s.as_bytes()),
        }));
        table.insert(s.to_owned(), handle.clone());
        handle
    }
}

/// One header element.
#[derive(Clone, Debug)]
pub struct Metadatum {
    pub key: MdStr,
    pub value: MdStr,
}

/// A batch of headers delivered by the transport, with the deadline the
/// transport decoded from it (if any).
#[derive(Clone, Debug, Default)]
pub struct MetadataBatch {
    pub list: Vec<Metadatum>,
    pub deadline: Option<SystemTime>,
}

impl MetadataBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: MdStr, value: MdStr) {
        self.list.push(Metadatum { key, value });
    }
}

/// The header view published to the application with a matched call.
#[derive(Clone, Debug, Default)]
pub struct MetadataArray {
    pub entries: Vec<Metadatum>,
}

impl MetadataArray {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_returns_identical_handles() {
        let ctx = MetadataContext::new();
        let a = ctx.intern("/method");
        let b = ctx.intern("/method");
        assert!(a.same(&b));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn distinct_contexts_intern_distinct_handles() {
        let ctx1 = MetadataContext::new();
        let ctx2 = MetadataContext::new();
        let a = ctx1.intern("host");
        let b = ctx2.intern("host");
        assert!(!a.same(&b));
        // value hashes still agree
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn kv_hash_mixes_key_and_value() {
        assert_ne!(kv_hash(1, 2), kv_hash(2, 1));
        assert_eq!(kv_hash(0, 7), 7);
    }
}
