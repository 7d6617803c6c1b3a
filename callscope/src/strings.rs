//! Document-scoped string interning.
//!
//! Symbol names, binary paths and nicks repeat millions of times across a
//! capture. Interning them means a symbol comparison is usually a pointer
//! comparison, and each distinct string is stored once.
//!
//! The table lives as long as the [`Strings`] instance (normally owned by a
//! document), so strings are never removed individually. Handles are `Arc`s:
//! a handle stays valid after the table is dropped.

use serde::{Serialize, Serializer};
use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock};

/// An interned, immutable, reference-counted string.
///
/// Equality first checks identity and only then content, so handles coming
/// from two different interners still compare sensibly.
#[derive(Clone)]
pub struct IStr(Arc<str>);

impl IStr {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when both handles point at the same interned storage.
    #[must_use]
    pub fn ptr_eq(a: &IStr, b: &IStr) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl PartialEq for IStr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl Eq for IStr {}

impl Hash for IStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Borrow<str> for IStr {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Deref for IStr {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for IStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl Serialize for IStr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Thread-safe interner shared by every symbolization worker.
///
/// Lookups take the read lock; only a miss takes the write lock, and it
/// re-checks before inserting because another worker may have won the race.
#[derive(Default)]
pub struct Strings {
    table: RwLock<HashSet<IStr>>,
}

impl Strings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text`, returning the shared handle for its content.
    pub fn get(&self, text: &str) -> IStr {
        {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(found) = table.get(text) {
                return found.clone();
            }
        }

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = table.get(text) {
            return found.clone();
        }

        let interned = IStr(Arc::from(text));
        table.insert(interned.clone());
        interned
    }

    /// Intern an optional string, mapping `None` and `""` to `None`.
    pub fn get_non_empty(&self, text: Option<&str>) -> Option<IStr> {
        text.filter(|s| !s.is_empty()).map(|s| self.get(s))
    }

    /// Number of distinct strings held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Strings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strings").field("len", &self.len()).finish()
    }
}
