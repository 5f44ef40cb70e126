//! Per-call tag store.
//!
//! A [`Tags`] handle is attached to a call's [`Extensions`] the first time it
//! is extracted and lives exactly as long as the call. Every interceptor in
//! the chain (and the handler itself) sees the same store, so a tag written
//! by one layer is visible to every log line emitted after the write.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tonic::Extensions;

/// Value stored under a tag key.
pub type TagValue = serde_json::Value;

/// Mutable key/value facts attached to a single call.
///
/// Cloning yields another handle to the same store. Keys are unique; a second
/// `set` for the same key overwrites the first.
#[derive(Clone, Default)]
pub struct Tags {
    inner: Arc<RwLock<HashMap<String, TagValue>>>,
}

impl Tags {
    /// Returns the store associated with `extensions`, inserting an empty one
    /// if the call has none yet.
    ///
    /// Repeated extraction on the same call returns handles to the same store.
    pub fn extract(extensions: &mut Extensions) -> Self {
        if let Some(tags) = extensions.get::<Tags>() {
            return tags.clone();
        }
        let tags = Tags::default();
        extensions.insert(tags.clone());
        tags
    }

    /// Read-only lookup. A call without a store behaves as an empty one; the
    /// returned handle is then detached and writes to it are not seen by
    /// anyone else.
    #[must_use]
    pub fn from_extensions(extensions: &Extensions) -> Self {
        extensions.get::<Tags>().cloned().unwrap_or_default()
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<TagValue>) -> &Self {
        self.inner.write().insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<TagValue> {
        self.inner.read().get(key).cloned()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<TagValue> {
        self.inner.write().remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Copies the current contents. Later writes to the store do not affect
    /// the returned set.
    #[must_use]
    pub fn snapshot(&self) -> TagSet {
        let guard = self.inner.read();
        TagSet(
            guard
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Whether two handles refer to the same underlying store.
    #[must_use]
    pub fn ptr_eq(&self, other: &Tags) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tags").field(&self.snapshot()).finish()
    }
}

/// Point-in-time copy of a tag store, ordered by key.
///
/// `Display` renders it as a JSON object so it can be attached to a log event
/// as a single field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, TagValue>);

impl TagSet {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.0.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TagValue)> {
        self.0.iter()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("{}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn extract_inserts_once_and_returns_same_store() {
        let mut ext = Extensions::new();
        let first = Tags::extract(&mut ext);
        first.set("peer.address", "127.0.0.1:5000");

        let second = Tags::extract(&mut ext);
        assert!(first.ptr_eq(&second));
        assert_eq!(second.get("peer.address"), Some(json!("127.0.0.1:5000")));
    }

    #[test]
    fn from_extensions_without_store_is_empty_and_detached() {
        let ext = Extensions::new();
        let detached = Tags::from_extensions(&ext);
        assert!(detached.is_empty());

        detached.set("k", 1);
        assert!(Tags::from_extensions(&ext).is_empty());
    }

    #[test]
    fn from_extensions_sees_extracted_store() {
        let mut ext = Extensions::new();
        let tags = Tags::extract(&mut ext);
        tags.set("user", "alice");

        let read = Tags::from_extensions(&ext);
        assert!(read.ptr_eq(&tags));
        assert!(read.has("user"));
    }

    #[test]
    fn separate_calls_never_share_a_store() {
        let mut a = Extensions::new();
        let mut b = Extensions::new();
        let ta = Tags::extract(&mut a);
        let tb = Tags::extract(&mut b);
        ta.set("only", "a");

        assert!(!ta.ptr_eq(&tb));
        assert!(!tb.has("only"));
    }

    #[test]
    fn last_write_wins() {
        let tags = Tags::default();
        tags.set("attempt", 1).set("attempt", 2);
        assert_eq!(tags.get("attempt"), Some(json!(2)));
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let tags = Tags::default();
        tags.set("a", "1");
        let snap = tags.snapshot();
        tags.set("b", "2");

        assert_eq!(snap.len(), 1);
        assert!(snap.get("b").is_none());
        assert_eq!(tags.snapshot().len(), 2);
    }

    #[test]
    fn tag_set_displays_as_sorted_json() {
        let tags = Tags::default();
        tags.set("z", 26).set("a", "first");
        assert_eq!(tags.snapshot().to_string(), r#"{"a":"first","z":26}"#);
    }

    #[test]
    fn remove_drops_key() {
        let tags = Tags::default();
        tags.set("k", true);
        assert_eq!(tags.remove("k"), Some(json!(true)));
        assert!(!tags.has("k"));
    }

    proptest! {
        #[test]
        fn final_value_is_last_written(writes in prop::collection::vec(("[a-d]", 0i64..100), 1..40)) {
            let tags = Tags::default();
            let mut expected = std::collections::HashMap::new();
            for (key, value) in &writes {
                tags.set(key.clone(), *value);
                expected.insert(key.clone(), *value);
            }
            prop_assert_eq!(tags.len(), expected.len());
            for (key, value) in expected {
                prop_assert_eq!(tags.get(&key), Some(json!(value)));
            }
        }
    }
}
