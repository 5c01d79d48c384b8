//! Two-tier entity caching: a request-scoped L1 document cache in front of
//! a pluggable, TTL-based L2 byte store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;

use crate::error::BoxError;
use crate::json_ext::Object;
use crate::json_ext::ValueExt;
use crate::template::InputTemplate;
use crate::template::TemplateError;

/// One key/value pair of the L2 store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
}

/// The pluggable L2 cache, shared across requests.
#[async_trait]
pub trait LoaderCache: Send + Sync {
    /// Look up `keys`, returning one slot per key in order; `None` marks a
    /// miss.
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, BoxError>;

    /// Store `entries` with the given time to live.
    async fn set(&self, entries: Vec<CacheEntry>, ttl: Duration) -> Result<(), BoxError>;
}

/// Per-fetch cache configuration. Present on a fetch means caching is
/// enabled for it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Renders an entity's identifying fields; the canonicalized rendering
    /// is the cache key.
    pub key_template: InputTemplate,
    /// L2 time to live, in seconds.
    pub ttl_seconds: u64,
    /// Exclude usable hits from the outgoing subrequest and splice their
    /// cached value in positionally. Off means the cache is write-only for
    /// this fetch.
    pub partial_load: bool,
    /// The field shape this fetch provides. A cached value missing any of
    /// these fields does not satisfy the cache check.
    pub provides: Value,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Compute the cache key for one selected item: render the key
    /// template, then canonicalize so key order in the source document is
    /// irrelevant.
    pub fn cache_key(
        &self,
        item: Option<&Value>,
        variables: &Object,
    ) -> Result<String, TemplateError> {
        let rendered = self.key_template.render_to_string(item, variables)?;
        match serde_json::from_str::<Value>(&rendered) {
            Ok(value) => Ok(value.to_canonical_json()),
            // non-JSON key templates are used verbatim
            Err(_) => Ok(rendered),
        }
    }

    /// Whether a cached value carries every field this fetch provides. A
    /// hit missing a newly required field must be treated as a miss.
    pub fn satisfied_by(&self, cached: &Value) -> bool {
        shape_satisfied(&self.provides, cached)
    }
}

fn shape_satisfied(shape: &Value, value: &Value) -> bool {
    match shape {
        Value::Object(fields) => match value {
            Value::Object(object) => fields.iter().all(|(key, sub_shape)| {
                object
                    .get(key.as_str())
                    .is_some_and(|sub_value| shape_satisfied(sub_shape, sub_value))
            }),
            Value::Array(items) => items.iter().all(|item| shape_satisfied(shape, item)),
            // a stored null is a known value, not a missing field
            Value::Null => true,
            _ => false,
        },
        _ => true,
    }
}

/// The request-scoped L1 cache: canonical key to document value, no TTL.
/// It lives and dies with one request, so entries are never invalidated.
#[derive(Default)]
pub struct L1Cache {
    entries: Mutex<HashMap<String, Value>>,
}

impl L1Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: String, value: Value) {
        self.entries.lock().insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
