//! Extensions over [`serde_json_bytes::Value`]: response paths and merging.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde::de::Deserializer;
use serde::ser::SerializeSeq;
use serde::ser::Serializer;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

/// A JSON object as returned by and sent to subgraphs.
pub type Object = Map<ByteString, Value>;

/// One element of a [`Path`] into a response document.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PathElement {
    /// An object field.
    Key(String),
    /// An array offset.
    Index(usize),
    /// A position applying to every element of the surrounding array,
    /// rendered as `@`.
    Flatten,
}

/// A path into the response document.
///
/// Paths address both concrete positions (keys and indices) and, via
/// [`PathElement::Flatten`], per-array-element positions the way GraphQL
/// error paths do.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Parse a dotted response path, mapping `@` to [`PathElement::Flatten`].
    pub fn from_response_path(path: &str) -> Self {
        if path.is_empty() {
            return Self::empty();
        }
        Self(
            path.split('.')
                .map(|segment| {
                    if segment == "@" {
                        PathElement::Flatten
                    } else {
                        PathElement::Key(segment.to_string())
                    }
                })
                .collect(),
        )
    }

    pub fn push(&mut self, element: PathElement) {
        self.0.push(element);
    }

    pub fn join(&self, other: &Path) -> Path {
        let mut elements = self.0.clone();
        elements.extend(other.0.iter().cloned());
        Path(elements)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ".")?;
            }
            match element {
                PathElement::Key(key) => write!(f, "{key}")?,
                PathElement::Index(index) => write!(f, "{index}")?,
                PathElement::Flatten => write!(f, "@")?,
            }
        }
        Ok(())
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for element in &self.0 {
            match element {
                PathElement::Key(key) => seq.serialize_element(key)?,
                PathElement::Index(index) => seq.serialize_element(index)?,
                PathElement::Flatten => seq.serialize_element("@")?,
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let elements = Vec::<Value>::deserialize(deserializer)?;
        Ok(Path(
            elements
                .into_iter()
                .map(|element| match element {
                    Value::Number(n) => {
                        PathElement::Index(n.as_u64().unwrap_or_default() as usize)
                    }
                    Value::String(s) if s.as_str() == "@" => PathElement::Flatten,
                    Value::String(s) => PathElement::Key(s.as_str().to_string()),
                    other => {
                        PathElement::Key(serde_json::to_string(&other).unwrap_or_default())
                    }
                })
                .collect(),
        ))
    }
}

/// Document operations the executor needs from the JSON layer.
pub trait ValueExt {
    /// Get the value at a concrete path, if present.
    fn get_path(&self, path: &Path) -> Option<&Value>;

    /// Mutable access to the value at a concrete path.
    fn get_path_mut(&mut self, path: &Path) -> Option<&mut Value>;

    /// Deep merge: objects merge recursively, same-length arrays merge
    /// element-wise, everything else is replaced by `other`.
    fn deep_merge(&mut self, other: Value);

    /// Navigate `merge_path` below `self`, creating objects as needed, and
    /// deep-merge `value` there. An empty `merge_path` merges into `self`.
    fn merge_at_path(&mut self, merge_path: &[String], value: Value);

    /// Render the value as canonical JSON: object keys sorted, no whitespace.
    /// Used for cache keys so key order in the source document is irrelevant.
    fn to_canonical_json(&self) -> String;
}

impl ValueExt for Value {
    fn get_path(&self, path: &Path) -> Option<&Value> {
        let mut current = self;
        for element in &path.0 {
            current = match element {
                PathElement::Key(key) => current.as_object()?.get(key.as_str())?,
                PathElement::Index(index) => current.as_array()?.get(*index)?,
                PathElement::Flatten => return None,
            };
        }
        Some(current)
    }

    fn get_path_mut(&mut self, path: &Path) -> Option<&mut Value> {
        let mut current = self;
        for element in &path.0 {
            current = match element {
                PathElement::Key(key) => current.as_object_mut()?.get_mut(key.as_str())?,
                PathElement::Index(index) => current.as_array_mut()?.get_mut(*index)?,
                PathElement::Flatten => return None,
            };
        }
        Some(current)
    }

    fn deep_merge(&mut self, other: Value) {
        match (self, other) {
            (Value::Object(left), Value::Object(right)) => {
                for (key, value) in right {
                    match left.get_mut(key.as_str()) {
                        Some(existing) => existing.deep_merge(value),
                        None => {
                            left.insert(key, value);
                        }
                    }
                }
            }
            (Value::Array(left), Value::Array(right)) if left.len() == right.len() => {
                for (existing, value) in left.iter_mut().zip(right) {
                    existing.deep_merge(value);
                }
            }
            (slot, other) => {
                if !other.is_null() {
                    *slot = other;
                }
            }
        }
    }

    fn merge_at_path(&mut self, merge_path: &[String], value: Value) {
        let mut current = self;
        for key in merge_path {
            if !current.is_object() {
                *current = Value::Object(Object::default());
            }
            let object = current
                .as_object_mut()
                .expect("value was just ensured to be an object");
            current = object
                .entry(key.as_str())
                .or_insert_with(|| Value::Object(Object::default()));
        }
        current.deep_merge(value);
    }

    fn to_canonical_json(&self) -> String {
        fn write(value: &Value, out: &mut String) {
            match value {
                Value::Object(object) => {
                    let mut entries: Vec<_> = object.iter().collect();
                    entries.sort_by(|(a, _), (b, _)| a.as_str().cmp(b.as_str()));
                    out.push('{');
                    for (i, (key, value)) in entries.into_iter().enumerate() {
                        if i != 0 {
                            out.push(',');
                        }
                        out.push_str(
                            &serde_json::to_string(key.as_str()).unwrap_or_default(),
                        );
                        out.push(':');
                        write(value, out);
                    }
                    out.push('}');
                }
                Value::Array(array) => {
                    out.push('[');
                    for (i, value) in array.iter().enumerate() {
                        if i != 0 {
                            out.push(',');
                        }
                        write(value, out);
                    }
                    out.push(']');
                }
                other => {
                    out.push_str(&serde_json::to_string(other).unwrap_or_default());
                }
            }
        }
        let mut out = String::new();
        write(self, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn deep_merge_objects() {
        let mut left = json!({"user": {"id": 1, "name": "Ada"}});
        left.deep_merge(json!({"user": {"name": "Grace", "reviews": []}}));
        assert_eq!(
            left,
            json!({"user": {"id": 1, "name": "Grace", "reviews": []}})
        );
    }

    #[test]
    fn deep_merge_arrays_elementwise() {
        let mut left = json!([{"id": 1}, {"id": 2}]);
        left.deep_merge(json!([{"name": "a"}, {"name": "b"}]));
        assert_eq!(left, json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]));
    }

    #[test]
    fn deep_merge_null_does_not_clobber() {
        let mut left = json!({"id": 1});
        left.deep_merge(json!({"id": null}));
        assert_eq!(left, json!({"id": 1}));
    }

    #[test]
    fn merge_at_path_creates_intermediate_objects() {
        let mut doc = json!({"id": "u1"});
        doc.merge_at_path(
            &["profile".to_string(), "address".to_string()],
            json!({"city": "Berlin"}),
        );
        assert_eq!(
            doc,
            json!({"id": "u1", "profile": {"address": {"city": "Berlin"}}})
        );
    }

    #[test]
    fn get_path_descends_keys_and_indices() {
        let doc = json!({"users": [{"name": "Ada"}, {"name": "Grace"}]});
        let path = Path(vec![
            PathElement::Key("users".to_string()),
            PathElement::Index(1),
            PathElement::Key("name".to_string()),
        ]);
        assert_eq!(doc.get_path(&path), Some(&json!("Grace")));
    }

    #[test]
    fn response_path_parses_flatten_markers() {
        let path = Path::from_response_path("query.topProducts.@.reviews");
        assert_eq!(path.to_string(), "query.topProducts.@.reviews");
        assert_eq!(path.0[2], PathElement::Flatten);
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"id": "1", "__typename": "Product", "b": {"z": 1, "a": 2}});
        assert_eq!(
            value.to_canonical_json(),
            r#"{"__typename":"Product","b":{"a":2,"z":1},"id":"1"}"#
        );
    }
}
