//! Types related to the GraphQL response envelope.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use crate::json_ext::Object;
use crate::json_ext::Path;

/// The error location
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// The line number
    pub line: u32,
    /// The column number
    pub column: u32,
}

/// A [GraphQL error](https://spec.graphql.org/October2021/#sec-Errors)
/// as may be found in the `errors` field of a GraphQL [`Response`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Error {
    /// The error message.
    pub message: String,

    /// The locations of the error in the GraphQL document of the originating request.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,

    /// If this is a field error, the JSON path to that field in [`Response::data`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,

    /// The optional GraphQL extensions for this error.
    #[serde(skip_serializing_if = "Object::is_empty")]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Error {
    /// Returns a builder that builds a GraphQL [`Error`] from its components.
    ///
    /// `.extension_code(…)` sets the `code` entry of the extension map unless
    /// the map already carries one.
    #[builder(visibility = "pub")]
    fn new(
        message: String,
        locations: Vec<Location>,
        path: Option<Path>,
        extension_code: Option<String>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        mut extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        if let Some(code) = extension_code {
            extensions
                .entry("code")
                .or_insert(Value::String(ByteString::from(code)));
        }
        Self {
            message,
            locations,
            path,
            extensions,
        }
    }

    /// Build an [`Error`] from a subgraph-supplied error value, tolerating
    /// missing optional fields. Returns `None` if the value is not an object
    /// or has no usable `message`.
    pub fn from_value(value: &Value) -> Option<Error> {
        let object = value.as_object()?;
        let message = object
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())?;
        let locations = object
            .get("locations")
            .cloned()
            .map(skip_invalid_locations)
            .and_then(|l| serde_json_bytes::from_value(l).ok())
            .unwrap_or_default();
        let path = object
            .get("path")
            .and_then(|p| serde_json_bytes::from_value(p.clone()).ok());
        let extensions = object
            .get("extensions")
            .and_then(|e| e.as_object().cloned())
            .unwrap_or_default();
        Some(Error {
            message,
            locations,
            path,
            extensions,
        })
    }
}

/// GraphQL spec require that both "line" and "column" are positive numbers.
/// However GraphQL Java and GraphQL Kotlin return `{ "line": -1, "column": -1 }`
/// if they can't determine error location inside query.
/// This function removes such locations from supplied value.
fn skip_invalid_locations(mut value: Value) -> Value {
    if let Some(array) = value.as_array_mut() {
        array.retain(|location| {
            location.get("line") != Some(&Value::from(-1))
                || location.get("column") != Some(&Value::from(-1))
        })
    }
    value
}

/// Displays (only) the error message.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

/// The top-level GraphQL response envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Response {
    /// The merged response data.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,

    /// The accumulated errors, in merge order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Error>,
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn builder_injects_extension_code() {
        let error = Error::builder()
            .message("failed")
            .extension_code("FETCH_ERROR")
            .build();
        assert_eq!(error.extensions.get("code"), Some(&json!("FETCH_ERROR")));
    }

    #[test]
    fn from_value_skips_invalid_locations() {
        let value = json!({
            "message": "boom",
            "locations": [{"line": -1, "column": -1}, {"line": 2, "column": 4}],
        });
        let error = Error::from_value(&value).expect("valid error");
        assert_eq!(error.locations, vec![Location { line: 2, column: 4 }]);
    }

    #[test]
    fn from_value_requires_message() {
        assert!(Error::from_value(&json!({"path": ["a"]})).is_none());
    }
}
