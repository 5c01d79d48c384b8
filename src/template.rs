//! Input templates: how a fetch renders its subrequest body from the
//! selected document items and the request variables.

use bytes::BufMut;
use bytes::BytesMut;
use displaydoc::Display;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;
use thiserror::Error;

use crate::json_ext::Object;

/// A failure while rendering a fetch input. Fatal to the fetch only; no
/// subrequest is attempted.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// undefined variable '{0}'
    UndefinedVariable(String),
    /// template requires a current item but none is selected
    MissingItem,
    /// current item has no value at '{0}'
    MissingItemField(String),
}

/// One segment of an [`InputTemplate`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    /// Literal text, emitted as-is.
    Static(String),
    /// The currently selected document item, or a sub-value of it when
    /// `path` is non-empty, rendered as JSON.
    CurrentItem { path: Vec<String> },
    /// A request variable, rendered as JSON.
    Variable { name: String },
}

/// A fetch input template. Rendering substitutes [`Segment::CurrentItem`]
/// and [`Segment::Variable`] segments against the selected item and the
/// request variables.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTemplate {
    pub segments: Vec<Segment>,
}

impl InputTemplate {
    /// A template that renders to fixed text.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Static(text.into())],
        }
    }

    /// A template that renders the whole current item.
    pub fn item() -> Self {
        Self {
            segments: vec![Segment::CurrentItem { path: Vec::new() }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Render into `out`. `item` is the currently selected document item,
    /// absent for root fetches that only use variables.
    pub fn render(
        &self,
        item: Option<&Value>,
        variables: &Object,
        out: &mut BytesMut,
    ) -> Result<(), TemplateError> {
        for segment in &self.segments {
            match segment {
                Segment::Static(text) => out.put_slice(text.as_bytes()),
                Segment::CurrentItem { path } => {
                    let mut value = item.ok_or(TemplateError::MissingItem)?;
                    for key in path {
                        value = value
                            .as_object()
                            .and_then(|object| object.get(key.as_str()))
                            .ok_or_else(|| TemplateError::MissingItemField(path.join(".")))?;
                    }
                    write_json(value, out);
                }
                Segment::Variable { name } => {
                    let value = variables
                        .get(name.as_str())
                        .ok_or_else(|| TemplateError::UndefinedVariable(name.clone()))?;
                    write_json(value, out);
                }
            }
        }
        Ok(())
    }

    /// Render to an owned string. Convenience for callers that do not pool
    /// buffers (key templates, tests).
    pub fn render_to_string(
        &self,
        item: Option<&Value>,
        variables: &Object,
    ) -> Result<String, TemplateError> {
        let mut out = BytesMut::new();
        self.render(item, variables, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

fn write_json(value: &Value, out: &mut BytesMut) {
    // a Value is always serializable, and the sink is infallible
    if serde_json::to_writer(out.writer(), value).is_err() {
        debug_assert!(false, "serializing a JSON value cannot fail");
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    fn variables() -> Object {
        json!({"first": 3}).as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn renders_static_item_and_variable_segments() {
        let template = InputTemplate {
            segments: vec![
                Segment::Static(r#"{"query":"...","variables":{"rep":"#.to_string()),
                Segment::CurrentItem { path: Vec::new() },
                Segment::Static(r#","first":"#.to_string()),
                Segment::Variable {
                    name: "first".to_string(),
                },
                Segment::Static("}}".to_string()),
            ],
        };
        let item = json!({"__typename": "Product", "id": "p1"});
        let rendered = template
            .render_to_string(Some(&item), &variables())
            .expect("renders");
        assert_eq!(
            rendered,
            r#"{"query":"...","variables":{"rep":{"__typename":"Product","id":"p1"},"first":3}}"#
        );
    }

    #[test]
    fn item_sub_path_selects_a_field() {
        let template = InputTemplate {
            segments: vec![Segment::CurrentItem {
                path: vec!["id".to_string()],
            }],
        };
        let item = json!({"id": "p1"});
        assert_eq!(
            template.render_to_string(Some(&item), &Object::default()),
            Ok(r#""p1""#.to_string())
        );
    }

    #[test]
    fn missing_variable_is_a_render_error() {
        let template = InputTemplate {
            segments: vec![Segment::Variable {
                name: "missing".to_string(),
            }],
        };
        assert_eq!(
            template.render_to_string(None, &Object::default()),
            Err(TemplateError::UndefinedVariable("missing".to_string()))
        );
    }

    #[test]
    fn missing_item_is_a_render_error() {
        let template = InputTemplate::item();
        assert_eq!(
            template.render_to_string(None, &Object::default()),
            Err(TemplateError::MissingItem)
        );
    }
}
