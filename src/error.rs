//! Error taxonomy for fetch execution and subgraph error propagation.

use displaydoc::Display;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::Value;
use serde_json_bytes::json;
use thiserror::Error;

use crate::graphql;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::plan::DataSourceInfo;

/// Boxed error at the `DataSource` seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error types for execution.
///
/// Note that these are not actually returned to the client, but are instead
/// converted to JSON for [`struct@graphql::Error`].
#[derive(Error, Display, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
#[allow(missing_docs)] // FIXME
pub enum FetchError {
    /// could not render the fetch input for service '{service}': {reason}
    MalformedFetchInput { service: String, reason: String },

    /// HTTP fetch failed from '{service}': {reason}
    ///
    /// Note that this relates to a transport error and not a GraphQL error.
    SubrequestHttpError {
        status_code: Option<u16>,
        service: String,
        reason: String,
    },

    /// service '{service}' response was malformed: {reason}
    SubrequestMalformedResponse { service: String, reason: String },

    /// fetch from service '{service}' was not authorized: {reason}
    AuthorizationRejected { service: String, reason: String },

    /// fetch from service '{service}' was rate limited: {reason}
    RateLimitRejected { service: String, reason: String },

    /// fetch plan is invalid: {reason}
    MalformedPlan { reason: String },
}

impl FetchError {
    /// Convert the fetch error to a GraphQL error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> graphql::Error {
        let mut extensions = Object::default();
        extensions.insert("code", self.extension_code().into());
        match self {
            FetchError::MalformedFetchInput { service, .. }
            | FetchError::SubrequestMalformedResponse { service, .. }
            | FetchError::AuthorizationRejected { service, .. }
            | FetchError::RateLimitRejected { service, .. } => {
                extensions.insert("service", service.as_str().into());
            }
            FetchError::SubrequestHttpError {
                service,
                status_code,
                ..
            } => {
                extensions.insert("service", service.as_str().into());
                if let Some(status_code) = status_code
                    && let Some(http) = extensions
                        .entry("http")
                        .or_insert(json!({}))
                        .as_object_mut()
                {
                    http.insert("status", (*status_code).into());
                }
            }
            FetchError::MalformedPlan { .. } => {}
        }
        graphql::Error::builder()
            .message(self.to_string())
            .locations(Vec::default())
            .and_path(path)
            .extensions(extensions)
            .build()
    }

    /// The error code related to the fetch error.
    pub fn extension_code(&self) -> String {
        match self {
            FetchError::MalformedFetchInput { .. } => "MALFORMED_FETCH_INPUT",
            FetchError::SubrequestHttpError { .. } => "SUBREQUEST_HTTP_ERROR",
            FetchError::SubrequestMalformedResponse { .. } => "SUBREQUEST_MALFORMED_RESPONSE",
            FetchError::AuthorizationRejected { .. } => "UNAUTHORIZED_FIELD_OR_TYPE",
            FetchError::RateLimitRejected { .. } => "RATE_LIMITED",
            FetchError::MalformedPlan { .. } => "MALFORMED_PLAN",
        }
        .to_string()
    }
}

/// A structured record of one failed subgraph fetch, kept on an internal
/// request-scoped list for logging, independently of the user-visible
/// response errors.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubgraphError {
    /// The data source the fetch targeted.
    pub data_source: DataSourceInfo,
    /// The response path of the failing fetch.
    pub path: String,
    /// A short, classifying reason.
    pub reason: String,
    /// The HTTP status code of the subgraph response, when one was received.
    pub status_code: Option<u16>,
    /// GraphQL errors reported by the subgraph itself, if any.
    pub downstream_errors: Vec<graphql::Error>,
}

/// A structured record of a rate-limit denial.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RateLimitError {
    /// The data source the fetch targeted.
    pub data_source: DataSourceInfo,
    /// The response path of the denied fetch.
    pub path: String,
    /// The limiter-supplied reason, if any.
    pub reason: String,
}

/// An entry of the internal, caller-retrievable error list.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum InternalError {
    Subgraph(SubgraphError),
    RateLimit(RateLimitError),
}

/// How subgraph-reported GraphQL errors appear in the final response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationMode {
    /// Attach the raw subgraph errors under `extensions.errors` of one
    /// synthetic parent error.
    #[default]
    Wrap,
    /// Forward each subgraph error individually, filtered and annotated.
    PassThrough,
}

/// Subgraph error propagation configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ErrorPropagation {
    pub mode: PropagationMode,
    /// Strip `locations` from forwarded errors (pass-through only).
    pub omit_locations: bool,
    /// Strip `extensions` from forwarded errors (pass-through only).
    pub omit_extensions: bool,
    /// When set, only these extension fields survive forwarding
    /// (pass-through only, ignored if `omit_extensions` is set).
    pub allowed_extension_fields: Option<Vec<String>>,
    /// Injected as `extensions.code` on forwarded errors that carry none.
    pub default_extension_code: Option<String>,
    /// Attach the data source name to the produced error extensions.
    pub attach_service_name: bool,
    /// Attach the subgraph HTTP status code to the produced error extensions.
    pub attach_status_code: bool,
}

impl ErrorPropagation {
    /// Transform the raw errors of one subgraph response into the errors
    /// appended to the client response, per the configured mode.
    ///
    /// `response_path` is the fetch's response path rendering, used for the
    /// wrapping error message and as the path of forwarded errors that carry
    /// none of their own.
    pub(crate) fn transform(
        &self,
        raw_errors: &[Value],
        service: &str,
        status_code: Option<u16>,
        response_path: &str,
    ) -> Vec<graphql::Error> {
        match self.mode {
            PropagationMode::Wrap => {
                vec![self.wrap(raw_errors, service, status_code, response_path, None)]
            }
            PropagationMode::PassThrough => raw_errors
                .iter()
                .map(|raw| self.forward(raw, service, status_code, response_path))
                .collect(),
        }
    }

    /// Build the synthetic wrapping error. Used both for subgraph-reported
    /// errors (no `reason`) and for outright fetch failures (`reason` set,
    /// `raw_errors` empty).
    pub(crate) fn wrap(
        &self,
        raw_errors: &[Value],
        service: &str,
        status_code: Option<u16>,
        response_path: &str,
        reason: Option<&str>,
    ) -> graphql::Error {
        let message = match reason {
            Some(reason) => format!(
                "Failed to fetch from Subgraph '{service}' at Path '{response_path}', Reason: {reason}."
            ),
            None => format!("Failed to fetch from Subgraph '{service}' at Path '{response_path}'."),
        };
        let mut extensions = Object::default();
        if !raw_errors.is_empty() {
            extensions.insert("errors", Value::Array(raw_errors.to_vec()));
        }
        if self.attach_service_name {
            extensions.insert("serviceName", service.into());
        }
        if self.attach_status_code
            && let Some(status_code) = status_code
        {
            extensions.insert("statusCode", status_code.into());
        }
        graphql::Error::builder()
            .message(message)
            .path(Path::from_response_path(response_path))
            .extensions(extensions)
            .build()
    }

    fn forward(
        &self,
        raw: &Value,
        service: &str,
        status_code: Option<u16>,
        response_path: &str,
    ) -> graphql::Error {
        let mut error = graphql::Error::from_value(raw).unwrap_or_else(|| {
            graphql::Error::builder()
                .message(String::from("unknown error"))
                .build()
        });
        if self.omit_locations {
            error.locations.clear();
        }
        if self.omit_extensions {
            error.extensions.clear();
        } else if let Some(allowed) = &self.allowed_extension_fields {
            error.extensions = std::mem::take(&mut error.extensions)
                .into_iter()
                .filter(|(key, _)| allowed.iter().any(|field| field == key.as_str()))
                .collect();
        }
        if let Some(code) = &self.default_extension_code
            && !error.extensions.contains_key("code")
        {
            error.extensions.insert("code", code.as_str().into());
        }
        if self.attach_service_name {
            error.extensions.insert("serviceName", service.into());
        }
        if self.attach_status_code
            && let Some(status_code) = status_code
        {
            error.extensions.insert("statusCode", status_code.into());
        }
        if error.path.is_none() && !response_path.is_empty() {
            error.path = Some(Path::from_response_path(response_path));
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    fn raw_errors() -> Vec<Value> {
        vec![
            json!({"message": "cannot resolve price", "extensions": {"code": "PRICE", "debug": "x"}}),
            json!({"message": "upstream timeout"}),
        ]
    }

    #[test]
    fn wrap_mode_produces_one_parent_error() {
        let propagation = ErrorPropagation {
            attach_status_code: true,
            ..Default::default()
        };
        let errors = propagation.transform(&raw_errors(), "products", Some(200), "query.product");
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].message,
            "Failed to fetch from Subgraph 'products' at Path 'query.product'."
        );
        assert_eq!(
            errors[0].extensions.get("errors"),
            Some(&Value::Array(raw_errors()))
        );
        assert_eq!(errors[0].extensions.get("statusCode"), Some(&json!(200)));
        // the raw errors stay untouched, only the parent is annotated
        assert!(raw_errors()[0].get("serviceName").is_none());
    }

    #[test]
    fn wrap_with_reason_extends_the_message() {
        let propagation = ErrorPropagation::default();
        let error = propagation.wrap(&[], "products", None, "query.product", Some("empty response"));
        assert_eq!(
            error.message,
            "Failed to fetch from Subgraph 'products' at Path 'query.product', Reason: empty response."
        );
        assert!(error.extensions.get("errors").is_none());
    }

    #[test]
    fn pass_through_forwards_each_error() {
        let propagation = ErrorPropagation {
            mode: PropagationMode::PassThrough,
            attach_service_name: true,
            default_extension_code: Some("SUBGRAPH_ERROR".to_string()),
            allowed_extension_fields: Some(vec!["code".to_string()]),
            ..Default::default()
        };
        let errors = propagation.transform(&raw_errors(), "products", None, "query.product");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "cannot resolve price");
        // "debug" filtered out, "code" kept
        assert_eq!(errors[0].extensions.get("code"), Some(&json!("PRICE")));
        assert!(errors[0].extensions.get("debug").is_none());
        assert_eq!(
            errors[0].extensions.get("serviceName"),
            Some(&json!("products"))
        );
        // second error had no code, so the default is injected
        assert_eq!(
            errors[1].extensions.get("code"),
            Some(&json!("SUBGRAPH_ERROR"))
        );
        assert_eq!(
            errors[1].path.as_ref().map(ToString::to_string).as_deref(),
            Some("query.product")
        );
    }

    #[test]
    fn http_error_conversion_attaches_status() {
        let error = FetchError::SubrequestHttpError {
            status_code: Some(502),
            service: "reviews".to_string(),
            reason: "connection reset".to_string(),
        };
        let graphql_error = error.to_graphql_error(None);
        assert_eq!(
            graphql_error.message,
            "HTTP fetch failed from 'reviews': connection reset"
        );
        assert_eq!(
            graphql_error.extensions.get("code"),
            Some(&json!("SUBREQUEST_HTTP_ERROR"))
        );
        assert_eq!(
            graphql_error.extensions.get("http"),
            Some(&json!({"status": 502}))
        );
    }
}
