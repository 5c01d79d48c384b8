//! Execution core for federated query gateways.
//!
//! A query planner (outside this crate) compiles an operation into a
//! [`plan::FetchTreeNode`]: a tree of subgraph fetches with `Sequence` and
//! `Parallel` combinators. [`loader::Loader::execute`] walks that tree
//! against a shared response document, rendering subrequest inputs from
//! already-merged data, deduplicating identical in-flight subrequests,
//! consulting a two-tier entity cache, and merging every response back in
//! a deterministic order.
//!
//! The pieces:
//!
//! - [`plan`] — the fetch tree data model.
//! - [`loader`] — the executor and its external seams ([`loader::DataSource`],
//!   [`loader::Authorizer`], [`loader::RateLimiter`], [`loader::LoaderHooks`]).
//! - [`single_flight`] — in-flight subrequest deduplication and the
//!   response-size estimator.
//! - [`cache`] — the request-scoped L1 cache and the pluggable L2 store.
//! - [`template`] — input rendering.
//! - [`error`] — the error taxonomy and subgraph error propagation.
//! - [`graphql`] — the response envelope.
//! - [`json_ext`] — paths and merging over [`serde_json_bytes::Value`].

pub mod cache;
pub mod error;
pub mod graphql;
pub mod json_ext;
pub mod loader;
pub mod plan;
pub mod pool;
pub mod single_flight;
pub mod template;

pub use crate::cache::CacheConfig;
pub use crate::cache::CacheEntry;
pub use crate::cache::LoaderCache;
pub use crate::error::ErrorPropagation;
pub use crate::error::FetchError;
pub use crate::error::InternalError;
pub use crate::error::PropagationMode;
pub use crate::loader::Authorizer;
pub use crate::loader::DataSource;
pub use crate::loader::ExecutionResult;
pub use crate::loader::Loader;
pub use crate::loader::LoaderHooks;
pub use crate::loader::RateLimiter;
pub use crate::loader::Request;
pub use crate::plan::Fetch;
pub use crate::plan::FetchTreeNode;
pub use crate::single_flight::SingleFlight;
