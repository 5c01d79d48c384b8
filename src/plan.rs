//! The fetch tree: the executable plan shape produced by a query planner
//! and consumed by the [`crate::loader`].

use std::fmt;
use std::fmt::Write;

use serde::Deserialize;
use serde::Serialize;

use crate::cache::CacheConfig;
use crate::template::InputTemplate;

/// GraphQL operation type, which the executor needs to decide on
/// pre-fetch authorization and single-flight eligibility.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

/// A `Type.field` coordinate in the federated graph. Root-field
/// coordinates identify "similar" fetches for buffer-size estimation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphCoordinate {
    pub type_name: String,
    pub field_name: String,
}

impl fmt::Display for GraphCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_name, self.field_name)
    }
}

/// Identity of the backing data source (subgraph).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataSourceInfo {
    pub id: String,
    pub name: String,
}

/// Static information about one fetch, known at plan time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchInfo {
    pub data_source: DataSourceInfo,
    pub root_fields: Vec<GraphCoordinate>,
    pub operation_kind: OperationKind,
}

/// Post-processing applied to a subrequest response before merging.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessing {
    /// Path to the payload inside the response (e.g. `["data", "_entities"]`).
    pub select_response_data_path: Vec<String>,
    /// Path to the errors array inside the response (e.g. `["errors"]`).
    pub select_response_errors_path: Vec<String>,
    /// Keys below each target item under which the payload is merged.
    pub merge_path: Vec<String>,
    /// Optional reshaping template applied to the selected payload before
    /// merging. For batch fetches it runs once per target, over the group
    /// of batch elements mapped to that target.
    pub response_template: Option<InputTemplate>,
}

/// A root fetch: one subrequest, input rendered from variables (and at
/// most one selected item), response merged into the target item(s).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleFetch {
    pub info: FetchInfo,
    pub input: InputTemplate,
    pub post_processing: PostProcessing,
}

/// Rendering configuration for one entity representation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityInput {
    pub header: InputTemplate,
    pub item: InputTemplate,
    pub footer: InputTemplate,
    /// Replace an unrenderable item with `null` instead of failing the fetch.
    pub skip_err_item: bool,
}

/// Rendering configuration for a deduplicated batch of representations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchInput {
    pub header: InputTemplate,
    pub item: InputTemplate,
    pub separator: InputTemplate,
    pub footer: InputTemplate,
    /// Drop items that rendered to `null` from the batch.
    pub skip_null_items: bool,
    /// Drop items that rendered to `{}` from the batch.
    pub skip_empty_object_items: bool,
    /// Drop items that failed to render instead of failing the fetch.
    pub skip_err_items: bool,
}

/// An entity fetch: exactly one representation per fetch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityFetch {
    pub info: FetchInfo,
    pub input: EntityInput,
    pub post_processing: PostProcessing,
    pub cache: Option<CacheConfig>,
}

/// A batch entity fetch: representations for all selected items are
/// rendered, deduplicated by content, and sent as one subrequest.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchEntityFetch {
    pub info: FetchInfo,
    pub input: BatchInput,
    pub post_processing: PostProcessing,
    pub cache: Option<CacheConfig>,
}

/// Wraps an inner fetch that is instantiated once per selected array item;
/// all instances run concurrently.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelListItemFetch {
    pub fetch: SingleFetch,
}

/// The closed set of fetch kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Fetch {
    Single(SingleFetch),
    Entity(EntityFetch),
    BatchEntity(BatchEntityFetch),
    ParallelListItem(ParallelListItemFetch),
}

impl Fetch {
    pub fn info(&self) -> &FetchInfo {
        match self {
            Fetch::Single(fetch) => &fetch.info,
            Fetch::Entity(fetch) => &fetch.info,
            Fetch::BatchEntity(fetch) => &fetch.info,
            Fetch::ParallelListItem(fetch) => &fetch.fetch.info,
        }
    }

    pub fn post_processing(&self) -> &PostProcessing {
        match self {
            Fetch::Single(fetch) => &fetch.post_processing,
            Fetch::Entity(fetch) => &fetch.post_processing,
            Fetch::BatchEntity(fetch) => &fetch.post_processing,
            Fetch::ParallelListItem(fetch) => &fetch.fetch.post_processing,
        }
    }

    pub fn cache(&self) -> Option<&CacheConfig> {
        match self {
            Fetch::Entity(fetch) => fetch.cache.as_ref(),
            Fetch::BatchEntity(fetch) => fetch.cache.as_ref(),
            Fetch::Single(_) | Fetch::ParallelListItem(_) => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Fetch::Single(_) => "Fetch",
            Fetch::Entity(_) => "EntityFetch",
            Fetch::BatchEntity(_) => "BatchEntityFetch",
            Fetch::ParallelListItem(_) => "ParallelListItemFetch",
        }
    }
}

/// Whether a fetch path segment descends through an object field or an
/// array-valued field. Both flatten arrays into one item per element for
/// the following segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchPathKind {
    Object,
    Array,
}

/// One segment of the path from the document root to a fetch's target
/// items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPathElement {
    pub kind: FetchPathKind,
    pub path: Vec<String>,
}

/// An object-field path segment.
pub fn object_path<const N: usize>(path: [&str; N]) -> FetchPathElement {
    FetchPathElement {
        kind: FetchPathKind::Object,
        path: path.iter().map(|s| s.to_string()).collect(),
    }
}

/// An array-field path segment.
pub fn array_path<const N: usize>(path: [&str; N]) -> FetchPathElement {
    FetchPathElement {
        kind: FetchPathKind::Array,
        path: path.iter().map(|s| s.to_string()).collect(),
    }
}

/// One positioned fetch of the tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchItem {
    pub fetch: Fetch,
    /// Path from the document root to the target items.
    pub fetch_path: Vec<FetchPathElement>,
    /// Dotted, user-facing response path (`query.topProducts.@.reviews`),
    /// used to scope errors.
    pub response_path: String,
}

impl FetchItem {
    pub fn new(fetch: Fetch) -> Self {
        Self {
            fetch,
            fetch_path: Vec::new(),
            response_path: String::new(),
        }
    }

    pub fn with_path(
        fetch: Fetch,
        response_path: impl Into<String>,
        fetch_path: Vec<FetchPathElement>,
    ) -> Self {
        Self {
            fetch,
            fetch_path,
            response_path: response_path.into(),
        }
    }
}

/// A node of the fetch tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FetchTreeNode {
    Single(FetchItem),
    Sequence { children: Vec<FetchTreeNode> },
    Parallel { children: Vec<FetchTreeNode> },
}

/// Builds a [`FetchTreeNode::Sequence`].
pub fn sequence(children: Vec<FetchTreeNode>) -> FetchTreeNode {
    FetchTreeNode::Sequence { children }
}

/// Builds a [`FetchTreeNode::Parallel`].
pub fn parallel(children: Vec<FetchTreeNode>) -> FetchTreeNode {
    FetchTreeNode::Parallel { children }
}

/// Builds a leaf node for a top-level fetch.
pub fn single(fetch: Fetch) -> FetchTreeNode {
    FetchTreeNode::Single(FetchItem::new(fetch))
}

/// Builds a leaf node positioned at `response_path` / `fetch_path`.
pub fn single_with_path(
    fetch: Fetch,
    response_path: impl Into<String>,
    fetch_path: Vec<FetchPathElement>,
) -> FetchTreeNode {
    FetchTreeNode::Single(FetchItem::with_path(fetch, response_path, fetch_path))
}

impl FetchTreeNode {
    /// Render the tree as a human-readable plan, for diagnostics.
    pub fn query_plan(&self) -> String {
        let mut out = String::from("QueryPlan {\n");
        self.print(&mut out, 1);
        out.push('}');
        out
    }

    fn print(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        match self {
            FetchTreeNode::Single(item) => {
                let info = item.fetch.info();
                let _ = write!(out, "{indent}{}(service: '{}'", item.fetch.kind_name(), info.data_source.name);
                if !item.response_path.is_empty() {
                    let _ = write!(out, ", path: '{}'", item.response_path);
                }
                out.push_str(")\n");
            }
            FetchTreeNode::Sequence { children } => {
                let _ = writeln!(out, "{indent}Sequence {{");
                for child in children {
                    child.print(out, depth + 1);
                }
                let _ = writeln!(out, "{indent}}}");
            }
            FetchTreeNode::Parallel { children } => {
                let _ = writeln!(out, "{indent}Parallel {{");
                for child in children {
                    child.print(out, depth + 1);
                }
                let _ = writeln!(out, "{indent}}}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_fetch(name: &str) -> Fetch {
        Fetch::Single(SingleFetch {
            info: FetchInfo {
                data_source: DataSourceInfo {
                    id: format!("{name}-id"),
                    name: name.to_string(),
                },
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn prints_the_plan_tree() {
        let tree = sequence(vec![
            single(service_fetch("users")),
            parallel(vec![
                single_with_path(
                    service_fetch("products"),
                    "query.user.products",
                    vec![object_path(["user"]), array_path(["products"])],
                ),
                single(service_fetch("reviews")),
            ]),
        ]);
        assert_eq!(
            tree.query_plan(),
            "QueryPlan {\n\
             \x20 Sequence {\n\
             \x20   Fetch(service: 'users')\n\
             \x20   Parallel {\n\
             \x20     Fetch(service: 'products', path: 'query.user.products')\n\
             \x20     Fetch(service: 'reviews')\n\
             \x20   }\n\
             \x20 }\n\
             }"
        );
    }

    #[test]
    fn plan_round_trips_through_serde() {
        let tree = parallel(vec![single(service_fetch("users"))]);
        let encoded = serde_json::to_string(&tree).expect("serializes");
        let decoded: FetchTreeNode = serde_json::from_str(&encoded).expect("deserializes");
        assert_eq!(decoded, tree);
    }
}
