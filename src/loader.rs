//! The fetch tree executor.
//!
//! [`Loader::execute`] walks a [`FetchTreeNode`] against a shared response
//! document. Every fetch goes through three phases:
//!
//! 1. *prepare* — select target items, render the subrequest body, consult
//!    the caches; reads the document, produces an owned [`FetchJob`].
//! 2. *load* — gating, single-flight, the actual [`DataSource`] call;
//!    no document access, so jobs of one `Parallel` node run concurrently.
//! 3. *merge* — splice the outcome into the document and the error lists,
//!    strictly in declared order, so the result is deterministic given a
//!    fixed plan and fixed subgraph responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use futures::future::BoxFuture;
use futures::future::join_all;
use serde_json_bytes::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cache::CacheConfig;
use crate::cache::CacheEntry;
use crate::cache::L1Cache;
use crate::cache::LoaderCache;
use crate::error::BoxError;
use crate::error::ErrorPropagation;
use crate::error::FetchError;
use crate::error::InternalError;
use crate::error::RateLimitError;
use crate::error::SubgraphError;
use crate::graphql;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::ValueExt;
use crate::plan::BatchEntityFetch;
use crate::plan::EntityFetch;
use crate::plan::Fetch;
use crate::plan::FetchInfo;
use crate::plan::FetchItem;
use crate::plan::FetchPathElement;
use crate::plan::FetchTreeNode;
use crate::plan::OperationKind;
use crate::plan::SingleFetch;
use crate::pool::BufferPool;
use crate::single_flight::Flight;
use crate::single_flight::FlightResponse;
use crate::single_flight::SingleFlight;
use crate::template::InputTemplate;

pub(crate) const SEQUENCE_SPAN_NAME: &str = "sequence";
pub(crate) const PARALLEL_SPAN_NAME: &str = "parallel";
pub(crate) const FETCH_SPAN_NAME: &str = "fetch";

/// One network/backend capability. Implementations execute a single
/// subrequest and write the raw JSON reply into `out`.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Returns the transport status code, when the transport has one.
    async fn load(&self, input: &[u8], out: &mut BytesMut) -> Result<Option<u16>, BoxError>;
}

/// Pre-fetch authorization check. Only mutations are gated here; queries
/// are filtered post-hoc outside this core.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// The deny reason, or `None` to allow the fetch.
    async fn authorize(&self, info: &FetchInfo) -> Option<String>;
}

/// Pre-fetch rate-limit check.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// The deny reason, or `None` to allow the fetch.
    async fn limit(&self, info: &FetchInfo) -> Option<String>;
}

/// Observability hooks bracketing every data source call. The value
/// returned by [`on_load`](Self::on_load) is handed back, opaque, to
/// [`on_finished`](Self::on_finished).
#[async_trait]
pub trait LoaderHooks: Send + Sync {
    async fn on_load(&self, data_source: &crate::plan::DataSourceInfo) -> Value;

    async fn on_finished(
        &self,
        state: Value,
        status_code: Option<u16>,
        data_source: &crate::plan::DataSourceInfo,
        error: Option<&str>,
    );
}

/// One request to execute a fetch tree.
#[derive(Default)]
pub struct Request {
    /// The GraphQL request variables, available to every input template.
    pub variables: Object,
    /// Hash over the forwarded request headers; part of the exact
    /// single-flight key so requests with different headers never share a
    /// flight.
    pub header_hash: u64,
    /// Pre-resolved root data, if any; fetches merge into it.
    pub initial_data: Value,
    /// Cancelling this token aborts every outstanding subrequest.
    pub cancellation: CancellationToken,
}

#[buildstructor::buildstructor]
impl Request {
    #[builder(visibility = "pub")]
    fn new(
        variables: Option<Object>,
        header_hash: Option<u64>,
        initial_data: Option<Value>,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        Self {
            variables: variables.unwrap_or_default(),
            header_hash: header_hash.unwrap_or_default(),
            initial_data: initial_data.unwrap_or_default(),
            cancellation: cancellation.unwrap_or_default(),
        }
    }
}

/// The outcome of one executed request.
#[derive(Debug)]
pub struct ExecutionResult {
    /// The client-facing response: merged data and transformed errors.
    pub response: graphql::Response,
    /// Structured errors for logging, independent of the client response.
    pub internal_errors: Vec<InternalError>,
}

/// The fetch tree executor. One instance serves many requests; the
/// single-flight map and the L2 cache are shared across them, everything
/// else is request-scoped.
pub struct Loader {
    data_sources: HashMap<String, Arc<dyn DataSource>>,
    single_flight: Arc<SingleFlight>,
    l2_cache: Option<Arc<dyn LoaderCache>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    hooks: Option<Arc<dyn LoaderHooks>>,
    propagation: ErrorPropagation,
    pool: BufferPool,
}

#[buildstructor::buildstructor]
impl Loader {
    /// Returns a builder for a [`Loader`].
    ///
    /// Data sources are registered by data source id with
    /// `.data_source(id, source)`.
    #[builder(visibility = "pub")]
    fn new(
        data_sources: HashMap<String, Arc<dyn DataSource>>,
        single_flight: Option<Arc<SingleFlight>>,
        cache: Option<Arc<dyn LoaderCache>>,
        authorizer: Option<Arc<dyn Authorizer>>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        hooks: Option<Arc<dyn LoaderHooks>>,
        propagation: Option<ErrorPropagation>,
    ) -> Self {
        Self {
            data_sources,
            single_flight: single_flight.unwrap_or_default(),
            l2_cache: cache,
            authorizer,
            rate_limiter,
            hooks,
            propagation: propagation.unwrap_or_default(),
            pool: BufferPool::new(),
        }
    }
}

/// Request-scoped, shareable context: readable from concurrent load tasks.
struct RequestCtx {
    variables: Object,
    header_hash: u64,
    l1: L1Cache,
}

/// Request-scoped mutable state: only touched between loads, never during.
struct DocState {
    doc: Value,
    errors: Vec<graphql::Error>,
    internal: Vec<InternalError>,
}

/// What `prepare` decided to do for one fetch.
enum JobAction {
    /// Perform the subrequest with this rendered body.
    Call(Bytes),
    /// Nothing to send: all representations were cached or skipped.
    Skipped,
    /// The fetch already failed before any subrequest (render error,
    /// unknown data source).
    Failed(FetchError),
}

/// Splicing info for entity/batch fetches.
struct BatchPlan {
    /// Per target: slots into the deduplicated batch; `None` is the skip
    /// sentinel and resolves to null.
    stats: Vec<Vec<Option<usize>>>,
    /// Per target: the usable cached value, bypassing the batch entirely.
    cached: Vec<Option<Value>>,
    /// Per batch index: the entity cache key, for write-back.
    keys: Vec<Option<String>>,
    /// L2 time to live; `None` disables the L2 write-back.
    ttl: Option<Duration>,
}

/// One fully prepared fetch, ready to load without document access.
struct FetchJob {
    info: FetchInfo,
    response_path: String,
    post_processing: crate::plan::PostProcessing,
    /// An empty fetch path addresses the document root. Distinct from a
    /// non-empty path that selected no items, which merges nothing.
    top_level: bool,
    targets: Vec<Path>,
    batch: Option<BatchPlan>,
    action: JobAction,
}

/// The load-phase outcome of one job.
enum JobOutcome {
    Response {
        status_code: Option<u16>,
        data: Value,
        raw_errors: Vec<Value>,
    },
    Failed(FetchError),
    Skipped,
}

impl Loader {
    /// Execute a fetch tree. Individual fetch failures surface as response
    /// errors; only unexecutable plans fail the whole call.
    pub async fn execute(
        &self,
        tree: &FetchTreeNode,
        request: Request,
    ) -> Result<ExecutionResult, FetchError> {
        let ctx = RequestCtx {
            variables: request.variables,
            header_hash: request.header_hash,
            l1: L1Cache::new(),
        };
        let mut state = DocState {
            doc: request.initial_data,
            errors: Vec::new(),
            internal: Vec::new(),
        };
        self.execute_node(tree, &ctx, &mut state, &request.cancellation)
            .await?;
        Ok(ExecutionResult {
            response: graphql::Response {
                data: state.doc,
                errors: state.errors,
            },
            internal_errors: state.internal,
        })
    }

    fn execute_node<'a>(
        &'a self,
        node: &'a FetchTreeNode,
        ctx: &'a RequestCtx,
        state: &'a mut DocState,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), FetchError>> {
        match node {
            FetchTreeNode::Single(item) => Box::pin(
                self.execute_fetch_item(item, ctx, state, token)
                    .instrument(tracing::info_span!(
                        FETCH_SPAN_NAME,
                        service = item.fetch.info().data_source.name.as_str(),
                    )),
            ),
            FetchTreeNode::Sequence { children } => Box::pin(
                async move {
                    for child in children {
                        self.execute_node(child, ctx, &mut *state, token).await?;
                    }
                    Ok(())
                }
                .instrument(tracing::info_span!(SEQUENCE_SPAN_NAME)),
            ),
            FetchTreeNode::Parallel { children } => Box::pin(
                async move {
                    let mut jobs = Vec::with_capacity(children.len());
                    for child in children {
                        let FetchTreeNode::Single(item) = child else {
                            return Err(FetchError::MalformedPlan {
                                reason: "sequence and parallel nodes must not nest inside \
                                         a parallel node"
                                    .to_string(),
                            });
                        };
                        jobs.extend(self.prepare_jobs(item, ctx, &state.doc).await);
                    }
                    // children start unordered
                    let outcomes = join_all(jobs.iter().map(|job| {
                        let span = tracing::info_span!(
                            FETCH_SPAN_NAME,
                            service = job.info.data_source.name.as_str(),
                        );
                        self.load(job, ctx, token).instrument(span)
                    }))
                    .await;
                    // merge strictly in declared order
                    for (job, outcome) in jobs.into_iter().zip(outcomes) {
                        self.merge(job, outcome, ctx, state);
                    }
                    Ok(())
                }
                .instrument(tracing::info_span!(PARALLEL_SPAN_NAME)),
            ),
        }
    }

    async fn execute_fetch_item(
        &self,
        item: &FetchItem,
        ctx: &RequestCtx,
        state: &mut DocState,
        token: &CancellationToken,
    ) -> Result<(), FetchError> {
        let jobs = self.prepare_jobs(item, ctx, &state.doc).await;
        let outcomes = join_all(jobs.iter().map(|job| self.load(job, ctx, token))).await;
        for (job, outcome) in jobs.into_iter().zip(outcomes) {
            self.merge(job, outcome, ctx, state);
        }
        Ok(())
    }

    // ---- phase 1: prepare ----

    /// A fetch item usually prepares to one job; a list-item fetch fans
    /// out into one job per selected item, all loaded concurrently.
    async fn prepare_jobs(&self, item: &FetchItem, ctx: &RequestCtx, doc: &Value) -> Vec<FetchJob> {
        let targets = select_targets(doc, &item.fetch_path);
        match &item.fetch {
            Fetch::Single(fetch) => vec![self.prepare_single(fetch, item, targets, doc, ctx)],
            Fetch::ParallelListItem(list_fetch) => targets
                .into_iter()
                .map(|target| {
                    self.prepare_single(&list_fetch.fetch, item, vec![target], doc, ctx)
                })
                .collect(),
            Fetch::Entity(fetch) => {
                vec![self.prepare_entity(fetch, item, targets, doc, ctx).await]
            }
            Fetch::BatchEntity(fetch) => {
                vec![self.prepare_batch(fetch, item, targets, doc, ctx).await]
            }
        }
    }

    fn prepare_single(
        &self,
        fetch: &SingleFetch,
        item: &FetchItem,
        targets: Vec<Path>,
        doc: &Value,
        ctx: &RequestCtx,
    ) -> FetchJob {
        let item_value = match targets.len() {
            0 => None,
            1 => doc.get_path(&targets[0]).cloned(),
            _ => Some(Value::Array(
                targets
                    .iter()
                    .map(|target| doc.get_path(target).cloned().unwrap_or(Value::Null))
                    .collect(),
            )),
        };
        let action = match self.render_body(&fetch.input, item_value.as_ref(), ctx) {
            Ok(body) => JobAction::Call(body),
            Err(reason) => JobAction::Failed(FetchError::MalformedFetchInput {
                service: fetch.info.data_source.name.clone(),
                reason,
            }),
        };
        FetchJob {
            info: fetch.info.clone(),
            response_path: item.response_path.clone(),
            post_processing: fetch.post_processing.clone(),
            top_level: item.fetch_path.is_empty(),
            targets,
            batch: None,
            action,
        }
    }

    async fn prepare_entity(
        &self,
        fetch: &EntityFetch,
        item: &FetchItem,
        mut targets: Vec<Path>,
        doc: &Value,
        ctx: &RequestCtx,
    ) -> FetchJob {
        // an entity fetch addresses exactly one representation
        targets.truncate(1);
        if targets.is_empty() {
            return self.empty_job(item, &fetch.info, &fetch.post_processing);
        }
        let representation = doc.get_path(&targets[0]).cloned().unwrap_or(Value::Null);
        let rendered = match fetch
            .input
            .item
            .render_to_string(Some(&representation), &ctx.variables)
        {
            Ok(rendered) => rendered,
            Err(error) if fetch.input.skip_err_item => {
                tracing::debug!(%error, "skipping unrenderable entity representation");
                return self.empty_job(item, &fetch.info, &fetch.post_processing);
            }
            Err(error) => {
                return self.failed_job(
                    item,
                    &fetch.info,
                    &fetch.post_processing,
                    targets,
                    FetchError::MalformedFetchInput {
                        service: fetch.info.data_source.name.clone(),
                        reason: error.to_string(),
                    },
                );
            }
        };
        // a null or empty representation cannot identify an entity
        if rendered == "null" || rendered == "{}" {
            return self.empty_job(item, &fetch.info, &fetch.post_processing);
        }

        let mut plan = BatchPlan {
            stats: vec![vec![Some(0)]],
            cached: vec![None],
            keys: vec![None],
            ttl: fetch.cache.as_ref().map(CacheConfig::ttl),
        };
        if let Some(cache) = &fetch.cache {
            match cache.cache_key(Some(&representation), &ctx.variables) {
                Ok(key) => {
                    if cache.partial_load
                        && let Some(cached) = self.cache_lookup(cache, &key, ctx).await
                    {
                        plan.cached[0] = Some(cached);
                        plan.stats[0].clear();
                        return FetchJob {
                            info: fetch.info.clone(),
                            response_path: item.response_path.clone(),
                            post_processing: fetch.post_processing.clone(),
                            top_level: item.fetch_path.is_empty(),
                            targets,
                            batch: Some(plan),
                            action: JobAction::Skipped,
                        };
                    }
                    plan.keys[0] = Some(key);
                }
                Err(error) => {
                    tracing::debug!(%error, "entity cache key did not render, bypassing cache");
                }
            }
        }

        let action = match self.render_wrapped_body(
            &fetch.input.header,
            &fetch.input.footer,
            None,
            &[rendered],
            ctx,
        ) {
            Ok(body) => JobAction::Call(body),
            Err(reason) => JobAction::Failed(FetchError::MalformedFetchInput {
                service: fetch.info.data_source.name.clone(),
                reason,
            }),
        };
        FetchJob {
            info: fetch.info.clone(),
            response_path: item.response_path.clone(),
            post_processing: fetch.post_processing.clone(),
            top_level: item.fetch_path.is_empty(),
            targets,
            batch: Some(plan),
            action,
        }
    }

    async fn prepare_batch(
        &self,
        fetch: &BatchEntityFetch,
        item: &FetchItem,
        targets: Vec<Path>,
        doc: &Value,
        ctx: &RequestCtx,
    ) -> FetchJob {
        if targets.is_empty() {
            return self.empty_job(item, &fetch.info, &fetch.post_processing);
        }
        let representations: Vec<Value> = targets
            .iter()
            .map(|target| doc.get_path(target).cloned().unwrap_or(Value::Null))
            .collect();

        let mut stats: Vec<Vec<Option<usize>>> = Vec::with_capacity(targets.len());
        let mut cached: Vec<Option<Value>> = vec![None; targets.len()];
        let mut batch_items: Vec<String> = Vec::new();
        let mut keys: Vec<Option<String>> = Vec::new();
        let mut index_by_content: HashMap<String, usize> = HashMap::new();

        // cache lookups happen per representation, before dedup, so the
        // rendered body and the single-flight key only cover the misses
        for (target_index, representation) in representations.iter().enumerate() {
            let rendered = match fetch
                .input
                .item
                .render_to_string(Some(representation), &ctx.variables)
            {
                Ok(rendered) => rendered,
                Err(error) if fetch.input.skip_err_items => {
                    tracing::debug!(%error, "skipping unrenderable batch representation");
                    stats.push(vec![None]);
                    continue;
                }
                Err(error) => {
                    return self.failed_job(
                        item,
                        &fetch.info,
                        &fetch.post_processing,
                        targets,
                        FetchError::MalformedFetchInput {
                            service: fetch.info.data_source.name.clone(),
                            reason: error.to_string(),
                        },
                    );
                }
            };
            if (fetch.input.skip_null_items && rendered == "null")
                || (fetch.input.skip_empty_object_items && rendered == "{}")
            {
                stats.push(vec![None]);
                continue;
            }

            let mut cache_key = None;
            if let Some(cache) = &fetch.cache {
                match cache.cache_key(Some(representation), &ctx.variables) {
                    Ok(key) => {
                        if cache.partial_load
                            && let Some(value) = self.cache_lookup(cache, &key, ctx).await
                        {
                            cached[target_index] = Some(value);
                            stats.push(Vec::new());
                            continue;
                        }
                        cache_key = Some(key);
                    }
                    Err(error) => {
                        tracing::debug!(%error, "entity cache key did not render, bypassing cache");
                    }
                }
            }

            // content-hash dedup: identical representations share one slot
            let batch_index = match index_by_content.get(&rendered) {
                Some(index) => *index,
                None => {
                    let index = batch_items.len();
                    index_by_content.insert(rendered.clone(), index);
                    batch_items.push(rendered);
                    keys.push(cache_key);
                    index
                }
            };
            stats.push(vec![Some(batch_index)]);
        }

        let plan = BatchPlan {
            stats,
            cached,
            keys,
            ttl: fetch.cache.as_ref().map(CacheConfig::ttl),
        };
        if batch_items.is_empty() {
            // everything was cached or skipped
            return FetchJob {
                info: fetch.info.clone(),
                response_path: item.response_path.clone(),
                post_processing: fetch.post_processing.clone(),
                top_level: item.fetch_path.is_empty(),
                targets,
                batch: Some(plan),
                action: JobAction::Skipped,
            };
        }
        let action = match self.render_wrapped_body(
            &fetch.input.header,
            &fetch.input.footer,
            Some(&fetch.input.separator),
            &batch_items,
            ctx,
        ) {
            Ok(body) => JobAction::Call(body),
            Err(reason) => JobAction::Failed(FetchError::MalformedFetchInput {
                service: fetch.info.data_source.name.clone(),
                reason,
            }),
        };
        FetchJob {
            info: fetch.info.clone(),
            response_path: item.response_path.clone(),
            post_processing: fetch.post_processing.clone(),
            top_level: item.fetch_path.is_empty(),
            targets,
            batch: Some(plan),
            action,
        }
    }

    /// L1 first, then L2. A hit is usable only if it satisfies the fetch's
    /// provided field shape; a usable L2 hit is promoted into L1.
    async fn cache_lookup(&self, cache: &CacheConfig, key: &str, ctx: &RequestCtx) -> Option<Value> {
        if let Some(value) = ctx.l1.get(key) {
            if cache.satisfied_by(&value) {
                return Some(value);
            }
            return None;
        }
        let l2 = self.l2_cache.as_ref()?;
        let keys = vec![key.to_string()];
        match l2.get(&keys).await {
            Ok(mut entries) => {
                let bytes = entries.pop().flatten()?;
                let value = Value::from_bytes(bytes).ok()?;
                if cache.satisfied_by(&value) {
                    ctx.l1.insert(key.to_string(), value.clone());
                    return Some(value);
                }
                None
            }
            Err(error) => {
                tracing::warn!(%error, "entity cache lookup failed, treating as miss");
                None
            }
        }
    }

    fn render_body(
        &self,
        input: &InputTemplate,
        item: Option<&Value>,
        ctx: &RequestCtx,
    ) -> Result<Bytes, String> {
        let mut buffer = self.pool.acquire(0);
        input
            .render(item, &ctx.variables, &mut buffer)
            .map_err(|error| error.to_string())?;
        Ok(buffer.freeze())
    }

    fn render_wrapped_body(
        &self,
        header: &InputTemplate,
        footer: &InputTemplate,
        separator: Option<&InputTemplate>,
        items: &[String],
        ctx: &RequestCtx,
    ) -> Result<Bytes, String> {
        let mut buffer = self.pool.acquire(0);
        header
            .render(None, &ctx.variables, &mut buffer)
            .map_err(|error| error.to_string())?;
        for (index, item) in items.iter().enumerate() {
            if index > 0 {
                match separator {
                    Some(separator) if !separator.is_empty() => separator
                        .render(None, &ctx.variables, &mut buffer)
                        .map_err(|error| error.to_string())?,
                    _ => buffer.put_slice(b","),
                }
            }
            buffer.put_slice(item.as_bytes());
        }
        footer
            .render(None, &ctx.variables, &mut buffer)
            .map_err(|error| error.to_string())?;
        Ok(buffer.freeze())
    }

    fn empty_job(
        &self,
        item: &FetchItem,
        info: &FetchInfo,
        post_processing: &crate::plan::PostProcessing,
    ) -> FetchJob {
        FetchJob {
            info: info.clone(),
            response_path: item.response_path.clone(),
            post_processing: post_processing.clone(),
            top_level: item.fetch_path.is_empty(),
            targets: Vec::new(),
            batch: None,
            action: JobAction::Skipped,
        }
    }

    fn failed_job(
        &self,
        item: &FetchItem,
        info: &FetchInfo,
        post_processing: &crate::plan::PostProcessing,
        targets: Vec<Path>,
        error: FetchError,
    ) -> FetchJob {
        FetchJob {
            info: info.clone(),
            response_path: item.response_path.clone(),
            post_processing: post_processing.clone(),
            top_level: item.fetch_path.is_empty(),
            targets,
            batch: None,
            action: JobAction::Failed(error),
        }
    }

    // ---- phase 2: load ----

    async fn load(&self, job: &FetchJob, ctx: &RequestCtx, token: &CancellationToken) -> JobOutcome {
        let body = match &job.action {
            JobAction::Call(body) => body.clone(),
            JobAction::Skipped => return JobOutcome::Skipped,
            JobAction::Failed(error) => return JobOutcome::Failed(error.clone()),
        };
        let info = &job.info;
        let service = &info.data_source.name;

        // pre-fetch gating; a deny skips the subrequest but still produces
        // a response error at merge time
        if info.operation_kind != OperationKind::Query
            && let Some(authorizer) = &self.authorizer
            && let Some(reason) = authorizer.authorize(info).await
        {
            return JobOutcome::Failed(FetchError::AuthorizationRejected {
                service: service.clone(),
                reason,
            });
        }
        if let Some(rate_limiter) = &self.rate_limiter
            && let Some(reason) = rate_limiter.limit(info).await
        {
            return JobOutcome::Failed(FetchError::RateLimitRejected {
                service: service.clone(),
                reason,
            });
        }

        let hook_state = match &self.hooks {
            Some(hooks) => Some(hooks.on_load(&info.data_source).await),
            None => None,
        };

        // mutations have side effects and never share a flight
        let outcome = if info.operation_kind == OperationKind::Query {
            let keys =
                self.single_flight
                    .keys(&info.data_source.id, &body, ctx.header_hash, &info.root_fields);
            match self.single_flight.get_or_create(keys).await {
                Flight::Leader(leader) => {
                    let outcome = self
                        .subrequest(info, &body, self.single_flight.size_hint(&keys), token)
                        .await;
                    leader.finish(outcome.clone());
                    outcome
                }
                Flight::Follower(outcome) => outcome,
            }
        } else {
            self.subrequest(info, &body, 0, token).await
        };

        let status_code = outcome.as_ref().ok().and_then(|response| response.status_code);
        if let Some(hooks) = &self.hooks {
            hooks
                .on_finished(
                    hook_state.unwrap_or(Value::Null),
                    status_code,
                    &info.data_source,
                    outcome.as_ref().err().map(String::as_str),
                )
                .await;
        }

        match outcome {
            Err(reason) => JobOutcome::Failed(FetchError::SubrequestHttpError {
                status_code: None,
                service: service.clone(),
                reason,
            }),
            Ok(response) => {
                let outcome = self.parse_response(job, response);
                self.l2_write_back(job, &outcome).await;
                outcome
            }
        }
    }

    async fn subrequest(
        &self,
        info: &FetchInfo,
        body: &Bytes,
        size_hint: usize,
        token: &CancellationToken,
    ) -> Result<FlightResponse, String> {
        let Some(source) = self.data_sources.get(&info.data_source.id) else {
            return Err(format!(
                "no data source registered for '{}'",
                info.data_source.id
            ));
        };
        let mut out = self.pool.acquire(size_hint);
        let result = tokio::select! {
            _ = token.cancelled() => return Err("subrequest was cancelled".to_string()),
            result = source.load(body, &mut out) => result,
        };
        match result {
            Ok(status_code) => Ok(FlightResponse {
                status_code,
                body: out.freeze(),
            }),
            Err(error) => Err(error.to_string()),
        }
    }

    fn parse_response(&self, job: &FetchJob, response: FlightResponse) -> JobOutcome {
        let service = &job.info.data_source.name;
        if response.body.is_empty() {
            return JobOutcome::Failed(FetchError::SubrequestMalformedResponse {
                service: service.clone(),
                reason: "empty response".to_string(),
            });
        }
        let value = match Value::from_bytes(response.body.clone()) {
            Ok(value) => value,
            Err(_) => {
                return JobOutcome::Failed(FetchError::SubrequestMalformedResponse {
                    service: service.clone(),
                    reason: "response is not valid JSON".to_string(),
                });
            }
        };
        let raw_errors = value_at(&value, &job.post_processing.select_response_errors_path)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let data_path = &job.post_processing.select_response_data_path;
        let data = if data_path.is_empty() {
            Some(&value)
        } else {
            value_at(&value, data_path)
        };
        let data_missing = !matches!(data, Some(data) if !data.is_null());
        if !data_path.is_empty() && data_missing && raw_errors.is_empty() {
            return JobOutcome::Failed(FetchError::SubrequestMalformedResponse {
                service: service.clone(),
                reason: "no data or errors found in response".to_string(),
            });
        }
        JobOutcome::Response {
            status_code: response.status_code,
            data: data.cloned().unwrap_or(Value::Null),
            raw_errors,
        }
    }

    /// Write every fetched entity to L2 with the fetch's TTL. Failures are
    /// logged, never surfaced: the cache is an optimization.
    async fn l2_write_back(&self, job: &FetchJob, outcome: &JobOutcome) {
        let (Some(plan), Some(ttl), Some(l2)) = (
            &job.batch,
            job.batch.as_ref().and_then(|plan| plan.ttl),
            &self.l2_cache,
        ) else {
            return;
        };
        let JobOutcome::Response { data, .. } = outcome else {
            return;
        };
        let batch = batch_values(data);
        let entries: Vec<CacheEntry> = plan
            .keys
            .iter()
            .enumerate()
            .filter_map(|(index, key)| {
                let key = key.clone()?;
                let entity = batch.get(index)?;
                let value = serde_json::to_vec(entity).ok()?;
                Some(CacheEntry {
                    key,
                    value: Bytes::from(value),
                })
            })
            .collect();
        if entries.is_empty() {
            return;
        }
        if let Err(error) = l2.set(entries, ttl).await {
            tracing::warn!(%error, "entity cache write-back failed");
        }
    }

    // ---- phase 3: merge ----

    fn merge(&self, job: FetchJob, outcome: JobOutcome, ctx: &RequestCtx, state: &mut DocState) {
        let service = job.info.data_source.name.clone();
        let response_path = job.response_path.clone();
        match outcome {
            JobOutcome::Skipped => {
                // all-cached batches still have their cached values to splice
                if job.batch.as_ref().is_some_and(|plan| {
                    plan.cached.iter().any(Option::is_some)
                }) {
                    self.splice(job, Value::Null, ctx, state);
                }
            }
            JobOutcome::Failed(error) => {
                let status_code = match &error {
                    FetchError::SubrequestHttpError { status_code, .. } => *status_code,
                    _ => None,
                };
                let reason = failure_reason(&error);
                state.errors.push(self.propagation.wrap(
                    &[],
                    &service,
                    status_code,
                    &response_path,
                    Some(&reason),
                ));
                state.internal.push(match &error {
                    FetchError::RateLimitRejected { reason, .. } => {
                        InternalError::RateLimit(RateLimitError {
                            data_source: job.info.data_source.clone(),
                            path: response_path,
                            reason: reason.clone(),
                        })
                    }
                    _ => InternalError::Subgraph(SubgraphError {
                        data_source: job.info.data_source.clone(),
                        path: response_path,
                        reason,
                        status_code,
                        downstream_errors: Vec::new(),
                    }),
                });
                // target items stay untouched; they resolve to null downstream
            }
            JobOutcome::Response {
                status_code,
                data,
                raw_errors,
            } => {
                if !raw_errors.is_empty() {
                    state.errors.extend(self.propagation.transform(
                        &raw_errors,
                        &service,
                        status_code,
                        &response_path,
                    ));
                    state.internal.push(InternalError::Subgraph(SubgraphError {
                        data_source: job.info.data_source.clone(),
                        path: response_path,
                        reason: "subgraph reported errors".to_string(),
                        status_code,
                        downstream_errors: raw_errors
                            .iter()
                            .filter_map(graphql::Error::from_value)
                            .collect(),
                    }));
                }
                self.splice(job, data, ctx, state);
            }
        }
    }

    fn splice(&self, job: FetchJob, data: Value, ctx: &RequestCtx, state: &mut DocState) {
        let merge_path = &job.post_processing.merge_path;
        let Some(plan) = &job.batch else {
            match job.targets.len() {
                // only a top-level fetch merges into the document root; a
                // non-empty fetch path that selected no items has nowhere
                // to put the response
                0 => {
                    if job.top_level {
                        state.doc.merge_at_path(merge_path, data);
                    }
                }
                1 => {
                    if let Some(target) = state.doc.get_path_mut(&job.targets[0]) {
                        target.merge_at_path(merge_path, data);
                    }
                }
                count => {
                    let Value::Array(elements) = data else {
                        state.errors.push(self.propagation.wrap(
                            &[],
                            &job.info.data_source.name,
                            None,
                            &job.response_path,
                            Some("expected a list response for multiple target items"),
                        ));
                        return;
                    };
                    let mut elements = elements.into_iter();
                    for target_path in job.targets.iter().take(count) {
                        let element = elements.next().unwrap_or(Value::Null);
                        if let Some(target) = state.doc.get_path_mut(target_path) {
                            target.merge_at_path(merge_path, element);
                        }
                    }
                }
            }
            return;
        };

        let batch = batch_values(&data);
        // fetched entities enter the request-scoped cache unconditionally
        for (index, key) in plan.keys.iter().enumerate() {
            if let (Some(key), Some(entity)) = (key, batch.get(index)) {
                ctx.l1.insert(key.clone(), entity.clone());
            }
        }
        for (target_index, target_path) in job.targets.iter().enumerate() {
            let value = if let Some(cached) = plan.cached.get(target_index).and_then(Clone::clone) {
                cached
            } else {
                let slots = plan.stats.get(target_index).cloned().unwrap_or_default();
                if slots.is_empty() {
                    continue;
                }
                let mut group: Vec<Value> = slots
                    .iter()
                    .map(|slot| {
                        slot.and_then(|index| batch.get(index).cloned())
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                match &job.post_processing.response_template {
                    Some(template) => {
                        let input = Value::Array(group);
                        match template
                            .render_to_string(Some(&input), &ctx.variables)
                            .map_err(|error| error.to_string())
                            .and_then(|rendered| {
                                serde_json::from_str(&rendered).map_err(|error| error.to_string())
                            }) {
                            Ok(value) => value,
                            Err(error) => {
                                state.errors.push(self.propagation.wrap(
                                    &[],
                                    &job.info.data_source.name,
                                    None,
                                    &job.response_path,
                                    Some(&format!("failed to render the response template: {error}")),
                                ));
                                continue;
                            }
                        }
                    }
                    None if group.len() == 1 => group.pop().unwrap_or(Value::Null),
                    None => Value::Array(group),
                }
            };
            if let Some(target) = state.doc.get_path_mut(target_path) {
                target.merge_at_path(merge_path, value);
            }
        }
    }
}

/// The short classifier appended as `Reason:` to failed-to-fetch errors.
fn failure_reason(error: &FetchError) -> String {
    match error {
        FetchError::MalformedFetchInput { reason, .. } => {
            format!("failed to render the fetch input: {reason}")
        }
        FetchError::SubrequestHttpError { reason, .. } => reason.clone(),
        FetchError::SubrequestMalformedResponse { reason, .. } => reason.clone(),
        FetchError::AuthorizationRejected { reason, .. } => {
            format!("not authorized: {reason}")
        }
        FetchError::RateLimitRejected { reason, .. } => {
            format!("rate limited: {reason}")
        }
        FetchError::MalformedPlan { reason } => reason.clone(),
    }
}

/// Interpret a response payload as a batch of entity values.
fn batch_values(data: &Value) -> Vec<Value> {
    match data {
        Value::Array(elements) => elements.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Navigate a response-selection path. String segments descend object
/// fields; numeric segments index arrays.
fn value_at<'v>(value: &'v Value, path: &[String]) -> Option<&'v Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(object) => object.get(segment.as_str())?,
            Value::Array(elements) => elements.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Map a fetch path to the concrete target item positions in the
/// document. An empty fetch path denotes a top-level fetch and selects no
/// items. Arrays encountered along the way are flattened into one item
/// per element.
fn select_targets(doc: &Value, fetch_path: &[FetchPathElement]) -> Vec<Path> {
    if fetch_path.is_empty() {
        return Vec::new();
    }
    let mut current = vec![Path::empty()];
    for element in fetch_path {
        let mut next = Vec::new();
        for base in current {
            let mut positions = vec![base];
            if element.path.is_empty() {
                let mut flattened = Vec::new();
                for position in positions {
                    flatten_into(doc, position, &mut flattened);
                }
                positions = flattened;
            }
            for key in &element.path {
                let mut descended = Vec::new();
                for position in positions {
                    let mut candidate = position;
                    candidate.push(PathElement::Key(key.clone()));
                    if doc.get_path(&candidate).is_some() {
                        flatten_into(doc, candidate, &mut descended);
                    }
                }
                positions = descended;
            }
            next.extend(positions);
        }
        current = next;
    }
    current
}

/// Expand a position into one position per array element, recursively, so
/// matrices flatten all the way down to their items.
fn flatten_into(doc: &Value, position: Path, out: &mut Vec<Path>) {
    match doc.get_path(&position) {
        Some(Value::Array(elements)) => {
            for index in 0..elements.len() {
                let mut child = position.clone();
                child.push(PathElement::Index(index));
                flatten_into(doc, child, out);
            }
        }
        Some(_) => out.push(position),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::plan::FetchPathKind;
    use crate::plan::object_path;

    #[test]
    fn select_targets_flattens_arrays() {
        let doc = json!({
            "user": {
                "products": [
                    {"id": 1, "variants": [{"sku": "a"}, {"sku": "b"}]},
                    {"id": 2, "variants": [{"sku": "c"}]},
                ]
            }
        });
        let targets = select_targets(
            &doc,
            &[
                object_path(["user"]),
                FetchPathElement {
                    kind: FetchPathKind::Array,
                    path: vec!["products".to_string()],
                },
            ],
        );
        assert_eq!(targets.len(), 2);
        assert_eq!(
            doc.get_path(&targets[0]).and_then(|v| v.get("id")),
            Some(&json!(1))
        );

        let nested = select_targets(
            &doc,
            &[
                object_path(["user"]),
                FetchPathElement {
                    kind: FetchPathKind::Array,
                    path: vec!["products".to_string()],
                },
                FetchPathElement {
                    kind: FetchPathKind::Array,
                    path: vec!["variants".to_string()],
                },
            ],
        );
        assert_eq!(nested.len(), 3);
        assert_eq!(
            doc.get_path(&nested[2]).and_then(|v| v.get("sku")),
            Some(&json!("c"))
        );
    }

    #[test]
    fn select_targets_is_empty_for_top_level_fetches() {
        let doc = json!({"user": {}});
        assert!(select_targets(&doc, &[]).is_empty());
    }

    #[test]
    fn select_targets_short_circuits_on_missing_fields() {
        let doc = json!({"user": {}});
        let targets = select_targets(&doc, &[object_path(["user"]), object_path(["friends"])]);
        assert!(targets.is_empty());
    }

    #[test]
    fn value_at_descends_objects_and_arrays() {
        let value = json!({"data": {"_entities": [{"id": 1}]}});
        assert_eq!(
            value_at(
                &value,
                &["data".to_string(), "_entities".to_string(), "0".to_string()]
            ),
            Some(&json!({"id": 1}))
        );
        assert_eq!(value_at(&value, &["data".to_string(), "nope".to_string()]), None);
    }
}
