//! `Scheduler` (`CollectionRunner`) — topologically drives the [`TaskGraph`]
//! under a bounded worker pool, owns the shared [`ExecutionContext`], emits
//! lifecycle events, enforces bail and cancellation.
//!
//! Lifecycle events are broadcast through a `tokio::sync::broadcast`
//! channel rather than a bespoke listener list, the same way
//! `mockforge-core` threads `tracing` spans/events through its request
//! pipeline.

use crate::context::{
    AbortHandle, EventInfo, ExecutionContextBuilder, ExecutionRecord, ExpectMessages,
    IterationSource, RunResult, RuntimeOptions, SharedContext, TestResult,
};
use crate::error::{Error, Result};
use crate::graph::{NodeKind, ScriptType, TaskGraph, TaskNode};
use crate::model::{Collection, FolderItem, Item, RequestItem};
use crate::scope::{ScopeFrame, ScopeLevel};
use crate::script_engine::{ScriptEngine, ScriptInput, ScriptOutput};
use crate::script_kind::ScriptKind;
use crate::{collection_validator::CollectionValidator, variables};
use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use questrunner_plugin::{
    AuthPlugin, EmitEvent, ProtocolEvent, ProtocolOptions, ProtocolPlugin, ProtocolRequest,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

/// Scheduler lifecycle events, broadcast to subscribers as a run progresses.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Emitted once, before any node runs.
    BeforeRun {
        /// Statically estimated test count; `-1` means dynamic/unknown.
        expected_test_count: i64,
    },
    /// A folder's `folder-enter` node is about to run.
    BeforeFolder {
        /// The folder node's path.
        path: String,
        /// The folder's name.
        name: String,
    },
    /// A folder's `folder-exit` node has run.
    AfterFolder {
        /// The folder node's path.
        path: String,
        /// The folder's name.
        name: String,
    },
    /// A request node is about to run.
    BeforeRequest {
        /// The request node's path.
        path: String,
        /// The request's name.
        name: String,
    },
    /// A request node has finished (successfully, skipped, or with a
    /// non-fatal protocol error).
    AfterRequest {
        /// The request node's path.
        path: String,
        /// The request's name.
        name: String,
    },
    /// A request's post-script chain has finished.
    AfterRequestPostScript {
        /// The request node's path.
        path: String,
    },
    /// A folder's post script has finished.
    AfterFolderPostScript {
        /// The folder node's path.
        path: String,
    },
    /// The collection-post script has finished.
    AfterCollectionPostScript,
    /// Emitted once, after the whole run completes.
    AfterRun {
        /// The final report.
        result: Box<RunResult>,
    },
}

/// What a completed node asks the scheduling loop to do next.
enum NodeOutcome {
    /// Mark this node completed normally via [`TaskGraph::complete_node`].
    Completed,
    /// The node's condition resolved to `"false"`; fast-forward its subtree
    /// via [`TaskGraph::skip_subtree`].
    SkippedSubtree,
}

/// Everything node execution needs that doesn't change across an iteration,
/// grouped so async closures (the `emitEvent` callback in particular) can
/// hold cheap `Arc` clones instead of borrowing a `&Scheduler`.
struct RunHandles {
    script_engine: Arc<ScriptEngine>,
    protocol: Arc<dyn ProtocolPlugin>,
    auth_plugins: HashMap<String, Arc<dyn AuthPlugin>>,
    protocol_events: Arc<Vec<ProtocolEvent>>,
    protocol_options: ProtocolOptions,
    events: broadcast::Sender<RunEvent>,
    abort: AbortHandle,
    bail: bool,
}

impl RunHandles {
    fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }
}

/// Drives one collection through the DAG scheduler. Cheap to construct per
/// run; holds only the plugins needed to execute a given protocol.
pub struct Scheduler {
    protocol: Arc<dyn ProtocolPlugin>,
    auth_plugins: HashMap<String, Arc<dyn AuthPlugin>>,
    script_engine: Arc<ScriptEngine>,
    events: broadcast::Sender<RunEvent>,
}

impl Scheduler {
    /// Build a scheduler for `protocol`, with `auth_plugins` keyed by auth
    /// type id. `max_concurrent_scripts` bounds how many script sandboxes
    /// may exist at once (the Script Mutex already serializes their
    /// *execution order*; this only bounds how many live simultaneously).
    pub fn new(
        protocol: Arc<dyn ProtocolPlugin>,
        auth_plugins: HashMap<String, Arc<dyn AuthPlugin>>,
        max_concurrent_scripts: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            protocol,
            auth_plugins,
            script_engine: Arc::new(ScriptEngine::new(max_concurrent_scripts)),
            events,
        }
    }

    /// Subscribe to lifecycle events for a run. Must be called before
    /// [`Scheduler::run`]/[`Scheduler::run_cancellable`] to avoid missing
    /// the `BeforeRun` event.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Run `collection` to completion with no external cancellation
    /// source beyond `options.execution.bail`.
    pub async fn run(&self, collection: &Collection, options: RuntimeOptions) -> Result<RunResult> {
        self.run_cancellable(collection, options, AbortHandle::new()).await
    }

    /// Run `collection`, honoring `abort` as an external cancellation
    /// signal, in addition to bail.
    pub async fn run_cancellable(
        &self,
        collection: &Collection,
        options: RuntimeOptions,
        abort: AbortHandle,
    ) -> Result<RunResult> {
        let start = Utc::now();
        let protocol_info = self.protocol.info();

        let auth_refs: HashMap<String, &dyn AuthPlugin> =
            self.auth_plugins.iter().map(|(k, v)| (k.clone(), v.as_ref())).collect();
        let validator = CollectionValidator::new(self.protocol.as_ref(), auth_refs, options.strict_mode);
        let validation_errors = validator.validate(collection);
        if !validation_errors.is_empty() {
            return Ok(empty_result(collection, start, Some(validation_errors)));
        }

        let (rows, source) = resolve_iteration_rows(collection, &options);
        let iteration_count = rows.len().max(1);
        let expected = expected_test_count(collection, &protocol_info.events, iteration_count);
        self.emit(RunEvent::BeforeRun { expected_test_count: expected });

        let mut ctx = ExecutionContextBuilder::new(collection.info.id.clone(), collection.protocol.clone())
            .name(collection.info.name.clone())
            .global_variables(options.global_variables.clone())
            .collection_variables(collection.variables.clone())
            .environment(options.environment.clone().unwrap_or_default())
            .abort_handle(abort.clone())
            .build();
        ctx.iteration_data = rows;
        ctx.iteration_count = iteration_count;
        ctx.iteration_source = source;
        let shared_ctx: SharedContext = Arc::new(AsyncMutex::new(ctx));

        let handles = RunHandles {
            script_engine: self.script_engine.clone(),
            protocol: self.protocol.clone(),
            auth_plugins: self.auth_plugins.clone(),
            protocol_events: Arc::new(protocol_info.events.clone()),
            protocol_options: to_protocol_options(&options),
            events: self.events.clone(),
            abort: abort.clone(),
            bail: options.execution.bail,
        };

        let max_concurrency = options.effective_concurrency();
        let mut graph = TaskGraph::build(collection, options.execution.allow_parallel)?;
        let mut aborted = false;
        let mut abort_reason: Option<String> = None;

        for iteration in 1..=iteration_count {
            if iteration > 1 {
                graph.reset();
            }
            {
                let mut locked = shared_ctx.lock().await;
                locked.iteration_current = iteration;
            }

            let outcome =
                run_iteration(&handles, &mut graph, &shared_ctx, max_concurrency).await;
            match outcome {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    aborted = true;
                    abort_reason = Some(reason);
                }
                Err(e) => {
                    let partial = build_result(collection, &shared_ctx, start, false, None).await;
                    return Err(Error::ScriptFailed {
                        message: e.to_string(),
                        partial_result: Box::new(partial),
                    });
                }
            }
            if aborted {
                break;
            }
        }

        let result = build_result(collection, &shared_ctx, start, aborted, abort_reason).await;
        self.emit(RunEvent::AfterRun { result: Box::new(result.clone()) });
        Ok(result)
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }
}

fn empty_result(
    collection: &Collection,
    start: chrono::DateTime<Utc>,
    validation_errors: Option<Vec<questrunner_plugin::ValidationError>>,
) -> RunResult {
    let end = Utc::now();
    RunResult {
        collection_id: collection.info.id.clone(),
        collection_name: collection.info.name.clone(),
        start_time: start.to_rfc3339(),
        end_time: end.to_rfc3339(),
        duration_ms: (end - start).num_milliseconds().max(0) as u64,
        request_results: Vec::new(),
        total_tests: 0,
        passed_tests: 0,
        failed_tests: 0,
        skipped_tests: 0,
        aborted: false,
        abort_reason: None,
        validation_errors,
    }
}

async fn build_result(
    collection: &Collection,
    shared_ctx: &SharedContext,
    start: chrono::DateTime<Utc>,
    aborted: bool,
    abort_reason: Option<String>,
) -> RunResult {
    let end = Utc::now();
    let ctx = shared_ctx.lock().await;
    let mut result = RunResult {
        collection_id: collection.info.id.clone(),
        collection_name: collection.info.name.clone(),
        start_time: start.to_rfc3339(),
        end_time: end.to_rfc3339(),
        duration_ms: (end - start).num_milliseconds().max(0) as u64,
        request_results: ctx.execution_history.clone(),
        total_tests: 0,
        passed_tests: 0,
        failed_tests: 0,
        skipped_tests: 0,
        aborted: aborted || ctx.abort.is_aborted(),
        abort_reason: abort_reason.or_else(|| ctx.abort.reason()),
        validation_errors: None,
    };
    result.recount_tests();
    result
}

/// Resolves `iterationSource` and the effective row list.
fn resolve_iteration_rows(collection: &Collection, options: &RuntimeOptions) -> (Vec<Value>, IterationSource) {
    let (mut rows, source) = match (&options.data, &collection.test_data) {
        (Some(rows), _) => (rows.clone(), IterationSource::OptionsData),
        (None, Some(rows)) => (rows.clone(), IterationSource::CollectionTestData),
        (None, None) => (Vec::new(), IterationSource::None),
    };
    if let Some(limit) = options.iterations {
        if limit > 0 {
            rows.truncate(limit as usize);
        }
    }
    (rows, source)
}

fn to_protocol_options(options: &RuntimeOptions) -> ProtocolOptions {
    ProtocolOptions {
        request_timeout_ms: options.timeout.request,
        validate_certificates: options.ssl.validate_certificates,
        follow_redirects: options.follow_redirects,
        max_redirects: options.max_redirects,
        proxy: resolve_proxy(options),
        plugin_config: options.plugins.clone(),
    }
}

/// `options.proxy` takes priority; otherwise fall back to the environment,
/// accepting both casings of `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` per
/// HTTP plugin externals. `NO_PROXY` itself is honored by the
/// HTTP plugin, not here; this only resolves which proxy URL (if any)
/// reaches it.
fn resolve_proxy(options: &RuntimeOptions) -> Option<String> {
    if options.proxy.enabled {
        if let Some(host) = &options.proxy.host {
            let port = options.proxy.port.map(|p| format!(":{p}")).unwrap_or_default();
            return Some(format!("http://{host}{port}"));
        }
    }
    std::env::var("HTTPS_PROXY")
        .or_else(|_| std::env::var("https_proxy"))
        .or_else(|_| std::env::var("HTTP_PROXY"))
        .or_else(|_| std::env::var("http_proxy"))
        .ok()
}

/// Static scan for `expectedTestCount`. `-1` means
/// dynamic/unknown (a plugin-event script exists without a resolvable
/// `quest.expectMessages(n)` upstream in that request's pre-chain).
fn expected_test_count(collection: &Collection, protocol_events: &[ProtocolEvent], iteration_count: usize) -> i64 {
    let can_have_tests: HashMap<&str, bool> =
        protocol_events.iter().map(|e| (e.name.as_str(), e.can_have_tests)).collect();

    let mut per_iteration: i64 = crate::validator::count_tests(collection.pre_script.as_deref().unwrap_or(""))
        as i64
        + crate::validator::count_tests(collection.post_script.as_deref().unwrap_or("")) as i64;
    let mut dynamic = false;

    for item in &collection.items {
        scan_item(item, &can_have_tests, &mut per_iteration, &mut dynamic);
    }

    if dynamic {
        return -1;
    }
    per_iteration * iteration_count as i64
}

fn scan_item(item: &Item, can_have_tests: &HashMap<&str, bool>, total: &mut i64, dynamic: &mut bool) {
    match item {
        Item::Folder(folder) => scan_folder(folder, can_have_tests, total, dynamic),
        Item::Request(request) => scan_request(request, can_have_tests, total, dynamic),
    }
}

fn scan_folder(folder: &FolderItem, can_have_tests: &HashMap<&str, bool>, total: &mut i64, dynamic: &mut bool) {
    *total += crate::validator::count_tests(folder.pre_script.as_deref().unwrap_or("")) as i64;
    *total += crate::validator::count_tests(folder.post_script.as_deref().unwrap_or("")) as i64;
    for item in &folder.items {
        scan_item(item, can_have_tests, total, dynamic);
    }
}

fn scan_request(request: &RequestItem, can_have_tests: &HashMap<&str, bool>, total: &mut i64, dynamic: &mut bool) {
    *total += crate::validator::count_tests(request.post_request_script.as_deref().unwrap_or("")) as i64;

    if request.data.scripts.is_empty() {
        return;
    }
    // Only the request's own pre-script is consulted for expectMessages;
    // inherited pre-scripts are appended ahead of it but expectMessages is
    // only valid in request-pre, so the nearest
    // (request-level) declaration wins.
    let expected_messages = request
        .pre_request_script
        .as_deref()
        .and_then(crate::validator::extract_expected_messages);

    for event_script in &request.data.scripts {
        let count = crate::validator::count_tests(&event_script.script) as i64;
        if count == 0 {
            continue;
        }
        if can_have_tests.get(event_script.event.as_str()).copied().unwrap_or(false) {
            match expected_messages {
                Some(n) => *total += count * n as i64,
                None => *dynamic = true,
            }
        }
    }
}

/// Drains the DAG for one iteration. Returns `Ok(None)` on a clean finish,
/// `Ok(Some(reason))` if the run was aborted (bail or external signal), or
/// `Err` if an uncaught script error occurred (which fails the whole run).
async fn run_iteration(
    handles: &RunHandles,
    graph: &mut TaskGraph,
    shared_ctx: &SharedContext,
    max_concurrency: usize,
) -> Result<Option<String>> {
    let mut ready: Vec<String> = graph.ready_nodes();
    let mut in_flight: FuturesUnordered<
        std::pin::Pin<Box<dyn std::future::Future<Output = (String, Result<NodeOutcome>)> + Send>>,
    > = FuturesUnordered::new();

    loop {
        if handles.abort.is_aborted() && in_flight.is_empty() {
            return Ok(Some(handles.abort.reason().unwrap_or_else(|| "aborted".to_string())));
        }

        while in_flight.len() < max_concurrency.max(1) {
            if handles.abort.is_aborted() {
                break;
            }
            let Some(node_id) = ready.pop() else { break };
            let node = graph.node(&node_id).cloned().expect("ready node must exist");
            let handles_owned = handles_handle(handles);
            let ctx = shared_ctx.clone();
            in_flight.push(Box::pin(async move {
                let outcome = execute_node(&handles_owned, &node, &ctx).await;
                (node_id, outcome)
            }));
        }

        let Some((node_id, outcome)) = in_flight.next().await else {
            if ready.is_empty() {
                return Ok(None);
            }
            continue;
        };

        match outcome {
            Ok(NodeOutcome::Completed) => {
                ready.extend(graph.complete_node(&node_id));
            }
            Ok(NodeOutcome::SkippedSubtree) => {
                record_skipped_subtree_requests(handles, graph, shared_ctx, &node_id).await;
                ready.extend(graph.skip_subtree(&node_id));
            }
            Err(e) => return Err(e),
        }

        if handles.abort.is_aborted() && in_flight.is_empty() && ready.is_empty() {
            return Ok(Some(handles.abort.reason().unwrap_or_else(|| "aborted".to_string())));
        }
    }
}

/// `skip_subtree` fast-forwards every node inside a condition-false
/// folder's subtree to completed without executing it, which would
/// otherwise silently drop the `requestResult` a caller expects for each
/// `Request` node inside. Emits a `Skipped by condition` `ExecutionRecord`
/// for each one, mirroring the request-level condition skip in
/// `execute_request_node`.
async fn record_skipped_subtree_requests(
    handles: &RunHandles,
    graph: &TaskGraph,
    shared_ctx: &SharedContext,
    folder_enter_id: &str,
) {
    let Some(folder_node) = graph.node(folder_enter_id) else {
        return;
    };
    let iteration = shared_ctx.lock().await.iteration_current;
    for child_id in &folder_node.subtree_node_ids {
        let Some(child) = graph.node(child_id) else { continue };
        if child.kind != NodeKind::Request {
            continue;
        }
        let request_item = child.request.as_ref().expect("Request node always carries a RequestItem");
        let path = child.path.clone();
        handles.emit(RunEvent::BeforeRequest { path: path.clone(), name: request_item.name.clone() });
        let record = ExecutionRecord {
            id: request_item.id.clone(),
            name: request_item.name.clone(),
            path: path.clone(),
            iteration,
            response: None,
            tests: Vec::new(),
            script_error: Some("Skipped by condition".to_string()),
            timestamp: Utc::now().to_rfc3339(),
        };
        shared_ctx.lock().await.execution_history.push(record);
        handles.emit(RunEvent::AfterRequest { path, name: request_item.name.clone() });
    }
}

/// `RunHandles` holds an `Arc<dyn ProtocolPlugin>` etc. already; this just
/// clones it cheaply for one node execution's `'static` future.
fn handles_handle(handles: &RunHandles) -> RunHandles {
    RunHandles {
        script_engine: handles.script_engine.clone(),
        protocol: handles.protocol.clone(),
        auth_plugins: handles.auth_plugins.clone(),
        protocol_events: handles.protocol_events.clone(),
        protocol_options: handles.protocol_options.clone(),
        events: handles.events.clone(),
        abort: handles.abort.clone(),
        bail: handles.bail,
    }
}

async fn execute_node(handles: &RunHandles, node: &TaskNode, shared_ctx: &SharedContext) -> Result<NodeOutcome> {
    match node.kind {
        NodeKind::Script => execute_script_node(handles, node, shared_ctx).await,
        NodeKind::FolderEnter => execute_folder_enter(handles, node, shared_ctx).await,
        NodeKind::FolderExit => execute_folder_exit(handles, node, shared_ctx).await,
        NodeKind::Request => execute_request_node(handles, node, shared_ctx).await,
    }
}

async fn execute_script_node(handles: &RunHandles, node: &TaskNode, shared_ctx: &SharedContext) -> Result<NodeOutcome> {
    let script_type = node.script_type.expect("Script node always carries a script_type");

    if matches!(script_type, ScriptType::CollectionPre) {
        let mut ctx = shared_ctx.lock().await;
        let id = ctx.collection_info.id.clone();
        ctx.scope_stack.push(ScopeFrame::new(ScopeLevel::Collection, id));
    }

    let kind = match script_type {
        ScriptType::CollectionPre => ScriptKind::CollectionPre,
        ScriptType::CollectionPost => ScriptKind::CollectionPost,
        ScriptType::FolderPre => ScriptKind::FolderPre,
        ScriptType::FolderPost => ScriptKind::FolderPost,
    };
    let script = node.script.clone().unwrap_or_default();
    // Lifecycle scripts never permit quest.test()
    // restricts tests to request-post and eligible plugin events. A script
    // that violates this was already rejected by CollectionValidator
    // before the run started; `allow_test=false` here is the matching
    // runtime enforcement.
    let output = run_script(handles, shared_ctx, &script, kind, false, None).await?;
    if let Some(message) = output.thrown {
        return Err(Error::script(message));
    }
    if !output.tests.is_empty() {
        tracing::warn!(script_type = %kind, "quest.test() calls in a lifecycle script are discarded; CollectionValidator should have rejected this script");
    }

    if matches!(script_type, ScriptType::CollectionPost) {
        handles.emit(RunEvent::AfterCollectionPostScript);
    }

    Ok(NodeOutcome::Completed)
}

async fn execute_folder_enter(handles: &RunHandles, node: &TaskNode, shared_ctx: &SharedContext) -> Result<NodeOutcome> {
    let folder_id = node.path.clone();
    handles.emit(RunEvent::BeforeFolder {
        path: node.path.clone(),
        name: folder_id.clone(),
    });

    // The matching `ScopeLevel::Folder` pop only happens in
    // `execute_folder_exit`, which `skip_subtree` bypasses entirely on a
    // condition-false folder. Pushed only once the subtree is known to run
    // so a skip never leaves an unbalanced frame on `scope_stack`.
    if let Some(condition) = &node.condition {
        if evaluate_condition_is_false(handles, shared_ctx, condition).await? {
            return Ok(NodeOutcome::SkippedSubtree);
        }
    }

    {
        let mut ctx = shared_ctx.lock().await;
        ctx.scope_stack.push(ScopeFrame::new(ScopeLevel::Folder, folder_id.clone()));
    }

    Ok(NodeOutcome::Completed)
}

async fn execute_folder_exit(_handles: &RunHandles, node: &TaskNode, shared_ctx: &SharedContext) -> Result<NodeOutcome> {
    {
        let mut ctx = shared_ctx.lock().await;
        ctx.scope_stack.pop();
    }
    _handles.emit(RunEvent::AfterFolder {
        path: node.path.clone(),
        name: node.path.clone(),
    });
    Ok(NodeOutcome::Completed)
}

async fn execute_request_node(handles: &RunHandles, node: &TaskNode, shared_ctx: &SharedContext) -> Result<NodeOutcome> {
    let request_item = node.request.clone().expect("Request node always carries a RequestItem");
    let path = node.path.clone();
    handles.emit(RunEvent::BeforeRequest { path: path.clone(), name: request_item.name.clone() });

    if let Some(condition) = &node.condition {
        if evaluate_condition_is_false(handles, shared_ctx, condition).await? {
            let iteration = shared_ctx.lock().await.iteration_current;
            let record = ExecutionRecord {
                id: request_item.id.clone(),
                name: request_item.name.clone(),
                path: path.clone(),
                iteration,
                response: None,
                tests: Vec::new(),
                script_error: Some("Skipped by condition".to_string()),
                timestamp: Utc::now().to_rfc3339(),
            };
            shared_ctx.lock().await.execution_history.push(record);
            handles.emit(RunEvent::AfterRequest { path, name: request_item.name.clone() });
            return Ok(NodeOutcome::Completed);
        }
    }

    {
        let mut ctx = shared_ctx.lock().await;
        ctx.scope_stack.push(ScopeFrame::new(ScopeLevel::Request, request_item.id.clone()));
        ctx.pending_expect_messages = None;
    }

    let mut tests: Vec<TestResult> = Vec::new();
    let mut script_error: Option<String> = None;
    let mut response = None;

    match run_pre_scripts(handles, shared_ctx, node).await {
        Ok(pre_tests) => tests.extend(pre_tests),
        Err(e) => {
            shared_ctx.lock().await.scope_stack.pop();
            return Err(e);
        }
    }

    let expect_messages = shared_ctx.lock().await.pending_expect_messages;

    match run_request_io(handles, shared_ctx, &request_item, node, expect_messages).await {
        Ok((resp, event_tests)) => {
            tests.extend(event_tests);
            response = Some(resp);
        }
        Err(e) => {
            script_error = Some(e.to_string());
        }
    }

    match run_post_scripts(handles, shared_ctx, node).await {
        Ok(post_tests) => tests.extend(post_tests),
        Err(e) => {
            shared_ctx.lock().await.scope_stack.pop();
            return Err(e);
        }
    }
    handles.emit(RunEvent::AfterRequestPostScript { path: path.clone() });

    let bailed_now = handles.bail
        && (script_error.is_some() || tests.iter().any(|t| !t.passed && !t.skipped));
    if bailed_now {
        handles.abort.abort("Test failure (--bail)");
    }

    let iteration = {
        let mut ctx = shared_ctx.lock().await;
        ctx.scope_stack.pop();
        if let Some(resp) = &response {
            apply_cookies_from_response(&mut ctx, &request_item.data.url, resp);
        }
        ctx.current_response = None;
        ctx.current_request = None;
        ctx.iteration_current
    };

    let record = ExecutionRecord {
        id: request_item.id.clone(),
        name: request_item.name.clone(),
        path: path.clone(),
        iteration,
        response,
        tests,
        script_error,
        timestamp: Utc::now().to_rfc3339(),
    };
    shared_ctx.lock().await.execution_history.push(record);
    handles.emit(RunEvent::AfterRequest { path, name: request_item.name.clone() });

    Ok(NodeOutcome::Completed)
}

async fn run_pre_scripts(handles: &RunHandles, shared_ctx: &SharedContext, node: &TaskNode) -> Result<Vec<TestResult>> {
    let mut tests = Vec::new();
    for script in &node.inherited_pre_scripts {
        let output = run_script(handles, shared_ctx, script, ScriptKind::RequestPre, false, None).await?;
        if let Some(message) = output.thrown {
            return Err(Error::script(message));
        }
        tests.extend(output.tests);
    }
    Ok(tests)
}

async fn run_post_scripts(handles: &RunHandles, shared_ctx: &SharedContext, node: &TaskNode) -> Result<Vec<TestResult>> {
    let mut tests = Vec::new();
    for script in &node.inherited_post_scripts {
        let output = run_script(handles, shared_ctx, script, ScriptKind::RequestPost, true, None).await?;
        if let Some(message) = output.thrown {
            return Err(Error::script(message));
        }
        tests.extend(output.tests);
    }
    Ok(tests)
}

/// Build the interpolated `ProtocolRequest`, apply auth, invoke the
/// protocol plugin's `execute`, and record `Set-Cookie`-shaped headers
/// into the jar. Returns the response plus any tests recorded by
/// plugin-event scripts.
async fn run_request_io(
    handles: &RunHandles,
    shared_ctx: &SharedContext,
    request_item: &RequestItem,
    node: &TaskNode,
    expect_messages: Option<ExpectMessages>,
) -> Result<(questrunner_plugin::ProtocolResponse, Vec<TestResult>)> {
    let mut request = {
        let ctx = shared_ctx.lock().await;
        let url = variables::resolve_str(&ctx, &request_item.data.url);
        let headers = request_item
            .data
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), variables::resolve_str(&ctx, v)))
            .collect();
        let data = variables::resolve_value(&ctx, &serde_json::to_value(&request_item.data).unwrap_or_default());
        ProtocolRequest {
            id: request_item.id.clone(),
            name: request_item.name.clone(),
            method: request_item.data.method.clone(),
            url,
            headers,
            data,
        }
    };

    if let Some(auth) = &node.effective_auth {
        if !auth.is_inherit() && !auth.is_none() {
            if let Some(plugin) = handles.auth_plugins.get(&auth.auth_type) {
                request = plugin.apply(request, auth, &handles.protocol_options).await?;
            }
        }
    }

    {
        let mut ctx = shared_ctx.lock().await;
        ctx.current_request = Some(request.clone());
        ctx.pending_expect_messages = expect_messages;
    }

    let event_tests: Arc<AsyncMutex<Vec<TestResult>>> = Arc::new(AsyncMutex::new(Vec::new()));
    let event_counts: Arc<AsyncMutex<HashMap<String, u64>>> = Arc::new(AsyncMutex::new(HashMap::new()));
    let event_scripts: Arc<HashMap<String, String>> = Arc::new(
        request_item.data.scripts.iter().map(|s| (s.event.clone(), s.script.clone())).collect(),
    );

    let emit_event: EmitEvent<'_> = {
        let handles = handles_handle(handles);
        let shared_ctx = shared_ctx.clone();
        let event_tests = event_tests.clone();
        let event_counts = event_counts.clone();
        let event_scripts = event_scripts.clone();
        Arc::new(move |name: &str, _payload: Value| {
            let handles = handles_handle(&handles);
            let shared_ctx = shared_ctx.clone();
            let event_tests = event_tests.clone();
            let event_counts = event_counts.clone();
            let event_scripts = event_scripts.clone();
            let name = name.to_string();
            Box::pin(async move {
                let index = {
                    let mut counts = event_counts.lock().await;
                    let entry = counts.entry(name.clone()).or_insert(0);
                    let i = *entry;
                    *entry += 1;
                    i
                };
                let Some(script) = event_scripts.get(&name) else {
                    return Ok(());
                };
                let can_have_tests =
                    handles.protocol_events.iter().any(|e| e.name == name && e.can_have_tests);
                let event_info = EventInfo { name: name.clone(), index };
                let output = run_script(
                    &handles,
                    &shared_ctx,
                    script,
                    ScriptKind::PluginEvent,
                    can_have_tests,
                    Some(event_info),
                )
                .await
                .map_err(|e| questrunner_plugin::PluginError::execution(e.to_string()))?;
                if let Some(message) = output.thrown {
                    return Err(questrunner_plugin::PluginError::execution(message));
                }
                event_tests.lock().await.extend(output.tests);
                Ok(())
            })
        })
    };

    let response = handles.protocol.execute(&request, &handles.protocol_options, Some(emit_event)).await?;

    {
        let mut ctx = shared_ctx.lock().await;
        ctx.current_response = Some(response.clone());
    }

    let tests = Arc::try_unwrap(event_tests).map(|m| m.into_inner()).unwrap_or_default();
    Ok((response, tests))
}

fn apply_cookies_from_response(
    ctx: &mut crate::context::ExecutionContext,
    url: &str,
    response: &questrunner_plugin::ProtocolResponse,
) {
    let Some(headers) = response.data.get("headers").and_then(Value::as_object) else {
        return;
    };
    let set_cookie = headers.iter().find(|(k, _)| k.to_ascii_lowercase() == "set-cookie");
    let Some((_, value)) = set_cookie else { return };

    let raw_values: Vec<String> = match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(ToString::to_string)).collect(),
        _ => return,
    };

    for raw in raw_values {
        let Some(pair) = raw.split(';').next() else { continue };
        let Some((name, cookie_value)) = pair.split_once('=') else { continue };
        ctx.cookie_jar.set(
            url,
            crate::cookie::Cookie {
                name: name.trim().to_string(),
                value: cookie_value.trim().to_string(),
            },
        );
    }
}

/// Evaluate `condition` (a JS expression) against the current context and
/// return whether it resolved to the literal string `"false"`
/// (case-insensitive).
async fn evaluate_condition_is_false(handles: &RunHandles, shared_ctx: &SharedContext, condition: &str) -> Result<bool> {
    let wrapped = format!("({condition})");
    let output = run_script(handles, shared_ctx, &wrapped, ScriptKind::RequestPre, false, None).await?;
    if let Some(message) = output.thrown {
        return Err(Error::script(format!("condition evaluation failed: {message}")));
    }
    let text = match output.eval_result {
        Some(Value::String(s)) => s,
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
        None => return Ok(false),
    };
    Ok(text.eq_ignore_ascii_case("false"))
}

/// Snapshot the locked context into a [`ScriptInput`], run the sandbox,
/// then fold [`ScriptOutput`] back into the context — all while holding
/// the single context lock for the duration, which is the literal
/// implementation of the Script Mutex invariant: nothing else
/// can observe or mutate `globalVariables`/`collectionVariables`/
/// `scopeStack`/`executionHistory`/`cookieJar` while a script runs.
async fn run_script(
    handles: &RunHandles,
    shared_ctx: &SharedContext,
    script: &str,
    kind: ScriptKind,
    allow_test: bool,
    event: Option<EventInfo>,
) -> Result<ScriptOutput> {
    let mut ctx = shared_ctx.lock().await;
    if script.trim().is_empty() {
        return Ok(ScriptOutput {
            global_variables: ctx.global_variables.clone(),
            collection_variables: ctx.collection_variables.clone(),
            top_scope_variables: None,
            tests: Vec::new(),
            expect_messages: None,
            cookie_mutation: crate::script_engine::CookieMutation::None,
            eval_result: None,
            thrown: None,
        });
    }

    let scope_frames: Vec<HashMap<String, Value>> =
        ctx.scope_stack.frames().iter().rev().map(|f| f.vars.clone()).collect();
    let cookies = ctx
        .current_request
        .as_ref()
        .map(|r| ctx.cookie_jar.to_object(&r.url))
        .unwrap_or_default();

    let input = ScriptInput {
        script: script.to_string(),
        script_kind: kind,
        allow_test,
        event,
        collection_id: ctx.collection_info.id.clone(),
        collection_name: ctx.collection_info.name.clone(),
        environment_name: ctx.environment.name.clone(),
        environment_vars: ctx.environment.vars.clone(),
        global_variables: ctx.global_variables.clone(),
        collection_variables: ctx.collection_variables.clone(),
        scope_frames,
        iteration_row: ctx.current_iteration_row().cloned(),
        iteration_current: ctx.iteration_current,
        iteration_count: ctx.iteration_count,
        history: ctx.execution_history.clone(),
        cookies,
        current_request: ctx.current_request.clone(),
        current_response: ctx.current_response.clone(),
        protocol: Some(handles.protocol.clone()),
        protocol_options: handles.protocol_options.clone(),
        abort: ctx.abort.clone(),
    };

    let output = handles.script_engine.run(input).await?;

    ctx.global_variables = output.global_variables.clone();
    ctx.collection_variables = output.collection_variables.clone();
    if let Some(top_vars) = &output.top_scope_variables {
        if let Some(frame) = ctx.scope_stack.top_mut() {
            frame.vars = top_vars.clone();
        }
    }
    if output.expect_messages.is_some() {
        ctx.pending_expect_messages = output.expect_messages;
    }
    if output.cookie_mutation == crate::script_engine::CookieMutation::ClearCurrentHost {
        if let Some(request) = &ctx.current_request {
            let url = request.url.clone();
            ctx.cookie_jar.clear(Some(&url));
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CollectionInfo, EventScript, RequestData};
    use async_trait::async_trait;
    use questrunner_plugin::{
        ProtocolInfo, ProtocolResponse, ProtocolResponseSummary, Result as PluginResult, ValidationResult,
    };
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoProtocol {
        calls: AtomicUsize,
    }

    impl EchoProtocol {
        fn new() -> Self {
            Self { calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl ProtocolPlugin for EchoProtocol {
        fn info(&self) -> ProtocolInfo {
            ProtocolInfo {
                protocols: vec!["echo".to_string()],
                name: "echo".to_string(),
                version: "0.0.0".to_string(),
                supported_auth_types: vec![],
                strict_auth_list: false,
                data_schema: serde_json::json!({}),
                options_schema: None,
                events: vec![ProtocolEvent {
                    name: "onComplete".to_string(),
                    can_have_tests: true,
                    required: false,
                    description: String::new(),
                }],
            }
        }

        fn validate(&self, _request: &ProtocolRequest, _options: &ProtocolOptions) -> ValidationResult {
            ValidationResult::ok()
        }

        async fn execute(
            &self,
            request: &ProtocolRequest,
            _options: &ProtocolOptions,
            emit_event: Option<EmitEvent<'_>>,
        ) -> PluginResult<ProtocolResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(emit) = emit_event {
                emit("onComplete", Value::Null).await?;
            }
            Ok(ProtocolResponse {
                data: serde_json::json!({"echoedUrl": request.url}),
                summary: ProtocolResponseSummary {
                    outcome: "ok".to_string(),
                    code: "200".to_string(),
                    label: "200 OK".to_string(),
                    message: None,
                    duration_ms: 1,
                },
            })
        }
    }

    fn request(id: &str, post_script: Option<&str>) -> RequestItem {
        RequestItem {
            id: id.to_string(),
            name: id.to_string(),
            condition: None,
            auth: None,
            depends_on: vec![],
            pre_request_script: None,
            post_request_script: post_script.map(ToString::to_string),
            data: RequestData {
                url: "https://example.com/{{path}}".to_string(),
                method: "GET".to_string(),
                ..Default::default()
            },
        }
    }

    fn collection(items: Vec<Item>) -> Collection {
        Collection {
            info: CollectionInfo { id: "c1".to_string(), name: "C".to_string() },
            protocol: "echo".to_string(),
            auth: None,
            test_data: None,
            pre_script: None,
            post_script: None,
            pre_request_script: None,
            post_request_script: None,
            variables: StdHashMap::from([("path".to_string(), Value::String("users".to_string()))]),
            items,
        }
    }

    #[tokio::test]
    async fn single_request_records_passed_test() {
        let protocol = Arc::new(EchoProtocol::new());
        let scheduler = Scheduler::new(protocol, HashMap::new(), 4);
        let c = collection(vec![Item::Request(request("r1", Some(r#"quest.test("ok", () => {});"#)))]);
        let result = scheduler.run(&c, RuntimeOptions::default()).await.unwrap();
        assert_eq!(result.request_results.len(), 1);
        assert_eq!(result.total_tests, 1);
        assert_eq!(result.passed_tests, 1);
        assert!(result.validation_errors.is_none());
    }

    #[tokio::test]
    async fn variable_interpolation_reaches_the_protocol_request() {
        let protocol = Arc::new(EchoProtocol::new());
        let scheduler = Scheduler::new(protocol, HashMap::new(), 4);
        let c = collection(vec![Item::Request(request("r1", None))]);
        let result = scheduler.run(&c, RuntimeOptions::default()).await.unwrap();
        let response = result.request_results[0].response.as_ref().unwrap();
        assert_eq!(response.data["echoedUrl"], "https://example.com/users");
    }

    #[tokio::test]
    async fn condition_false_skips_request() {
        let protocol = Arc::new(EchoProtocol::new());
        let scheduler = Scheduler::new(protocol, HashMap::new(), 4);
        let mut r = request("r1", None);
        r.condition = Some(r#""false""#.to_string());
        let c = collection(vec![Item::Request(r)]);
        let result = scheduler.run(&c, RuntimeOptions::default()).await.unwrap();
        assert_eq!(result.request_results[0].script_error.as_deref(), Some("Skipped by condition"));
        assert!(result.request_results[0].response.is_none());
    }

    #[tokio::test]
    async fn plugin_event_script_increments_global_counter_per_occurrence() {
        let protocol = Arc::new(EchoProtocol::new());
        let scheduler = Scheduler::new(protocol, HashMap::new(), 4);
        let mut r1 = request("r1", None);
        r1.data.scripts.push(EventScript {
            event: "onComplete".to_string(),
            script: r#"
                const n = quest.global.variables.get("count") || 0;
                quest.global.variables.set("count", n + 1);
                quest.test("onComplete " + quest.event.index, () => {});
            "#
            .to_string(),
        });
        let mut r2 = request("r2", None);
        r2.data.scripts = r1.data.scripts.clone();
        let c = collection(vec![Item::Request(r1), Item::Request(r2)]);
        let result = scheduler.run(&c, RuntimeOptions::default()).await.unwrap();
        assert_eq!(result.total_tests, 2);
        assert_eq!(result.passed_tests, 2);
    }

    #[tokio::test]
    async fn bail_aborts_after_first_failing_test() {
        let protocol = Arc::new(EchoProtocol::new());
        let scheduler = Scheduler::new(protocol, HashMap::new(), 4);
        let r1 = request("r1", Some(r#"quest.test("fails", () => { throw new Error("nope"); });"#));
        let r2 = request("r2", Some(r#"quest.test("ok", () => {});"#));
        let c = collection(vec![Item::Request(r1), Item::Request(r2)]);
        let mut options = RuntimeOptions::default();
        options.execution.bail = true;
        let result = scheduler.run(&c, options).await.unwrap();
        assert!(result.aborted);
        assert_eq!(result.abort_reason.as_deref(), Some("Test failure (--bail)"));
    }

    #[tokio::test]
    async fn iteration_multiplies_test_count() {
        let protocol = Arc::new(EchoProtocol::new());
        let scheduler = Scheduler::new(protocol, HashMap::new(), 4);
        let mut c = collection(vec![Item::Request(request("r1", Some(r#"quest.test("ok", () => {});"#)))]);
        c.test_data = Some(vec![Value::Null, Value::Null]);
        let result = scheduler.run(&c, RuntimeOptions::default()).await.unwrap();
        assert_eq!(result.total_tests, 2);
        assert_eq!(result.request_results.len(), 2);
    }

    #[tokio::test]
    async fn expected_test_count_matches_static_scan() {
        let c = collection(vec![Item::Request(request("r1", Some(r#"quest.test("ok", () => {});"#)))]);
        let events = vec![ProtocolEvent {
            name: "onComplete".to_string(),
            can_have_tests: true,
            required: false,
            description: String::new(),
        }];
        assert_eq!(expected_test_count(&c, &events, 2), 2);
    }

    fn folder(id: &str, condition: Option<&str>, items: Vec<Item>) -> FolderItem {
        FolderItem {
            id: id.to_string(),
            name: id.to_string(),
            condition: condition.map(ToString::to_string),
            auth: None,
            depends_on: vec![],
            pre_script: None,
            post_script: None,
            pre_request_script: None,
            post_request_script: None,
            items,
        }
    }

    #[tokio::test]
    async fn folder_condition_false_skips_every_child_request() {
        let protocol = Arc::new(EchoProtocol::new());
        let scheduler = Scheduler::new(protocol, HashMap::new(), 4);
        let f = folder(
            "f1",
            Some(r#""false""#),
            vec![Item::Request(request("r1", None)), Item::Request(request("r2", None))],
        );
        let c = collection(vec![Item::Folder(f)]);
        let result = scheduler.run(&c, RuntimeOptions::default()).await.unwrap();

        assert_eq!(result.request_results.len(), 2);
        for record in &result.request_results {
            assert_eq!(record.script_error.as_deref(), Some("Skipped by condition"));
            assert!(record.response.is_none());
            assert!(record.tests.is_empty());
        }
    }

    #[tokio::test]
    async fn folder_condition_false_does_not_leak_a_scope_frame() {
        // `execute_folder_exit` (the only place that pops the
        // `ScopeLevel::Folder` frame) never runs for a skipped subtree, so
        // the push must be deferred until the skip check has passed.
        let protocol = Arc::new(EchoProtocol::new());
        let (events, _) = broadcast::channel(16);
        let handles = RunHandles {
            script_engine: Arc::new(ScriptEngine::new(4)),
            protocol,
            auth_plugins: HashMap::new(),
            protocol_events: Arc::new(Vec::new()),
            protocol_options: ProtocolOptions::default(),
            events,
            abort: AbortHandle::new(),
            bail: false,
        };

        let f = folder("f1", Some(r#""false""#), vec![Item::Request(request("r1", None))]);
        let c = collection(vec![Item::Folder(f)]);
        let graph = TaskGraph::build(&c, false).unwrap();
        let enter_node = graph.node(".f1::enter").unwrap().clone();

        let ctx = ExecutionContextBuilder::new(c.info.id.clone(), c.protocol.clone()).build();
        let shared_ctx: SharedContext = Arc::new(AsyncMutex::new(ctx));

        let depth_before = shared_ctx.lock().await.scope_stack.depth();
        let outcome = execute_folder_enter(&handles, &enter_node, &shared_ctx).await.unwrap();
        assert!(matches!(outcome, NodeOutcome::SkippedSubtree));
        let depth_after = shared_ctx.lock().await.scope_stack.depth();
        assert_eq!(depth_before, depth_after, "skipped folder-enter left an unbalanced scope frame");
    }

    #[tokio::test]
    async fn depends_on_orders_execution_across_sibling_folders() {
        struct OrderingProtocol {
            order: Arc<std::sync::Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl ProtocolPlugin for OrderingProtocol {
            fn info(&self) -> ProtocolInfo {
                ProtocolInfo {
                    protocols: vec!["echo".to_string()],
                    name: "echo".to_string(),
                    version: "0.0.0".to_string(),
                    supported_auth_types: vec![],
                    strict_auth_list: false,
                    data_schema: serde_json::json!({}),
                    options_schema: None,
                    events: vec![],
                }
            }

            fn validate(&self, _request: &ProtocolRequest, _options: &ProtocolOptions) -> ValidationResult {
                ValidationResult::ok()
            }

            async fn execute(
                &self,
                request: &ProtocolRequest,
                _options: &ProtocolOptions,
                _emit_event: Option<EmitEvent<'_>>,
            ) -> PluginResult<ProtocolResponse> {
                self.order.lock().unwrap().push(request.id.clone());
                Ok(ProtocolResponse {
                    data: serde_json::json!({}),
                    summary: ProtocolResponseSummary {
                        outcome: "ok".to_string(),
                        code: "200".to_string(),
                        label: "200 OK".to_string(),
                        message: None,
                        duration_ms: 1,
                    },
                })
            }
        }

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let protocol = Arc::new(OrderingProtocol { order: order.clone() });
        let scheduler = Scheduler::new(protocol, HashMap::new(), 4);

        let mut dependent = request("b1", None);
        dependent.depends_on.push("a1".to_string());
        let folder_a = folder("fa", None, vec![Item::Request(request("a1", None))]);
        let folder_b = folder("fb", None, vec![Item::Request(dependent)]);
        let c = collection(vec![Item::Folder(folder_a), Item::Folder(folder_b)]);

        let mut options = RuntimeOptions::default();
        options.execution.allow_parallel = true;
        options.execution.max_concurrency = 4;
        let result = scheduler.run(&c, options).await.unwrap();

        assert_eq!(result.request_results.len(), 2);
        assert_eq!(*order.lock().unwrap(), vec!["a1".to_string(), "b1".to_string()]);
    }
}
