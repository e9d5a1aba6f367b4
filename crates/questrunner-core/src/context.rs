//! `ExecutionContext` — the per-run mutable state threaded through every
//! script and protocol call, plus the records and final report it
//! accumulates into.

use crate::cookie::{CookieJar, InMemoryCookieJar};
use crate::model::CollectionInfo;
use crate::scope::ScopeStack;
use questrunner_plugin::{ProtocolResponse, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, Notify};

/// The active environment block (`environment.name` / `environment.vars`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Environment name, surfaced as `quest.environment.name`.
    pub name: Option<String>,
    /// Environment variables, third-from-last in the `quest.variables`
    /// cascade.
    pub vars: HashMap<String, Value>,
}

/// Where the active iteration rows came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationSource {
    /// No iteration data; a single implicit iteration.
    None,
    /// `RuntimeOptions.data` overrode the collection's `testData`.
    OptionsData,
    /// `Collection.testData` was used as-is.
    CollectionTestData,
}

/// `quest.event` — set for the duration of a plugin-event script.
#[derive(Debug, Clone)]
pub struct EventInfo {
    /// The event name (`"onMessage"`, `"onComplete"`, …).
    pub name: String,
    /// 0-based counter, per event name, per request.
    pub index: u64,
}

/// The recorded intent of a `quest.expectMessages(n[, timeoutMs])` call,
/// read by the protocol plugin during `execute`.
#[derive(Debug, Clone, Copy)]
pub struct ExpectMessages {
    /// Expected message count, a positive integer.
    pub count: u64,
    /// Optional timeout, in milliseconds, to wait for them.
    pub timeout_ms: Option<u64>,
}

/// A single user assertion, as produced by `quest.test(...)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// The name passed to `quest.test(name, fn)`.
    pub name: String,
    /// Whether the assertion passed.
    pub passed: bool,
    /// Set when the test body called `quest.skip(...)`.
    pub skipped: bool,
    /// The thrown error's message, if the test failed.
    pub error: Option<String>,
    /// Which script type produced this test.
    pub script_type: String,
    /// The plugin event name, if produced from a `plugin-event` script.
    pub event_name: Option<String>,
}

/// An appended, per-request archival row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// The request item's id.
    pub id: String,
    /// The request item's name.
    pub name: String,
    /// Dot-joined path of ids from the collection root to this request.
    pub path: String,
    /// 1-based iteration number this execution belongs to.
    pub iteration: usize,
    /// The protocol response, absent if the request was skipped or a
    /// pre-script aborted before I/O.
    pub response: Option<ProtocolResponse>,
    /// User test results recorded for this request (pre + post + events).
    pub tests: Vec<TestResult>,
    /// Set when the request was skipped by condition, or a script failed.
    pub script_error: Option<String>,
    /// Wall-clock time the record was appended, RFC 3339.
    pub timestamp: String,
}

/// The final report returned by `Scheduler::run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// The collection's id.
    pub collection_id: String,
    /// The collection's name.
    pub collection_name: String,
    /// RFC 3339 start timestamp.
    pub start_time: String,
    /// RFC 3339 end timestamp.
    pub end_time: String,
    /// Wall-clock duration, in milliseconds.
    pub duration_ms: u64,
    /// Every appended [`ExecutionRecord`], in completion order.
    pub request_results: Vec<ExecutionRecord>,
    /// Sum of tests recorded across every request result.
    pub total_tests: usize,
    /// Tests with `passed == true`.
    pub passed_tests: usize,
    /// Tests with `passed == false && !skipped`.
    pub failed_tests: usize,
    /// Tests with `skipped == true`.
    pub skipped_tests: usize,
    /// Set when the run stopped early (external cancel or bail).
    pub aborted: bool,
    /// Human-readable reason for the abort, if any.
    pub abort_reason: Option<String>,
    /// Populated instead of executing anything, when the pre-run validator
    /// rejected the collection.
    pub validation_errors: Option<Vec<ValidationError>>,
}

impl RunResult {
    /// Recompute the four test counters from `request_results`.
    pub fn recount_tests(&mut self) {
        let mut total = 0;
        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        for record in &self.request_results {
            for test in &record.tests {
                total += 1;
                if test.skipped {
                    skipped += 1;
                } else if test.passed {
                    passed += 1;
                } else {
                    failed += 1;
                }
            }
        }
        self.total_tests = total;
        self.passed_tests = passed;
        self.failed_tests = failed;
        self.skipped_tests = skipped;
    }
}

struct AbortState {
    aborted: AtomicBool,
    reason: RwLock<Option<String>>,
    notify: Notify,
}

/// A cheap-to-clone, one-shot cancellation signal shared between the
/// scheduler, the script engine, and protocol plugins.
#[derive(Clone)]
pub struct AbortHandle(Arc<AbortState>);

impl AbortHandle {
    /// A fresh, not-yet-aborted handle.
    pub fn new() -> Self {
        Self(Arc::new(AbortState {
            aborted: AtomicBool::new(false),
            reason: RwLock::new(None),
            notify: Notify::new(),
        }))
    }

    /// Trip the signal. Idempotent; the first reason wins.
    pub fn abort(&self, reason: impl Into<String>) {
        if !self.0.aborted.swap(true, Ordering::SeqCst) {
            *self.0.reason.write().expect("abort reason lock poisoned") = Some(reason.into());
        }
        self.0.notify.notify_waiters();
    }

    /// Whether the signal has tripped.
    pub fn is_aborted(&self) -> bool {
        self.0.aborted.load(Ordering::SeqCst)
    }

    /// The reason passed to the first [`AbortHandle::abort`] call.
    pub fn reason(&self) -> Option<String> {
        self.0.reason.read().expect("abort reason lock poisoned").clone()
    }

    /// Resolves once the signal trips, or immediately if already tripped.
    pub async fn aborted(&self) {
        if self.is_aborted() {
            return;
        }
        self.0.notify.notified().await;
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// `RuntimeOptions` — knobs configurable per run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Seeded global variables.
    #[serde(default)]
    pub global_variables: HashMap<String, Value>,
    /// Active environment.
    #[serde(default)]
    pub environment: Option<EnvironmentSpec>,
    /// Iteration rows, overriding `Collection.testData` when present.
    #[serde(default)]
    pub data: Option<Vec<Value>>,
    /// Clamps the row count when positive; non-positive values are ignored.
    #[serde(default)]
    pub iterations: Option<i64>,
    /// Whether `quest.test` ancestor checks run.
    #[serde(default = "default_true")]
    pub strict_mode: bool,
    /// Timeout configuration.
    #[serde(default)]
    pub timeout: TimeoutOptions,
    /// TLS configuration.
    #[serde(default)]
    pub ssl: SslOptions,
    /// Proxy configuration.
    #[serde(default)]
    pub proxy: ProxyOptions,
    /// Whether protocol plugins should follow redirects automatically.
    #[serde(default)]
    pub follow_redirects: bool,
    /// Maximum redirects to follow.
    #[serde(default)]
    pub max_redirects: u32,
    /// Scheduling/parallelism configuration.
    #[serde(default)]
    pub execution: ExecutionOptions,
    /// Arbitrary per-plugin configuration, keyed by plugin id.
    #[serde(default)]
    pub plugins: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

/// Timeout knobs forwarded to protocol plugins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutOptions {
    /// Per-request timeout, in milliseconds.
    pub request: Option<u64>,
}

/// TLS knobs forwarded to protocol plugins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SslOptions {
    /// Whether to validate TLS certificates.
    #[serde(default = "default_true")]
    pub validate_certificates: bool,
    /// Path to a client certificate, if mutual TLS is required.
    pub client_certificate: Option<String>,
    /// Path to a custom CA bundle.
    pub ca: Option<String>,
}

/// Proxy knobs forwarded to protocol plugins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyOptions {
    /// Whether proxying is enabled at all.
    #[serde(default)]
    pub enabled: bool,
    /// Proxy host.
    pub host: Option<String>,
    /// Proxy port.
    pub port: Option<u16>,
    /// `user:password`, if the proxy requires auth.
    pub auth: Option<String>,
    /// Hosts to bypass the proxy for.
    #[serde(default)]
    pub bypass: Vec<String>,
}

/// Scheduling/parallelism knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Whether siblings may run concurrently.
    #[serde(default)]
    pub allow_parallel: bool,
    /// Bound on concurrently-running request nodes.
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    /// Abort on the first failed assertion or script error.
    #[serde(default)]
    pub bail: bool,
}

fn default_concurrency() -> usize {
    1
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            allow_parallel: false,
            max_concurrency: default_concurrency(),
            bail: false,
        }
    }
}

impl RuntimeOptions {
    /// The effective concurrency bound: `1` whenever `allow_parallel` is
    /// false, regardless of a configured `max_concurrency`.
    pub fn effective_concurrency(&self) -> usize {
        if self.execution.allow_parallel {
            self.execution.max_concurrency.max(1)
        } else {
            1
        }
    }
}

/// The per-run mutable state threaded through every script and protocol
/// call. Lives behind a single [`tokio::sync::Mutex`] so every mutation from
/// script code is automatically serialized by the Script Mutex, per
/// the run.
pub struct ExecutionContext {
    /// The collection's static metadata.
    pub collection_info: CollectionInfo,
    /// The collection's declared protocol id.
    pub protocol: String,
    /// Global variables, last in the `quest.variables` cascade.
    pub global_variables: HashMap<String, Value>,
    /// Collection-scoped variables.
    pub collection_variables: HashMap<String, Value>,
    /// The active environment block.
    pub environment: EnvironmentSpec,
    /// The live scope frame stack.
    pub scope_stack: ScopeStack,
    /// Resolved iteration rows for this run.
    pub iteration_data: Vec<Value>,
    /// 1-based current iteration number.
    pub iteration_current: usize,
    /// Total iteration count for this run.
    pub iteration_count: usize,
    /// Where `iteration_data` came from.
    pub iteration_source: IterationSource,
    /// The request currently being processed, set for the duration of its
    /// pre/I-O/post phase.
    pub current_request: Option<questrunner_plugin::ProtocolRequest>,
    /// The most recent protocol response, set by the scheduler immediately
    /// after I/O returns, before post-scripts run.
    pub current_response: Option<ProtocolResponse>,
    /// Append-only archival log, one row per completed request node.
    pub execution_history: Vec<ExecutionRecord>,
    /// `quest.event`, set only while a plugin-event script is running.
    pub event: Option<EventInfo>,
    /// The most recent `quest.expectMessages(...)` call for the request
    /// currently executing, reset before each request's pre-scripts run.
    pub pending_expect_messages: Option<ExpectMessages>,
    /// Cookie storage.
    pub cookie_jar: Arc<dyn CookieJar>,
    /// Cancellation signal (external `options.signal` or bail).
    pub abort: AbortHandle,
}

impl ExecutionContext {
    /// The iteration row for `iteration_current`, if iteration data exists.
    pub fn current_iteration_row(&self) -> Option<&Value> {
        self.iteration_data.get(self.iteration_current.checked_sub(1)?)
    }

    /// Convenience accessor mirroring `quest.history.requests.count`.
    pub fn history_count(&self) -> usize {
        self.execution_history.len()
    }

    /// Look up the most recent history entry by id or name
    /// (`quest.history.requests.get`).
    pub fn history_get(&self, id_or_name: &str) -> Option<&ExecutionRecord> {
        self.execution_history
            .iter()
            .rev()
            .find(|r| r.id == id_or_name || r.name == id_or_name)
    }

    /// The most recently appended history entry.
    pub fn history_last(&self) -> Option<&ExecutionRecord> {
        self.execution_history.last()
    }

    /// Filter history by `path` (supporting a trailing `*` wildcard),
    /// `name`, `iteration`, or `id`, per the `quest.history.requests.filter`
    /// criteria.
    pub fn history_filter(&self, criteria: &HistoryFilter) -> Vec<&ExecutionRecord> {
        self.execution_history
            .iter()
            .filter(|record| criteria.matches(record))
            .collect()
    }
}

/// Criteria accepted by `quest.history.requests.filter`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    /// Exact path match, or a prefix match when ending in `*`.
    pub path: Option<String>,
    /// Exact name match.
    pub name: Option<String>,
    /// Exact iteration match.
    pub iteration: Option<usize>,
    /// Exact id match.
    pub id: Option<String>,
}

impl HistoryFilter {
    fn matches(&self, record: &ExecutionRecord) -> bool {
        if let Some(path) = &self.path {
            let matches_path = match path.strip_suffix('*') {
                Some(prefix) => record.path.starts_with(prefix),
                None => record.path == *path,
            };
            if !matches_path {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if record.name != *name {
                return false;
            }
        }
        if let Some(iteration) = self.iteration {
            if record.iteration != iteration {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if record.id != *id {
                return false;
            }
        }
        true
    }
}

/// Shared ownership of an [`ExecutionContext`] behind the Script Mutex.
pub type SharedContext = Arc<Mutex<ExecutionContext>>;

/// Builds an [`ExecutionContext`] from a collection id/protocol and
/// optional overrides; used by the scheduler at the start of a run and by
/// tests that need a minimal context.
pub struct ExecutionContextBuilder {
    collection_info: CollectionInfo,
    protocol: String,
    global_variables: HashMap<String, Value>,
    collection_variables: HashMap<String, Value>,
    environment: EnvironmentSpec,
    cookie_jar: Option<Arc<dyn CookieJar>>,
    abort: AbortHandle,
}

impl ExecutionContextBuilder {
    /// Start building a context for `collection_id` running over `protocol`.
    pub fn new(collection_id: impl Into<String>, protocol: impl Into<String>) -> Self {
        let id = collection_id.into();
        Self {
            collection_info: CollectionInfo {
                id: id.clone(),
                name: id,
            },
            protocol: protocol.into(),
            global_variables: HashMap::new(),
            collection_variables: HashMap::new(),
            environment: EnvironmentSpec::default(),
            cookie_jar: None,
            abort: AbortHandle::new(),
        }
    }

    /// Override the collection's display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.collection_info.name = name.into();
        self
    }

    /// Seed initial global variables.
    pub fn global_variables(mut self, vars: HashMap<String, Value>) -> Self {
        self.global_variables = vars;
        self
    }

    /// Seed initial collection variables.
    pub fn collection_variables(mut self, vars: HashMap<String, Value>) -> Self {
        self.collection_variables = vars;
        self
    }

    /// Set the active environment.
    pub fn environment(mut self, environment: EnvironmentSpec) -> Self {
        self.environment = environment;
        self
    }

    /// Use a non-default cookie jar.
    pub fn cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    /// Share an externally-owned abort handle (so callers can trip it).
    pub fn abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    /// Finish building.
    pub fn build(self) -> ExecutionContext {
        ExecutionContext {
            collection_info: self.collection_info,
            protocol: self.protocol,
            global_variables: self.global_variables,
            collection_variables: self.collection_variables,
            environment: self.environment,
            scope_stack: ScopeStack::new(),
            iteration_data: Vec::new(),
            iteration_current: 1,
            iteration_count: 1,
            iteration_source: IterationSource::None,
            current_request: None,
            current_response: None,
            execution_history: Vec::new(),
            event: None,
            pending_expect_messages: None,
            cookie_jar: self.cookie_jar.unwrap_or_else(|| Arc::new(InMemoryCookieJar::new())),
            abort: self.abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_handle_is_idempotent_on_first_reason() {
        let abort = AbortHandle::new();
        assert!(!abort.is_aborted());
        abort.abort("first");
        abort.abort("second");
        assert!(abort.is_aborted());
        assert_eq!(abort.reason(), Some("first".to_string()));
    }

    #[test]
    fn history_filter_matches_wildcard_path() {
        let record = |path: &str| ExecutionRecord {
            id: "r1".to_string(),
            name: "Req".to_string(),
            path: path.to_string(),
            iteration: 1,
            response: None,
            tests: vec![],
            script_error: None,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };
        let filter = HistoryFilter {
            path: Some("folder.*".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&record("folder.child")));
        assert!(!filter.matches(&record("other.child")));
    }

    #[test]
    fn effective_concurrency_forces_one_when_sequential() {
        let options = RuntimeOptions {
            execution: ExecutionOptions {
                allow_parallel: false,
                max_concurrency: 8,
                bail: false,
            },
            ..Default::default()
        };
        assert_eq!(options.effective_concurrency(), 1);
    }

    #[test]
    fn run_result_recount_tests_splits_by_outcome() {
        let mut result = RunResult {
            collection_id: "c1".to_string(),
            collection_name: "C".to_string(),
            start_time: String::new(),
            end_time: String::new(),
            duration_ms: 0,
            request_results: vec![ExecutionRecord {
                id: "r1".to_string(),
                name: "R".to_string(),
                path: "r1".to_string(),
                iteration: 1,
                response: None,
                tests: vec![
                    TestResult {
                        name: "a".to_string(),
                        passed: true,
                        skipped: false,
                        error: None,
                        script_type: "request-post".to_string(),
                        event_name: None,
                    },
                    TestResult {
                        name: "b".to_string(),
                        passed: false,
                        skipped: false,
                        error: Some("boom".to_string()),
                        script_type: "request-post".to_string(),
                        event_name: None,
                    },
                    TestResult {
                        name: "c".to_string(),
                        passed: false,
                        skipped: true,
                        error: None,
                        script_type: "request-post".to_string(),
                        event_name: None,
                    },
                ],
                script_error: None,
                timestamp: String::new(),
            }],
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            skipped_tests: 0,
            aborted: false,
            abort_reason: None,
            validation_errors: None,
        };
        result.recount_tests();
        assert_eq!(result.total_tests, 3);
        assert_eq!(result.passed_tests, 1);
        assert_eq!(result.failed_tests, 1);
        assert_eq!(result.skipped_tests, 1);
    }
}
