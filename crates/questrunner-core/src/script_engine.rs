//! `ScriptEngine` — sandboxed runner for a single `quest.*` script, built on
//! `rquickjs` for in-process JavaScript. Every execution gets a fresh `Runtime`/
//! `Context` created inside `spawn_blocking`, bounded by a `Semaphore`, so a
//! misbehaving script cannot see another run's state and cannot monopolize
//! the worker pool.
//!
//! Nothing `!Send` (an `rquickjs::Ctx`, a `Rc<RefCell<_>>`) ever crosses an
//! `.await`: the caller snapshots everything a script may read into a
//! [`ScriptInput`] while holding the Script Mutex, runs the sandbox on a
//! blocking thread, and applies the returned [`ScriptOutput`] back onto the
//! [`crate::context::ExecutionContext`] under the same lock.

use crate::context::{AbortHandle, EventInfo, ExecutionRecord, ExpectMessages, HistoryFilter};
use crate::context::TestResult as CoreTestResult;
use crate::error::{Error, Result};
use crate::script_kind::ScriptKind;
use questrunner_plugin::{ProtocolOptions, ProtocolPlugin, ProtocolRequest, ProtocolResponse};
use rquickjs::{Context, Ctx, Function, Object, Runtime, Value as JsValue};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Everything one script execution may read, snapshotted up front.
#[derive(Clone)]
pub struct ScriptInput {
    /// Script source.
    pub script: String,
    /// Which slot this script occupies.
    pub script_kind: ScriptKind,
    /// Whether `quest.test(...)` is allowed to run here (check 1, resolved
    /// by the scheduler using the active protocol event when applicable).
    pub allow_test: bool,
    /// `quest.event`, set only for plugin-event scripts.
    pub event: Option<EventInfo>,
    pub collection_id: String,
    pub collection_name: String,
    pub environment_name: Option<String>,
    pub environment_vars: HashMap<String, Value>,
    pub global_variables: HashMap<String, Value>,
    pub collection_variables: HashMap<String, Value>,
    /// Scope frames, innermost (top) first. Only index `0` is writable.
    pub scope_frames: Vec<HashMap<String, Value>>,
    pub iteration_row: Option<Value>,
    pub iteration_current: usize,
    pub iteration_count: usize,
    pub history: Vec<ExecutionRecord>,
    /// Cookies for the current request's host, flattened.
    pub cookies: HashMap<String, String>,
    pub current_request: Option<ProtocolRequest>,
    pub current_response: Option<ProtocolResponse>,
    /// Available only when the scheduler permits ad-hoc `quest.sendRequest`.
    pub protocol: Option<Arc<dyn ProtocolPlugin>>,
    pub protocol_options: ProtocolOptions,
    /// Checked by `quest.wait`, `quest.sendRequest`, and between `quest.test`
    /// callbacks, so a run-level abort interrupts a script rather than
    /// waiting for it to finish on its own.
    pub abort: AbortHandle,
}

/// Requested cookie mutation, applied by the caller after the sandbox runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CookieMutation {
    #[default]
    None,
    ClearCurrentHost,
}

/// Everything a script may have produced, to be folded back into
/// `ExecutionContext` by the caller.
pub struct ScriptOutput {
    pub global_variables: HashMap<String, Value>,
    pub collection_variables: HashMap<String, Value>,
    pub top_scope_variables: Option<HashMap<String, Value>>,
    pub tests: Vec<CoreTestResult>,
    pub expect_messages: Option<ExpectMessages>,
    pub cookie_mutation: CookieMutation,
    /// The script's final expression value, JSON-converted. Used by the
    /// scheduler to evaluate `condition` expressions; ignored for ordinary
    /// pre/post scripts.
    pub eval_result: Option<Value>,
    /// Set when the script threw and the scheduler should surface it as a
    /// `scriptError` rather than a panic.
    pub thrown: Option<String>,
}

/// Bounds concurrent script executions; the Script Mutex already serializes
/// everything, but the semaphore caps how many sandboxes exist at once when
/// several runs share one process.
pub struct ScriptEngine {
    semaphore: Arc<Semaphore>,
}

impl ScriptEngine {
    /// Build an engine allowing up to `max_concurrent` simultaneous
    /// sandboxes.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run `input.script` to completion in a fresh sandbox.
    pub async fn run(&self, input: ScriptInput) -> Result<ScriptOutput> {
        if input.script.trim().is_empty() {
            return Ok(ScriptOutput {
                global_variables: input.global_variables,
                collection_variables: input.collection_variables,
                top_scope_variables: None,
                tests: Vec::new(),
                expect_messages: None,
                cookie_mutation: CookieMutation::None,
                eval_result: None,
                thrown: None,
            });
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| Error::script(format!("failed to acquire script permit: {e}")))?;

        tokio::task::spawn_blocking(move || execute_blocking(input))
            .await
            .map_err(|e| Error::script(format!("script task panicked: {e}")))?
    }
}

fn execute_blocking(input: ScriptInput) -> Result<ScriptOutput> {
    let runtime = Runtime::new().map_err(|e| Error::script(format!("failed to create JS runtime: {e}")))?;
    let context = Context::full(&runtime).map_err(|e| Error::script(format!("failed to create JS context: {e}")))?;

    let tests = Rc::new(RefCell::new(Vec::<CoreTestResult>::new()));
    let expect_messages = Rc::new(RefCell::new(None::<ExpectMessages>));
    let cookie_mutation = Rc::new(RefCell::new(CookieMutation::None));
    let has_scope_frame = !input.scope_frames.is_empty();
    let top_scope_writes = Rc::new(RefCell::new(input.scope_frames.first().cloned().unwrap_or_default()));
    let global_writes = Rc::new(RefCell::new(input.global_variables.clone()));
    let collection_writes = Rc::new(RefCell::new(input.collection_variables.clone()));

    let (thrown, eval_result) = context.with(|ctx| -> Result<(Option<String>, Option<Value>)> {
        let quest = Object::new(ctx.clone()).map_err(js_err)?;

        install_static_data(&ctx, &quest, &input)?;
        install_variables(&ctx, &quest, &input, &global_writes, &collection_writes, &top_scope_writes)?;
        install_history(&ctx, &quest, &input)?;
        install_cookies(&ctx, &quest, &input, &cookie_mutation)?;
        install_test_api(&ctx, &quest, input.allow_test, &tests, &input.abort)?;
        install_expect_messages(&ctx, &quest, input.script_kind, &expect_messages)?;
        install_wait(&ctx, &quest, &input.abort)?;
        install_send_request(&ctx, &quest, &input)?;
        install_console(&ctx)?;

        ctx.globals().set("quest", quest).map_err(js_err)?;

        match ctx.eval::<JsValue, _>(input.script.as_bytes()) {
            Ok(value) => Ok((None, Some(js_to_json(&value)))),
            Err(rquickjs::Error::Exception) => {
                let exception = ctx.catch();
                Ok((Some(describe_exception(&ctx, &exception)), None))
            }
            Err(e) => Ok((Some(e.to_string()), None)),
        }
    })?;

    Ok(ScriptOutput {
        global_variables: Rc::try_unwrap(global_writes).map(RefCell::into_inner).unwrap_or_default(),
        collection_variables: Rc::try_unwrap(collection_writes).map(RefCell::into_inner).unwrap_or_default(),
        top_scope_variables: has_scope_frame
            .then(|| Rc::try_unwrap(top_scope_writes).map(RefCell::into_inner).unwrap_or_default()),
        tests: Rc::try_unwrap(tests).map(RefCell::into_inner).unwrap_or_default(),
        expect_messages: *expect_messages.borrow(),
        cookie_mutation: *cookie_mutation.borrow(),
        eval_result,
        thrown,
    })
}

fn js_err(e: rquickjs::Error) -> Error {
    Error::script(e.to_string())
}

/// Throws a JS exception carrying the abort reason if `abort` has tripped.
fn check_aborted(ctx: &Ctx<'_>, abort: &AbortHandle) -> rquickjs::Result<()> {
    if abort.is_aborted() {
        let reason = abort.reason().unwrap_or_else(|| "run aborted".to_string());
        return Err(ctx.throw(rquickjs::String::from_str(ctx.clone(), &format!("aborted: {reason}"))?.into_value()));
    }
    Ok(())
}

/// `quest.collection`, `quest.environment`, `quest.iteration`, `quest.event`
/// — read-only static snapshots, no cascade involved.
fn install_static_data(ctx: &Ctx<'_>, quest: &Object<'_>, input: &ScriptInput) -> Result<()> {
    let collection = Object::new(ctx.clone()).map_err(js_err)?;
    collection.set("id", input.collection_id.as_str()).map_err(js_err)?;
    collection.set("name", input.collection_name.as_str()).map_err(js_err)?;
    quest.set("collection", collection).map_err(js_err)?;

    let environment = Object::new(ctx.clone()).map_err(js_err)?;
    match &input.environment_name {
        Some(name) => environment.set("name", name.as_str()).map_err(js_err)?,
        None => environment.set("name", rquickjs::Undefined).map_err(js_err)?,
    }
    environment.set("variables", json_to_js(ctx, &Value::Object(
        input.environment_vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    ))?).map_err(js_err)?;
    quest.set("environment", environment).map_err(js_err)?;

    let iteration = Object::new(ctx.clone()).map_err(js_err)?;
    iteration.set("current", input.iteration_current as i64).map_err(js_err)?;
    iteration.set("count", input.iteration_count as i64).map_err(js_err)?;
    let data = Object::new(ctx.clone()).map_err(js_err)?;
    let row = input.iteration_row.clone().unwrap_or(Value::Object(Default::default()));
    let row_map: HashMap<String, Value> = match &row {
        Value::Object(m) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => HashMap::new(),
    };
    let row_js = json_to_js(ctx, &row)?;
    data.set("get", {
        let ctx = ctx.clone();
        let row_map = row_map.clone();
        Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<JsValue<'_>> {
            match row_map.get(&key) {
                Some(value) => json_to_js(&ctx, value),
                None => Ok(JsValue::new_undefined(ctx.clone())),
            }
        })
        .map_err(js_err)?
    })
    .map_err(js_err)?;
    data.set("has", {
        let row_map = row_map.clone();
        Function::new(ctx.clone(), move |key: String| -> bool { row_map.contains_key(&key) }).map_err(js_err)?
    })
    .map_err(js_err)?;
    data.set("keys", {
        let row_map = row_map.clone();
        Function::new(ctx.clone(), move || -> Vec<String> { row_map.keys().cloned().collect() }).map_err(js_err)?
    })
    .map_err(js_err)?;
    data.set("toObject", {
        let row_js = row_js.clone();
        Function::new(ctx.clone(), move || -> JsValue { row_js.clone() }).map_err(js_err)?
    })
    .map_err(js_err)?;
    data.set("all", {
        Function::new(ctx.clone(), move || -> JsValue { row_js.clone() }).map_err(js_err)?
    })
    .map_err(js_err)?;
    iteration.set("data", data).map_err(js_err)?;
    quest.set("iteration", iteration).map_err(js_err)?;

    match &input.event {
        Some(event) => {
            let event_obj = Object::new(ctx.clone()).map_err(js_err)?;
            event_obj.set("name", event.name.as_str()).map_err(js_err)?;
            event_obj.set("index", event.index as i64).map_err(js_err)?;
            quest.set("event", event_obj).map_err(js_err)?;
        }
        None => quest.set("event", rquickjs::Null).map_err(js_err)?,
    }

    if let Some(request) = &input.current_request {
        let request_obj = Object::new(ctx.clone()).map_err(js_err)?;
        request_obj.set("id", request.id.as_str()).map_err(js_err)?;
        request_obj.set("name", request.name.as_str()).map_err(js_err)?;
        request_obj.set("method", request.method.as_str()).map_err(js_err)?;
        request_obj.set("url", request.url.as_str()).map_err(js_err)?;
        let headers = json_to_js(
            ctx,
            &Value::Object(request.headers.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect()),
        )?;
        request_obj.set("headers", headers).map_err(js_err)?;
        request_obj.set("data", json_to_js(ctx, &request.data)?).map_err(js_err)?;
        quest.set("request", request_obj).map_err(js_err)?;
    }

    if let Some(response) = &input.current_response {
        let response_obj = Object::new(ctx.clone()).map_err(js_err)?;
        response_obj.set("data", json_to_js(ctx, &response.data)?).map_err(js_err)?;
        let summary = serde_json::to_value(&response.summary).unwrap_or(Value::Null);
        response_obj.set("summary", json_to_js(ctx, &summary)?).map_err(js_err)?;
        quest.set("response", response_obj).map_err(js_err)?;
    }

    Ok(())
}

/// `quest.global.variables`, `quest.collection.variables`,
/// `quest.scope.variables`, and the read-only `quest.variables` cascade.
fn install_variables<'js>(
    ctx: &Ctx<'js>,
    quest: &Object<'js>,
    input: &ScriptInput,
    global_writes: &Rc<RefCell<HashMap<String, Value>>>,
    collection_writes: &Rc<RefCell<HashMap<String, Value>>>,
    top_scope_writes: &Rc<RefCell<HashMap<String, Value>>>,
) -> Result<()> {
    let global_bag = readable_bag(ctx, global_writes.clone())?;
    writable(ctx, &global_bag, global_writes.clone())?;
    quest.set("global", global_bag).map_err(js_err)?;

    let collection_bag = readable_bag(ctx, collection_writes.clone())?;
    writable(ctx, &collection_bag, collection_writes.clone())?;
    // `quest.collection` was set in install_static_data as {id, name};
    // attach `.variables` onto it rather than overwriting the object.
    let collection: Object<'js> = quest.get("collection").map_err(js_err)?;
    collection.set("variables", collection_bag).map_err(js_err)?;

    let scope_bag = readable_bag(ctx, top_scope_writes.clone())?;
    writable(ctx, &scope_bag, top_scope_writes.clone())?;
    let scope = Object::new(ctx.clone()).map_err(js_err)?;
    scope.set("variables", scope_bag).map_err(js_err)?;
    quest.set("scope", scope).map_err(js_err)?;

    // The read-only cascade: iteration -> scope frames (innermost first) ->
    // collection -> environment -> global.
    let mut cascade: HashMap<String, Value> = HashMap::new();
    for key in input.global_variables.keys() {
        cascade.entry(key.clone()).or_insert_with(|| input.global_variables[key].clone());
    }
    for (key, value) in &input.environment_vars {
        cascade.insert(key.clone(), value.clone());
    }
    for (key, value) in &input.collection_variables {
        cascade.insert(key.clone(), value.clone());
    }
    for frame in input.scope_frames.iter().rev() {
        for (key, value) in frame {
            cascade.insert(key.clone(), value.clone());
        }
    }
    if let Some(Value::Object(row)) = &input.iteration_row {
        for (key, value) in row {
            cascade.insert(key.clone(), value.clone());
        }
    }
    let cascade_bag = readable_bag(ctx, Rc::new(RefCell::new(cascade)))?;
    quest.set("variables", cascade_bag).map_err(js_err)?;

    Ok(())
}

/// A `{get,has,keys,toObject}` bag backed by a shared map, read-only until
/// [`writable`] attaches a `set` method to the same object.
fn readable_bag<'js>(ctx: &Ctx<'js>, store: Rc<RefCell<HashMap<String, Value>>>) -> Result<Object<'js>> {
    let obj = Object::new(ctx.clone()).map_err(js_err)?;
    {
        let ctx = ctx.clone();
        let store = store.clone();
        obj.set(
            "get",
            Function::new(ctx.clone(), move |key: String| -> rquickjs::Result<JsValue<'_>> {
                match store.borrow().get(&key) {
                    Some(value) => json_to_js(&ctx, value),
                    None => Ok(JsValue::new_null(ctx.clone())),
                }
            })
            .map_err(js_err)?,
        )
        .map_err(js_err)?;
    }
    {
        let store = store.clone();
        obj.set(
            "has",
            Function::new(ctx.clone(), move |key: String| -> bool { store.borrow().contains_key(&key) })
                .map_err(js_err)?,
        )
        .map_err(js_err)?;
    }
    {
        let store = store.clone();
        obj.set(
            "keys",
            Function::new(ctx.clone(), move || -> Vec<String> { store.borrow().keys().cloned().collect() })
                .map_err(js_err)?,
        )
        .map_err(js_err)?;
    }
    {
        let ctx = ctx.clone();
        let store = store.clone();
        obj.set(
            "toObject",
            Function::new(ctx.clone(), move || -> rquickjs::Result<JsValue<'_>> {
                let snapshot = Value::Object(store.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect());
                json_to_js(&ctx, &snapshot)
            })
            .map_err(js_err)?,
        )
        .map_err(js_err)?;
    }
    Ok(obj)
}

/// Attaches a `set(key, value)` method to `bag` that records writes into
/// `sink` instead of `bag`'s own backing store, so the caller can diff what
/// a script actually changed.
fn writable<'js>(ctx: &Ctx<'js>, bag: &Object<'js>, sink: Rc<RefCell<HashMap<String, Value>>>) -> Result<()> {
    bag.set(
        "set",
        Function::new(ctx.clone(), move |key: String, value: JsValue| {
            let json = js_to_json(&value);
            sink.borrow_mut().insert(key, json);
        })
        .map_err(js_err)?,
    )
    .map_err(js_err)?;
    Ok(())
}

/// `quest.history.requests.{count,get,all,last,filter}`.
fn install_history(ctx: &Ctx<'_>, quest: &Object<'_>, input: &ScriptInput) -> Result<()> {
    let history = Rc::new(input.history.clone());
    let requests = Object::new(ctx.clone()).map_err(js_err)?;

    requests
        .set("count", {
            let history = history.clone();
            Function::new(ctx.clone(), move || -> i64 { history.len() as i64 }).map_err(js_err)?
        })
        .map_err(js_err)?;

    requests
        .set("get", {
            let history = history.clone();
            let ctx = ctx.clone();
            Function::new(ctx.clone(), move |id_or_name: String| -> rquickjs::Result<JsValue> {
                match history.iter().rev().find(|r| r.id == id_or_name || r.name == id_or_name) {
                    Some(record) => record_to_js(&ctx, record),
                    None => Ok(JsValue::new_null(ctx.clone())),
                }
            })
            .map_err(js_err)?
        })
        .map_err(js_err)?;

    requests
        .set("last", {
            let history = history.clone();
            let ctx = ctx.clone();
            Function::new(ctx.clone(), move || -> rquickjs::Result<JsValue> {
                match history.last() {
                    Some(record) => record_to_js(&ctx, record),
                    None => Ok(JsValue::new_null(ctx.clone())),
                }
            })
            .map_err(js_err)?
        })
        .map_err(js_err)?;

    requests
        .set("all", {
            let history = history.clone();
            let ctx = ctx.clone();
            Function::new(ctx.clone(), move || -> rquickjs::Result<Vec<JsValue<'_>>> {
                history.iter().map(|r| record_to_js(&ctx, r)).collect()
            })
            .map_err(js_err)?
        })
        .map_err(js_err)?;

    requests
        .set("filter", {
            let history = history.clone();
            let ctx = ctx.clone();
            Function::new(ctx.clone(), move |criteria: JsValue| -> rquickjs::Result<Vec<JsValue<'_>>> {
                let criteria_json = js_to_json(&criteria);
                let filter: HistoryFilter = serde_json::from_value(criteria_json).unwrap_or_default();
                history.iter().filter(|r| filter_matches(&filter, r)).map(|r| record_to_js(&ctx, r)).collect()
            })
            .map_err(js_err)?
        })
        .map_err(js_err)?;

    quest.set("history", Object::new(ctx.clone()).map_err(js_err)?).map_err(js_err)?;
    let history_obj: Object = quest.get("history").map_err(js_err)?;
    history_obj.set("requests", requests).map_err(js_err)?;
    Ok(())
}

fn filter_matches(filter: &HistoryFilter, record: &ExecutionRecord) -> bool {
    if let Some(path) = &filter.path {
        let matches_path = match path.strip_suffix('*') {
            Some(prefix) => record.path.starts_with(prefix),
            None => record.path == *path,
        };
        if !matches_path {
            return false;
        }
    }
    if let Some(name) = &filter.name {
        if record.name != *name {
            return false;
        }
    }
    if let Some(iteration) = filter.iteration {
        if record.iteration != iteration {
            return false;
        }
    }
    if let Some(id) = &filter.id {
        if record.id != *id {
            return false;
        }
    }
    true
}

fn record_to_js<'js>(ctx: &Ctx<'js>, record: &ExecutionRecord) -> rquickjs::Result<JsValue<'js>> {
    let value = serde_json::to_value(record).unwrap_or(Value::Null);
    json_to_js(ctx, &value)
}

/// `quest.cookies.{get,has,toObject,clear}`, scoped to the current request's
/// host.
fn install_cookies(
    ctx: &Ctx<'_>,
    quest: &Object<'_>,
    input: &ScriptInput,
    cookie_mutation: &Rc<RefCell<CookieMutation>>,
) -> Result<()> {
    let cookies = Rc::new(input.cookies.clone());
    let obj = Object::new(ctx.clone()).map_err(js_err)?;

    obj.set("get", {
        let cookies = cookies.clone();
        Function::new(ctx.clone(), move |name: String| -> Option<String> { cookies.get(&name).cloned() })
            .map_err(js_err)?
    })
    .map_err(js_err)?;

    obj.set("has", {
        let cookies = cookies.clone();
        Function::new(ctx.clone(), move |name: String| -> bool { cookies.contains_key(&name) }).map_err(js_err)?
    })
    .map_err(js_err)?;

    obj.set("toObject", {
        let ctx = ctx.clone();
        let cookies = cookies.clone();
        Function::new(ctx.clone(), move || -> rquickjs::Result<JsValue<'_>> {
            let snapshot = Value::Object(cookies.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect());
            json_to_js(&ctx, &snapshot)
        })
        .map_err(js_err)?
    })
    .map_err(js_err)?;

    obj.set("clear", {
        let mutation = cookie_mutation.clone();
        Function::new(ctx.clone(), move || {
            *mutation.borrow_mut() = CookieMutation::ClearCurrentHost;
        })
        .map_err(js_err)?
    })
    .map_err(js_err)?;

    quest.set("cookies", obj).map_err(js_err)?;
    Ok(())
}

/// `quest.test(name, fn)` and `quest.skip(reason)`. Runtime rejection when
/// `allow_test` is false uses a fixed error message.
fn install_test_api(
    ctx: &Ctx<'_>,
    quest: &Object<'_>,
    allow_test: bool,
    tests: &Rc<RefCell<Vec<CoreTestResult>>>,
    abort: &AbortHandle,
) -> Result<()> {
    let tests = tests.clone();
    let script_type = "request-post".to_string();
    let ctx_for_test = ctx.clone();
    let abort = abort.clone();
    let test_fn = Function::new(ctx.clone(), move |name: String, callback: JsValue| -> rquickjs::Result<()> {
        check_aborted(&ctx_for_test, &abort)?;
        if !allow_test {
            // Runtime-level check 1, independent of static validation.
            tests.borrow_mut().push(CoreTestResult {
                name,
                passed: false,
                skipped: false,
                error: Some("quest.test() can only be called in request post scripts".to_string()),
                script_type: script_type.clone(),
                event_name: None,
            });
            return Ok(());
        }
        let outcome = match callback.as_function() {
            Some(func) => func.call::<(), ()>(()),
            None => Ok(()),
        };
        let result = match outcome {
            Ok(()) => CoreTestResult {
                name,
                passed: true,
                skipped: false,
                error: None,
                script_type: script_type.clone(),
                event_name: None,
            },
            Err(rquickjs::Error::Exception) => {
                let exception = ctx_for_test.catch();
                if is_skip_exception(&exception) {
                    CoreTestResult {
                        name,
                        passed: false,
                        skipped: true,
                        error: None,
                        script_type: script_type.clone(),
                        event_name: None,
                    }
                } else {
                    CoreTestResult {
                        name,
                        passed: false,
                        skipped: false,
                        error: Some(describe_exception(&ctx_for_test, &exception)),
                        script_type: script_type.clone(),
                        event_name: None,
                    }
                }
            }
            Err(e) => CoreTestResult {
                name,
                passed: false,
                skipped: false,
                error: Some(e.to_string()),
                script_type: script_type.clone(),
                event_name: None,
            },
        };
        tests.borrow_mut().push(result);
        Ok(())
    })
    .map_err(js_err)?;
    quest.set("test", test_fn).map_err(js_err)?;

    let skip_fn = Function::new(ctx.clone(), |reason: Option<String>, ctx: Ctx<'_>| -> rquickjs::Result<()> {
        let error = Object::new(ctx.clone())?;
        error.set("__questSkip", true)?;
        error.set("message", reason.unwrap_or_default())?;
        Err(ctx.throw(error.into_value()))
    })
    .map_err(js_err)?;
    quest.set("skip", skip_fn).map_err(js_err)?;

    Ok(())
}

fn is_skip_exception(value: &JsValue) -> bool {
    value
        .as_object()
        .and_then(|o| o.get::<_, Option<bool>>("__questSkip").ok().flatten())
        .unwrap_or(false)
}

fn describe_exception(ctx: &Ctx<'_>, value: &JsValue) -> String {
    if let Some(obj) = value.as_object() {
        if let Ok(Some(message)) = obj.get::<_, Option<String>>("message") {
            return message;
        }
    }
    if let Some(s) = value.as_string() {
        if let Ok(text) = s.to_string() {
            return text;
        }
    }
    let _ = ctx;
    format!("{value:?}")
}

/// `quest.expectMessages(n[, timeoutMs])`, a no-op at execution time beyond
/// recording intent for the protocol plugin, only meaningful in `request-pre`.
fn install_expect_messages(
    ctx: &Ctx<'_>,
    quest: &Object<'_>,
    script_kind: ScriptKind,
    expect_messages: &Rc<RefCell<Option<ExpectMessages>>>,
) -> Result<()> {
    let expect_messages = expect_messages.clone();
    let allowed = script_kind.allows_expect_messages();
    let func = Function::new(ctx.clone(), move |count: i64, timeout_ms: Option<i64>| {
        if !allowed || count <= 0 {
            return;
        }
        *expect_messages.borrow_mut() = Some(ExpectMessages {
            count: count as u64,
            timeout_ms: timeout_ms.and_then(|t| u64::try_from(t).ok()),
        });
    })
    .map_err(js_err)?;
    quest.set("expectMessages", func).map_err(js_err)?;
    Ok(())
}

/// How long each `quest.wait` sleep increment runs before re-checking the
/// abort signal.
const WAIT_POLL_MS: u64 = 50;

/// `quest.wait(ms)` — a blocking sleep on the sandbox's dedicated thread,
/// broken into short increments so a run-level abort interrupts it instead
/// of running to completion. Rejects NaN/non-number/negative values with the
/// fixed messages from below.
fn install_wait(ctx: &Ctx<'_>, quest: &Object<'_>, abort: &AbortHandle) -> Result<()> {
    let abort = abort.clone();
    let func = Function::new(ctx.clone(), move |ms: JsValue, ctx: Ctx<'_>| -> rquickjs::Result<()> {
        let Some(ms) = ms.as_number() else {
            return Err(ctx.throw(rquickjs::String::from_str(ctx.clone(), "quest.wait(ms) requires a number")?.into_value()));
        };
        if ms.is_nan() {
            return Err(ctx.throw(rquickjs::String::from_str(ctx.clone(), "quest.wait(ms) received NaN")?.into_value()));
        }
        if ms < 0.0 {
            return Err(ctx.throw(rquickjs::String::from_str(ctx.clone(), "quest.wait(ms) requires a non-negative duration")?.into_value()));
        }
        check_aborted(&ctx, &abort)?;
        let mut remaining = std::time::Duration::from_millis(ms as u64);
        let step = std::time::Duration::from_millis(WAIT_POLL_MS);
        while !remaining.is_zero() {
            let chunk = remaining.min(step);
            std::thread::sleep(chunk);
            remaining -= chunk;
            check_aborted(&ctx, &abort)?;
        }
        Ok(())
    })
    .map_err(js_err)?;
    quest.set("wait", func).map_err(js_err)?;
    Ok(())
}

/// `quest.sendRequest(cfg)` — an ad-hoc call to the active protocol plugin,
/// bypassing the DAG and the execution history.
fn install_send_request(ctx: &Ctx<'_>, quest: &Object<'_>, input: &ScriptInput) -> Result<()> {
    let Some(plugin) = input.protocol.clone() else {
        return Ok(());
    };
    let options = input.protocol_options.clone();
    let abort = input.abort.clone();
    let func = Function::new(ctx.clone(), move |cfg: JsValue, ctx: Ctx<'_>| -> rquickjs::Result<JsValue<'_>> {
        check_aborted(&ctx, &abort)?;
        let cfg_json = js_to_json(&cfg);
        let request = ProtocolRequest {
            id: "adhoc".to_string(),
            name: "quest.sendRequest".to_string(),
            method: cfg_json.get("method").and_then(Value::as_str).unwrap_or("GET").to_string(),
            url: cfg_json.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
            headers: cfg_json
                .get("headers")
                .and_then(Value::as_object)
                .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
                .unwrap_or_default(),
            data: cfg_json.get("data").cloned().unwrap_or(Value::Null),
        };
        let plugin = plugin.clone();
        let options = options.clone();
        let response = tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(plugin.execute(&request, &options, None))
        });
        check_aborted(&ctx, &abort)?;
        match response {
            Ok(response) => {
                let value = serde_json::to_value(&response).unwrap_or(Value::Null);
                json_to_js(&ctx, &value)
            }
            Err(e) => Err(ctx.throw(rquickjs::String::from_str(ctx.clone(), e.to_string())?.into_value())),
        }
    })
    .map_err(js_err)?;
    quest.set("sendRequest", func).map_err(js_err)?;
    Ok(())
}

/// `console.log(...)` — scripts may log for debugging; output goes through
/// `tracing`, matching the ambient logging stack rather than raw `println!`.
fn install_console(ctx: &Ctx<'_>) -> Result<()> {
    let console = Object::new(ctx.clone()).map_err(js_err)?;
    let log_fn = Function::new(ctx.clone(), |message: String| {
        tracing::info!(target: "questrunner::script", "{message}");
    })
    .map_err(js_err)?;
    console.set("log", log_fn).map_err(js_err)?;
    ctx.globals().set("console", console).map_err(js_err)?;
    Ok(())
}

fn json_to_js<'js>(ctx: &Ctx<'js>, value: &Value) -> rquickjs::Result<JsValue<'js>> {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    ctx.eval(format!("({text})"))
}

fn js_to_json(value: &JsValue<'_>) -> Value {
    let ctx = value.ctx();
    let Ok(json_global) = ctx.globals().get::<_, Object>("JSON") else {
        return Value::Null;
    };
    let Ok(stringify) = json_global.get::<_, Function>("stringify") else {
        return Value::Null;
    };
    match stringify.call::<_, Option<rquickjs::String>>((value.clone(),)) {
        Ok(Some(s)) => s.to_string().ok().and_then(|text| serde_json::from_str(&text).ok()).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input(script: &str, script_kind: ScriptKind, allow_test: bool) -> ScriptInput {
        ScriptInput {
            script: script.to_string(),
            script_kind,
            allow_test,
            event: None,
            collection_id: "c1".to_string(),
            collection_name: "Collection".to_string(),
            environment_name: None,
            environment_vars: HashMap::new(),
            global_variables: HashMap::new(),
            collection_variables: HashMap::new(),
            scope_frames: vec![HashMap::new()],
            iteration_row: None,
            iteration_current: 0,
            iteration_count: 1,
            history: Vec::new(),
            cookies: HashMap::new(),
            current_request: None,
            current_response: None,
            protocol: None,
            protocol_options: ProtocolOptions::default(),
            abort: AbortHandle::default(),
        }
    }

    #[tokio::test]
    async fn global_variable_set_and_read_back_round_trips() {
        let engine = ScriptEngine::new(4);
        let input = base_input(
            r#"quest.global.variables.set("token", "abc123");"#,
            ScriptKind::RequestPre,
            false,
        );
        let output = engine.run(input).await.unwrap();
        assert_eq!(output.global_variables.get("token"), Some(&Value::String("abc123".to_string())));
        assert!(output.thrown.is_none());
    }

    #[tokio::test]
    async fn global_variable_seen_by_a_later_script_run() {
        let engine = ScriptEngine::new(4);
        let mut input = base_input(r#"quest.global.variables.set("count", 1);"#, ScriptKind::RequestPre, false);
        let first = engine.run(input.clone()).await.unwrap();
        input.global_variables = first.global_variables;
        input.script = r#"
            const n = quest.global.variables.get("count");
            quest.global.variables.set("count", n + 1);
        "#
        .to_string();
        let second = engine.run(input).await.unwrap();
        assert_eq!(second.global_variables.get("count"), Some(&Value::Number(2.into())));
    }

    #[tokio::test]
    async fn test_recorded_as_passed_in_request_post() {
        let engine = ScriptEngine::new(4);
        let input = base_input(r#"quest.test("adds up", () => {});"#, ScriptKind::RequestPost, true);
        let output = engine.run(input).await.unwrap();
        assert_eq!(output.tests.len(), 1);
        assert!(output.tests[0].passed);
        assert!(!output.tests[0].skipped);
    }

    #[tokio::test]
    async fn test_call_rejected_at_runtime_when_not_allowed() {
        let engine = ScriptEngine::new(4);
        let input = base_input(r#"quest.test("nope", () => {});"#, ScriptKind::RequestPre, false);
        let output = engine.run(input).await.unwrap();
        assert_eq!(output.tests.len(), 1);
        assert!(!output.tests[0].passed);
        assert_eq!(
            output.tests[0].error.as_deref(),
            Some("quest.test() can only be called in request post scripts")
        );
    }

    #[tokio::test]
    async fn skip_inside_test_marks_it_skipped_not_failed() {
        let engine = ScriptEngine::new(4);
        let input = base_input(
            r#"quest.test("conditional", () => { quest.skip("not applicable"); });"#,
            ScriptKind::RequestPost,
            true,
        );
        let output = engine.run(input).await.unwrap();
        assert_eq!(output.tests.len(), 1);
        assert!(output.tests[0].skipped);
        assert!(!output.tests[0].passed);
    }

    #[tokio::test]
    async fn thrown_error_is_captured_not_propagated() {
        let engine = ScriptEngine::new(4);
        let input = base_input("throw new Error('boom');", ScriptKind::RequestPre, false);
        let output = engine.run(input).await.unwrap();
        assert!(output.thrown.as_deref().unwrap_or_default().contains("boom"));
    }

    #[tokio::test]
    async fn blank_script_short_circuits_without_a_sandbox() {
        let engine = ScriptEngine::new(4);
        let input = base_input("   ", ScriptKind::RequestPre, false);
        let output = engine.run(input).await.unwrap();
        assert!(output.tests.is_empty());
        assert!(output.thrown.is_none());
    }

    #[tokio::test]
    async fn expect_messages_recorded_only_in_request_pre() {
        let engine = ScriptEngine::new(4);
        let input = base_input("quest.expectMessages(3, 500);", ScriptKind::RequestPre, false);
        let output = engine.run(input).await.unwrap();
        let expect = output.expect_messages.unwrap();
        assert_eq!(expect.count, 3);
        assert_eq!(expect.timeout_ms, Some(500));
    }

    #[tokio::test]
    async fn aborted_run_interrupts_wait() {
        let engine = ScriptEngine::new(4);
        let mut input = base_input("quest.wait(5000);", ScriptKind::RequestPre, false);
        input.abort.abort("stopped by user");
        let output = engine.run(input).await.unwrap();
        assert!(output.thrown.as_deref().unwrap_or_default().contains("stopped by user"));
    }

    #[tokio::test]
    async fn cookies_clear_is_surfaced_as_a_mutation() {
        let engine = ScriptEngine::new(4);
        let mut input = base_input("quest.cookies.clear();", ScriptKind::RequestPre, false);
        input.cookies.insert("session".to_string(), "xyz".to_string());
        let output = engine.run(input).await.unwrap();
        assert_eq!(output.cookie_mutation, CookieMutation::ClearCurrentHost);
    }
}
