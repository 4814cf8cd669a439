//! Script sandbox - runs user pre-request and post-response scripts
//!
//! Scripts are Rhai, evaluated on a dedicated thread under an operation cap
//! and a wall-clock budget. The caller waits on a channel with its own
//! timeout, so a script that never yields cannot hang the host. A run either
//! succeeds and its mutations are applied, or fails and nothing is applied.

pub mod bindings;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Scope};

use crate::constants::SCRIPT_MAX_OPERATIONS;
use crate::models::{HttpResponse, KeyValue, RawFormat, Request, RequestBody, VarMap};
use bindings::{Console, ScriptRequest, ScriptResponse, ScriptVariables};

/// Extra wait after the budget before the supervisor gives up on the thread.
const SUPERVISOR_GRACE: Duration = Duration::from_millis(250);

/// State a script runs against
#[derive(Clone, Debug, Default)]
pub struct ScriptContext {
    pub request: Request,
    pub response: Option<HttpResponse>,
    pub variables: VarMap,
}

impl ScriptContext {
    pub fn new(request: Request, variables: VarMap) -> Self {
        ScriptContext {
            request,
            response: None,
            variables,
        }
    }
}

/// Outcome of one script run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptResult {
    pub success: bool,
    pub output: Vec<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    PreRequest,
    PostResponse,
    Signature,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::PreRequest => "pre-request",
            Phase::PostResponse => "post-response",
            Phase::Signature => "signature",
        }
    }
}

/// Everything a successful run wants to change
#[derive(Debug, Default)]
struct Mutations {
    added_headers: Vec<(String, String)>,
    body: Option<String>,
    variables: VarMap,
    value: Option<String>,
}

struct Outcome {
    result: Result<Mutations, String>,
    output: Vec<String>,
}

/// Sandboxed script runner
#[derive(Clone, Debug)]
pub struct ScriptSandbox {
    budget: Duration,
    max_operations: u64,
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::constants::DEFAULT_SCRIPT_TIMEOUT_MS))
    }
}

fn build_engine(
    console: &Console,
    deadline: Option<Instant>,
    abort: Arc<AtomicBool>,
    max_operations: u64,
) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(max_operations);
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(64, 32);
    engine.set_max_string_size(8 * 1024 * 1024);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(100_000);
    engine.set_strict_variables(true);
    engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
    engine.disable_symbol("eval");

    let out = console.clone();
    engine.on_print(move |text| out.push("", text));
    let out = console.clone();
    engine.on_debug(move |text, _source, _pos| out.push("[DEBUG] ", text));
    engine.on_progress(move |_ops| {
        let expired = deadline.is_some_and(|d| Instant::now() >= d);
        if expired || abort.load(Ordering::Relaxed) {
            Some(Dynamic::from("time budget exceeded".to_string()))
        } else {
            None
        }
    });

    bindings::register(&mut engine);
    engine
}

/// Scope with every name a script may reference
fn build_scope(
    request: ScriptRequest,
    response: Option<ScriptResponse>,
    variables: VarMap,
    console: Console,
) -> Scope<'static> {
    let mut scope = Scope::new();
    scope.push("request", request);
    if let Some(response) = response {
        scope.push("response", response);
    }
    scope.push("variables", ScriptVariables { values: variables });
    scope.push("console", console);
    scope
}

fn describe(err: &EvalAltResult, budget: Duration) -> String {
    match err {
        EvalAltResult::ErrorTerminated(..) => {
            format!("Script timed out after {} ms", budget.as_millis())
        }
        EvalAltResult::ErrorTooManyOperations(..) => {
            "Script exceeded the operation limit".to_string()
        }
        other => other.to_string(),
    }
}

struct Job {
    phase: Phase,
    script: String,
    request: ScriptRequest,
    response: Option<ScriptResponse>,
    variables: VarMap,
}

impl Job {
    fn run(
        self,
        deadline: Instant,
        abort: Arc<AtomicBool>,
        max_operations: u64,
        budget: Duration,
    ) -> Outcome {
        let console = Console::default();
        let engine = build_engine(&console, Some(deadline), abort, max_operations);
        let mut scope = build_scope(self.request, self.response, self.variables, console.clone());

        let result = (|| -> Result<Mutations, String> {
            let ast = engine
                .compile_with_scope(&scope, &self.script)
                .map_err(|e| format!("Syntax error: {}", e))?;
            let value: Dynamic = engine
                .eval_ast_with_scope(&mut scope, &ast)
                .map_err(|e| describe(&e, budget))?;

            let request = scope
                .get_value::<ScriptRequest>("request")
                .ok_or("`request` was reassigned")?;
            let variables = scope
                .get_value::<ScriptVariables>("variables")
                .ok_or("`variables` was reassigned")?;

            let value = match self.phase {
                Phase::Signature if value.is_unit() => {
                    return Err("Signature script produced no value".to_string())
                }
                Phase::Signature => Some(bindings::dynamic_to_string(value)),
                _ => None,
            };

            Ok(Mutations {
                added_headers: request.added_headers,
                body: request.new_body,
                variables: variables.values,
                value,
            })
        })();

        Outcome {
            result,
            output: console.take(),
        }
    }
}

impl ScriptSandbox {
    pub fn new(budget: Duration) -> Self {
        ScriptSandbox {
            budget,
            max_operations: SCRIPT_MAX_OPERATIONS,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Syntax check without running anything.
    pub fn validate(&self, script: &str) -> Result<(), String> {
        if script.trim().is_empty() {
            return Ok(());
        }
        let console = Console::default();
        let abort = Arc::new(AtomicBool::new(false));
        let engine = build_engine(&console, None, abort, self.max_operations);
        let scope = build_scope(
            ScriptRequest::default(),
            Some(ScriptResponse::default()),
            VarMap::new(),
            console,
        );
        engine
            .compile_with_scope(&scope, script)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Run on a supervised thread and wait at most the budget.
    fn supervise(&self, job: Job) -> Outcome {
        let phase = job.phase;
        let (tx, rx) = mpsc::channel();
        let abort = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + self.budget;
        let (thread_abort, max_operations, budget) = (abort.clone(), self.max_operations, self.budget);

        let spawned = std::thread::Builder::new()
            .name(format!("script-{}", phase.as_str()))
            .spawn(move || {
                let _ = tx.send(job.run(deadline, thread_abort, max_operations, budget));
            });
        if let Err(e) = spawned {
            return Outcome {
                result: Err(format!("Failed to start script thread: {}", e)),
                output: Vec::new(),
            };
        }

        match rx.recv_timeout(self.budget + SUPERVISOR_GRACE) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                abort.store(true, Ordering::Relaxed);
                tracing::warn!(phase = phase.as_str(), "Script thread did not stop within its budget");
                Outcome {
                    result: Err(format!("Script timed out after {} ms", self.budget.as_millis())),
                    output: Vec::new(),
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Outcome {
                result: Err("Script aborted unexpectedly".to_string()),
                output: Vec::new(),
            },
        }
    }

    fn run(
        &self,
        phase: Phase,
        script: &str,
        ctx: &mut ScriptContext,
    ) -> (ScriptResult, Option<String>) {
        let start = Instant::now();
        let job = Job {
            phase,
            script: script.to_string(),
            request: ScriptRequest::from(&ctx.request),
            response: ctx.response.as_ref().map(ScriptResponse::from),
            variables: ctx.variables.clone(),
        };
        let outcome = self.supervise(job);
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome.result {
            Ok(mutations) => {
                tracing::debug!(phase = phase.as_str(), duration_ms, "Script succeeded");
                if phase == Phase::PreRequest {
                    apply_request_mutations(&mut ctx.request, &mutations);
                }
                ctx.variables = mutations.variables;
                (
                    ScriptResult {
                        success: true,
                        output: outcome.output,
                        error: None,
                        duration_ms,
                    },
                    mutations.value,
                )
            }
            Err(error) => {
                tracing::debug!(phase = phase.as_str(), duration_ms, "Script failed");
                (
                    ScriptResult {
                        success: false,
                        output: outcome.output,
                        error: Some(error),
                        duration_ms,
                    },
                    None,
                )
            }
        }
    }

    /// Run a pre-request script. Header additions, body replacement and
    /// variable writes land in `ctx` only if the script succeeds.
    pub fn run_pre_request(&self, script: &str, ctx: &mut ScriptContext) -> ScriptResult {
        if script.trim().is_empty() {
            return ScriptResult {
                success: true,
                ..ScriptResult::default()
            };
        }
        self.run(Phase::PreRequest, script, ctx).0
    }

    /// Run a post-response script against `ctx.response`. Only variable
    /// writes are kept; the request has already been sent.
    pub fn run_post_response(&self, script: &str, ctx: &mut ScriptContext) -> ScriptResult {
        if script.trim().is_empty() {
            return ScriptResult {
                success: true,
                ..ScriptResult::default()
            };
        }
        if ctx.response.is_none() {
            return ScriptResult {
                success: false,
                error: Some("No response available".to_string()),
                ..ScriptResult::default()
            };
        }
        self.run(Phase::PostResponse, script, ctx).0
    }

    /// Evaluate a custom auth expression to the `Authorization` header value.
    /// Variable writes are discarded.
    pub fn evaluate_signature(&self, script: &str, ctx: &ScriptContext) -> Result<String, String> {
        if script.trim().is_empty() {
            return Err("Signature script is empty".to_string());
        }
        let mut scratch = ctx.clone();
        match self.run(Phase::Signature, script, &mut scratch) {
            (_, Some(value)) => Ok(value),
            (result, None) => Err(result.error.unwrap_or_else(|| "Signature script failed".to_string())),
        }
    }
}

/// Headers added by a script update an existing row of the same name (and
/// enable it) or append a new one.
fn apply_request_mutations(request: &mut Request, mutations: &Mutations) {
    for (key, value) in &mutations.added_headers {
        match request
            .headers
            .iter_mut()
            .find(|h| h.key.eq_ignore_ascii_case(key))
        {
            Some(existing) => {
                existing.value = value.clone();
                existing.enabled = true;
            }
            None => request.headers.push(KeyValue::new(key.clone(), value.clone())),
        }
    }

    if let Some(body) = &mutations.body {
        let format = match &request.body {
            RequestBody::Raw { format, .. } => *format,
            _ if serde_json::from_str::<serde_json::Value>(body).is_ok() => RawFormat::Json,
            _ => RawFormat::Text,
        };
        request.body = RequestBody::raw(format, body.clone());
    }

    if !mutations.added_headers.is_empty() || mutations.body.is_some() {
        request.touch();
    }
}
