//! The thread that owns a sandbox's interpreter. The interpreter cannot be
//! shared across threads, so every evaluation is shipped to it as a job.

use std::sync::mpsc as std_mpsc;

use boa_engine::property::Attribute;
use boa_engine::builtins::promise::PromiseState;
use boa_engine::{Context, JsError, JsString, JsValue, Source};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::convert;
use super::error::{Result, SandboxError};
use super::registrar::{self, HostContext};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").unwrap());

const RESERVED: &[&str] = &[
    "arguments", "await", "break", "case", "catch", "class", "const", "continue", "debugger",
    "default", "delete", "do", "else", "enum", "eval", "export", "extends", "false", "finally",
    "for", "function", "if", "implements", "import", "in", "instanceof", "interface", "let",
    "new", "null", "package", "private", "protected", "public", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Key of the script source inside a scratch object. Not a valid identifier,
/// so it can never collide with an injected variable.
const SOURCE_KEY: &str = "@source";

pub(crate) enum Job {
    Eval {
        script: String,
        reply: oneshot::Sender<Result<Value>>,
    },
    Scoped {
        script: String,
        vars: Map<String, Value>,
        reply: oneshot::Sender<Result<Value>>,
    },
    Set {
        name: String,
        value: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        name: String,
        reply: oneshot::Sender<Result<Option<Value>>>,
    },
}

pub(crate) struct ScriptWorker {
    jobs: mpsc::UnboundedSender<Job>,
    groups: Vec<&'static str>,
}

impl ScriptWorker {
    /// Start the worker thread and register capabilities on it. Returns once
    /// registration has finished.
    pub fn spawn(host: HostContext) -> Result<Self> {
        let (jobs, mut inbox) = mpsc::unbounded_channel::<Job>();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let id = host.sandbox_id;

        std::thread::Builder::new()
            .name(format!("scriptbox-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                let mut context = Context::default();
                match registrar::install_all(&mut context, &host) {
                    Ok(groups) => {
                        let _ = ready_tx.send(Ok(groups));
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                }
                while let Some(job) = inbox.blocking_recv() {
                    run_job(&mut context, job);
                }
                debug!(sandbox = %id, "Script worker stopped");
            })
            .map_err(|e| {
                SandboxError::system(format!("failed to start script worker: {}", e)).with_cause(e)
            })?;

        let groups = ready_rx
            .recv()
            .map_err(|_| SandboxError::system("script worker exited during startup"))??;
        Ok(Self { jobs, groups })
    }

    pub fn groups(&self) -> &[&'static str] {
        &self.groups
    }

    pub fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| SandboxError::system("script worker has stopped"))
    }
}

fn run_job(context: &mut Context, job: Job) {
    // A send error means the caller stopped waiting; the result is dropped.
    match job {
        Job::Eval { script, reply } => {
            let _ = reply.send(evaluate(context, &script));
        }
        Job::Scoped {
            script,
            vars,
            reply,
        } => {
            let _ = reply.send(evaluate_scoped(context, &script, &vars));
        }
        Job::Set { name, value, reply } => {
            let _ = reply.send(set_global(context, &name, &value));
        }
        Job::Get { name, reply } => {
            let _ = reply.send(get_global(context, &name));
        }
    }
}

fn guest_error(err: JsError) -> SandboxError {
    SandboxError::execution(err.to_string())
}

fn evaluate(context: &mut Context, script: &str) -> Result<Value> {
    let value = context
        .eval(Source::from_bytes(script))
        .map_err(guest_error)?;
    if let Err(err) = context.run_jobs() {
        debug!(error = %err, "Pending job failed");
    }
    let value = settle(value)?;
    convert::to_json(&value, context).map_err(guest_error)
}

/// Unwrap a promise completion value once the job queue has drained.
fn settle(value: JsValue) -> Result<JsValue> {
    let Some(promise) = value.as_promise() else {
        return Ok(value);
    };
    match promise.state() {
        PromiseState::Fulfilled(result) => Ok(result),
        PromiseState::Rejected(reason) => Err(SandboxError::execution(format!(
            "promise rejected: {}",
            reason.display()
        ))),
        PromiseState::Pending => Err(SandboxError::execution(
            "promise still pending after the job queue drained",
        )),
    }
}

/// Evaluate `script` with `vars` bound as locals of a wrapper function. The
/// values travel through a configurable global that is deleted afterwards.
fn evaluate_scoped(context: &mut Context, script: &str, vars: &Map<String, Value>) -> Result<Value> {
    for name in vars.keys() {
        if !IDENTIFIER.is_match(name) || RESERVED.contains(&name.as_str()) {
            return Err(SandboxError::invalid_input(format!(
                "'{}' is not a usable variable name",
                name
            )));
        }
    }

    let slot = format!("__scriptbox_scratch_{}", Uuid::new_v4().simple());
    let mut scratch = vars.clone();
    scratch.insert(SOURCE_KEY.to_string(), Value::String(script.to_string()));
    let scratch = convert::to_js(&Value::Object(scratch), context).map_err(guest_error)?;
    context
        .register_global_property(JsString::from(slot.as_str()), scratch, Attribute::all())
        .map_err(guest_error)?;

    let names: Vec<&str> = vars.keys().map(String::as_str).collect();
    let bindings: Vec<String> = names
        .iter()
        .map(|name| format!("{}[{}]", slot, Value::String(name.to_string())))
        .collect();
    let wrapper = format!(
        "(function ({params}) {{ return eval({slot}[{source}]); }})({args})",
        params = names.join(", "),
        slot = slot,
        source = Value::String(SOURCE_KEY.to_string()),
        args = bindings.join(", "),
    );
    let result = evaluate(context, &wrapper);

    let global = context.global_object();
    if let Err(err) = global.delete_property_or_throw(JsString::from(slot.as_str()), context) {
        warn!(%slot, error = %err, "Failed to remove scratch namespace");
    }
    result
}

fn set_global(context: &mut Context, name: &str, value: &Value) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SandboxError::invalid_input("global name must not be empty"));
    }
    let value = convert::to_js(value, context).map_err(guest_error)?;
    context
        .global_object()
        .set(JsString::from(name), value, true, context)
        .map_err(guest_error)?;
    Ok(())
}

fn get_global(context: &mut Context, name: &str) -> Result<Option<Value>> {
    let global = context.global_object();
    if !global
        .has_property(JsString::from(name), context)
        .map_err(guest_error)?
    {
        return Ok(None);
    }
    let value = global
        .get(JsString::from(name), context)
        .map_err(guest_error)?;
    convert::to_json(&value, context)
        .map(Some)
        .map_err(guest_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scoped_values_do_not_leak() {
        let mut context = Context::default();
        let vars = json!({"a": 2, "b": {"n": 3}});
        let value = evaluate_scoped(
            &mut context,
            "var local = a * b.n; local + 1",
            vars.as_object().unwrap(),
        )
        .unwrap();
        assert_eq!(value, json!(7));

        let leaked = evaluate(
            &mut context,
            "[typeof a, typeof local, Object.keys(globalThis).filter(k => k.startsWith('__scriptbox')).length]",
        )
        .unwrap();
        assert_eq!(leaked, json!(["undefined", "undefined", 0]));
    }

    #[test]
    fn scoped_runs_reject_bad_names() {
        let mut context = Context::default();
        for name in ["eval", "1abc", "a-b", "this"] {
            let mut vars = Map::new();
            vars.insert(name.to_string(), json!(1));
            let err = evaluate_scoped(&mut context, "1", &vars).unwrap_err();
            assert_eq!(err.code(), crate::sandbox::error::ErrorCode::InvalidInput);
        }
    }

    #[test]
    fn scoped_errors_still_clean_up() {
        let mut context = Context::default();
        let vars = json!({"x": 1});
        let err = evaluate_scoped(&mut context, "throw new Error('bad ' + x)", vars.as_object().unwrap())
            .unwrap_err();
        assert!(err.message().contains("bad 1"));
        let left = evaluate(
            &mut context,
            "Object.keys(globalThis).filter(k => k.startsWith('__scriptbox')).length",
        )
        .unwrap();
        assert_eq!(left, json!(0));
    }

    #[test]
    fn promise_results_are_settled() {
        let mut context = Context::default();
        assert_eq!(
            evaluate(&mut context, "Promise.resolve(20).then(n => n + 1)").unwrap(),
            json!(21)
        );
        let err = evaluate(&mut context, "Promise.reject(new Error('nope'))").unwrap_err();
        assert_eq!(err.code(), crate::sandbox::error::ErrorCode::ExecutionError);
        assert!(err.message().contains("nope"));
    }

    #[test]
    fn globals_can_be_set_and_read() {
        let mut context = Context::default();
        set_global(&mut context, "config", &json!({"retries": 3})).unwrap();
        assert_eq!(evaluate(&mut context, "config.retries + 1").unwrap(), json!(4));

        evaluate(&mut context, "var counter = 1").unwrap();
        set_global(&mut context, "counter", &json!(5)).unwrap();
        assert_eq!(get_global(&mut context, "counter").unwrap(), Some(json!(5)));
        assert_eq!(get_global(&mut context, "missing").unwrap(), None);
    }
}
