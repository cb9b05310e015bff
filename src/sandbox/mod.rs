// Script sandbox: config, errors, the script worker and host capabilities
pub mod capabilities;
pub mod config;
pub mod convert;
pub mod error;
pub mod registrar;
mod runtime;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::{BrowserLauncher, BrowserPool, ChromeLauncher, LaunchOptions};
use config::Config;
use error::{Result, SandboxError};
use registrar::HostContext;
use runtime::{Job, ScriptWorker};

/// One isolated guest runtime plus the host capabilities bound into it.
///
/// Globals persist across `run` calls on the same sandbox; use a fresh
/// sandbox for isolation. Calls are serialized on a single worker thread,
/// so concurrent callers simply queue.
pub struct Sandbox {
    id: Uuid,
    config: Arc<Config>,
    scope: CancellationToken,
    browser: Option<Arc<BrowserPool>>,
    worker: Mutex<Option<ScriptWorker>>,
    groups: Vec<&'static str>,
    closed: AtomicBool,
}

impl Sandbox {
    /// Must be called from within a Tokio runtime. `root` cancels the sandbox
    /// and everything it started; `None` uses the default config.
    pub fn new(root: CancellationToken, config: Option<Config>) -> Result<Self> {
        Self::with_launcher(root, config, Arc::new(ChromeLauncher::new()))
    }

    pub fn with_launcher(
        root: CancellationToken,
        config: Option<Config>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            SandboxError::system(format!("sandbox needs a Tokio runtime: {}", e))
        })?;
        let config = Arc::new(config.unwrap_or_default());
        let id = Uuid::new_v4();
        let scope = root.child_token();

        let browser = config.enable_browser.then(|| {
            Arc::new(BrowserPool::new(
                launcher,
                LaunchOptions::new(config.headless, config.browser_timeout),
                scope.clone(),
            ))
        });

        let worker = ScriptWorker::spawn(HostContext {
            sandbox_id: id,
            config: config.clone(),
            runtime,
            browser: browser.clone(),
            scope: scope.clone(),
        })?;
        let groups = worker.groups().to_vec();
        info!(sandbox = %id, groups = ?groups, "Sandbox ready");

        Ok(Self {
            id,
            config,
            scope,
            browser,
            worker: Mutex::new(Some(worker)),
            groups,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Capability groups registered at construction, in registration order.
    pub fn groups(&self) -> &[&'static str] {
        &self.groups
    }

    pub fn browser_pool(&self) -> Option<&Arc<BrowserPool>> {
        self.browser.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.scope.is_cancelled()
    }

    /// Evaluate `script` without a deadline. A guest exception becomes an
    /// `EXECUTION_ERROR` carrying the guest message.
    pub async fn run(&self, script: &str) -> Result<Value> {
        let (reply, done) = oneshot::channel();
        self.submit(Job::Eval {
            script: script.to_string(),
            reply,
        })?;
        self.await_reply(done).await
    }

    /// Evaluate `script` against a deadline; zero means the configured
    /// default. On expiry this returns `TIMEOUT` at once, but the evaluation
    /// itself keeps running on the worker and its result is discarded.
    pub async fn run_with_deadline(&self, script: &str, timeout: Duration) -> Result<Value> {
        let (reply, done) = oneshot::channel();
        self.submit(Job::Eval {
            script: script.to_string(),
            reply,
        })?;
        self.with_deadline(done, timeout).await
    }

    /// Like [`run_with_deadline`](Self::run_with_deadline), with `vars` bound
    /// as locals of the script. Nothing injected outlives the call.
    pub async fn run_scoped(
        &self,
        script: &str,
        vars: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let (reply, done) = oneshot::channel();
        self.submit(Job::Scoped {
            script: script.to_string(),
            vars,
            reply,
        })?;
        self.with_deadline(done, timeout).await
    }

    /// Assign a global, as `globalThis[name] = value` would.
    pub async fn set(&self, name: &str, value: Value) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.submit(Job::Set {
            name: name.to_string(),
            value,
            reply,
        })?;
        self.await_reply(done).await
    }

    /// Read a global. `None` when no such global exists.
    pub async fn get(&self, name: &str) -> Result<Option<Value>> {
        let (reply, done) = oneshot::channel();
        self.submit(Job::Get {
            name: name.to_string(),
            reply,
        })?;
        self.await_reply(done).await
    }

    /// Cancel the sandbox scope, stop the shared browser and release the
    /// worker. A script that is still running finishes in the background.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scope.cancel();
        if let Some(pool) = &self.browser {
            pool.teardown().await;
        }
        if let Ok(mut worker) = self.worker.lock() {
            worker.take();
        }
        info!(sandbox = %self.id, "Sandbox closed");
    }

    fn submit(&self, job: Job) -> Result<()> {
        if self.is_closed() {
            return Err(SandboxError::cancelled("sandbox is closed"));
        }
        let worker = self
            .worker
            .lock()
            .map_err(|_| SandboxError::system("sandbox worker lock poisoned"))?;
        match worker.as_ref() {
            Some(worker) => worker.submit(job),
            None => Err(SandboxError::cancelled("sandbox is closed")),
        }
    }

    async fn await_reply<T>(&self, done: oneshot::Receiver<Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => {
                debug!(sandbox = %self.id, "Sandbox cancelled while waiting for a script");
                Err(SandboxError::cancelled("sandbox closed while the script was running"))
            }
            result = done => result.unwrap_or_else(|_| {
                Err(SandboxError::system("script worker stopped before replying"))
            }),
        }
    }

    async fn with_deadline<T>(
        &self,
        done: oneshot::Receiver<Result<T>>,
        timeout: Duration,
    ) -> Result<T> {
        let timeout = if timeout.is_zero() {
            self.config.default_timeout
        } else {
            timeout
        };
        match tokio::time::timeout(timeout, self.await_reply(done)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    sandbox = %self.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Script deadline elapsed; evaluation continues in the background"
                );
                Err(SandboxError::timed_out(timeout))
            }
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{FakeLauncher, GotoOutcome};
    use crate::sandbox::error::{ErrorCode, SESSION_CLOSED};
    use serde_json::json;
    use std::time::Instant;

    fn sandbox_with(launcher: Arc<FakeLauncher>) -> Sandbox {
        Sandbox::with_launcher(CancellationToken::new(), None, launcher).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_wins_over_a_runaway_script() {
        let sandbox = Sandbox::new(CancellationToken::new(), None).unwrap();
        let started = Instant::now();
        let err = sandbox
            .run_with_deadline("while (true) {}", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timed_out());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completion_before_deadline_returns_the_value() {
        let sandbox = Sandbox::new(CancellationToken::new(), None).unwrap();
        let value = sandbox
            .run_with_deadline("[1, 2, 3].map(n => n * 2)", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(value, json!([2, 4, 6]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn globals_persist_between_runs() {
        let sandbox = Sandbox::new(CancellationToken::new(), None).unwrap();
        sandbox.run("var x = 1").await.unwrap();
        assert_eq!(sandbox.run("x").await.unwrap(), json!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn thrown_errors_carry_the_guest_message() {
        let sandbox = Sandbox::new(CancellationToken::new(), None).unwrap();
        let err = sandbox.run("throw new Error('boom')").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExecutionError);
        assert!(err.message().contains("boom"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_sandbox_refuses_work() {
        let launcher = Arc::new(FakeLauncher::new());
        let sandbox = sandbox_with(launcher.clone());
        sandbox
            .run("newBrowserSession().getURL().success")
            .await
            .unwrap();

        sandbox.close().await;
        sandbox.close().await;
        assert_eq!(launcher.shutdowns(), 1);
        let err = sandbox.run("1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_the_root_cancels_a_waiting_run() {
        let root = CancellationToken::new();
        let sandbox = Sandbox::new(root.clone(), None).unwrap();
        let cancel = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = sandbox.run("sleep(5000)").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn capability_failures_are_structured_results() {
        let sandbox = Sandbox::new(CancellationToken::new(), None).unwrap();
        let result = sandbox
            .run("readFile('/definitely/missing/file.txt')")
            .await
            .unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["code"], "FILE_NOT_FOUND");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disabled_groups_are_not_registered() {
        let config = Config::default().with_browser(false).with_http(false);
        let sandbox = Sandbox::new(CancellationToken::new(), Some(config)).unwrap();
        assert_eq!(
            sandbox.groups(),
            &["system", "logging", "utilities", "filesystem", "documents", "images"]
        );
        assert!(sandbox.browser_pool().is_none());
        let value = sandbox
            .run("[typeof newBrowserSession, typeof httpGet, typeof readFile, typeof console.log]")
            .await
            .unwrap();
        assert_eq!(value, json!(["undefined", "undefined", "function", "function"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_navigation_keeps_the_session_usable() {
        let launcher = Arc::new(FakeLauncher::new().with_navigation(vec![GotoOutcome::Fail(
            "net::ERR_NAME_NOT_RESOLVED".into(),
        )]));
        let sandbox = sandbox_with(launcher);
        let result = sandbox
            .run(
                r#"(() => {
                    const session = newBrowserSession();
                    const nav = session.navigate("http://example.invalid");
                    const url = session.getURL();
                    return { nav, url };
                })()"#,
            )
            .await
            .unwrap();
        assert_eq!(result["nav"]["success"], false);
        assert_eq!(result["nav"]["code"], "BROWSER_ERROR");
        assert!(result["nav"]["error"]
            .as_str()
            .unwrap()
            .contains("ERR_NAME_NOT_RESOLVED"));
        assert_eq!(result["url"]["success"], true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_wait_leaves_the_sandbox_usable() {
        let sandbox = sandbox_with(Arc::new(FakeLauncher::new()));
        let result = sandbox
            .run("newBrowserSession().wait(1e20)")
            .await
            .unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["code"], "INVALID_INPUT");
        assert_eq!(sandbox.run("1 + 1").await.unwrap(), json!(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn double_close_then_click_reports_closed_session() {
        let sandbox = sandbox_with(Arc::new(FakeLauncher::new()));
        let result = sandbox
            .run(
                r##"(() => {
                    const session = newBrowserSession();
                    session.getURL();
                    const first = session.close();
                    const second = session.close();
                    return { first, second, click: session.click("#go") };
                })()"##,
            )
            .await
            .unwrap();
        assert_eq!(result["first"]["success"], true);
        assert_eq!(result["second"]["success"], true);
        assert_eq!(result["click"]["success"], false);
        assert_eq!(result["click"]["error"], SESSION_CLOSED);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn many_sessions_share_one_browser_process() {
        let launcher = Arc::new(FakeLauncher::new());
        let sandbox = sandbox_with(launcher.clone());
        let value = sandbox
            .run(
                r#"(() => {
                    const sessions = [];
                    for (let i = 0; i < 8; i++) sessions.push(newBrowserSession());
                    return sessions.map(s => s.getURL().success);
                })()"#,
            )
            .await
            .unwrap();
        assert_eq!(value, json!([true, true, true, true, true, true, true, true]));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_options_are_validated() {
        let sandbox = sandbox_with(Arc::new(FakeLauncher::new()));
        let value = sandbox
            .run("newBrowserSession({ timeout: 'soon' })")
            .await
            .unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["code"], "INVALID_INPUT");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scoped_runs_leave_no_trace() {
        let sandbox = Sandbox::new(CancellationToken::new(), None).unwrap();
        let mut vars = Map::new();
        vars.insert("name".into(), json!("ada"));
        let value = sandbox
            .run_scoped("name.toUpperCase()", vars, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, json!("ADA"));
        assert_eq!(sandbox.get("name").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn set_and_get_round_trip_globals() {
        let sandbox = Sandbox::new(CancellationToken::new(), None).unwrap();
        sandbox.set("limits", json!({"max": 3})).await.unwrap();
        assert_eq!(sandbox.run("limits.max * 2").await.unwrap(), json!(6));
        assert_eq!(sandbox.get("limits").await.unwrap(), Some(json!({"max": 3})));
    }
}
