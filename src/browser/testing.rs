//! In-process browser used by unit tests. Navigation follows a scripted plan
//! and every page call is counted.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::driver::{BrowserLauncher, BrowserProcess, LaunchOptions, PageDriver, BLANK_URL};
use crate::sandbox::error::{Result, SandboxError};

/// What a single `goto` does. Without a plan every navigation lands on the
/// requested URL.
#[derive(Debug, Clone)]
pub enum GotoOutcome {
    Land(String),
    StayBlank,
    Fail(String),
    /// Reports an error although the page at the given URL loaded.
    FailAfterLoading(String, String),
    /// Fails and leaves Chrome's error page committed.
    ErrorPage(String),
}

#[derive(Debug, Clone)]
struct PageScript {
    navigation: Vec<GotoOutcome>,
    ready_state: String,
    screenshot: Vec<u8>,
    hidden: HashSet<String>,
    text: String,
    eval_result: Value,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            navigation: Vec::new(),
            ready_state: "complete".to_string(),
            screenshot: vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a],
            hidden: HashSet::new(),
            text: String::new(),
            eval_result: Value::Bool(true),
        }
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    launches: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    launch_delay: Duration,
    last_cancel: Mutex<Option<CancellationToken>>,
    pages: Arc<Mutex<Vec<Arc<FakePage>>>>,
    script: PageScript,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn with_navigation(mut self, plan: Vec<GotoOutcome>) -> Self {
        self.script.navigation = plan;
        self
    }

    pub fn with_ready_state(mut self, state: &str) -> Self {
        self.script.ready_state = state.to_string();
        self
    }

    pub fn with_screenshot(mut self, data: Vec<u8>) -> Self {
        self.script.screenshot = data;
        self
    }

    pub fn with_hidden(mut self, selector: &str) -> Self {
        self.script.hidden.insert(selector.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.script.text = text.to_string();
        self
    }

    pub fn with_eval_result(mut self, value: Value) -> Self {
        self.script.eval_result = value;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn last_cancel_token(&self) -> Option<CancellationToken> {
        self.last_cancel.lock().ok().and_then(|t| t.clone())
    }

    /// The `index`-th page opened across all launches.
    pub fn page(&self, index: usize) -> Option<Arc<FakePage>> {
        self.pages.lock().ok().and_then(|p| p.get(index).cloned())
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(
        &self,
        _options: &LaunchOptions,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn BrowserProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        if let Ok(mut last) = self.last_cancel.lock() {
            *last = Some(cancel);
        }
        Ok(Arc::new(FakeProcess {
            shutdowns: self.shutdowns.clone(),
            pages: self.pages.clone(),
            script: self.script.clone(),
        }))
    }
}

struct FakeProcess {
    shutdowns: Arc<AtomicUsize>,
    pages: Arc<Mutex<Vec<Arc<FakePage>>>>,
    script: PageScript,
}

#[async_trait]
impl BrowserProcess for FakeProcess {
    async fn new_page(&self) -> Result<Box<dyn PageDriver>> {
        let page = Arc::new(FakePage::new(self.script.clone()));
        if let Ok(mut pages) = self.pages.lock() {
            pages.push(page.clone());
        }
        Ok(Box::new(SharedPage(page)))
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakePage {
    url: Mutex<String>,
    plan: Mutex<VecDeque<GotoOutcome>>,
    script: PageScript,
    interactions: AtomicUsize,
    gotos: AtomicUsize,
    enters: AtomicUsize,
    closed: AtomicBool,
    evaluated: Mutex<Vec<String>>,
    clicks: Mutex<Vec<String>>,
    typed: Mutex<Vec<(String, String)>>,
}

impl FakePage {
    fn new(script: PageScript) -> Self {
        Self {
            url: Mutex::new(BLANK_URL.to_string()),
            plan: Mutex::new(script.navigation.iter().cloned().collect()),
            script,
            interactions: AtomicUsize::new(0),
            gotos: AtomicUsize::new(0),
            enters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            evaluated: Mutex::new(Vec::new()),
            clicks: Mutex::new(Vec::new()),
            typed: Mutex::new(Vec::new()),
        }
    }

    pub fn interactions(&self) -> usize {
        self.interactions.load(Ordering::SeqCst)
    }

    pub fn gotos(&self) -> usize {
        self.gotos.load(Ordering::SeqCst)
    }

    pub fn enters(&self) -> usize {
        self.enters.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether any evaluated expression contained `needle`.
    pub fn evaluated(&self, needle: &str) -> bool {
        self.evaluated
            .lock()
            .map(|e| e.iter().any(|expr| expr.contains(needle)))
            .unwrap_or(false)
    }

    pub fn clicks(&self) -> Vec<String> {
        self.clicks.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.typed.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn touch(&self) {
        self.interactions.fetch_add(1, Ordering::SeqCst);
    }

    fn set_url(&self, url: &str) {
        if let Ok(mut current) = self.url.lock() {
            *current = url.to_string();
        }
    }

    fn url(&self) -> String {
        self.url.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

struct SharedPage(Arc<FakePage>);

#[async_trait]
impl PageDriver for SharedPage {
    async fn goto(&self, url: &str) -> Result<()> {
        let page = &self.0;
        page.touch();
        page.gotos.fetch_add(1, Ordering::SeqCst);
        let step = page.plan.lock().ok().and_then(|mut plan| plan.pop_front());
        match step.unwrap_or_else(|| GotoOutcome::Land(url.to_string())) {
            GotoOutcome::Land(target) => {
                page.set_url(&target);
                Ok(())
            }
            GotoOutcome::StayBlank => {
                page.set_url(BLANK_URL);
                Ok(())
            }
            GotoOutcome::Fail(message) => Err(SandboxError::browser(message)),
            GotoOutcome::FailAfterLoading(target, message) => {
                page.set_url(&target);
                Err(SandboxError::browser(message))
            }
            GotoOutcome::ErrorPage(message) => {
                page.set_url("chrome-error://chromewebdata/");
                Err(SandboxError::browser(message))
            }
        }
    }

    async fn current_url(&self) -> Result<String> {
        self.0.touch();
        Ok(self.0.url())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.0.touch();
        if let Ok(mut evaluated) = self.0.evaluated.lock() {
            evaluated.push(expression.to_string());
        }
        Ok(self.0.script.eval_result.clone())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.0.touch();
        if let Ok(mut clicks) = self.0.clicks.lock() {
            clicks.push(selector.to_string());
        }
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.0.touch();
        if let Ok(mut typed) = self.0.typed.lock() {
            typed.push((selector.to_string(), text.to_string()));
        }
        Ok(())
    }

    async fn press_enter(&self) -> Result<()> {
        self.0.touch();
        self.0.enters.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        self.0.touch();
        Ok(format!(
            "<html><head><title>Fake</title></head><body>{}</body></html>",
            self.0.script.text
        ))
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.0.touch();
        Ok(self.0.script.screenshot.clone())
    }

    async fn close(&self) -> Result<()> {
        self.0.touch();
        self.0.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ready_state(&self) -> Result<String> {
        self.0.touch();
        Ok(self.0.script.ready_state.clone())
    }

    async fn is_visible(&self, selector: &str) -> Result<bool> {
        self.0.touch();
        Ok(!self.0.script.hidden.contains(selector))
    }

    async fn text_content(&self) -> Result<String> {
        self.0.touch();
        Ok(self.0.script.text.clone())
    }
}
