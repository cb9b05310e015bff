use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::driver::{has_content, js_literal, PageDriver};
use super::pool::BrowserPool;
use super::wait::WaitTarget;
use crate::sandbox::error::{ErrorCode, Result, SandboxError};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Normalises a few properties automation detectors look at.
const STEALTH_SCRIPT: &str = r#"(() => {
  try {
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
    Object.defineProperty(navigator, 'plugins', {
      get: () => [
        { name: 'PDF Viewer', filename: 'internal-pdf-viewer' },
        { name: 'Chrome PDF Viewer', filename: 'internal-pdf-viewer' },
        { name: 'Chromium PDF Viewer', filename: 'internal-pdf-viewer' },
      ],
    });
    window.chrome = window.chrome || { runtime: {} };
  } catch (e) {}
  return true;
})()"#;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Total lifetime; the session closes itself once it elapses.
    pub lifetime: Duration,
    /// Pause before each navigation so a freshly started browser can settle.
    pub grace: Duration,
    /// Bound on waiting for the document to become interactive after navigation.
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    /// Default bound for selector, URL and text waits.
    pub element_timeout: Duration,
}

impl SessionOptions {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            grace: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            element_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Navigation {
    pub url: String,
    /// The driver reported an error but a page was loaded anyway.
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Screenshot {
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Default)]
struct PageSlot {
    page: Option<Box<dyn PageDriver>>,
}

impl PageSlot {
    fn page(&self) -> Result<&dyn PageDriver> {
        self.page.as_deref().ok_or_else(SandboxError::session_closed)
    }
}

/// One page multiplexed over the pool's shared process.
pub struct BrowserSession {
    id: Uuid,
    pool: Arc<BrowserPool>,
    options: SessionOptions,
    slot: Mutex<PageSlot>,
    active: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    deadline: Instant,
}

impl BrowserSession {
    pub fn new(pool: Arc<BrowserPool>, options: SessionOptions) -> Arc<Self> {
        let cancel = pool.scope().child_token();
        let deadline = Instant::now() + options.lifetime;
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            pool,
            options,
            slot: Mutex::new(PageSlot::default()),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel,
            deadline,
        });
        debug!(session = %session.id, lifetime_ms = session.options.lifetime.as_millis() as u64, "Browser session created");
        session
    }

    /// Close the session when its lifetime elapses or its scope is cancelled,
    /// even if nothing calls into it again.
    pub fn watch_deadline(self: &Arc<Self>, runtime: &Handle) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Browser session lifetime elapsed");
                }
            }
            if let Some(session) = weak.upgrade() {
                session.close().await;
            }
        });
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else if self.active.load(Ordering::Acquire) {
            SessionState::Active
        } else {
            SessionState::Created
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    pub async fn navigate(&self, url: &str) -> Result<Navigation> {
        self.ensure_open()?;
        let url = validate_url(url)?;
        self.guarded(async {
            let slot = self.active_page().await?;
            self.navigate_page(slot.page()?, &url).await
        })
        .await
    }

    pub async fn wait(&self, target: &WaitTarget) -> Result<()> {
        self.guarded(async {
            match target {
                WaitTarget::Seconds(_) => {
                    let _slot = self.open_slot().await?;
                    sleep(target.duration().unwrap_or_default()).await;
                    Ok(())
                }
                WaitTarget::Selector(selector) => {
                    let slot = self.active_page().await?;
                    self.wait_visible(slot.page()?, selector, self.options.element_timeout)
                        .await
                }
            }
        })
        .await
    }

    pub async fn click(&self, selector: &str) -> Result<()> {
        self.ensure_open()?;
        let selector = require_selector(selector)?;
        self.guarded(async {
            let slot = self.active_page().await?;
            let page = slot.page()?;
            self.wait_visible(page, selector, self.options.element_timeout)
                .await?;
            page.click(selector).await
        })
        .await
    }

    /// Replace the field's value with `text`.
    pub async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        self.ensure_open()?;
        let selector = require_selector(selector)?;
        self.guarded(async {
            let slot = self.active_page().await?;
            let page = slot.page()?;
            self.wait_visible(page, selector, self.options.element_timeout)
                .await?;
            page.evaluate(&clear_script(selector)).await?;
            page.type_text(selector, text).await
        })
        .await
    }

    pub async fn clear(&self, selector: &str) -> Result<()> {
        self.ensure_open()?;
        let selector = require_selector(selector)?;
        self.guarded(async {
            let slot = self.active_page().await?;
            let page = slot.page()?;
            self.wait_visible(page, selector, self.options.element_timeout)
                .await?;
            let cleared = page.evaluate(&clear_script(selector)).await?;
            if cleared.as_bool() == Some(false) {
                return Err(SandboxError::browser(format!(
                    "element '{}' not found",
                    selector
                )));
            }
            Ok(())
        })
        .await
    }

    /// Submit the form behind `selector`, or press Enter on the focused element.
    pub async fn submit(&self, selector: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let selector = selector.map(require_selector).transpose()?;
        self.guarded(async {
            let slot = self.active_page().await?;
            let page = slot.page()?;
            match selector {
                Some(selector) => {
                    self.wait_visible(page, selector, self.options.element_timeout)
                        .await?;
                    let submitted = page.evaluate(&submit_script(selector)).await?;
                    if submitted.as_bool() == Some(false) {
                        return Err(SandboxError::browser(format!(
                            "element '{}' not found",
                            selector
                        )));
                    }
                    Ok(())
                }
                None => {
                    if let Some(warning) = self.wait_ready(page).await {
                        debug!(session = %self.id, %warning, "Submitting before document is ready");
                    }
                    page.press_enter().await
                }
            }
        })
        .await
    }

    /// Run `code` in the page's script context.
    pub async fn evaluate(&self, code: &str) -> Result<serde_json::Value> {
        self.ensure_open()?;
        if code.trim().is_empty() {
            return Err(SandboxError::invalid_input("evaluate() needs code to run"));
        }
        self.guarded(async {
            let slot = self.active_page().await?;
            slot.page()?.evaluate(code).await
        })
        .await
    }

    pub async fn get_html(&self) -> Result<String> {
        self.guarded(async {
            let slot = self.active_page().await?;
            slot.page()?.content().await
        })
        .await
    }

    pub async fn get_url(&self) -> Result<String> {
        self.guarded(async {
            let slot = self.active_page().await?;
            slot.page()?.current_url().await
        })
        .await
    }

    /// Capture the page to `path`. Fails unless a non-empty file ends up on disk.
    pub async fn screenshot(&self, path: &Path) -> Result<Screenshot> {
        self.ensure_open()?;
        if path.as_os_str().is_empty() {
            return Err(SandboxError::invalid_input("screenshot() needs a file path"));
        }
        self.guarded(async {
            let slot = self.active_page().await?;
            let data = slot.page()?.screenshot().await?;
            if data.is_empty() {
                return Err(SandboxError::browser("screenshot capture returned no data"));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, &data).await?;
            let written = tokio::fs::metadata(path).await?.len();
            if written == 0 {
                let _ = tokio::fs::remove_file(path).await;
                return Err(SandboxError::browser(format!(
                    "screenshot file {} is empty after writing",
                    path.display()
                )));
            }
            info!(session = %self.id, path = %path.display(), bytes = written, "Screenshot saved");
            Ok(Screenshot {
                path: path.to_path_buf(),
                bytes: written,
            })
        })
        .await
    }

    /// Poll until the URL contains `pattern` or matches it as a regex.
    pub async fn wait_for_url(&self, pattern: &str, limit: Option<Duration>) -> Result<String> {
        self.ensure_open()?;
        if pattern.is_empty() {
            return Err(SandboxError::invalid_input("waitForURL() needs a pattern"));
        }
        let regex = Regex::new(pattern).ok();
        let limit = limit.unwrap_or(self.options.element_timeout);
        self.guarded(async {
            let slot = self.active_page().await?;
            let page = slot.page()?;
            let regex = regex.as_ref();
            let matched = self
                .poll(limit, || async move {
                    let url = page.current_url().await.ok()?;
                    let hit = url.contains(pattern) || regex.map(|r| r.is_match(&url)).unwrap_or(false);
                    hit.then_some(url)
                })
                .await;
            matched.ok_or_else(|| {
                SandboxError::new(
                    ErrorCode::Timeout,
                    format!(
                        "timed out after {}ms waiting for URL matching '{}'",
                        limit.as_millis(),
                        pattern
                    ),
                )
            })
        })
        .await
    }

    pub async fn wait_for_text(&self, text: &str, limit: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        if text.is_empty() {
            return Err(SandboxError::invalid_input("waitForText() needs text"));
        }
        let limit = limit.unwrap_or(self.options.element_timeout);
        self.guarded(async {
            let slot = self.active_page().await?;
            let page = slot.page()?;
            let found = self
                .poll(limit, || async move {
                    let body = page.text_content().await.ok()?;
                    body.contains(text).then_some(())
                })
                .await;
            found.ok_or_else(|| {
                SandboxError::new(
                    ErrorCode::Timeout,
                    format!(
                        "timed out after {}ms waiting for text '{}'",
                        limit.as_millis(),
                        text
                    ),
                )
            })
        })
        .await
    }

    /// Close this session's page. The shared browser process stays up.
    pub async fn close(&self) {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.cancel.cancel();
        let page = self.slot.lock().await.page.take();
        if let Some(page) = page {
            match timeout(CLOSE_TIMEOUT, page.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session = %self.id, error = %e, "Page close failed"),
                Err(_) => debug!(session = %self.id, "Page close timed out"),
            }
        }
        if first {
            info!(session = %self.id, "Browser session closed");
        }
    }

    /// Closed-session error when closed or past its lifetime.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SandboxError::session_closed());
        }
        if Instant::now() >= self.deadline {
            self.expire();
            return Err(SandboxError::session_closed());
        }
        Ok(())
    }

    fn expire(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(session = %self.id, "Browser session lifetime elapsed");
        }
        self.cancel.cancel();
    }

    /// Race `op` against this session's cancellation and lifetime.
    async fn guarded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_open()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SandboxError::session_closed()),
            _ = tokio::time::sleep_until(self.deadline) => {
                self.expire();
                Err(SandboxError::new(
                    ErrorCode::Timeout,
                    format!("browser session {} exceeded its lifetime", self.id),
                ))
            }
            result = op => result,
        }
    }

    async fn open_slot(&self) -> Result<MutexGuard<'_, PageSlot>> {
        let slot = self.slot.lock().await;
        self.ensure_open()?;
        Ok(slot)
    }

    async fn active_page(&self) -> Result<MutexGuard<'_, PageSlot>> {
        let mut slot = self.open_slot().await?;
        if slot.page.is_none() {
            let process = self.pool.acquire().await?;
            slot.page = Some(process.new_page().await?);
            self.active.store(true, Ordering::Release);
            debug!(session = %self.id, "Browser session active");
        }
        Ok(slot)
    }

    async fn navigate_page(&self, page: &dyn PageDriver, url: &str) -> Result<Navigation> {
        if !self.options.grace.is_zero() {
            sleep(self.options.grace).await;
        }

        if let Err(err) = page.goto(url).await {
            let current = page.current_url().await.unwrap_or_default();
            if !has_content(&current) {
                warn!(session = %self.id, %url, error = %err, "Navigation failed");
                return Err(SandboxError::browser(format!(
                    "navigation to {} failed: {}",
                    url,
                    err.message()
                ))
                .with_cause(err));
            }
            warn!(session = %self.id, %url, %current, error = %err, "Navigation reported an error but content loaded");
            return Ok(Navigation {
                url: current,
                partial: true,
                warning: Some(err.message().to_string()),
            });
        }

        let mut warning = self.wait_ready(page).await;
        let mut current = page.current_url().await?;
        if !has_content(&current) {
            debug!(session = %self.id, %url, "Page still blank after navigation, retrying once");
            if let Err(err) = page.goto(url).await {
                debug!(session = %self.id, error = %err, "Navigation retry reported an error");
            }
            if let Some(retry_warning) = self.wait_ready(page).await {
                warning = Some(retry_warning);
            }
            current = page.current_url().await?;
            if !has_content(&current) {
                return Err(SandboxError::browser(format!(
                    "navigation to {} left the page blank after a retry",
                    url
                )));
            }
        }

        match timeout(self.options.ready_timeout, page.evaluate(STEALTH_SCRIPT)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(session = %self.id, error = %e, "Stealth script failed"),
            Err(_) => debug!(session = %self.id, "Stealth script timed out"),
        }

        info!(session = %self.id, url = %current, "Navigation complete");
        Ok(Navigation {
            url: current,
            partial: false,
            warning,
        })
    }

    /// Wait for an interactive document. Returns a warning instead of failing.
    async fn wait_ready(&self, page: &dyn PageDriver) -> Option<String> {
        let ready = self
            .poll(self.options.ready_timeout, || async move {
                let state = page.ready_state().await.ok()?;
                (state == "interactive" || state == "complete").then_some(())
            })
            .await;
        match ready {
            Some(()) => None,
            None => Some(format!(
                "document not ready after {}ms",
                self.options.ready_timeout.as_millis()
            )),
        }
    }

    async fn wait_visible(
        &self,
        page: &dyn PageDriver,
        selector: &str,
        limit: Duration,
    ) -> Result<()> {
        let visible = self
            .poll(limit, || async move {
                page.is_visible(selector).await.ok().filter(|v| *v)
            })
            .await;
        visible.map(|_| ()).ok_or_else(|| {
            SandboxError::new(
                ErrorCode::Timeout,
                format!(
                    "element '{}' not visible after {}ms",
                    selector,
                    limit.as_millis()
                ),
            )
        })
    }

    async fn poll<T, F, Fut>(&self, limit: Duration, mut probe: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let until = Instant::now() + limit;
        loop {
            if let Some(value) = probe().await {
                return Some(value);
            }
            if Instant::now() >= until {
                return None;
            }
            sleep(self.options.poll_interval).await;
        }
    }
}

fn validate_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(SandboxError::invalid_input("navigate() needs a URL"));
    }
    url::Url::parse(url)
        .map(|parsed| parsed.to_string())
        .map_err(|e| SandboxError::invalid_input(format!("invalid URL '{}': {}", url, e)))
}

fn require_selector(selector: &str) -> Result<&str> {
    if selector.trim().is_empty() {
        return Err(SandboxError::invalid_input("selector must not be empty"));
    }
    Ok(selector)
}

fn clear_script(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return false;
  if ('value' in el) {{ el.value = ''; }} else {{ el.textContent = ''; }}
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  el.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return true;
}})()"#,
        sel = js_literal(selector)
    )
}

fn submit_script(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return false;
  const form = el.tagName === 'FORM' ? el : el.form;
  if (form) {{
    if (typeof form.requestSubmit === 'function') {{ form.requestSubmit(); }} else {{ form.submit(); }}
  }} else {{
    el.click();
  }}
  return true;
}})()"#,
        sel = js_literal(selector)
    )
}
