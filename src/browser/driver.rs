use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::sandbox::error::{Result, SandboxError};

pub const BLANK_URL: &str = "about:blank";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Options for starting the shared browser process.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub headless: bool,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub window_size: (u32, u32),
}

impl LaunchOptions {
    pub fn new(headless: bool, request_timeout: Duration) -> Self {
        Self {
            headless,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout,
            window_size: (1366, 768),
        }
    }
}

/// Starts browser processes. The pool calls this at most once per sandbox.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch a process that must shut down once `cancel` fires.
    async fn launch(
        &self,
        options: &LaunchOptions,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn BrowserProcess>>;
}

/// A running browser process shared by every session of one sandbox.
#[async_trait]
pub trait BrowserProcess: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn PageDriver>>;

    async fn shutdown(&self);
}

/// Primitive operations on a single page. Selector waits, retries and result
/// checks live in the session; implementations stay thin.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// Evaluate `expression` in the page's own script context.
    async fn evaluate(&self, expression: &str) -> Result<Value>;

    async fn click(&self, selector: &str) -> Result<()>;

    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;

    /// Press Enter on whichever element currently has focus.
    async fn press_enter(&self) -> Result<()>;

    async fn content(&self) -> Result<String>;

    /// Full-page PNG capture.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()>;

    async fn ready_state(&self) -> Result<String> {
        let value = self.evaluate("document.readyState").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn is_visible(&self, selector: &str) -> Result<bool> {
        let value = self.evaluate(&visibility_script(selector)).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn text_content(&self) -> Result<String> {
        let value = self
            .evaluate("document.body ? document.body.innerText : ''")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

pub const ERROR_PAGE_SCHEME: &str = "chrome-error:";

pub fn is_blank(url: &str) -> bool {
    let url = url.trim();
    url.is_empty() || url == BLANK_URL
}

/// Chrome commits `chrome-error://chromewebdata/` when a load fails outright.
pub fn is_error_page(url: &str) -> bool {
    url.trim().starts_with(ERROR_PAGE_SCHEME)
}

/// Whether the page shows anything beyond the placeholder or an error page.
pub fn has_content(url: &str) -> bool {
    !is_blank(url) && !is_error_page(url)
}

/// JSON-quote a value for interpolation into page scripts.
pub fn js_literal(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn visibility_script(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return false;
  const style = window.getComputedStyle(el);
  if (style.visibility === 'hidden' || style.display === 'none') return false;
  const rect = el.getBoundingClientRect();
  return rect.width > 0 && rect.height > 0;
}})()"#,
        sel = js_literal(selector)
    )
}

pub(crate) fn driver_error(action: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::browser(format!("{} failed: {}", action, err))
}
