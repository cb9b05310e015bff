use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::driver::{
    driver_error, BrowserLauncher, BrowserProcess, LaunchOptions, PageDriver, BLANK_URL,
};
use crate::sandbox::error::Result;

/// Launches a local Chromium over the DevTools protocol.
#[derive(Debug, Default, Clone)]
pub struct ChromeLauncher;

impl ChromeLauncher {
    pub fn new() -> Self {
        Self
    }

    fn config(options: &LaunchOptions) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .request_timeout(options.request_timeout)
            .window_size(options.window_size.0, options.window_size.1)
            .args(launch_args(options));
        if !options.headless {
            builder = builder.with_head();
        }
        builder
            .build()
            .map_err(|e| driver_error("browser configuration", e))
    }
}

/// Extra command-line flags. Chrome's own sandbox is disabled on Linux only.
fn launch_args(options: &LaunchOptions) -> Vec<String> {
    let mut args = vec![
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        format!("--user-agent={}", options.user_agent),
    ];
    if cfg!(target_os = "linux") {
        args.push("--no-sandbox".to_string());
        args.push("--disable-setuid-sandbox".to_string());
    }
    args
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(
        &self,
        options: &LaunchOptions,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn BrowserProcess>> {
        let config = Self::config(options)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| driver_error("browser launch", e))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "Browser handler event error");
                }
            }
            debug!("Browser handler loop ended");
        });

        let process = Arc::new(ChromeProcess {
            browser: Arc::new(Mutex::new(Some(browser))),
        });

        let watched = process.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            watched.shutdown().await;
        });

        info!(headless = options.headless, "Browser process started");
        Ok(process)
    }
}

pub struct ChromeProcess {
    browser: Arc<Mutex<Option<Browser>>>,
}

#[async_trait]
impl BrowserProcess for ChromeProcess {
    async fn new_page(&self) -> Result<Box<dyn PageDriver>> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| driver_error("new page", "browser process has exited"))?;
        let page = browser
            .new_page(BLANK_URL)
            .await
            .map_err(|e| driver_error("new page", e))?;
        Ok(Box::new(ChromePage { page }))
    }

    async fn shutdown(&self) {
        let Some(mut browser) = self.browser.lock().await.take() else {
            return;
        };
        if let Err(e) = browser.close().await {
            warn!(error = %e, "Browser close failed");
        }
        if let Err(e) = browser.wait().await {
            debug!(error = %e, "Waiting for browser exit failed");
        }
        info!("Browser process stopped");
    }
}

pub struct ChromePage {
    page: Page,
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .map(|_| ())
            .map_err(|e| driver_error("navigation", e))
    }

    async fn current_url(&self) -> Result<String> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| driver_error("reading URL", e))?;
        Ok(url.unwrap_or_else(|| BLANK_URL.to_string()))
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .page
            .evaluate(expression)
            .await
            .map_err(|e| driver_error("evaluate", e))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| driver_error("find element", e))?;
        element
            .click()
            .await
            .map(|_| ())
            .map_err(|e| driver_error("click", e))
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| driver_error("find element", e))?;
        element
            .click()
            .await
            .map_err(|e| driver_error("focus", e))?;
        element
            .type_str(text)
            .await
            .map(|_| ())
            .map_err(|e| driver_error("typing", e))
    }

    async fn press_enter(&self) -> Result<()> {
        let element = match self.page.find_element(":focus").await {
            Ok(element) => element,
            Err(_) => self
                .page
                .find_element("body")
                .await
                .map_err(|e| driver_error("find element", e))?,
        };
        element
            .press_key("Enter")
            .await
            .map(|_| ())
            .map_err(|e| driver_error("key press", e))
    }

    async fn content(&self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| driver_error("reading content", e))
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|e| driver_error("screenshot", e))
    }

    async fn close(&self) -> Result<()> {
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| driver_error("closing page", e))
    }
}
