use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{Context, JsResult, JsString, JsValue, NativeFunction};
use serde_json::{json, Value};
use tracing::info;

use super::success;
use crate::browser::{BrowserPool, BrowserSession, SessionOptions, WaitTarget};
use crate::sandbox::convert::{self, arg, optional_object, optional_str, optional_u64, require_str, require_text};
use crate::sandbox::error::SandboxError;
use crate::sandbox::registrar::{native, CapabilityGroup, HostContext, HostFunction};

/// Installs `newBrowserSession(options?)`.
pub struct BrowserGroup;

impl CapabilityGroup for BrowserGroup {
    fn name(&self) -> &'static str {
        "browser"
    }

    fn install(&self, context: &mut Context, host: &HostContext) -> JsResult<usize> {
        let Some(pool) = host.browser.clone() else {
            return Ok(0);
        };
        context.register_global_callable(
            JsString::from("newBrowserSession"),
            1,
            session_factory(host.clone(), pool),
        )?;
        Ok(1)
    }
}

fn session_factory(host: HostContext, pool: Arc<BrowserPool>) -> NativeFunction {
    // SAFETY: captures host-side values only.
    unsafe {
        NativeFunction::from_closure(move |_this, args, context| {
            let args = convert::args_to_json(args, context);
            match open_session(&host, &pool, &args) {
                Ok(session) => session_object(context, &host, session),
                Err(err) => convert::to_js(&err.to_script_value(), context),
            }
        })
    }
}

fn open_session(
    host: &HostContext,
    pool: &Arc<BrowserPool>,
    args: &[Value],
) -> std::result::Result<Arc<BrowserSession>, SandboxError> {
    let lifetime = match optional_object(args, 0, "options")? {
        Some(options) => match options.get("timeout") {
            None | Some(Value::Null) => host.config.browser_timeout,
            Some(Value::Number(n)) => n
                .as_f64()
                .filter(|ms| ms.is_finite() && *ms > 0.0)
                .map(|ms| Duration::from_millis(ms as u64))
                .ok_or_else(|| {
                    SandboxError::invalid_input("session timeout must be a positive number of milliseconds")
                })?,
            Some(_) => {
                return Err(SandboxError::invalid_input(
                    "session timeout must be a number of milliseconds",
                ))
            }
        },
        None => host.config.browser_timeout,
    };
    if pool.scope().is_cancelled() {
        return Err(SandboxError::cancelled("sandbox closed"));
    }
    let session = BrowserSession::new(pool.clone(), SessionOptions::new(lifetime));
    session.watch_deadline(&host.runtime);
    info!(sandbox = %host.sandbox_id, session = %session.id(), lifetime_ms = lifetime.as_millis() as u64, "Browser session opened");
    Ok(session)
}

fn session_object(
    context: &mut Context,
    host: &HostContext,
    session: Arc<BrowserSession>,
) -> JsResult<JsValue> {
    let mut object = ObjectInitializer::new(context);
    object.property(
        JsString::from("id"),
        JsString::from(session.id().to_string().as_str()),
        Attribute::READONLY | Attribute::ENUMERABLE,
    );
    for method in SessionMethod::ALL {
        let function = Arc::new(SessionMethodFn {
            session: session.clone(),
            method,
        });
        object.function(
            native(host, function),
            JsString::from(method.name()),
            method.arity(),
        );
    }
    Ok(object.build().into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMethod {
    Navigate,
    Wait,
    Click,
    Fill,
    Clear,
    Submit,
    Evaluate,
    GetHtml,
    GetUrl,
    Screenshot,
    WaitForUrl,
    WaitForText,
    Close,
}

impl SessionMethod {
    pub const ALL: [SessionMethod; 13] = [
        SessionMethod::Navigate,
        SessionMethod::Wait,
        SessionMethod::Click,
        SessionMethod::Fill,
        SessionMethod::Clear,
        SessionMethod::Submit,
        SessionMethod::Evaluate,
        SessionMethod::GetHtml,
        SessionMethod::GetUrl,
        SessionMethod::Screenshot,
        SessionMethod::WaitForUrl,
        SessionMethod::WaitForText,
        SessionMethod::Close,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SessionMethod::Navigate => "navigate",
            SessionMethod::Wait => "wait",
            SessionMethod::Click => "click",
            SessionMethod::Fill => "fill",
            SessionMethod::Clear => "clear",
            SessionMethod::Submit => "submit",
            SessionMethod::Evaluate => "evaluate",
            SessionMethod::GetHtml => "getHTML",
            SessionMethod::GetUrl => "getURL",
            SessionMethod::Screenshot => "screenshot",
            SessionMethod::WaitForUrl => "waitForURL",
            SessionMethod::WaitForText => "waitForText",
            SessionMethod::Close => "close",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            SessionMethod::GetHtml | SessionMethod::GetUrl | SessionMethod::Close => 0,
            SessionMethod::Fill | SessionMethod::WaitForUrl | SessionMethod::WaitForText => 2,
            _ => 1,
        }
    }
}

/// One method of a script-side session object.
pub struct SessionMethodFn {
    session: Arc<BrowserSession>,
    method: SessionMethod,
}

#[async_trait]
impl HostFunction for SessionMethodFn {
    fn name(&self) -> &'static str {
        self.method.name()
    }

    fn description(&self) -> &'static str {
        "Browser session method"
    }

    fn arity(&self) -> usize {
        self.method.arity()
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        Ok(dispatch(&self.session, self.method, args).await?)
    }
}

pub async fn dispatch(
    session: &BrowserSession,
    method: SessionMethod,
    args: &[Value],
) -> std::result::Result<Value, SandboxError> {
    if method != SessionMethod::Close {
        session.ensure_open()?;
    }
    let timeout = |index| optional_u64(args, index, "timeout").map(|ms| ms.map(Duration::from_millis));
    match method {
        SessionMethod::Navigate => {
            let nav = session.navigate(&require_str(args, 0, "url")?).await?;
            let mut result = json!({ "url": nav.url, "partial": nav.partial });
            if let Some(warning) = nav.warning {
                result["warning"] = Value::String(warning);
            }
            Ok(success(result))
        }
        SessionMethod::Wait => {
            let target = WaitTarget::from_json(arg(args, 0))?;
            session.wait(&target).await?;
            Ok(success(Value::Null))
        }
        SessionMethod::Click => {
            session.click(&require_str(args, 0, "selector")?).await?;
            Ok(success(Value::Null))
        }
        SessionMethod::Fill => {
            let selector = require_str(args, 0, "selector")?;
            let text = require_text(args, 1, "text")?;
            session.fill(&selector, &text).await?;
            Ok(success(Value::Null))
        }
        SessionMethod::Clear => {
            session.clear(&require_str(args, 0, "selector")?).await?;
            Ok(success(Value::Null))
        }
        SessionMethod::Submit => {
            session.submit(optional_str(args, 0).as_deref()).await?;
            Ok(success(Value::Null))
        }
        SessionMethod::Evaluate => {
            let value = session.evaluate(&require_str(args, 0, "code")?).await?;
            Ok(success(json!({ "result": value })))
        }
        SessionMethod::GetHtml => {
            let html = session.get_html().await?;
            Ok(success(json!({ "html": html })))
        }
        SessionMethod::GetUrl => {
            let url = session.get_url().await?;
            Ok(success(json!({ "url": url })))
        }
        SessionMethod::Screenshot => {
            let path = require_str(args, 0, "path")?;
            let shot = session.screenshot(std::path::Path::new(&path)).await?;
            Ok(success(json!({
                "path": shot.path.display().to_string(),
                "bytes": shot.bytes,
            })))
        }
        SessionMethod::WaitForUrl => {
            let pattern = require_str(args, 0, "pattern")?;
            let url = session.wait_for_url(&pattern, timeout(1)?).await?;
            Ok(success(json!({ "url": url })))
        }
        SessionMethod::WaitForText => {
            let text = require_str(args, 0, "text")?;
            session.wait_for_text(&text, timeout(1)?).await?;
            Ok(success(Value::Null))
        }
        SessionMethod::Close => {
            session.close().await;
            Ok(success(Value::Null))
        }
    }
}
