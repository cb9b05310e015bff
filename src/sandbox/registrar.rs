use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use boa_engine::{Context, JsResult, JsString, NativeFunction};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capabilities::{
    browser::BrowserGroup, documents::DocumentsGroup, filesystem::FilesystemGroup,
    http::HttpGroup, images::ImagesGroup, logging::LoggingGroup, system::SystemGroup,
    utils::UtilitiesGroup,
};
use super::config::Config;
use super::convert;
use super::error::{self, ErrorCode, Result, SandboxError};
use crate::browser::BrowserPool;

/// Host state shared by every capability of one sandbox.
#[derive(Clone)]
pub struct HostContext {
    pub sandbox_id: Uuid,
    pub config: Arc<Config>,
    pub runtime: Handle,
    pub browser: Option<Arc<BrowserPool>>,
    pub scope: CancellationToken,
}

impl HostContext {
    /// Drive `fut` to completion from the script thread, giving up when the
    /// sandbox scope is cancelled.
    pub fn block_on<T, F>(&self, fut: F) -> anyhow::Result<T>
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        let scope = self.scope.clone();
        self.runtime.block_on(async move {
            tokio::select! {
                biased;
                _ = scope.cancelled() => Err(SandboxError::cancelled("sandbox closed").into()),
                result = fut => result,
            }
        })
    }
}

/// A script-visible host function.
#[async_trait]
pub trait HostFunction: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn arity(&self) -> usize {
        1
    }

    async fn call(&self, args: &[Value]) -> anyhow::Result<Value>;
}

/// A named bundle of host functions, bound into the guest global namespace.
pub trait CapabilityGroup {
    fn name(&self) -> &'static str;

    fn functions(&self, _host: &HostContext) -> Vec<Arc<dyn HostFunction>> {
        Vec::new()
    }

    fn install(&self, context: &mut Context, host: &HostContext) -> JsResult<usize> {
        let functions = self.functions(host);
        for function in &functions {
            context.register_global_callable(
                JsString::from(function.name()),
                function.arity(),
                native(host, function.clone()),
            )?;
        }
        Ok(functions.len())
    }
}

/// Wrap a host function for the interpreter. Errors come back to the guest
/// as `{success: false, error, code}` and are never thrown.
pub fn native(host: &HostContext, function: Arc<dyn HostFunction>) -> NativeFunction {
    let host = host.clone();
    // SAFETY: the closure holds host-side values only, nothing the guest
    // garbage collector has to trace.
    unsafe {
        NativeFunction::from_closure(move |_this, args, context| {
            let args = convert::args_to_json(args, context);
            let call = AssertUnwindSafe(function.call(&args)).catch_unwind();
            let result = host
                .block_on(async {
                    call.await.unwrap_or_else(|_| {
                        warn!(function = function.name(), "Host function panicked");
                        let err = SandboxError::system(format!(
                            "{} failed unexpectedly",
                            function.name()
                        ));
                        Err(err.into())
                    })
                })
                .unwrap_or_else(|err| {
                    debug!(function = function.name(), error = %err, "Host function failed");
                    failure(&err)
                });
            convert::to_js(&result, context)
        })
    }
}

pub fn failure(err: &anyhow::Error) -> Value {
    if let Some(err) = err.downcast_ref::<SandboxError>() {
        return err.to_script_value();
    }
    let code = match err.downcast_ref::<std::io::Error>() {
        Some(io) => error::io_code(io.kind()),
        None => ErrorCode::Unknown,
    };
    json!({
        "success": false,
        "error": err.to_string(),
        "code": code,
    })
}

fn groups(host: &HostContext) -> Vec<Box<dyn CapabilityGroup>> {
    let config = &host.config;
    let mut groups: Vec<Box<dyn CapabilityGroup>> = vec![
        Box::new(SystemGroup),
        Box::new(LoggingGroup),
        Box::new(UtilitiesGroup),
    ];
    if config.enable_filesystem {
        groups.push(Box::new(FilesystemGroup));
    }
    if config.enable_http {
        groups.push(Box::new(HttpGroup));
    }
    if config.enable_documents {
        groups.push(Box::new(DocumentsGroup));
    }
    if config.enable_image_processing {
        groups.push(Box::new(ImagesGroup));
    }
    if config.enable_browser && host.browser.is_some() {
        groups.push(Box::new(BrowserGroup));
    }
    groups
}

/// Register every enabled group in its fixed order. Returns the group names.
pub fn install_all(context: &mut Context, host: &HostContext) -> Result<Vec<&'static str>> {
    let mut installed = Vec::new();
    for group in groups(host) {
        let count = group.install(context, host).map_err(|e| {
            SandboxError::system(format!("registering {} group failed: {}", group.name(), e))
        })?;
        debug!(sandbox = %host.sandbox_id, group = group.name(), functions = count, "Capability group registered");
        installed.push(group.name());
    }
    info!(sandbox = %host.sandbox_id, groups = ?installed, "Capabilities registered");
    Ok(installed)
}
