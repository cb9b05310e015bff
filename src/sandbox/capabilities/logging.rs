use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{Context, JsResult, JsString};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::success;
use crate::sandbox::registrar::{native, CapabilityGroup, HostContext, HostFunction};

/// Installs `console.log/info/warn/error/debug`, forwarded to tracing.
pub struct LoggingGroup;

impl CapabilityGroup for LoggingGroup {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn functions(&self, host: &HostContext) -> Vec<Arc<dyn HostFunction>> {
        [
            GuestLevel::Log,
            GuestLevel::Info,
            GuestLevel::Warn,
            GuestLevel::Error,
            GuestLevel::Debug,
        ]
        .into_iter()
        .map(|level| {
            Arc::new(ConsoleFn {
                level,
                sandbox_id: host.sandbox_id,
            }) as Arc<dyn HostFunction>
        })
        .collect()
    }

    fn install(&self, context: &mut Context, host: &HostContext) -> JsResult<usize> {
        let functions = self.functions(host);
        let mut console = ObjectInitializer::new(context);
        for function in &functions {
            console.function(
                native(host, function.clone()),
                JsString::from(function.name()),
                function.arity(),
            );
        }
        let console = console.build();
        context.register_global_property(JsString::from("console"), console, Attribute::all())?;
        Ok(functions.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

pub struct ConsoleFn {
    level: GuestLevel,
    sandbox_id: Uuid,
}

#[async_trait]
impl HostFunction for ConsoleFn {
    fn name(&self) -> &'static str {
        match self.level {
            GuestLevel::Log => "log",
            GuestLevel::Info => "info",
            GuestLevel::Warn => "warn",
            GuestLevel::Error => "error",
            GuestLevel::Debug => "debug",
        }
    }

    fn description(&self) -> &'static str {
        "Write the arguments to the host log"
    }

    async fn call(&self, args: &[Value]) -> Result<Value> {
        let line = format_args_line(args);
        let sandbox = self.sandbox_id;
        match self.level {
            GuestLevel::Log | GuestLevel::Info => {
                info!(target: "scriptbox::guest", %sandbox, "{}", line)
            }
            GuestLevel::Warn => warn!(target: "scriptbox::guest", %sandbox, "{}", line),
            GuestLevel::Error => error!(target: "scriptbox::guest", %sandbox, "{}", line),
            GuestLevel::Debug => debug!(target: "scriptbox::guest", %sandbox, "{}", line),
        }
        Ok(success(json!({ "message": line })))
    }
}

/// Strings print bare, everything else as JSON.
pub fn format_args_line(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_are_joined_with_spaces() {
        let line = format_args_line(&[json!("count:"), json!(3), json!({"ok": true})]);
        assert_eq!(line, r#"count: 3 {"ok":true}"#);
    }

    #[tokio::test]
    async fn console_returns_the_logged_line() {
        let console = ConsoleFn {
            level: GuestLevel::Warn,
            sandbox_id: Uuid::new_v4(),
        };
        let result = console.call(&[json!("disk"), json!("low")]).await.unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["message"], "disk low");
        assert_eq!(console.name(), "warn");
    }
}
