use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use sysinfo::System;

use super::success;
use crate::sandbox::config::Config;
use crate::sandbox::registrar::{CapabilityGroup, HostContext, HostFunction};

pub struct SystemGroup;

impl CapabilityGroup for SystemGroup {
    fn name(&self) -> &'static str {
        "system"
    }

    fn functions(&self, host: &HostContext) -> Vec<Arc<dyn HostFunction>> {
        vec![
            Arc::new(SystemInfoFn),
            Arc::new(ConfigFn {
                config: host.config.clone(),
            }),
        ]
    }
}

pub struct SystemInfoFn;

#[async_trait]
impl HostFunction for SystemInfoFn {
    fn name(&self) -> &'static str {
        "getSystemInfo"
    }

    fn description(&self) -> &'static str {
        "Operating system, host name, CPU count and memory of the host"
    }

    fn arity(&self) -> usize {
        0
    }

    async fn call(&self, _args: &[Value]) -> Result<Value> {
        let info = tokio::task::spawn_blocking(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.refresh_cpu();
            json!({
                "os": System::name(),
                "os_version": System::os_version(),
                "kernel_version": System::kernel_version(),
                "hostname": System::host_name(),
                "arch": std::env::consts::ARCH,
                "cpus": sys.cpus().len(),
                "total_memory": sys.total_memory(),
                "available_memory": sys.available_memory(),
                "uptime_secs": System::uptime(),
            })
        })
        .await?;
        Ok(success(info))
    }
}

pub struct ConfigFn {
    config: Arc<Config>,
}

#[async_trait]
impl HostFunction for ConfigFn {
    fn name(&self) -> &'static str {
        "getConfig"
    }

    fn description(&self) -> &'static str {
        "Timeouts, limits and enabled capability groups of this sandbox"
    }

    fn arity(&self) -> usize {
        0
    }

    async fn call(&self, _args: &[Value]) -> Result<Value> {
        let config = &self.config;
        Ok(success(json!({
            "default_timeout_ms": config.default_timeout.as_millis() as u64,
            "http_timeout_ms": config.http_timeout.as_millis() as u64,
            "browser_timeout_ms": config.browser_timeout.as_millis() as u64,
            "max_file_size": config.max_file_size,
            "allowed_file_types": config.allowed_file_types,
            "headless": config.headless,
            "groups": config.enabled_groups(),
        })))
    }
}
