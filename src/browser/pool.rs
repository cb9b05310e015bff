use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::driver::{BrowserLauncher, BrowserProcess, LaunchOptions};
use crate::sandbox::error::{Result, SandboxError};

#[derive(Clone)]
struct PooledProcess {
    handle: Arc<dyn BrowserProcess>,
    cancel: CancellationToken,
}

/// Owns the single browser process of one sandbox. Sessions share it; the
/// process starts on the first `acquire` and dies with the sandbox scope.
pub struct BrowserPool {
    launcher: Arc<dyn BrowserLauncher>,
    options: LaunchOptions,
    scope: CancellationToken,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    process: RwLock<Option<PooledProcess>>,
}

impl BrowserPool {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        options: LaunchOptions,
        scope: CancellationToken,
    ) -> Self {
        Self {
            launcher,
            options,
            scope,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            process: RwLock::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Scope that sessions derive their own cancellation from.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub async fn acquire(&self) -> Result<Arc<dyn BrowserProcess>> {
        if let Some(handle) = self.cached() {
            return Ok(handle);
        }

        let _guard = self.init_lock.lock().await;
        if let Some(handle) = self.cached() {
            return Ok(handle);
        }
        if self.scope.is_cancelled() {
            return Err(SandboxError::cancelled("browser pool has been shut down"));
        }

        info!(
            headless = self.options.headless,
            "Launching shared browser process"
        );
        let cancel = self.scope.child_token();
        let handle = self.launcher.launch(&self.options, cancel.clone()).await?;
        if let Ok(mut slot) = self.process.write() {
            *slot = Some(PooledProcess {
                handle: handle.clone(),
                cancel,
            });
        }
        self.initialized.store(true, Ordering::Release);
        Ok(handle)
    }

    fn cached(&self) -> Option<Arc<dyn BrowserProcess>> {
        if !self.initialized.load(Ordering::Acquire) {
            return None;
        }
        self.process
            .read()
            .ok()
            .and_then(|slot| slot.as_ref().map(|p| p.handle.clone()))
    }

    /// Stop the process if one is running and return to the uninitialised state.
    pub async fn teardown(&self) {
        let _guard = self.init_lock.lock().await;
        self.initialized.store(false, Ordering::Release);
        let pooled = self.process.write().ok().and_then(|mut slot| slot.take());
        match pooled {
            Some(pooled) => {
                pooled.cancel.cancel();
                pooled.handle.shutdown().await;
                info!("Shared browser process shut down");
            }
            None => debug!("Browser pool teardown with no running process"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::FakeLauncher;
    use std::time::Duration;

    fn pool(launcher: Arc<FakeLauncher>, scope: CancellationToken) -> Arc<BrowserPool> {
        Arc::new(BrowserPool::new(
            launcher,
            LaunchOptions::new(true, Duration::from_secs(5)),
            scope,
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_launches_once() {
        let launcher = Arc::new(FakeLauncher::new().with_launch_delay(Duration::from_millis(50)));
        let pool = pool(launcher.clone(), CancellationToken::new());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        assert_eq!(launcher.launches(), 1);
        assert!(pool.is_initialized());
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_allows_relaunch() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(launcher.clone(), CancellationToken::new());

        pool.teardown().await;
        pool.acquire().await.unwrap();
        pool.teardown().await;
        pool.teardown().await;
        assert!(!pool.is_initialized());
        assert_eq!(launcher.shutdowns(), 1);

        pool.acquire().await.unwrap();
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn cancelled_scope_refuses_to_launch() {
        let launcher = Arc::new(FakeLauncher::new());
        let scope = CancellationToken::new();
        let pool = pool(launcher.clone(), scope.clone());

        scope.cancel();
        let err = pool.acquire().await.err().unwrap();
        assert_eq!(err.code(), crate::sandbox::error::ErrorCode::Cancelled);
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn process_scope_is_child_of_pool_scope() {
        let launcher = Arc::new(FakeLauncher::new());
        let scope = CancellationToken::new();
        let pool = pool(launcher.clone(), scope.clone());

        pool.acquire().await.unwrap();
        let process_token = launcher.last_cancel_token().unwrap();
        assert!(!process_token.is_cancelled());
        scope.cancel();
        assert!(process_token.is_cancelled());
    }
}
