//! Host-side JavaScript sandbox with curated host capabilities and pooled
//! browser automation.

pub mod browser;
pub mod sandbox;
pub mod shared;

pub use browser::{BrowserSession, WaitTarget};
pub use sandbox::config::Config;
pub use sandbox::error::{ErrorCode, Result, SandboxError};
pub use sandbox::Sandbox;
pub use tokio_util::sync::CancellationToken;
