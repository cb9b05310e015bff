pub mod chrome;
pub mod driver;
pub mod pool;
pub mod session;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

pub use chrome::ChromeLauncher;
pub use driver::{BrowserLauncher, BrowserProcess, LaunchOptions, PageDriver};
pub use pool::BrowserPool;
pub use session::{BrowserSession, Navigation, Screenshot, SessionOptions, SessionState};
pub use wait::WaitTarget;
