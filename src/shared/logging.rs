use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    // RUST_LOG wins; guest console output is included at info by default
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// File plus console logging. Console output goes to stderr so stdout stays
/// free for results. Falls back to console only when `log_dir` is not writable.
pub fn init_service_logging(log_dir: &str, service_name: &str) -> Result<(), anyhow::Error> {
    let can_write_logs = std::fs::create_dir_all(log_dir)
        .and_then(|_| std::fs::File::create(format!("{log_dir}/.test_write")))
        .map(|_| std::fs::remove_file(format!("{log_dir}/.test_write")))
        .is_ok();

    if !can_write_logs {
        init_console_logging()?;
        info!("Logging initialized - console output only (could not write to {log_dir})");
        return Ok(());
    }

    let _ = rotate_logs_on_startup(log_dir, service_name);

    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{service_name}.log"));
    let (non_blocking_file, guard_file) = non_blocking(file_appender);
    let (non_blocking_stderr, guard_stderr) = non_blocking(std::io::stderr());

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(non_blocking_stderr)
        .with_ansi(true)
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    // Keep the writers alive for the life of the process
    std::mem::forget(guard_file);
    std::mem::forget(guard_stderr);

    info!("Logging initialized - logs will be written to {log_dir}/{service_name}.log");
    Ok(())
}

/// Console-only logging on stderr.
pub fn init_console_logging() -> Result<(), anyhow::Error> {
    let (non_blocking_stderr, guard) = non_blocking(std::io::stderr());
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_writer(non_blocking_stderr)
                .with_ansi(true)
                .with_target(false),
        )
        .try_init()?;
    std::mem::forget(guard);
    Ok(())
}

/// Move an existing `<service>.log` aside with a timestamp suffix.
pub fn rotate_logs_on_startup(log_dir: &str, service_name: &str) -> Result<(), anyhow::Error> {
    let log_file = format!("{log_dir}/{service_name}.log");
    if Path::new(&log_file).exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_file = format!("{log_dir}/{service_name}.{timestamp}.log");
        std::fs::rename(&log_file, &backup_file)?;
        info!("Previous log file backed up to: {backup_file}");
    }
    Ok(())
}
