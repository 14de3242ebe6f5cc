//! OS signal handling.
//!
//! SIGINT and SIGTERM end the process gracefully; the caller decides what
//! that means (the runtime reports them on its error channel).

use std::io;

/// Wait for SIGINT or SIGTERM and return the signal name.
#[cfg(unix)]
pub async fn wait_for_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    tracing::info!(signal = name, "Shutdown signal received");
    Ok(name)
}

/// Wait for Ctrl+C and return the signal name.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    tracing::info!(signal = "ctrl-c", "Shutdown signal received");
    Ok("ctrl-c")
}
