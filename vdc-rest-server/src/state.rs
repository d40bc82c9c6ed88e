//! Process shutdown state.
//!
//! A single watch channel fans the shutdown request out to every listener:
//! the accept loops stop, reconciler tasks wind down, and the daemon exits
//! once the last tracked worker finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use anyhow::{bail, Error};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

static SHUTDOWN_LISTENERS: OnceLock<watch::Sender<bool>> = OnceLock::new();
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

fn shutdown_listeners() -> &'static watch::Sender<bool> {
    SHUTDOWN_LISTENERS.get_or_init(|| watch::channel(false).0)
}

/// Request a shutdown.
pub fn request_shutdown() {
    tracing::info!("shutdown requested");
    if !SHUTDOWN_REQUESTED.swap(true, Ordering::Release) {
        let _ = shutdown_listeners().send(true);
    }
}

/// Returns true if a shutdown has been requested either via a signal or a
/// call to [`request_shutdown()`].
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Acquire)
}

/// This future finishes once a shutdown has been requested.
pub async fn shutdown_future() {
    let _ = shutdown_listeners().subscribe().wait_for(|&v| v).await;
}

/// Raise an error if there was a shutdown request.
pub fn fail_on_shutdown() -> Result<(), Error> {
    if is_shutdown_requested() {
        bail!("server shutdown requested - aborting task");
    }
    Ok(())
}

/// Spawn tasks translating SIGINT and SIGTERM into a shutdown request.
pub fn catch_shutdown_signals() -> Result<(), Error> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        while interrupt.recv().await.is_some() {
            tracing::info!("got shutdown request (SIGINT)");
            request_shutdown();
        }
    });
    tokio::spawn(async move {
        while terminate.recv().await.is_some() {
            tracing::info!("got shutdown request (SIGTERM)");
            request_shutdown();
        }
    });
    Ok(())
}
