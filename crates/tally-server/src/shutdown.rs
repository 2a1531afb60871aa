//! Signal handling and listener draining for the server binary.

use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Resolves once the flag behind `rx` turns true or its sender is gone.
pub async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// A spawned server task (HTTP or gRPC).
pub struct Listener {
    name: &'static str,
    handle: JoinHandle<anyhow::Result<()>>,
    done: bool,
}

impl Listener {
    pub fn spawn<F>(name: &'static str, serve: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(serve),
            done: false,
        }
    }

    /// Waits for the task to end and logs how it ended. Cancel safe.
    pub async fn join(&mut self) {
        if self.done {
            return;
        }
        let result = (&mut self.handle).await;
        self.done = true;
        log_exit(self.name, result);
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

fn log_exit(name: &str, result: Result<anyhow::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => tracing::info!(listener = name, "Listener stopped"),
        Ok(Err(e)) => tracing::error!(listener = name, error = %e, "Listener failed"),
        Err(e) if e.is_cancelled() => tracing::warn!(listener = name, "Listener aborted"),
        Err(e) => tracing::error!(listener = name, error = %e, "Listener task panicked"),
    }
}

/// Waits up to `grace` for every listener, then aborts and reaps the ones
/// still running. Returns true when all of them stopped on their own.
pub async fn drain(listeners: &mut [Listener], grace: Duration) -> bool {
    let joined = tokio::time::timeout(grace, async {
        for listener in listeners.iter_mut() {
            listener.join().await;
        }
    })
    .await;
    if joined.is_ok() {
        return true;
    }

    tracing::warn!(
        grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
        "Listeners did not drain in time, aborting"
    );
    for listener in listeners.iter_mut().filter(|l| !l.done) {
        listener.handle.abort();
        listener.join().await;
    }
    false
}
