//! Shutdown Coordinator
//!
//! Owned replacement for a process-wide cleanup registry:
//! - Components register named closers on the coordinator they were given
//! - A cancellation token tells long-running loops to stop
//! - Closers run once, in reverse registration order, within a deadline
//! - Signal handlers (SIGTERM, SIGINT) trigger the shutdown

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::signal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::BoxError;

/// Shutdown configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Deadline for running every registered closer
    pub timeout: Duration,
    /// Install SIGINT/SIGTERM handlers
    pub enable_signals: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            enable_signals: true,
        }
    }
}

impl ShutdownConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Reason for shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    SigTerm,
    SigInt,
    Programmatic(String),
    Unknown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::SigTerm => write!(f, "SIGTERM"),
            ShutdownReason::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            ShutdownReason::Programmatic(reason) => write!(f, "Programmatic: {}", reason),
            ShutdownReason::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Failure of a single closer.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Failed to close {name}: {source}")]
    Closer {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("Closing {name} panicked")]
    Panic { name: String },

    #[error("Closing {name} did not finish within {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

/// Outcome of [`ShutdownCoordinator::close_all`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Closers that finished successfully, in execution order
    pub closed: Vec<String>,
    pub errors: Vec<ShutdownError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

type Closer = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

struct Inner {
    config: ShutdownConfig,
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
    closers: Mutex<Option<Vec<(String, Closer)>>>,
}

/// Coordinates stopping and cleanup of the components it is handed to.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                token: CancellationToken::new(),
                reason: Mutex::new(None),
                closers: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.inner.config
    }

    /// Token cancelled when shutdown is triggered.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Registers a closer. Closers run in reverse registration order.
    ///
    /// Registration after [`close_all`](Self::close_all) is ignored with a warning.
    pub fn add<F, Fut, E>(&self, name: impl Into<String>, closer: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let name = name.into();
        let closer: Closer = Box::new(move || -> BoxFuture<'static, Result<(), BoxError>> {
            closer().map(|r| r.map_err(Into::into)).boxed()
        });

        match self.inner.closers.lock() {
            Ok(mut closers) => match closers.as_mut() {
                Some(closers) => closers.push((name, closer)),
                None => warn!(closer = %name, "shutdown already ran, closer ignored"),
            },
            Err(_) => error!(closer = %name, "closer registry poisoned, closer ignored"),
        }
    }

    /// Triggers shutdown. Only the first reason is kept.
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut current) = self.inner.reason.lock() {
            if current.is_none() {
                info!(reason = %reason, "Triggering shutdown");
                *current = Some(reason);
            }
        }
        self.inner.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.inner.reason.lock().ok().and_then(|r| r.clone())
    }

    /// Waits until shutdown is triggered.
    pub async fn wait_for_signal(&self) -> ShutdownReason {
        self.inner.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Unknown)
    }

    /// Runs every registered closer once, newest first, within the configured
    /// timeout. Errors are logged and collected; a closer that misses the
    /// deadline is abandoned along with everything after it.
    pub async fn close_all(&self) -> ShutdownReport {
        self.inner.token.cancel();

        let closers = match self.inner.closers.lock() {
            Ok(mut closers) => closers.take(),
            Err(_) => None,
        };
        let Some(closers) = closers else {
            warn!("shutdown closers already ran");
            return ShutdownReport::default();
        };

        let timeout = self.inner.config.timeout;
        let deadline = Instant::now() + timeout;
        info!(count = closers.len(), timeout_ms = timeout.as_millis() as u64, "running shutdown closers");

        let mut report = ShutdownReport::default();
        let mut pending = closers.into_iter().rev();
        while let Some((name, closer)) = pending.next() {
            let run = std::panic::AssertUnwindSafe(closer()).catch_unwind();
            match tokio::time::timeout_at(deadline, run).await {
                Ok(Ok(Ok(()))) => {
                    info!(closer = %name, "closed");
                    report.closed.push(name);
                }
                Ok(Ok(Err(source))) => {
                    error!(closer = %name, error = %source, "failed to close");
                    report.errors.push(ShutdownError::Closer { name, source });
                }
                Ok(Err(_)) => {
                    error!(closer = %name, "closer panicked");
                    report.errors.push(ShutdownError::Panic { name });
                }
                Err(_) => {
                    warn!(closer = %name, "Shutdown sequence timed out after {:?}", timeout);
                    report.errors.push(ShutdownError::Timeout { name, timeout });
                    for (name, _) in pending.by_ref() {
                        report.errors.push(ShutdownError::Timeout { name, timeout });
                    }
                }
            }
        }

        if report.is_clean() {
            info!("All components shut down gracefully");
        } else {
            warn!(errors = report.errors.len(), "Some components did not shut down cleanly");
        }
        report
    }

    /// Spawns a task that triggers shutdown on SIGINT or SIGTERM.
    pub fn start_signal_handler(&self) {
        if !self.inner.config.enable_signals {
            return;
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                match signal::ctrl_c().await {
                    Ok(()) => ShutdownReason::SigInt,
                    Err(e) => {
                        error!("Failed to register ctrl-c handler: {}", e);
                        std::future::pending().await
                    }
                }
            };

            let term = terminate_signal();

            let token = coordinator.token();
            tokio::select! {
                reason = ctrl_c => coordinator.shutdown(reason),
                reason = term => coordinator.shutdown(reason),
                _ = token.cancelled() => {}
            }
        });
    }
}

#[cfg(unix)]
async fn terminate_signal() -> ShutdownReason {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
            ShutdownReason::SigTerm
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() -> ShutdownReason {
    std::future::pending().await
}
