use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::connection::ConnectionManager;
use crate::listener::AsyncListener;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    Draining = 1,
    Closed = 2,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ShutdownState::Running,
            1 => ShutdownState::Draining,
            _ => ShutdownState::Closed,
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownState::Running => "running",
            ShutdownState::Draining => "draining",
            ShutdownState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the single effective teardown did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Final listener counter; `None` when no listener was registered.
    pub messages_processed: Option<u64>,
    /// Teardown steps that failed and were logged.
    pub failures: usize,
}

/// Runs the process teardown exactly once, whether a signal or the normal
/// exit path gets there first. Order: report, close listener, disconnect.
///
/// Foreground work that owns a producer or consumer should not let a signal
/// disconnect underneath it. It installs [`install_stop_signal`] instead,
/// stops when [`stop_requested`] resolves, closes its handle and then calls
/// [`shutdown`] itself.
///
/// [`install_stop_signal`]: ShutdownCoordinator::install_stop_signal
/// [`stop_requested`]: ShutdownCoordinator::stop_requested
/// [`shutdown`]: ShutdownCoordinator::shutdown
pub struct ShutdownCoordinator {
    manager: Arc<ConnectionManager>,
    listener: Option<Arc<AsyncListener>>,
    state: AtomicU8,
    closed: Notify,
    stop_flag: AtomicBool,
    stop: Notify,
    signal_installed: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ConnectionManager>, listener: Option<Arc<AsyncListener>>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            listener,
            state: AtomicU8::new(ShutdownState::Running as u8),
            closed: Notify::new(),
            stop_flag: AtomicBool::new(false),
            stop: Notify::new(),
            signal_installed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Asks foreground work to wind down. Does not tear anything down.
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    /// Resolves once a stop was requested or a teardown has started.
    pub async fn stop_requested(&self) {
        loop {
            let notified = self.stop.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.stop_flag.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Tears everything down. Only the first call does any work and gets a
    /// report; every later call returns `None` at once.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        if self
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return None;
        }

        self.request_stop();
        info!("Shutting down...");
        let mut failures = 0;

        let messages_processed = self.listener.as_ref().map(|listener| listener.message_count());
        if let Some(count) = messages_processed {
            info!("Total messages processed: {}", count);
        }

        if let Some(listener) = &self.listener {
            if let Err(e) = listener.close().await {
                error!("Error closing message listener: {}", e);
                failures += 1;
            }
        }

        for failure in self.manager.disconnect().await {
            warn!("Teardown failure: {}", failure);
            failures += 1;
        }

        self.state.store(ShutdownState::Closed as u8, Ordering::SeqCst);
        self.closed.notify_waiters();
        info!("Shutdown complete");

        Some(ShutdownReport {
            messages_processed,
            failures,
        })
    }

    /// Resolves once a teardown has finished.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() == ShutdownState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Spawns a task that runs [`shutdown`](Self::shutdown) on SIGINT or
    /// SIGTERM. Only one signal task per coordinator; later calls return `None`.
    pub fn install_signal_handler(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.claim_signal() {
            warn!("Signal handler already installed");
            return None;
        }
        let coordinator = Arc::clone(self);
        Some(tokio::spawn(async move {
            wait_for_signal().await;
            coordinator.shutdown().await;
        }))
    }

    /// Like [`install_signal_handler`](Self::install_signal_handler), but the
    /// signal only calls [`request_stop`](Self::request_stop).
    pub fn install_stop_signal(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.claim_signal() {
            warn!("Signal handler already installed");
            return None;
        }
        let coordinator = Arc::clone(self);
        Some(tokio::spawn(async move {
            wait_for_signal().await;
            coordinator.request_stop();
        }))
    }

    fn claim_signal(&self) -> bool {
        !self.signal_installed.swap(true, Ordering::SeqCst)
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
