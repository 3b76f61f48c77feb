//! RelayService: process-level state shared by every accepted connection.
//!
//! This service owns:
//! - The worker every connection runs
//! - Relay configuration handed to each supervisor
//! - Connection accounting for the health route
//! - Shutdown coordination
//!
//! Per-connection lifecycle lives in [`ConnectionSupervisor`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, watch};

use crate::config::RelayConfig;
use crate::supervisor::ConnectionSupervisor;
use crate::version::VersionInfo;
use crate::worker::Worker;

/// Whether the service still accepts connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Ready,
    ShuttingDown,
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: ServiceStatus,
    pub active_connections: usize,
    pub total_connections: usize,
    pub version: VersionInfo,
}

pub struct RelayService {
    worker: Arc<dyn Worker>,
    config: RelayConfig,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    total: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayService {
    pub fn new(worker: impl Worker, config: RelayConfig) -> Self {
        Self::from_arc(Arc::new(worker), config)
    }

    pub fn from_arc(worker: Arc<dyn Worker>, config: RelayConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            worker,
            config,
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            total: AtomicUsize::new(0),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Fresh supervisor for a newly accepted connection, terminated by
    /// [`trigger_shutdown`](Self::trigger_shutdown).
    pub fn supervisor(&self) -> ConnectionSupervisor {
        ConnectionSupervisor::new(Arc::clone(&self.worker), self.config.clone())
            .with_shutdown(self.shutdown_rx())
    }

    /// Count a connection as live until the returned guard drops.
    pub fn track_connection(&self) -> ConnectionGuard {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            active: Arc::clone(&self.active),
            idle: Arc::clone(&self.idle),
        }
    }

    /// Wait until no connection is live. Returns false if `timeout` elapsed first.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.idle.notified();
                if self.active_connections() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn health(&self) -> HealthSnapshot {
        let status = if self.is_shutting_down() {
            ServiceStatus::ShuttingDown
        } else {
            ServiceStatus::Ready
        };
        HealthSnapshot {
            status,
            active_connections: self.active_connections(),
            total_connections: self.total.load(Ordering::Relaxed),
            version: VersionInfo::new(),
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

/// Decrements the live connection count on drop.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}
