use std::{sync::Arc, time::Instant};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use super::Shared;
use crate::{driver::Driver, dsn::Dsn, runtime};

/// Monitor that keeps one host's pool alive and its role classification
/// current.
///
/// The monitor first creates the host's pool, retrying until it succeeds,
/// then probes the host once per `refresh_delay`: acquire a probe
/// connection, ask the driver whether the host is a master, and publish the
/// classification. Every probe step runs under the `refresh_timeout` budget,
/// and every suspension point is raced against the manager's closing signal
/// so shutdown interrupts the loop promptly.
pub(super) struct Monitor<D: Driver> {
    index: usize,
    dsn: Dsn,
    redacted: String,
    shared: Arc<Shared<D>>,
    closing: watch::Receiver<bool>,
}

impl<D: Driver> Monitor<D> {
    pub(super) fn start(
        index: usize,
        dsn: Dsn,
        shared: Arc<Shared<D>>,
        closing: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Self {
            index,
            redacted: dsn.redacted().to_string(),
            dsn,
            shared,
            closing,
        };
        runtime::spawn(monitor.run())
    }

    async fn run(mut self) {
        debug!(dsn = %self.redacted, "starting pool monitor");
        let Some(pool) = self.create_pool().await else {
            return;
        };
        self.shared.registry.set_pool(self.index, pool.clone());

        while !self.is_closing() {
            self.probe_cycle(&pool).await;
            if self.sleep_or_close().await {
                break;
            }
        }
        debug!(dsn = %self.redacted, "pool monitor stopped");
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    async fn closed_signal(closing: &mut watch::Receiver<bool>) {
        let _ = closing.wait_for(|closing| *closing).await;
    }

    /// Creation phase: retry `create_pool` until it succeeds or the manager
    /// closes. Each attempt gets a full `refresh_timeout` budget.
    async fn create_pool(&mut self) -> Option<D::Pool> {
        loop {
            if self.is_closing() {
                return None;
            }
            let mut closing = self.closing.clone();
            let attempt = tokio::select! {
                _ = Self::closed_signal(&mut closing) => return None,
                result = runtime::timeout(
                    self.shared.options.refresh_timeout,
                    self.shared.driver.create_pool(&self.dsn, &self.shared.pool_config),
                ) => result.and_then(|created| created),
            };
            match attempt {
                Ok(pool) => return Some(pool),
                Err(error) => {
                    warn!(dsn = %self.redacted, %error, "creating pool failed");
                }
            }
        }
    }

    /// One probe cycle. The per-DSN check condition is notified exactly once
    /// on every path that completes the cycle.
    async fn probe_cycle(&mut self, pool: &D::Pool) {
        let mut closing = self.closing.clone();
        let shared = &self.shared;

        debug!(dsn = %self.redacted, "acquiring probe connection");
        let acquired = tokio::select! {
            _ = Self::closed_signal(&mut closing) => return,
            result = runtime::timeout(shared.options.refresh_timeout, shared.driver.acquire(pool)) => {
                result.and_then(|acquired| acquired)
            }
        };
        let mut connection = match acquired {
            Ok(connection) => connection,
            Err(error) => {
                warn!(dsn = %self.redacted, %error, "acquiring probe connection failed");
                self.drop_from_sets();
                shared.registry.notify_check(self.index);
                return;
            }
        };

        debug!(dsn = %self.redacted, "checking host role");
        let started_at = Instant::now();
        let checked = tokio::select! {
            _ = Self::closed_signal(&mut closing) => None,
            result = runtime::timeout(shared.options.refresh_timeout, shared.driver.is_master(&mut connection)) => {
                Some(result.and_then(|checked| checked))
            }
        };
        match checked {
            Some(Ok(is_master)) => {
                shared.stopwatch.record(self.index, started_at.elapsed());
                self.classify(is_master);
                shared.registry.mark_ready(self.index);
            }
            Some(Err(error)) => {
                warn!(dsn = %self.redacted, %error, "database is not available");
                self.drop_from_sets();
            }
            // shutting down; release the probe connection and leave the sets
            // as they are
            None => {}
        }

        if let Err(error) = shared.driver.release(connection, pool).await {
            warn!(dsn = %self.redacted, %error, "releasing probe connection failed");
        }
        shared.registry.notify_check(self.index);
    }

    fn classify(&self, is_master: bool) {
        let registry = &self.shared.registry;
        let newly_added = if is_master {
            registry.promote_master(self.index)
        } else {
            registry.promote_replica(self.index)
        };
        if newly_added {
            debug!(
                dsn = %self.redacted,
                role = if is_master { "master" } else { "replica" },
                "pool classified",
            );
        }
    }

    fn drop_from_sets(&self) {
        let (was_master, was_replica) = self.shared.registry.demote(self.index);
        if was_master {
            debug!(dsn = %self.redacted, "pool removed from master set");
        }
        if was_replica {
            debug!(dsn = %self.redacted, "pool removed from replica set");
        }
    }

    async fn sleep_or_close(&mut self) -> bool {
        let mut closing = self.closing.clone();
        tokio::select! {
            _ = Self::closed_signal(&mut closing) => true,
            _ = runtime::delay_for(self.shared.options.refresh_delay) => false,
        }
    }
}
