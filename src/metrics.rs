//! Snapshots of pool selection, acquire, and connection accounting.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::Serialize;

/// Per-pool gauges sourced from the driver adapter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DriverMetrics {
    /// Maximum pool size.
    pub max: usize,

    /// Minimum pool size.
    pub min: usize,

    /// Idle connections currently available.
    pub idle: usize,

    /// Connections currently checked out or being established.
    pub used: usize,

    /// Host component of the pool's DSN.
    pub host: String,
}

/// Counters and cumulative times recorded by the pool manager itself.
///
/// Counters increment when a timed region is entered; the matching duration
/// accumulates when the region exits, whether it succeeded or failed. The
/// connection maps are keyed by the redacted per-host DSN.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HasqlMetrics {
    /// Number of pool selections performed by the balancer.
    pub pool: u64,

    /// Cumulative time spent selecting pools.
    pub pool_time: Duration,

    /// Number of connection acquires.
    pub acquire: u64,

    /// Cumulative time spent acquiring connections.
    pub acquire_time: Duration,

    /// Connections handed out, per host DSN.
    pub add_connections: HashMap<String, u64>,

    /// Connections returned or reclaimed, per host DSN.
    pub remove_connections: HashMap<String, u64>,
}

/// A full metrics snapshot: one [`DriverMetrics`] per live pool plus the
/// manager's own [`HasqlMetrics`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Metrics {
    /// Adapter-reported state of every live pool.
    pub drivers: Vec<DriverMetrics>,

    /// The manager's own counters.
    pub hasql: HasqlMetrics,
}

#[derive(Debug, Default)]
struct RecorderState {
    pool: u64,
    pool_time: Duration,
    acquire: u64,
    acquire_time: Duration,
    add_connections: HashMap<String, u64>,
    remove_connections: HashMap<String, u64>,
}

/// Accumulates [`HasqlMetrics`] behind a mutex held only for counter bumps.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    state: Mutex<RecorderState>,
}

#[derive(Clone, Copy, Debug)]
enum TimerTarget {
    Pool,
    Acquire,
}

impl MetricsRecorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts timing a pool selection; the entry counter is bumped
    /// immediately and the elapsed time lands when the guard drops.
    pub(crate) fn time_pool(&self) -> MetricsTimer<'_> {
        self.start(TimerTarget::Pool)
    }

    /// Starts timing a connection acquire.
    pub(crate) fn time_acquire(&self) -> MetricsTimer<'_> {
        self.start(TimerTarget::Acquire)
    }

    fn start(&self, target: TimerTarget) -> MetricsTimer<'_> {
        {
            let mut state = self.state.lock().unwrap();
            match target {
                TimerTarget::Pool => state.pool += 1,
                TimerTarget::Acquire => state.acquire += 1,
            }
        }
        MetricsTimer {
            recorder: self,
            target,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn add_connection(&self, dsn: &str) {
        let mut state = self.state.lock().unwrap();
        *state.add_connections.entry(dsn.to_string()).or_default() += 1;
    }

    pub(crate) fn remove_connection(&self, dsn: &str) {
        let mut state = self.state.lock().unwrap();
        *state.remove_connections.entry(dsn.to_string()).or_default() += 1;
    }

    pub(crate) fn snapshot(&self) -> HasqlMetrics {
        let state = self.state.lock().unwrap();
        HasqlMetrics {
            pool: state.pool,
            pool_time: state.pool_time,
            acquire: state.acquire,
            acquire_time: state.acquire_time,
            add_connections: state.add_connections.clone(),
            remove_connections: state.remove_connections.clone(),
        }
    }
}

/// Guard returned by [`MetricsRecorder::time_pool`] and
/// [`MetricsRecorder::time_acquire`]; accumulates the elapsed time on drop so
/// failed and cancelled regions are still accounted for.
#[derive(Debug)]
pub(crate) struct MetricsTimer<'a> {
    recorder: &'a MetricsRecorder,
    target: TimerTarget,
    started_at: Instant,
}

impl Drop for MetricsTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.started_at.elapsed();
        let mut state = self.recorder.state.lock().unwrap();
        match self.target {
            TimerTarget::Pool => state.pool_time += elapsed,
            TimerTarget::Acquire => state.acquire_time += elapsed,
        }
    }
}
