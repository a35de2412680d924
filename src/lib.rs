#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod balancer;
pub mod driver;
pub mod dsn;
pub mod error;
mod manager;
pub mod metrics;
pub(crate) mod runtime;
mod stopwatch;

pub use crate::{
    balancer::{
        BalancerPolicy, CandidateRequest, GreedyBalancerPolicy, RandomWeightedBalancerPolicy,
        RoundRobinBalancerPolicy,
    },
    driver::{Driver, PoolConfig},
    dsn::{split_dsn, Dsn, HostAddr, DEFAULT_PORT},
    error::{Error, ErrorKind, Result},
    manager::{
        AcquireOptions, PoolManager, PoolOptions, PoolView, PooledConnection,
        DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_MASTER_AS_REPLICA_WEIGHT, DEFAULT_REFRESH_DELAY,
        DEFAULT_REFRESH_TIMEOUT, DEFAULT_STOPWATCH_WINDOW_SIZE,
    },
    metrics::{DriverMetrics, HasqlMetrics, Metrics},
};
