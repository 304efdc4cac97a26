#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

pub mod command;
mod config;
mod context;
mod dispatch;
pub mod error;
mod logging;
mod metrics;
pub mod pool;
mod queue;
mod util;
pub mod validate;

pub use crate::{
    config::{ConfigError, MonitorConfig, MonitorConfigBuilder},
    context::MonitorContext,
    dispatch::{Dispatcher, DispatcherBuilder},
    logging::{MonitorLogLevel, TracingMonitor, LOG_TARGET},
    metrics::MetricsMonitor,
    queue::{QueueConfig, QueueError, QueuedMonitor},
};
