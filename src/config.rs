//! Monitoring configuration structures.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    dispatch::{Dispatcher, DispatcherBuilder},
    logging::{MonitorLogLevel, TracingMonitor},
    metrics::MetricsMonitor,
    queue::{QueueConfig, QueueError, QueuedMonitor},
    validate::ValidatingMonitor,
};

/// Top-level monitoring configuration error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Configuration builder error
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Monitor queue could not be started
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Monitoring configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct MonitorConfig {
    /// Time budget for a single monitor callback
    ///
    /// Command callbacks get a context expiring after this budget. With a queue configured,
    /// callbacks overrunning the budget are abandoned.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub budget: Option<Duration>,
    /// Offload monitor callbacks to a background queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueConfig>,
    /// Level used to log every event, `OFF` disables event logging
    #[serde(default)]
    pub logging: MonitorLogLevel,
    /// Record OpenTelemetry metrics derived from events
    #[serde(default = "crate::util::default_true")]
    pub metrics: bool,
    /// Check event ordering and log violations
    #[serde(default)]
    pub validate: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            budget: None,
            queue: None,
            logging: MonitorLogLevel::default(),
            metrics: true,
            validate: false,
        }
    }
}

impl MonitorConfig {
    /// Create builder for monitoring configuration.
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::new()
    }

    /// Build dispatcher from user monitors plus the monitors enabled in this configuration.
    ///
    /// User monitors registered in `user` receive events first.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a queue is configured but no Tokio runtime is available.
    pub fn make_dispatcher(&self, user: DispatcherBuilder) -> Result<Dispatcher, ConfigError> {
        let mut builder = user.budget(self.budget);
        if self.logging != MonitorLogLevel::Off {
            let monitor = TracingMonitor::new(self.logging);
            builder = builder.pool_monitor(monitor).command_monitor(monitor);
        }
        if self.metrics {
            let monitor = Arc::new(MetricsMonitor::new());
            builder = builder
                .shared_pool_monitor(monitor.clone())
                .shared_command_monitor(monitor);
        }
        if self.validate {
            let monitor = Arc::new(ValidatingMonitor::new());
            builder = builder
                .shared_pool_monitor(monitor.clone())
                .shared_command_monitor(monitor);
        }
        let Some(queue_cfg) = &self.queue else {
            return Ok(builder.build());
        };
        let inner = builder.build();
        let (has_pool, has_command) = (inner.has_pool_monitor(), inner.has_command_monitor());
        let (queue, _worker) = QueuedMonitor::spawn(inner, queue_cfg)?;
        let mut outer = Dispatcher::builder();
        if has_pool {
            outer = outer.pool_monitor(queue.clone());
        }
        if has_command {
            outer = outer.command_monitor(queue);
        }
        Ok(outer.build())
    }
}

/// Builder for monitoring configuration.
#[must_use]
pub struct MonitorConfigBuilder {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl MonitorConfigBuilder {
    /// Alternative method to construct a monitoring configuration builder.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
        }
    }

    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful.
    pub fn build(self) -> Result<MonitorConfig, ConfigError> {
        self.builder.build()?.try_deserialize().map_err(Into::into)
    }

    /// Add a custom object implementing [`Source`] trait as a source of configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of configuration.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add environment variables as a source of configuration.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(
            config::Environment::with_prefix(prefix.as_ref())
                .separator("_")
                .prefix_separator("__"),
        )
    }
}

impl Default for MonitorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
