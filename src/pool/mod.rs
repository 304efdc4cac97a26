//! Pool lifecycle events.

mod monitored;
mod reporter;

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};

pub use crate::{
    error::{Error, EventError},
    pool::{
        monitored::{MonitoredConnection, MonitoredPool, ObservablePool, PooledConnection},
        reporter::PoolReporter,
    },
};

/// Pool event type.
///
/// Serialized names are part of the external event format and must not change.
#[derive(Clone, Copy, Debug, Deserialize, Hash, PartialEq, Eq, Serialize)]
pub enum EventType {
    /// Pool was initialized.
    #[serde(rename = "ConnectionPoolCreated")]
    PoolCreated,
    /// New connection was established.
    #[serde(rename = "ConnectionCreated")]
    ConnectionCreated,
    /// Caller acquired a connection.
    #[serde(rename = "ConnectionCheckedOut")]
    CheckedOut,
    /// Connection acquisition attempt failed.
    #[serde(rename = "ConnectionCheckOutFailed")]
    CheckOutFailed,
    /// Caller released a connection back to the pool.
    #[serde(rename = "ConnectionCheckedIn")]
    CheckedIn,
    /// All pool connections were invalidated.
    #[serde(rename = "ConnectionPoolCleared")]
    PoolCleared,
    /// Connection was torn down.
    #[serde(rename = "ConnectionClosed")]
    ConnectionClosed,
    /// Pool was shut down.
    #[serde(rename = "ConnectionPoolClosed")]
    PoolClosed,
}

impl EventType {
    /// Every event type, in lifecycle order.
    pub const ALL: [Self; 8] = [
        Self::PoolCreated,
        Self::ConnectionCreated,
        Self::CheckedOut,
        Self::CheckOutFailed,
        Self::CheckedIn,
        Self::PoolCleared,
        Self::ConnectionClosed,
        Self::PoolClosed,
    ];

    /// Serialized name of the event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PoolCreated => "ConnectionPoolCreated",
            Self::ConnectionCreated => "ConnectionCreated",
            Self::CheckedOut => "ConnectionCheckedOut",
            Self::CheckOutFailed => "ConnectionCheckOutFailed",
            Self::CheckedIn => "ConnectionCheckedIn",
            Self::PoolCleared => "ConnectionPoolCleared",
            Self::ConnectionClosed => "ConnectionClosed",
            Self::PoolClosed => "ConnectionPoolClosed",
        }
    }

    /// Whether events of this type refer to a single connection.
    #[must_use]
    pub const fn is_connection_scoped(self) -> bool {
        matches!(
            self,
            Self::ConnectionCreated | Self::CheckedOut | Self::CheckedIn | Self::ConnectionClosed
        )
    }

    /// Whether events of this type carry a reason code.
    #[must_use]
    pub const fn has_reason(self) -> bool {
        matches!(
            self,
            Self::CheckOutFailed | Self::PoolCleared | Self::ConnectionClosed
        )
    }

    /// Whether events of this type carry pool options.
    #[must_use]
    pub const fn has_options(self) -> bool {
        matches!(self, Self::PoolCreated)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_owned()))
    }
}

/// Reason code attached to checkout failure, pool clear and connection close events.
#[derive(Clone, Copy, Debug, Deserialize, Hash, PartialEq, Eq, Serialize)]
pub enum Reason {
    /// Pool was already closed.
    #[serde(rename = "poolClosed")]
    PoolClosed,
    /// Connection belongs to an older pool generation.
    #[serde(rename = "stale")]
    Stale,
    /// Connection encountered an error.
    #[serde(rename = "connectionError")]
    ConnectionError,
    /// Operation timed out.
    #[serde(rename = "timeout")]
    Timeout,
}

impl Reason {
    /// Every reason code.
    pub const ALL: [Self; 4] = [
        Self::PoolClosed,
        Self::Stale,
        Self::ConnectionError,
        Self::Timeout,
    ];

    /// Serialized name of the reason code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PoolClosed => "poolClosed",
            Self::Stale => "stale",
            Self::ConnectionError => "connectionError",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reason {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| EventError::UnknownReason(s.to_owned()))
    }
}

/// Pool size configuration, as reported in [`EventType::PoolCreated`] events.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorPoolOptions {
    /// Maximum number of open connections.
    pub max_pool_size: u64,
    /// Minimum number of open connections.
    pub min_pool_size: u64,
}

impl MonitorPoolOptions {
    /// Snapshot pool size limits.
    #[must_use]
    pub const fn new(max_pool_size: u64, min_pool_size: u64) -> Self {
        Self {
            max_pool_size,
            min_pool_size,
        }
    }
}

/// Single pool lifecycle event.
///
/// Use typed constructors to build events; each one sets exactly the fields its type requires.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    address: String,
    #[serde(rename = "connectionId", default)]
    connection_id: Option<u64>,
    #[serde(rename = "options", default)]
    pool_options: Option<MonitorPoolOptions>,
    #[serde(default)]
    reason: Option<Reason>,
}

impl Event {
    fn new(event_type: EventType, address: impl Into<String>) -> Self {
        Self {
            event_type,
            address: address.into(),
            connection_id: None,
            pool_options: None,
            reason: None,
        }
    }

    fn with_connection(mut self, connection_id: u64) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// [`EventType::PoolCreated`] event.
    #[must_use]
    pub fn pool_created(address: impl Into<String>, options: MonitorPoolOptions) -> Self {
        let mut event = Self::new(EventType::PoolCreated, address);
        event.pool_options = Some(options);
        event
    }

    /// [`EventType::ConnectionCreated`] event.
    #[must_use]
    pub fn connection_created(address: impl Into<String>, connection_id: u64) -> Self {
        Self::new(EventType::ConnectionCreated, address).with_connection(connection_id)
    }

    /// [`EventType::CheckedOut`] event.
    #[must_use]
    pub fn checked_out(address: impl Into<String>, connection_id: u64) -> Self {
        Self::new(EventType::CheckedOut, address).with_connection(connection_id)
    }

    /// [`EventType::CheckOutFailed`] event.
    #[must_use]
    pub fn check_out_failed(address: impl Into<String>, reason: Reason) -> Self {
        Self::new(EventType::CheckOutFailed, address).with_reason(reason)
    }

    /// [`EventType::CheckedIn`] event.
    #[must_use]
    pub fn checked_in(address: impl Into<String>, connection_id: u64) -> Self {
        Self::new(EventType::CheckedIn, address).with_connection(connection_id)
    }

    /// [`EventType::PoolCleared`] event.
    #[must_use]
    pub fn pool_cleared(address: impl Into<String>, reason: Reason) -> Self {
        Self::new(EventType::PoolCleared, address).with_reason(reason)
    }

    /// [`EventType::ConnectionClosed`] event.
    #[must_use]
    pub fn connection_closed(
        address: impl Into<String>,
        connection_id: u64,
        reason: Reason,
    ) -> Self {
        Self::new(EventType::ConnectionClosed, address)
            .with_connection(connection_id)
            .with_reason(reason)
    }

    /// [`EventType::PoolClosed`] event.
    #[must_use]
    pub fn pool_closed(address: impl Into<String>) -> Self {
        Self::new(EventType::PoolClosed, address)
    }

    /// Event type.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Network address of the pool.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connection identifier, for connection-scoped event types.
    #[must_use]
    pub fn connection_id(&self) -> Option<u64> {
        self.connection_id
    }

    /// Pool size options, for [`EventType::PoolCreated`].
    #[must_use]
    pub fn pool_options(&self) -> Option<&MonitorPoolOptions> {
        self.pool_options.as_ref()
    }

    /// Reason code, for checkout failure, clear and close events.
    #[must_use]
    pub fn reason(&self) -> Option<Reason> {
        self.reason
    }

    /// Check that the event carries exactly the fields its type requires.
    ///
    /// Events built with typed constructors always pass. This is meant for events coming from
    /// deserialization or other foreign sources.
    ///
    /// # Errors
    ///
    /// Returns `Err` naming the first missing or unexpected field.
    pub fn validate(&self) -> Result<(), EventError> {
        let event_type = self.event_type;
        let check = |required: bool, present: bool, field: &'static str| match (required, present)
        {
            (true, false) => Err(EventError::MissingField { event_type, field }),
            (false, true) => Err(EventError::UnexpectedField { event_type, field }),
            _ => Ok(()),
        };
        check(true, !self.address.is_empty(), "address")?;
        check(
            event_type.is_connection_scoped(),
            self.connection_id.is_some(),
            "connectionId",
        )?;
        check(
            event_type.has_options(),
            self.pool_options.is_some(),
            "options",
        )?;
        check(event_type.has_reason(), self.reason.is_some(), "reason")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.event_type, self.address)?;
        if let Some(id) = self.connection_id {
            write!(f, " connection={id}")?;
        }
        if let Some(opts) = &self.pool_options {
            write!(f, " max={} min={}", opts.max_pool_size, opts.min_pool_size)?;
        }
        if let Some(reason) = self.reason {
            write!(f, " reason={reason}")?;
        }
        Ok(())
    }
}

/// Receiver of pool lifecycle events.
///
/// Implementations may be called concurrently from several connections, and must do their own
/// synchronization. Any `Fn(&Event)` closure is a valid monitor.
pub trait PoolMonitor: Send + Sync {
    /// Observe a single pool event.
    fn event(&self, event: &Event);
}

impl<F> PoolMonitor for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn event(&self, event: &Event) {
        self(event);
    }
}

/// Pool event callback slot.
///
/// An empty slot observes nothing.
#[derive(Clone, Default)]
#[must_use]
pub struct PoolCallback {
    event: Option<Arc<dyn Fn(&Event) + Send + Sync>>,
}

impl PoolCallback {
    /// Empty callback slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set pool event callback.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.event = Some(Arc::new(f));
        self
    }

    /// Whether the callback slot is filled.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.event.is_some()
    }
}

impl fmt::Debug for PoolCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCallback")
            .field("event", &self.event.is_some())
            .finish()
    }
}

impl PoolMonitor for PoolCallback {
    fn event(&self, event: &Event) {
        if let Some(cb) = &self.event {
            cb(event);
        }
    }
}
