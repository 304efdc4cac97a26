//! Error types and error support code.

use thiserror::Error;

use crate::pool::{EventType, Reason};

/// Generalized error type used by any monitored pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Pool operation not supported.
    #[error("operation not supported")]
    NotImplemented,
    /// No available resources were found in the pool.
    #[error("pool is exhausted")]
    PoolExhausted,
    /// Call would block the thread, and non-blocking operation was requested.
    #[error("acquisition from pool would block execution")]
    WouldBlock,
    /// Resource acquisition took longer than the specified timeout.
    #[error("connection acquisition timeout")]
    AcquireTimeout,
    /// Pool was already closed.
    #[error("pool is closed")]
    PoolClosed,
    /// Acquired connection belongs to an older pool generation.
    #[error("connection is stale")]
    StaleConnection,
    /// Pool implementation-specific error.
    #[error("pool error: {0}")]
    Pool(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap pool implementation-specific error.
    pub fn pool<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Pool(err.into())
    }

    /// Reason code reported in a [`EventType::CheckOutFailed`] event for this error.
    #[must_use]
    pub fn reason(&self) -> Reason {
        match self {
            Self::PoolClosed => Reason::PoolClosed,
            Self::StaleConnection => Reason::Stale,
            Self::AcquireTimeout | Self::WouldBlock | Self::PoolExhausted => Reason::Timeout,
            Self::NotImplemented | Self::Pool(_) => Reason::ConnectionError,
        }
    }
}

/// Malformed or unrecognized event data.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum EventError {
    /// Event type string is outside the closed vocabulary.
    #[error("unknown pool event type: {0:?}")]
    UnknownEventType(String),
    /// Reason string is outside the closed vocabulary.
    #[error("unknown pool event reason: {0:?}")]
    UnknownReason(String),
    /// Event lacks a field its type requires.
    #[error("{event_type} event is missing required field `{field}`")]
    MissingField {
        /// Type of the offending event.
        event_type: EventType,
        /// Serialized name of the missing field.
        field: &'static str,
    },
    /// Event carries a field its type does not allow.
    #[error("{event_type} event must not carry field `{field}`")]
    UnexpectedField {
        /// Type of the offending event.
        event_type: EventType,
        /// Serialized name of the unexpected field.
        field: &'static str,
    },
}

/// Violation of event ordering guarantees.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SequenceError {
    /// Event arrived for an address with no preceding pool creation.
    #[error("{event_type} for {address} before ConnectionPoolCreated")]
    BeforePoolCreated {
        /// Pool address.
        address: String,
        /// Type of the offending event.
        event_type: EventType,
    },
    /// Event arrived for an address after its pool was closed.
    #[error("{event_type} for {address} after ConnectionPoolClosed")]
    AfterPoolClosed {
        /// Pool address.
        address: String,
        /// Type of the offending event.
        event_type: EventType,
    },
    /// Pool creation reported twice for the same address.
    #[error("duplicate ConnectionPoolCreated for {address}")]
    DuplicatePoolCreated {
        /// Pool address.
        address: String,
    },
    /// Connection creation reported twice for the same id.
    #[error("duplicate ConnectionCreated for connection {connection_id} of {address}")]
    DuplicateConnectionCreated {
        /// Pool address.
        address: String,
        /// Connection identifier.
        connection_id: u64,
    },
    /// Connection-scoped event for a connection that was never created.
    #[error("{event_type} for unknown connection {connection_id} of {address}")]
    UnknownConnection {
        /// Pool address.
        address: String,
        /// Connection identifier.
        connection_id: u64,
        /// Type of the offending event.
        event_type: EventType,
    },
    /// Connection-scoped event for a connection that was already closed.
    #[error("{event_type} for closed connection {connection_id} of {address}")]
    ConnectionAlreadyClosed {
        /// Pool address.
        address: String,
        /// Connection identifier.
        connection_id: u64,
        /// Type of the offending event.
        event_type: EventType,
    },
    /// Pool closure reported while connections were still open.
    #[error("ConnectionPoolClosed for {address} with connections {connection_ids:?} still open")]
    UnclosedConnections {
        /// Pool address.
        address: String,
        /// Identifiers of connections never closed, in ascending order.
        connection_ids: Vec<u64>,
    },
    /// Command started twice with the same request id.
    #[error("duplicate CommandStarted for request {request_id}")]
    DuplicateCommandStarted {
        /// Request identifier.
        request_id: i64,
    },
    /// Terminal command event without a matching started event.
    #[error("terminal event for request {request_id} without CommandStarted")]
    CommandNotStarted {
        /// Request identifier.
        request_id: i64,
    },
    /// Terminal command event reported on a different connection than its start.
    #[error("request {request_id} started on {started:?} but finished on {finished:?}")]
    CommandConnectionMismatch {
        /// Request identifier.
        request_id: i64,
        /// Connection the command started on.
        started: String,
        /// Connection the terminal event names.
        finished: String,
    },
    /// Event is malformed.
    #[error(transparent)]
    Malformed(#[from] EventError),
}
