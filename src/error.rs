/// Error types for payload decoding and the peripheral connection
use thiserror::Error;

use bluer::Uuid;

/// Failure to turn one notification payload into a reading.
///
/// Local to a single notification: the pipeline logs it, skips the
/// payload and carries on with the next one.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("payload is not valid base64 ASCII: {0}")]
    Encoding(String),
    #[error("malformed value for '{label}': '{value}'")]
    Malformed { label: String, value: String },
}

/// Failure that ends a connection session.
///
/// Carried inside `ConnectionState::Failed` and published to consumers
/// as a status string; never retried inside the session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("peripheral discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("no device named '{0}' found before the scan timed out")]
    ScanTimedOut(String),
    #[error("failed to connect to {device}: {reason}")]
    ConnectFailed { device: String, reason: String },
    #[error("service {0} not found on peripheral")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found in service")]
    CharacteristicNotFound(Uuid),
    #[error("failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),
    #[error("notification transport error: {0}")]
    TransportError(String),
}
