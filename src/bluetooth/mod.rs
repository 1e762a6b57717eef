/// Peripheral discovery, connection and notification plumbing
pub mod manager;
pub mod scanner;

use bluer::Uuid;
use futures_util::stream::LocalBoxStream;

use crate::error::ConnectionError;
use crate::models::{CharacteristicRef, ConnectionState};

pub use manager::ConnectionManager;
pub use scanner::BluerCentral;

/// Base64 payloads in arrival order; ends when the link drops
pub type NotificationStream = LocalBoxStream<'static, Result<String, ConnectionError>>;

/// A peripheral seen during the scan
#[derive(Debug, Clone)]
pub struct Advertisement<D> {
    pub name: Option<String>,
    pub address: String,
    pub device: D,
}

/// A resolved GATT service and the characteristics it exposes
#[derive(Debug, Clone, PartialEq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Everything the connection manager hands to the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    State(ConnectionState),
    Payload(String),
}

/// BLE central role as seen by the connection manager
///
/// `stop_scan` and `disconnect` must be idempotent. Notification values
/// are surfaced in their base64 wire form.
#[allow(async_fn_in_trait)]
pub trait BleCentral {
    type Device: Clone;

    async fn start_scan(&mut self) -> Result<(), ConnectionError>;

    /// Next peripheral seen by the running scan, `None` once discovery ends
    async fn next_advertisement(&mut self) -> Option<Advertisement<Self::Device>>;

    async fn stop_scan(&mut self);

    async fn connect(&mut self, device: &Self::Device) -> Result<(), ConnectionError>;

    /// Release a connected peripheral; best effort, never fails
    async fn disconnect(&mut self, device: &Self::Device);

    async fn discover_services(
        &mut self,
        device: &Self::Device,
    ) -> Result<Vec<GattService>, ConnectionError>;

    async fn subscribe(
        &mut self,
        device: &Self::Device,
        link: CharacteristicRef,
    ) -> Result<NotificationStream, ConnectionError>;
}
