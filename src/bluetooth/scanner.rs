/// BlueZ-backed central built on bluer
use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures_util::{stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Advertisement, BleCentral, GattService, NotificationStream};
use crate::codec;
use crate::error::ConnectionError;
use crate::models::CharacteristicRef;

// Discovered addresses waiting to be matched
const DISCOVERY_QUEUE_DEPTH: usize = 64;
const NOTIFICATION_QUEUE_DEPTH: usize = 64;

/// Central running on the local BlueZ adapter
///
/// The session and adapter are opened lazily on the first scan so that a
/// missing adapter surfaces as a connection failure instead of a startup
/// crash.
pub struct BluerCentral {
    adapter_name: Option<String>,
    session: Option<Session>,
    adapter: Option<Adapter>,
    discovery_handle: Option<JoinHandle<()>>,
    discovered: Option<mpsc::Receiver<Address>>,
}

impl BluerCentral {
    pub fn new(adapter_name: Option<String>) -> Self {
        BluerCentral {
            adapter_name,
            session: None,
            adapter: None,
            discovery_handle: None,
            discovered: None,
        }
    }

    async fn open_adapter(&mut self) -> Result<Adapter, ConnectionError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        // Initialize Bluetooth session
        if self.session.is_none() {
            let session = Session::new().await.map_err(|e| {
                error!("Failed to create Bluetooth session: {}", e);
                ConnectionError::AdapterUnavailable(e.to_string())
            })?;
            self.session = Some(session);
        }
        let session = match &self.session {
            Some(session) => session,
            None => return Err(ConnectionError::AdapterUnavailable("no session".into())),
        };

        let adapter = match &self.adapter_name {
            Some(name) => session.adapter(name),
            None => session.default_adapter().await,
        }
        .map_err(|e| {
            error!("Failed to get Bluetooth adapter: {}", e);
            ConnectionError::AdapterUnavailable(e.to_string())
        })?;

        // Ensure Bluetooth adapter is powered on
        if let Err(e) = adapter.set_powered(true).await {
            error!("Failed to power on adapter: {}", e);
            return Err(ConnectionError::AdapterUnavailable(e.to_string()));
        }

        info!("Using Bluetooth adapter {}", adapter.name());
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }
}

fn address_of(device: &Device) -> String {
    device.address().to_string().to_uppercase()
}

/// Address worth (re)checking against the target name
fn reported_address(event: &AdapterEvent) -> Option<Address> {
    match event {
        AdapterEvent::DeviceAdded(addr) => Some(*addr),
        _ => None,
    }
}

impl BleCentral for BluerCentral {
    type Device = Device;

    async fn start_scan(&mut self) -> Result<(), ConnectionError> {
        if self.discovery_handle.is_some() {
            debug!("Scan already running");
            return Ok(());
        }

        let adapter = self.open_adapter().await?;

        // Low Energy only, no name or service filter
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: false,
            ..Default::default()
        };

        // Apply the discovery filter (warn if it fails, but continue)
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        // With changes, a device is re-reported once its name arrives in a scan response
        let discovery_stream = adapter.discover_devices_with_changes().await.map_err(|e| {
            error!("Failed to start device discovery: {}", e);
            ConnectionError::DiscoveryFailed(e.to_string())
        })?;

        // Drain discovery in the background; the scan lives as long as this task
        let (tx, rx) = mpsc::channel(DISCOVERY_QUEUE_DEPTH);
        let handle = tokio::spawn(async move {
            let mut stream = Box::pin(discovery_stream);
            while let Some(event) = stream.next().await {
                debug!("Discovery event: {:?}", event);
                if let Some(addr) = reported_address(&event) {
                    if tx.send(addr).await.is_err() {
                        break;
                    }
                }
            }
        });

        self.discovery_handle = Some(handle);
        self.discovered = Some(rx);
        Ok(())
    }

    async fn next_advertisement(&mut self) -> Option<Advertisement<Device>> {
        let adapter = self.adapter.as_ref()?;
        let discovered = self.discovered.as_mut()?;

        while let Some(addr) = discovered.recv().await {
            let device = match adapter.device(addr) {
                Ok(device) => device,
                Err(_) => continue,
            };

            let name = match device.name().await {
                Ok(name) => name,
                Err(e) => {
                    debug!("Failed to read name of {}: {}", addr, e);
                    None
                }
            };

            return Some(Advertisement {
                name,
                address: addr.to_string().to_uppercase(),
                device,
            });
        }

        None
    }

    async fn stop_scan(&mut self) {
        // Stopping twice is a no-op
        if let Some(handle) = self.discovery_handle.take() {
            handle.abort();
            debug!("Discovery stopped");
        }
        self.discovered = None;
    }

    async fn connect(&mut self, device: &Device) -> Result<(), ConnectionError> {
        let addr = address_of(device);

        if device.is_connected().await.unwrap_or(false) {
            debug!("{} already connected", addr);
            return Ok(());
        }

        device
            .connect()
            .await
            .map_err(|e| ConnectionError::ConnectFailed {
                device: addr,
                reason: e.to_string(),
            })
    }

    async fn disconnect(&mut self, device: &Device) {
        let addr = address_of(device);

        // Already gone is fine
        if !device.is_connected().await.unwrap_or(false) {
            debug!("{} not connected", addr);
            return;
        }

        match device.disconnect().await {
            Ok(()) => info!("Disconnected from {}", addr),
            Err(e) => warn!("Failed to disconnect from {}: {}", addr, e),
        }
    }

    async fn discover_services(
        &mut self,
        device: &Device,
    ) -> Result<Vec<GattService>, ConnectionError> {
        let discovery_failed = |e: bluer::Error| ConnectionError::DiscoveryFailed(e.to_string());

        let mut resolved = Vec::new();
        for service in device.services().await.map_err(discovery_failed)? {
            let uuid = service.uuid().await.map_err(discovery_failed)?;

            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await.map_err(discovery_failed)? {
                characteristics.push(characteristic.uuid().await.map_err(discovery_failed)?);
            }

            debug!(
                "Service {} on {} with {} characteristics",
                uuid,
                address_of(device),
                characteristics.len()
            );
            resolved.push(GattService {
                uuid,
                characteristics,
            });
        }

        Ok(resolved)
    }

    async fn subscribe(
        &mut self,
        device: &Device,
        link: CharacteristicRef,
    ) -> Result<NotificationStream, ConnectionError> {
        let subscription_failed =
            |e: bluer::Error| ConnectionError::SubscriptionFailed(e.to_string());

        for service in device.services().await.map_err(subscription_failed)? {
            if service.uuid().await.map_err(subscription_failed)? != link.service {
                continue;
            }

            for characteristic in service.characteristics().await.map_err(subscription_failed)? {
                if characteristic.uuid().await.map_err(subscription_failed)? != link.characteristic
                {
                    continue;
                }

                let notifications = characteristic
                    .notify()
                    .await
                    .map_err(subscription_failed)?;

                // Forward in arrival order; the channel closes when the link drops
                let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_DEPTH);
                tokio::spawn(async move {
                    let mut stream = Box::pin(notifications);
                    while let Some(value) = stream.next().await {
                        // BlueZ hands over raw values; present them in wire form
                        if tx.send(codec::encode(&value)).await.is_err() {
                            break;
                        }
                    }
                    debug!("Notification stream ended");
                });

                return Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv()
                        .await
                        .map(|payload| (Ok::<_, ConnectionError>(payload), rx))
                })
                .boxed_local());
            }

            return Err(ConnectionError::CharacteristicNotFound(link.characteristic));
        }

        Err(ConnectionError::ServiceNotFound(link.service))
    }
}
