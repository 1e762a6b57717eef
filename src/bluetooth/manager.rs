/// Connection state machine: scan, connect, resolve, subscribe, forward
///
/// ```text
/// Idle -> Scanning -> Connecting -> Connected
///            |            |            |
///            +------------+------------+--> Failed
/// ```
///
/// `Failed` is terminal. Nothing here retries; a new session needs a new
/// manager. A peripheral that was connected is always released when the
/// session ends so the next session can find it advertising again.
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{BleCentral, GattService, LinkEvent, NotificationStream};
use crate::config::MonitorConfig;
use crate::error::ConnectionError;
use crate::models::{CharacteristicRef, ConnectionState, DeviceRef};

pub struct ConnectionManager<C: BleCentral> {
    central: C,
    config: MonitorConfig,
    state: ConnectionState,
    events: mpsc::Sender<LinkEvent>,
    connected: Option<C::Device>,
}

impl<C: BleCentral> ConnectionManager<C> {
    pub fn new(central: C, config: MonitorConfig, events: mpsc::Sender<LinkEvent>) -> Self {
        ConnectionManager {
            central,
            config,
            state: ConnectionState::Idle,
            events,
            connected: None,
        }
    }

    /// Drive one session to its end and return the final state
    ///
    /// Returns once the session fails, or once the pipeline stops
    /// listening while the link is up.
    pub async fn run(mut self) -> ConnectionState {
        if let Err(e) = self.session().await {
            error!("Connection session failed: {}", e);
            self.transition(ConnectionState::Failed(e)).await;
        }
        if let Some(device) = self.connected.take() {
            self.central.disconnect(&device).await;
        }
        self.state
    }

    async fn session(&mut self) -> Result<(), ConnectionError> {
        let (device, device_ref) = self.scan().await?;

        info!(
            "Found {} at {}, connecting",
            device_ref.name, device_ref.address
        );
        self.transition(ConnectionState::Connecting(device_ref.clone()))
            .await;

        self.central.connect(&device).await?;
        self.connected = Some(device.clone());

        let services = self.central.discover_services(&device).await?;
        let link = resolve_characteristic(&services, &self.config)?;
        let notifications = self.central.subscribe(&device, link).await?;

        self.transition(ConnectionState::Connected(device_ref, link))
            .await;
        self.forward(notifications).await
    }

    async fn scan(&mut self) -> Result<(C::Device, DeviceRef), ConnectionError> {
        self.transition(ConnectionState::Scanning).await;
        self.central.start_scan().await?;
        info!("Scanning for '{}'", self.config.device_name);

        let scan_timeout = self.config.scan_timeout;
        let found = match scan_timeout {
            Some(limit) => match timeout(limit, self.wait_for_target()).await {
                Ok(found) => found,
                Err(_) => Err(ConnectionError::ScanTimedOut(self.config.device_name.clone())),
            },
            None => self.wait_for_target().await,
        };

        // Only one connection attempt in flight, so the scan ends here either way
        self.central.stop_scan().await;
        found
    }

    async fn wait_for_target(&mut self) -> Result<(C::Device, DeviceRef), ConnectionError> {
        while let Some(advertisement) = self.central.next_advertisement().await {
            if advertisement.name.as_deref() == Some(self.config.device_name.as_str()) {
                let device_ref = DeviceRef {
                    name: self.config.device_name.clone(),
                    address: advertisement.address,
                };
                return Ok((advertisement.device, device_ref));
            }
            debug!(
                "Skipping {} ({})",
                advertisement.address,
                advertisement.name.as_deref().unwrap_or("unnamed")
            );
        }

        Err(ConnectionError::DiscoveryFailed(
            "discovery ended before the target was seen".to_string(),
        ))
    }

    async fn forward(
        &mut self,
        mut notifications: NotificationStream,
    ) -> Result<(), ConnectionError> {
        let mut forwarded: u64 = 0;

        while let Some(item) = notifications.next().await {
            let payload = item?;
            if self.events.send(LinkEvent::Payload(payload)).await.is_err() {
                info!("Pipeline stopped listening after {} notifications", forwarded);
                return Ok(());
            }
            forwarded += 1;
        }

        Err(ConnectionError::TransportError(format!(
            "notification stream closed after {} notifications",
            forwarded
        )))
    }

    async fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(&next) {
            warn!(
                "Refusing connection transition {:?} -> {:?}",
                self.state, next
            );
            return;
        }

        info!("Connection state: {}", next.status_label());
        self.state = next.clone();
        // A closed pipeline still lets the state machine finish
        let _ = self.events.send(LinkEvent::State(next)).await;
    }
}

/// Locate the configured service, then the configured characteristic in it
fn resolve_characteristic(
    services: &[GattService],
    config: &MonitorConfig,
) -> Result<CharacteristicRef, ConnectionError> {
    let service = services
        .iter()
        .find(|s| s.uuid == config.service_uuid)
        .ok_or(ConnectionError::ServiceNotFound(config.service_uuid))?;

    if !service.characteristics.contains(&config.characteristic_uuid) {
        return Err(ConnectionError::CharacteristicNotFound(
            config.characteristic_uuid,
        ));
    }

    Ok(CharacteristicRef {
        service: service.uuid,
        characteristic: config.characteristic_uuid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::Advertisement;
    use crate::codec;
    use crate::config::{SERVICE_UUID, STEP_DATA_CHAR_UUID};
    use bluer::Uuid;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// In-memory central replaying a fixed script
    struct ScriptedCentral {
        advertisements: VecDeque<Advertisement<u32>>,
        // Keep the scan open forever once the script runs out
        hang_after_script: bool,
        scan_starts: usize,
        scan_stops: usize,
        scanning: bool,
        connect_result: Result<(), ConnectionError>,
        services: Vec<GattService>,
        subscribe_result: Result<(), ConnectionError>,
        notifications: Vec<Result<String, ConnectionError>>,
        connected_to: Vec<u32>,
        link_up: Option<u32>,
        disconnected: Vec<u32>,
    }

    impl ScriptedCentral {
        fn new() -> Self {
            ScriptedCentral {
                advertisements: VecDeque::new(),
                hang_after_script: false,
                scan_starts: 0,
                scan_stops: 0,
                scanning: false,
                connect_result: Ok(()),
                services: vec![GattService {
                    uuid: SERVICE_UUID,
                    characteristics: vec![STEP_DATA_CHAR_UUID],
                }],
                subscribe_result: Ok(()),
                notifications: Vec::new(),
                connected_to: Vec::new(),
                link_up: None,
                disconnected: Vec::new(),
            }
        }

        fn advertise(mut self, id: u32, name: Option<&str>) -> Self {
            self.advertisements.push_back(Advertisement {
                name: name.map(str::to_string),
                address: format!("00:00:00:00:00:{:02X}", id),
                device: id,
            });
            self
        }
    }

    impl BleCentral for &mut ScriptedCentral {
        type Device = u32;

        async fn start_scan(&mut self) -> Result<(), ConnectionError> {
            assert!(!self.scanning, "second scan started while one is active");
            self.scanning = true;
            self.scan_starts += 1;
            Ok(())
        }

        async fn next_advertisement(&mut self) -> Option<Advertisement<u32>> {
            assert!(self.scanning, "polled advertisements without a scan");
            match self.advertisements.pop_front() {
                Some(advertisement) => Some(advertisement),
                None if self.hang_after_script => std::future::pending().await,
                None => None,
            }
        }

        async fn stop_scan(&mut self) {
            if self.scanning {
                self.scanning = false;
                self.scan_stops += 1;
            }
        }

        async fn connect(&mut self, device: &u32) -> Result<(), ConnectionError> {
            assert!(!self.scanning, "connecting while still scanning");
            self.connected_to.push(*device);
            self.connect_result.clone()?;
            self.link_up = Some(*device);
            Ok(())
        }

        async fn disconnect(&mut self, device: &u32) {
            if self.link_up == Some(*device) {
                self.link_up = None;
                self.disconnected.push(*device);
            }
        }

        async fn discover_services(
            &mut self,
            _device: &u32,
        ) -> Result<Vec<GattService>, ConnectionError> {
            Ok(self.services.clone())
        }

        async fn subscribe(
            &mut self,
            _device: &u32,
            _link: CharacteristicRef,
        ) -> Result<NotificationStream, ConnectionError> {
            self.subscribe_result.clone()?;
            Ok(stream::iter(std::mem::take(&mut self.notifications)).boxed_local())
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            scan_timeout: None,
            ..MonitorConfig::default()
        }
    }

    async fn run_session(
        central: &mut ScriptedCentral,
        config: MonitorConfig,
    ) -> (ConnectionState, Vec<LinkEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let state = ConnectionManager::new(central, config, tx).run().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (state, events)
    }

    fn states(events: &[LinkEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::State(s) => Some(s.clone()),
                LinkEvent::Payload(_) => None,
            })
            .collect()
    }

    fn payloads(events: &[LinkEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Payload(p) => Some(p.clone()),
                LinkEvent::State(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn connects_to_named_device_and_forwards_in_order() {
        let mut central = ScriptedCentral::new()
            .advertise(1, None)
            .advertise(2, Some("Other"))
            .advertise(3, Some("ESP32_BLE"))
            .advertise(4, Some("ESP32_BLE"));
        central.notifications = vec![
            Ok(codec::encode(b"Analog:1,Avg:700")),
            Ok(codec::encode(b"Analog:2,Avg:701")),
            Ok(codec::encode(b"Analog:3,Avg:702")),
        ];

        let (state, events) = run_session(&mut central, config()).await;

        assert_eq!(central.scan_starts, 1);
        assert_eq!(central.scan_stops, 1);
        assert_eq!(central.connected_to, vec![3]);
        // Only the fourth advertisement is left unread
        assert_eq!(central.advertisements.len(), 1);

        let seen = states(&events);
        assert_eq!(seen[0], ConnectionState::Scanning);
        assert!(matches!(&seen[1], ConnectionState::Connecting(d) if d.address == "00:00:00:00:00:03"));
        assert!(matches!(&seen[2], ConnectionState::Connected(_, link)
            if link.service == SERVICE_UUID && link.characteristic == STEP_DATA_CHAR_UUID));

        assert_eq!(
            payloads(&events),
            vec![
                codec::encode(b"Analog:1,Avg:700"),
                codec::encode(b"Analog:2,Avg:701"),
                codec::encode(b"Analog:3,Avg:702"),
            ]
        );

        // The stream ran dry, which is a transport failure
        assert!(matches!(
            state,
            ConnectionState::Failed(ConnectionError::TransportError(_))
        ));
    }

    #[tokio::test]
    async fn missing_service_is_terminal() {
        let mut central = ScriptedCentral::new().advertise(7, Some("ESP32_BLE"));
        central.services = vec![GattService {
            uuid: Uuid::from_u128(0x180d),
            characteristics: vec![STEP_DATA_CHAR_UUID],
        }];

        let (state, events) = run_session(&mut central, config()).await;

        assert_eq!(
            state,
            ConnectionState::Failed(ConnectionError::ServiceNotFound(SERVICE_UUID))
        );
        let seen = states(&events);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ConnectionState::Scanning);
        assert!(matches!(seen[1], ConnectionState::Connecting(_)));
        assert!(seen[2].is_terminal());
        // Never rescans after failing
        assert_eq!(central.scan_starts, 1);
        assert!(payloads(&events).is_empty());
        assert_eq!(central.disconnected, vec![7]);
        assert_eq!(central.link_up, None);
    }

    #[tokio::test]
    async fn missing_characteristic_is_reported() {
        let mut central = ScriptedCentral::new().advertise(7, Some("ESP32_BLE"));
        central.services = vec![GattService {
            uuid: SERVICE_UUID,
            characteristics: vec![Uuid::from_u128(0x2a37)],
        }];

        let (state, _) = run_session(&mut central, config()).await;

        assert_eq!(
            state,
            ConnectionState::Failed(ConnectionError::CharacteristicNotFound(STEP_DATA_CHAR_UUID))
        );
        assert_eq!(central.disconnected, vec![7]);
    }

    #[tokio::test]
    async fn connect_failure_fails_the_session() {
        let mut central = ScriptedCentral::new().advertise(7, Some("ESP32_BLE"));
        central.connect_result = Err(ConnectionError::ConnectFailed {
            device: "00:00:00:00:00:07".to_string(),
            reason: "le-connection-abort-by-local".to_string(),
        });

        let (state, events) = run_session(&mut central, config()).await;

        assert!(matches!(
            state,
            ConnectionState::Failed(ConnectionError::ConnectFailed { .. })
        ));
        assert_eq!(central.scan_starts, 1);
        assert!(states(&events).last().is_some_and(ConnectionState::is_terminal));
        // Never connected, nothing to release
        assert!(central.disconnected.is_empty());
    }

    #[tokio::test]
    async fn subscription_failure_fails_the_session() {
        let mut central = ScriptedCentral::new().advertise(7, Some("ESP32_BLE"));
        central.subscribe_result = Err(ConnectionError::SubscriptionFailed(
            "notify not permitted".to_string(),
        ));

        let (state, events) = run_session(&mut central, config()).await;

        assert!(matches!(
            state,
            ConnectionState::Failed(ConnectionError::SubscriptionFailed(_))
        ));
        assert!(!states(&events)
            .iter()
            .any(|s| matches!(s, ConnectionState::Connected(..))));
        assert_eq!(central.disconnected, vec![7]);
    }

    #[tokio::test]
    async fn transport_error_after_connect_is_terminal() {
        let mut central = ScriptedCentral::new().advertise(7, Some("ESP32_BLE"));
        central.notifications = vec![
            Ok(codec::encode(b"Analog:1,Avg:700")),
            Err(ConnectionError::TransportError("link lost".to_string())),
            Ok(codec::encode(b"Analog:2,Avg:800")),
        ];

        let (state, events) = run_session(&mut central, config()).await;

        assert_eq!(
            state,
            ConnectionState::Failed(ConnectionError::TransportError("link lost".to_string()))
        );
        assert_eq!(payloads(&events).len(), 1);
        assert_eq!(central.disconnected, vec![7]);
    }

    #[tokio::test]
    async fn discovery_ending_without_target_fails() {
        let mut central = ScriptedCentral::new().advertise(1, Some("Other"));

        let (state, _) = run_session(&mut central, config()).await;

        assert!(matches!(
            state,
            ConnectionState::Failed(ConnectionError::DiscoveryFailed(_))
        ));
        assert_eq!(central.scan_stops, 1);
        assert!(central.connected_to.is_empty());
    }

    #[tokio::test]
    async fn scan_times_out_and_stops() {
        let mut central = ScriptedCentral::new().advertise(1, Some("Other"));
        central.hang_after_script = true;
        let config = MonitorConfig {
            scan_timeout: Some(Duration::from_millis(20)),
            ..MonitorConfig::default()
        };

        let (state, _) = run_session(&mut central, config).await;

        assert_eq!(
            state,
            ConnectionState::Failed(ConnectionError::ScanTimedOut("ESP32_BLE".to_string()))
        );
        assert!(!central.scanning);
        assert_eq!(central.scan_stops, 1);
    }

    #[tokio::test]
    async fn stops_forwarding_when_pipeline_goes_away() {
        let mut central = ScriptedCentral::new().advertise(7, Some("ESP32_BLE"));
        central.notifications = vec![Ok(codec::encode(b"Analog:1,Avg:700"))];

        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let state = ConnectionManager::new(&mut central, config(), tx).run().await;

        assert!(matches!(state, ConnectionState::Connected(..)));
        assert_eq!(central.disconnected, vec![7]);
    }

    #[tokio::test]
    async fn name_arriving_late_is_matched() {
        // BlueZ reports the device again once the scan response fills in its name
        let mut central = ScriptedCentral::new()
            .advertise(5, None)
            .advertise(5, Some("ESP32_BLE"));

        let (state, events) = run_session(&mut central, config()).await;

        assert_eq!(central.connected_to, vec![5]);
        assert!(states(&events)
            .iter()
            .any(|s| matches!(s, ConnectionState::Connected(..))));
        assert!(state.is_terminal());
    }

    #[tokio::test]
    async fn stopping_a_stopped_scan_is_a_no_op() {
        let mut central = ScriptedCentral::new().advertise(1, Some("Other"));

        let (state, _) = run_session(&mut central, config()).await;
        assert!(state.is_terminal());
        assert_eq!(central.scan_stops, 1);

        let mut handle = &mut central;
        handle.stop_scan().await;
        handle.stop_scan().await;
        assert_eq!(central.scan_stops, 1);
        assert!(!central.scanning);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut central = ScriptedCentral::new();
        let mut handle = &mut central;
        handle.connect(&3).await.unwrap();
        handle.disconnect(&3).await;
        handle.disconnect(&3).await;
        assert_eq!(central.disconnected, vec![3]);
    }

    #[test]
    fn resolves_configured_characteristic() {
        let services = vec![
            GattService {
                uuid: Uuid::from_u128(0x1800),
                characteristics: vec![Uuid::from_u128(0x2a00)],
            },
            GattService {
                uuid: SERVICE_UUID,
                characteristics: vec![Uuid::from_u128(0x2a19), STEP_DATA_CHAR_UUID],
            },
        ];
        let link = resolve_characteristic(&services, &MonitorConfig::default()).unwrap();
        assert_eq!(link.service, SERVICE_UUID);
        assert_eq!(link.characteristic, STEP_DATA_CHAR_UUID);
    }
}
