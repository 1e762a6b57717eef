use bluer::Uuid;
use time::OffsetDateTime;

use crate::error::ConnectionError;

/// One decoded notification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub analog: i64,
    pub average_time_ms: f64,
}

/// Chart point: seconds since pipeline start and the analog value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub elapsed_seconds: f64,
    pub analog_value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntensityBand {
    Low,
    Good,
    High,
}

impl IntensityBand {
    pub fn label(self) -> &'static str {
        match self {
            IntensityBand::Low => "Low",
            IntensityBand::Good => "Good",
            IntensityBand::High => "High",
        }
    }
}

/// The peripheral picked out of the scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub name: String,
    pub address: String,
}

/// The data channel notifications arrive on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting(DeviceRef),
    Connected(DeviceRef, CharacteristicRef),
    Failed(ConnectionError),
}

impl ConnectionState {
    /// Legal self-driven edges of the connection state machine
    ///
    /// ```text
    /// Idle -> Scanning -> Connecting -> Connected
    ///            |            |            |
    ///            +------------+------------+--> Failed
    /// ```
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Scanning)
                | (Scanning, Connecting(_))
                | (Scanning, Failed(_))
                | (Connecting(_), Connected(..))
                | (Connecting(_), Failed(_))
                | (Connected(..), Failed(_))
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }

    pub fn status_label(&self) -> String {
        match self {
            ConnectionState::Idle => "Idle".to_string(),
            ConnectionState::Scanning => "Searching...".to_string(),
            ConnectionState::Connecting(_) => "Connecting...".to_string(),
            ConnectionState::Connected(..) => "Connected".to_string(),
            ConnectionState::Failed(reason) => format!("Connection failed: {}", reason),
        }
    }
}

/// Read-only view of the pipeline, published after every change
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub session_started: OffsetDateTime,
    pub connection: ConnectionState,
    pub status: String,
    pub latest_analog: i64,
    pub latest_average: f64,
    /// Average at which the current category was selected
    pub category_average: f64,
    /// -1 until the first category is selected
    pub category_index: i32,
    pub category_label: &'static str,
    pub intensity_band: IntensityBand,
    /// Unclamped; presentation clamps to [0, 1]
    pub intensity_ratio: f64,
    pub series: Vec<Sample>,
    pub received_payloads: u64,
    pub dropped_payloads: u64,
}
