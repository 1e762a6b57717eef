/// Pipeline coordinator
///
/// Sole owner of the telemetry buffer and the classifier. Link events are
/// applied one at a time in arrival order, and after each one a fresh
/// snapshot is published on a watch channel. Consumers only ever see
/// clones.
use log::{debug, info, warn};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::bluetooth::LinkEvent;
use crate::buffer::TelemetryBuffer;
use crate::classifier::{self, Classifier};
use crate::codec;
use crate::models::{ConnectionState, Reading, Sample, Snapshot};
use crate::utils::{elapsed_seconds, format_datetime};

pub struct Pipeline {
    buffer: TelemetryBuffer,
    classifier: Classifier,
    connection: ConnectionState,
    latest: Reading,
    started_at: Instant,
    session_started: OffsetDateTime,
    received_payloads: u64,
    dropped_payloads: u64,
    publisher: watch::Sender<Snapshot>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        let session_started = OffsetDateTime::now_utc();
        info!("Pipeline started at {}", format_datetime(&session_started));

        let mut pipeline = Pipeline {
            buffer: TelemetryBuffer::new(),
            classifier: Classifier::new(),
            connection: ConnectionState::Idle,
            latest: Reading {
                analog: 0,
                average_time_ms: 0.0,
            },
            started_at: Instant::now(),
            session_started,
            received_payloads: 0,
            dropped_payloads: 0,
            publisher: watch::channel(placeholder_snapshot(session_started)).0,
        };
        pipeline.publish();
        pipeline
    }

    /// New receiver that sees the current snapshot and every later one
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.publisher.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            session_started: self.session_started,
            connection: self.connection.clone(),
            status: self.connection.status_label(),
            latest_analog: self.latest.analog,
            latest_average: self.latest.average_time_ms,
            category_average: self.classifier.previous_average(),
            category_index: self.classifier.category_index(),
            category_label: self.classifier.category_label(),
            intensity_band: classifier::intensity_band(self.latest.average_time_ms),
            intensity_ratio: classifier::intensity_ratio(self.latest.average_time_ms),
            series: self.buffer.snapshot(),
            received_payloads: self.received_payloads,
            dropped_payloads: self.dropped_payloads,
        }
    }

    /// Consume link events until the connection manager hangs up
    pub async fn run(mut self, mut events: mpsc::Receiver<LinkEvent>) -> Snapshot {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Link event channel closed");
        self.snapshot()
    }

    pub fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::State(state) => self.set_connection_state(state),
            LinkEvent::Payload(payload) => {
                let elapsed = elapsed_seconds(self.started_at, Instant::now());
                self.handle_payload(&payload, elapsed);
            }
        }
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection = state;
        self.publish();
    }

    /// Decode and apply one notification; corrupt payloads are skipped
    pub fn handle_payload(&mut self, payload: &str, elapsed_seconds: f64) {
        self.received_payloads += 1;

        match codec::decode(payload) {
            Ok(reading) => self.handle_reading(reading, elapsed_seconds),
            Err(e) => {
                self.dropped_payloads += 1;
                warn!("Skipping notification '{}': {}", payload, e);
                self.publish();
            }
        }
    }

    pub fn handle_reading(&mut self, reading: Reading, elapsed_seconds: f64) {
        debug!(
            "Reading at {:.2}s: analog={}, avg={:.2} ms",
            elapsed_seconds, reading.analog, reading.average_time_ms
        );

        self.buffer.append(Sample {
            elapsed_seconds,
            analog_value: reading.analog,
        });

        debug!("Chart holds {} points", self.buffer.len());

        if self.classifier.update(reading.average_time_ms) {
            info!(
                "Category -> {} at {:.2} ms",
                self.classifier.category_label(),
                self.classifier.previous_average()
            );
        }

        self.latest = reading;
        self.publish();
    }

    fn publish(&self) {
        // send_replace never fails, even with no receivers left
        self.publisher.send_replace(self.snapshot());
    }
}

fn placeholder_snapshot(session_started: OffsetDateTime) -> Snapshot {
    Snapshot {
        session_started,
        connection: ConnectionState::Idle,
        status: ConnectionState::Idle.status_label(),
        latest_analog: 0,
        latest_average: 0.0,
        category_average: 0.0,
        category_index: -1,
        category_label: classifier::NO_CATEGORY,
        intensity_band: classifier::intensity_band(0.0),
        intensity_ratio: classifier::intensity_ratio(0.0),
        series: Vec::new(),
        received_payloads: 0,
        dropped_payloads: 0,
    }
}
