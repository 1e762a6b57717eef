/// Rolling chart series of the most recent samples
use std::collections::VecDeque;

use crate::models::Sample;

/// Number of points kept for the chart
pub const CAPACITY: usize = 20;

/// FIFO of the last `CAPACITY` samples in arrival order
#[derive(Debug, Clone, Default)]
pub struct TelemetryBuffer {
    samples: VecDeque<Sample>,
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(CAPACITY),
        }
    }

    /// Append a sample, evicting the oldest one when full
    ///
    /// Elapsed time never runs backwards inside the buffer: a sample
    /// stamped earlier than its predecessor is pinned to the predecessor's
    /// time.
    pub fn append(&mut self, mut sample: Sample) {
        if let Some(last) = self.samples.back() {
            if sample.elapsed_seconds < last.elapsed_seconds {
                sample.elapsed_seconds = last.elapsed_seconds;
            }
        }

        if self.samples.len() == CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Copy of the series, oldest first
    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}
