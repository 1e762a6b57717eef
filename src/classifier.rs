/// Hysteresis classifier over the "average time" metric
///
/// Drives the rotating category shown to the user. The category only moves
/// when the average shifts by at least `DEAD_BAND_MS`; small jitter is
/// ignored so the label does not flicker. The intensity band is not gated
/// and follows the latest average directly.
use crate::models::IntensityBand;

/// Rotating category labels
pub const CATEGORIES: [&str; 4] = ["Water", "Curd", "Banana", "Apple"];
/// Label shown before the first category is selected
pub const NO_CATEGORY: &str = "N/A";

pub const DEAD_BAND_MS: f64 = 2.0;
pub const GOOD_LOW_MS: f64 = 700.0;
pub const GOOD_HIGH_MS: f64 = 900.0;

// Progress scale endpoints for the intensity ratio
const RATIO_FLOOR_MS: f64 = 350.0;
const RATIO_CEILING_MS: f64 = 1600.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Classifier {
    previous_average: f64,
    category_index: i32,
    category_count: i32,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self::with_category_count(CATEGORIES.len())
    }

    /// Classifier rotating through `count` categories
    pub fn with_category_count(count: usize) -> Self {
        Self {
            previous_average: 0.0,
            category_index: -1,
            category_count: count.max(1) as i32,
        }
    }

    /// Feed a new average; returns true when the category advanced
    pub fn update(&mut self, new_average: f64) -> bool {
        if (self.previous_average - new_average).abs() < DEAD_BAND_MS {
            return false;
        }

        // -1 + 1 lands on 0, and rem_euclid keeps the result non-negative
        self.category_index = (self.category_index + 1).rem_euclid(self.category_count);
        self.previous_average = new_average;
        true
    }

    pub fn previous_average(&self) -> f64 {
        self.previous_average
    }

    /// -1 until the first update outside the dead-band
    pub fn category_index(&self) -> i32 {
        self.category_index
    }

    pub fn category_label(&self) -> &'static str {
        category_label(self.category_index)
    }
}

pub fn category_label(index: i32) -> &'static str {
    usize::try_from(index)
        .ok()
        .and_then(|i| CATEGORIES.get(i).copied())
        .unwrap_or(NO_CATEGORY)
}

/// Band for an average; 700 and 900 are both inclusive to `Good`
pub fn intensity_band(average: f64) -> IntensityBand {
    if (GOOD_LOW_MS..=GOOD_HIGH_MS).contains(&average) {
        IntensityBand::Good
    } else if average < GOOD_LOW_MS {
        IntensityBand::Low
    } else {
        IntensityBand::High
    }
}

/// Position of the average on the 350..1600 ms scale, unclamped
pub fn intensity_ratio(average: f64) -> f64 {
    (average - RATIO_FLOOR_MS) / (RATIO_CEILING_MS - RATIO_FLOOR_MS)
}
