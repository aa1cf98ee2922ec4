//! Telemetry Window
//!
//! Bounded FIFO of recent samples with the auto-scaled plot bounds used by
//! the live display. The Y range only looks at the newest entry.

use crate::domain::models::SensorSample;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of retained entries
pub const CAPACITY: usize = 100;

/// Padding added around the newest sample's channel values
pub const Y_PADDING: f64 = 0.5;

/// Half-width of the X range when only one entry exists
pub const SINGLE_ENTRY_HALF_WIDTH: f64 = 0.1;

/// Bounds reported for an empty window
pub const DEFAULT_X_RANGE: AxisRange = AxisRange { min: 0.0, max: 10.0 };
pub const DEFAULT_Y_RANGE: AxisRange = AxisRange { min: -2.0, max: 2.0 };

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

impl AxisRange {
    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlotBounds {
    pub x: AxisRange,
    pub y: AxisRange,
}

impl Default for PlotBounds {
    fn default() -> Self {
        Self {
            x: DEFAULT_X_RANGE,
            y: DEFAULT_Y_RANGE,
        }
    }
}

/// Which sensor triple drives the Y auto-scale
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Accel,
    Gyro,
    Angle,
}

impl Channel {
    pub fn values(&self, sample: &SensorSample) -> [f32; 3] {
        match self {
            Self::Accel => [sample.accel.x, sample.accel.y, sample.accel.z],
            Self::Gyro => [sample.gyro.x, sample.gyro.y, sample.gyro.z],
            Self::Angle => [sample.angle.roll, sample.angle.pitch, sample.angle.yaw],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryWindowEntry {
    /// Seconds since the window started
    pub timestamp: f64,
    pub sample: SensorSample,
}

pub struct TelemetryWindow {
    entries: VecDeque<TelemetryWindowEntry>,
    channel: Channel,
    bounds: PlotBounds,
}

impl Default for TelemetryWindow {
    fn default() -> Self {
        Self::new(Channel::default())
    }
}

impl TelemetryWindow {
    pub fn new(channel: Channel) -> Self {
        Self {
            entries: VecDeque::with_capacity(CAPACITY + 1),
            channel,
            bounds: PlotBounds::default(),
        }
    }

    /// Append a sample, evicting the oldest entry past `CAPACITY`.
    pub fn push(&mut self, sample: SensorSample, timestamp: f64) {
        self.entries.push_back(TelemetryWindowEntry { timestamp, sample });
        while self.entries.len() > CAPACITY {
            self.entries.pop_front();
        }
        self.rescale();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bounds = PlotBounds::default();
    }

    /// Entries oldest first
    pub fn snapshot(&self) -> Vec<TelemetryWindowEntry> {
        self.entries.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&TelemetryWindowEntry> {
        self.entries.back()
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Switch the plotted channel; bounds follow immediately.
    pub fn set_channel(&mut self, channel: Channel) {
        self.channel = channel;
        if !self.entries.is_empty() {
            self.rescale();
        }
    }

    pub fn bounds(&self) -> PlotBounds {
        self.bounds
    }

    fn rescale(&mut self) {
        let (Some(oldest), Some(newest)) = (self.entries.front(), self.entries.back()) else {
            return;
        };

        let x = if self.entries.len() == 1 {
            AxisRange {
                min: newest.timestamp - SINGLE_ENTRY_HALF_WIDTH,
                max: newest.timestamp + SINGLE_ENTRY_HALF_WIDTH,
            }
        } else {
            AxisRange {
                min: oldest.timestamp,
                max: newest.timestamp,
            }
        };

        let values = self.channel.values(&newest.sample);
        let min = values.iter().copied().fold(f32::INFINITY, f32::min) as f64;
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
        let y = AxisRange {
            min: min - Y_PADDING,
            max: max + Y_PADDING,
        };

        self.bounds = PlotBounds { x, y };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Angles, Vec3};

    fn accel(x: f32, y: f32, z: f32) -> SensorSample {
        SensorSample {
            accel: Vec3::new(x, y, z),
            ..Default::default()
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_overflow_keeps_most_recent_entries() {
        let mut window = TelemetryWindow::default();
        for i in 0..150 {
            window.push(accel(i as f32, 0.0, 0.0), i as f64);
        }

        let entries = window.snapshot();
        assert_eq!(entries.len(), CAPACITY);
        assert_eq!(entries.first().unwrap().timestamp, 50.0);
        assert_eq!(entries.last().unwrap().timestamp, 149.0);
        assert!(entries.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_single_entry_x_range() {
        let mut window = TelemetryWindow::default();
        window.push(accel(0.0, 0.0, 0.0), 5.0);

        let x = window.bounds().x;
        assert_close(x.min, 4.9);
        assert_close(x.max, 5.1);
    }

    #[test]
    fn test_x_range_spans_oldest_to_newest() {
        let mut window = TelemetryWindow::default();
        for t in [1.0, 2.0, 3.0] {
            window.push(accel(0.0, 0.0, 0.0), t);
        }

        let x = window.bounds().x;
        assert_close(x.min, 1.0);
        assert_close(x.max, 3.0);
    }

    #[test]
    fn test_y_range_uses_only_latest_entry() {
        let mut window = TelemetryWindow::default();
        window.push(accel(-50.0, 50.0, 0.0), 0.0);
        window.push(accel(0.2, -1.0, 0.9), 0.1);

        let y = window.bounds().y;
        assert_close(y.min, -1.5);
        assert_close(y.max, 0.9f32 as f64 + 0.5);
    }

    #[test]
    fn test_channel_switch_rescales() {
        let mut window = TelemetryWindow::new(Channel::Accel);
        window.push(
            SensorSample {
                accel: Vec3::new(0.0, 0.0, 1.0),
                gyro: Vec3::default(),
                angle: Angles {
                    roll: -90.0,
                    pitch: 10.0,
                    yaw: 170.0,
                },
            },
            0.0,
        );
        assert_close(window.bounds().y.max, 1.5);

        window.set_channel(Channel::Angle);
        assert_close(window.bounds().y.min, -90.5);
        assert_close(window.bounds().y.max, 170.5);
    }

    #[test]
    fn test_clear_restores_default_bounds() {
        let mut window = TelemetryWindow::default();
        window.push(accel(3.0, 4.0, 5.0), 12.0);
        window.clear();

        assert!(window.is_empty());
        assert!(window.snapshot().is_empty());
        assert_eq!(window.bounds(), PlotBounds::default());
    }
}
