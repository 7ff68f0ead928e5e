//! Percentage → physical value mapping.
//!
//! Needles respond non-linearly to the signal they are fed, so every channel
//! carries a set of measured breakpoints `(percentage, value)` and anything in
//! between is linearly interpolated.  `value` is a gain or a duty cycle,
//! depending on the configured encoding.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Default upper bound for the gain of a fully deflected needle.
///
/// Most headphone outputs drive a meter to full scale with a very quiet
/// signal; anything above this only makes the usable range of a calibration
/// slider tiny.
pub const MAX_GAIN: f64 = 0.02;

/// Breakpoint spacing used by freshly generated curves.
pub const DEFAULT_STEP: u8 = 10;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("percentage {0} is outside 0..=100")]
    PercentageOutOfRange(f64),

    #[error("channel {channel} does not exist (table has {channels} channels)")]
    UnknownChannel { channel: usize, channels: usize },

    #[error("calibration curve is missing the {0}% breakpoint")]
    MissingBreakpoint(u8),

    #[error("breakpoint {percent}% has invalid value {value}")]
    InvalidValue { percent: u8, value: f64 },

    #[error("breakpoint {0}% is above 100")]
    BreakpointOutOfRange(u8),
}

/// One channel's calibration.  Always contains the 0% and 100% breakpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(u8, f64)>", into = "Vec<(u8, f64)>")]
pub struct CalibrationCurve {
    points: BTreeMap<u8, f64>,
}

impl CalibrationCurve {
    pub fn new(points: impl IntoIterator<Item = (u8, f64)>) -> Result<Self, CalibrationError> {
        let mut map = BTreeMap::new();
        for (percent, value) in points {
            check_point(percent, value)?;
            map.insert(percent, value);
        }
        for required in [0, 100] {
            if !map.contains_key(&required) {
                return Err(CalibrationError::MissingBreakpoint(required));
            }
        }
        Ok(Self { points: map })
    }

    /// Evenly spaced curve where `percent` maps to `percent / 100 * full_scale`.
    pub fn linear(full_scale: f64) -> Self {
        let points = (0..=100u8)
            .step_by(DEFAULT_STEP as usize)
            .map(|p| (p, f64::from(p) / 100.0 * full_scale))
            .collect();
        Self { points }
    }

    /// Breakpoints in ascending order.
    pub fn points(&self) -> impl Iterator<Item = (u8, f64)> + '_ {
        self.points.iter().map(|(p, v)| (*p, *v))
    }

    pub fn get(&self, percent: u8) -> Option<f64> {
        self.points.get(&percent).copied()
    }

    /// Insert or replace a breakpoint.
    pub fn set_point(&mut self, percent: u8, value: f64) -> Result<(), CalibrationError> {
        check_point(percent, value)?;
        self.points.insert(percent, value);
        Ok(())
    }

    /// Remove an interior breakpoint.  The 0% and 100% anchors stay.
    pub fn remove_point(&mut self, percent: u8) -> Result<Option<f64>, CalibrationError> {
        if percent == 0 || percent == 100 {
            return Err(CalibrationError::MissingBreakpoint(percent));
        }
        Ok(self.points.remove(&percent))
    }

    pub fn interpolate(&self, percentage: f64) -> Result<f64, CalibrationError> {
        if !(0.0..=100.0).contains(&percentage) {
            return Err(CalibrationError::PercentageOutOfRange(percentage));
        }

        // Exact hits skip the arithmetic so stored values come back bit-for-bit.
        if percentage.fract() == 0.0 {
            if let Some(value) = self.points.get(&(percentage as u8)) {
                return Ok(*value);
            }
        }

        let below = self.points.range(..=percentage.floor() as u8).next_back();
        let above = self.points.range(percentage.ceil() as u8..).next();
        match (below, above) {
            (Some((&lower, &lower_value)), Some((&upper, &upper_value))) => {
                let slope = (upper_value - lower_value) / f64::from(upper - lower);
                Ok(lower_value + slope * (percentage - f64::from(lower)))
            }
            (None, _) => Err(CalibrationError::MissingBreakpoint(0)),
            (_, None) => Err(CalibrationError::MissingBreakpoint(100)),
        }
    }
}

fn check_point(percent: u8, value: f64) -> Result<(), CalibrationError> {
    if percent > 100 {
        return Err(CalibrationError::BreakpointOutOfRange(percent));
    }
    if !value.is_finite() {
        return Err(CalibrationError::InvalidValue { percent, value });
    }
    Ok(())
}

impl TryFrom<Vec<(u8, f64)>> for CalibrationCurve {
    type Error = CalibrationError;

    fn try_from(points: Vec<(u8, f64)>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

impl From<CalibrationCurve> for Vec<(u8, f64)> {
    fn from(curve: CalibrationCurve) -> Self {
        curve.points.into_iter().collect()
    }
}

/// Calibration of every channel, in channel order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationTable {
    channels: Vec<CalibrationCurve>,
}

impl CalibrationTable {
    pub fn new(channels: Vec<CalibrationCurve>) -> Self {
        Self { channels }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, channel: usize) -> Option<&CalibrationCurve> {
        self.channels.get(channel)
    }

    pub fn channel_mut(&mut self, channel: usize) -> Option<&mut CalibrationCurve> {
        self.channels.get_mut(channel)
    }

    pub fn interpolate(&self, channel: usize, percentage: f64) -> Result<f64, CalibrationError> {
        self.channels
            .get(channel)
            .ok_or(CalibrationError::UnknownChannel {
                channel,
                channels: self.channels.len(),
            })?
            .interpolate(percentage)
    }
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self::new(vec![
            CalibrationCurve::linear(MAX_GAIN),
            CalibrationCurve::linear(MAX_GAIN),
        ])
    }
}

impl FromIterator<CalibrationCurve> for CalibrationTable {
    fn from_iter<I: IntoIterator<Item = CalibrationCurve>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
