//! Normalized weather readings shared by every provider back-end.

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::provider::ProviderId;

/// Sentinel for numeric readings the provider did not supply.
pub const UNSET: f64 = -999.0;

/// Sentinel for a missing day marker.
pub const UNSET_TIMESTAMP: i64 = -1;

pub const UNKNOWN_ICON: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnitSystem {
    #[default]
    Imperial,
    Metric,
}

impl UnitSystem {
    pub fn is_imperial(self) -> bool {
        self == UnitSystem::Imperial
    }

    pub fn temperature_symbol(self) -> &'static str {
        match self {
            UnitSystem::Imperial => "°F",
            UnitSystem::Metric => "°C",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitSystem::Imperial => "imperial",
            UnitSystem::Metric => "metric",
        }
    }
}

impl Display for UnitSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for UnitSystem {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "imperial" | "fahrenheit" | "f" => Ok(UnitSystem::Imperial),
            "metric" | "celsius" | "c" => Ok(UnitSystem::Metric),
            _ => Err(anyhow::anyhow!(
                "Unknown unit system '{value}'. Supported: imperial, metric."
            )),
        }
    }
}

/// Unit a wind speed was reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeedUnit {
    #[default]
    Mph,
    Kmh,
    Mps,
}

impl SpeedUnit {
    pub fn label(self) -> &'static str {
        match self {
            SpeedUnit::Mph => "mph",
            SpeedUnit::Kmh => "km/h",
            SpeedUnit::Mps => "m/s",
        }
    }
}

/// A single point-in-time or single-day reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub forecast: String,
    pub icon: String,
    /// Relative humidity in percent.
    pub humidity: f64,
    pub wind_speed: f64,
    pub wind_unit: SpeedUnit,
    /// Degrees, meteorological convention.
    pub wind_direction: f64,
    /// Percent of sky covered.
    pub cloud_cover: f64,
    /// Epoch seconds.
    pub timestamp: i64,
    pub temp: f64,
    pub feels_like: f64,
    pub low: f64,
    pub high: f64,
}

impl Default for Condition {
    fn default() -> Self {
        Self {
            forecast: String::new(),
            icon: UNKNOWN_ICON.to_string(),
            humidity: UNSET,
            wind_speed: UNSET,
            wind_unit: SpeedUnit::default(),
            wind_direction: UNSET,
            cloud_cover: UNSET,
            timestamp: UNSET_TIMESTAMP,
            temp: UNSET,
            feels_like: UNSET,
            low: UNSET,
            high: UNSET,
        }
    }
}

/// Whether a numeric reading holds real data rather than [`UNSET`].
pub fn is_set(value: f64) -> bool {
    value > UNSET
}

fn reading(value: f64) -> Option<f64> {
    is_set(value).then_some(value)
}

impl Condition {
    pub fn temperature(&self, feels_like: bool) -> Option<f64> {
        reading(if feels_like { self.feels_like } else { self.temp })
    }

    pub fn rounded_temperature(&self, feels_like: bool) -> Option<i64> {
        self.temperature(feels_like).map(|t| t.round() as i64)
    }

    pub fn low(&self) -> Option<f64> {
        reading(self.low)
    }

    pub fn high(&self) -> Option<f64> {
        reading(self.high)
    }

    pub fn humidity(&self) -> Option<f64> {
        reading(self.humidity)
    }

    pub fn wind_speed(&self) -> Option<f64> {
        reading(self.wind_speed)
    }

    pub fn wind_direction(&self) -> Option<f64> {
        reading(self.wind_direction)
    }

    pub fn cloud_cover(&self) -> Option<f64> {
        reading(self.cloud_cover)
    }

    pub fn day(&self) -> Option<DateTime<Utc>> {
        if self.timestamp == UNSET_TIMESTAMP {
            return None;
        }
        DateTime::from_timestamp(self.timestamp, 0)
    }

    /// Humidity as `"45%"`, empty when unknown.
    pub fn humidity_text(&self) -> String {
        self.humidity()
            .map(|h| format!("{h:.0}%"))
            .unwrap_or_default()
    }

    /// Wind speed with its unit, e.g. `"12.3 mph"`; empty when unknown.
    pub fn wind_text(&self) -> String {
        self.wind_speed()
            .map(|w| format!("{w:.1} {}", self.wind_unit.label()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateFormat {
    #[default]
    Short,
    Long,
}

impl UpdateFormat {
    fn pattern(self) -> &'static str {
        match self {
            UpdateFormat::Short => "%Y-%m-%d %H:%M",
            UpdateFormat::Long => "%A, %B %-d, %Y %H:%M",
        }
    }
}

/// Current conditions plus the daily forecast from one successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub provider: ProviderId,
    pub current: Condition,
    pub forecast: Vec<Condition>,
    pub updated_at: DateTime<Utc>,
    pub units: UnitSystem,
}

impl WeatherSnapshot {
    /// Last update time in the local time zone.
    pub fn last_update(&self, style: UpdateFormat) -> String {
        self.last_update_in(&Local, style)
    }

    pub fn last_update_in<Tz>(&self, tz: &Tz, style: UpdateFormat) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        self.updated_at
            .with_timezone(tz)
            .format(style.pattern())
            .to_string()
    }
}
