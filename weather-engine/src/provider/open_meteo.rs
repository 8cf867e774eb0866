use serde::Deserialize;
use serde_json::Value;

use crate::{
    condition::{Condition, SpeedUnit, UNSET, UNSET_TIMESTAMP, UnitSystem},
    error::{ConfigError, ParseError},
    provider::{ParsedWeather, ProviderId, RequestParams, WeatherBackend, build_url_with},
};

pub const DEFAULT_URL: &str = "https://api.open-meteo.com/v1/forecast";

const CURRENT_FIELDS: &str = "temperature_2m,apparent_temperature,relative_humidity_2m,\
                              wind_speed_10m,wind_direction_10m,cloud_cover,weathercode";
const DAILY_FIELDS: &str = "temperature_2m_min,temperature_2m_max,weathercode";

/// Open-Meteo forecast API. No credential needed.
#[derive(Debug, Clone)]
pub struct OpenMeteoBackend {
    base_url: String,
}

impl OpenMeteoBackend {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for OpenMeteoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct OmResponse {
    current: Option<OmCurrent>,
    daily: Option<OmDaily>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OmCurrent {
    time: Option<f64>,
    temperature_2m: Option<f64>,
    apparent_temperature: Option<f64>,
    relative_humidity_2m: Option<f64>,
    wind_speed_10m: Option<f64>,
    wind_direction_10m: Option<f64>,
    cloud_cover: Option<f64>,
    #[serde(alias = "weather_code")]
    weathercode: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OmDaily {
    #[serde(default)]
    time: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_min: Vec<Option<f64>>,
    #[serde(default)]
    temperature_2m_max: Vec<Option<f64>>,
    #[serde(default, alias = "weather_code")]
    weathercode: Vec<Option<f64>>,
}

impl WeatherBackend for OpenMeteoBackend {
    fn id(&self) -> ProviderId {
        ProviderId::OpenMeteo
    }

    fn build_url(&self, params: &RequestParams) -> Result<String, ConfigError> {
        let imperial = params.units.is_imperial();
        // always ask for one day so today's high/low is available
        let days = params.forecast_days.max(1);

        build_url_with(
            &self.base_url,
            &[
                ("latitude", format!("{:.6}", params.latitude)),
                ("longitude", format!("{:.6}", params.longitude)),
                ("timezone", "auto".to_string()),
                (
                    "temperature_unit",
                    if imperial { "fahrenheit" } else { "celsius" }.to_string(),
                ),
                (
                    "wind_speed_unit",
                    if imperial { "mph" } else { "kmh" }.to_string(),
                ),
                (
                    "precipitation_unit",
                    if imperial { "inch" } else { "mm" }.to_string(),
                ),
                ("timeformat", "unixtime".to_string()),
                ("forecast_days", days.to_string()),
                ("current", CURRENT_FIELDS.to_string()),
                ("daily", DAILY_FIELDS.to_string()),
            ],
        )
    }

    fn parse(&self, payload: &Value, units: UnitSystem) -> Result<ParsedWeather, ParseError> {
        let parsed: OmResponse = serde_json::from_value(payload.clone())
            .map_err(|e| ParseError::Invalid(e.to_string()))?;

        let current = parsed.current.ok_or(ParseError::MissingBlock("current"))?;
        let daily = parsed.daily.ok_or(ParseError::MissingBlock("daily"))?;

        let mut current = current_condition(&current, units);
        let forecast = daily_conditions(&daily)?;

        // today's entry carries the high/low for the current conditions
        if let Some(today) = forecast.first() {
            current.low = today.low;
            current.high = today.high;
        }

        Ok(ParsedWeather { current, forecast })
    }
}

/// Parses a bare `current` block, e.g. `{"temperature_2m": 72.5, "weathercode": 0}`.
pub fn parse_current(block: &Value, units: UnitSystem) -> Result<Condition, ParseError> {
    let current: OmCurrent =
        serde_json::from_value(block.clone()).map_err(|e| ParseError::Invalid(e.to_string()))?;
    Ok(current_condition(&current, units))
}

fn current_condition(current: &OmCurrent, units: UnitSystem) -> Condition {
    let mut condition = Condition {
        temp: current.temperature_2m.unwrap_or(UNSET),
        feels_like: current.apparent_temperature.unwrap_or(UNSET),
        humidity: current.relative_humidity_2m.unwrap_or(UNSET),
        wind_speed: current.wind_speed_10m.unwrap_or(UNSET),
        wind_unit: if units.is_imperial() {
            SpeedUnit::Mph
        } else {
            SpeedUnit::Kmh
        },
        wind_direction: current.wind_direction_10m.unwrap_or(UNSET),
        cloud_cover: current.cloud_cover.unwrap_or(UNSET),
        timestamp: current.time.map(|t| t as i64).unwrap_or(UNSET_TIMESTAMP),
        ..Condition::default()
    };

    if let Some(code) = current.weathercode {
        apply_weather_code(&mut condition, code as i64);
    }
    condition
}

fn daily_conditions(daily: &OmDaily) -> Result<Vec<Condition>, ParseError> {
    let first_low = daily.temperature_2m_min.first().copied().flatten();
    let first_high = daily.temperature_2m_max.first().copied().flatten();
    if first_low.is_none() {
        return Err(ParseError::MissingField("daily.temperature_2m_min"));
    }
    if first_high.is_none() {
        return Err(ParseError::MissingField("daily.temperature_2m_max"));
    }

    let days = daily
        .time
        .len()
        .max(daily.temperature_2m_min.len())
        .max(daily.temperature_2m_max.len());

    let at = |values: &[Option<f64>], idx: usize| values.get(idx).copied().flatten();

    Ok((0..days)
        .map(|idx| {
            let mut condition = Condition {
                timestamp: at(&daily.time, idx)
                    .map(|t| t as i64)
                    .unwrap_or(UNSET_TIMESTAMP),
                low: at(&daily.temperature_2m_min, idx).unwrap_or(UNSET),
                high: at(&daily.temperature_2m_max, idx).unwrap_or(UNSET),
                ..Condition::default()
            };
            if let Some(code) = at(&daily.weathercode, idx) {
                apply_weather_code(&mut condition, code as i64);
            }
            condition
        })
        .collect())
}

fn apply_weather_code(condition: &mut Condition, code: i64) {
    if let Some((description, icon)) = describe_weather_code(code) {
        condition.forecast = description.to_string();
        condition.icon = icon.to_string();
    }
}

/// WMO weather interpretation codes as used by Open-Meteo.
/// See: https://open-meteo.com/en/docs#weathervariables
pub fn describe_weather_code(code: i64) -> Option<(&'static str, &'static str)> {
    let entry = match code {
        0 => ("Clear sky", "sunny"),
        1 => ("Mainly clear", "partlycloudy"),
        2 => ("Partly cloudy", "partlycloudy"),
        3 => ("Overcast", "cloudy"),
        45 => ("Fog", "cloudy"),
        48 => ("Rime fog", "cloudy"),
        51 => ("Light drizzle", "rain"),
        53 => ("Drizzle", "rain"),
        55 => ("Dense drizzle", "rain"),
        56 => ("Light freezing drizzle", "rain"),
        57 => ("Dense freezing drizzle", "rain"),
        61 => ("Slight rain", "rain"),
        63 => ("Rain", "rain"),
        65 => ("Heavy rain", "rain"),
        66 => ("Light freezing rain", "rain"),
        67 => ("Heavy freezing rain", "rain"),
        71 => ("Slight snow", "snow"),
        73 => ("Snow", "snow"),
        75 => ("Heavy snow", "snow"),
        77 => ("Snow grains", "snow"),
        80 => ("Slight rain showers", "rain"),
        81 => ("Rain showers", "rain"),
        82 => ("Violent rain showers", "rain"),
        85 => ("Slight snow showers", "snow"),
        86 => ("Heavy snow showers", "snow"),
        95 => ("Thunderstorm", "thunderstorm"),
        96 => ("Thunderstorm with slight hail", "thunderstorm"),
        99 => ("Thunderstorm with heavy hail", "thunderstorm"),
        _ => return None,
    };
    Some(entry)
}
