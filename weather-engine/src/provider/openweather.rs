use serde::Deserialize;
use serde_json::Value;

use crate::{
    condition::{Condition, SpeedUnit, UNSET, UNSET_TIMESTAMP, UnitSystem},
    error::{ConfigError, ParseError},
    provider::{ParsedWeather, ProviderId, RequestParams, WeatherBackend, build_url_with},
};

pub const DEFAULT_URL: &str = "https://api.openweathermap.org/data/3.0/onecall";

/// OpenWeather One Call API. Requires an API key.
#[derive(Debug, Clone)]
pub struct OpenWeatherBackend {
    base_url: String,
}

impl OpenWeatherBackend {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for OpenWeatherBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    #[serde(default)]
    description: String,
    icon: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwCurrent {
    dt: Option<i64>,
    temp: Option<f64>,
    feels_like: Option<f64>,
    humidity: Option<f64>,
    wind_speed: Option<f64>,
    wind_deg: Option<f64>,
    clouds: Option<f64>,
    #[serde(default)]
    weather: Vec<OwWeather>,
}

#[derive(Debug, Deserialize)]
struct OwDailyTemp {
    day: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwDailyFeelsLike {
    day: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwDaily {
    dt: Option<i64>,
    temp: Option<OwDailyTemp>,
    feels_like: Option<OwDailyFeelsLike>,
    humidity: Option<f64>,
    wind_speed: Option<f64>,
    wind_deg: Option<f64>,
    clouds: Option<f64>,
    #[serde(default)]
    weather: Vec<OwWeather>,
}

#[derive(Debug, Deserialize)]
struct OwResponse {
    current: Option<OwCurrent>,
    daily: Option<Vec<OwDaily>>,
}

impl WeatherBackend for OpenWeatherBackend {
    fn id(&self) -> ProviderId {
        ProviderId::OpenWeather
    }

    fn build_url(&self, params: &RequestParams) -> Result<String, ConfigError> {
        let api_key = params
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingCredential(ProviderId::OpenWeather))?;

        build_url_with(
            &self.base_url,
            &[
                ("lat", format!("{:.6}", params.latitude)),
                ("lon", format!("{:.6}", params.longitude)),
                ("exclude", "minutely,hourly".to_string()),
                ("units", params.units.as_str().to_string()),
                ("appid", api_key.to_string()),
            ],
        )
    }

    fn parse(&self, payload: &Value, units: UnitSystem) -> Result<ParsedWeather, ParseError> {
        let parsed: OwResponse = serde_json::from_value(payload.clone())
            .map_err(|e| ParseError::Invalid(e.to_string()))?;

        let current = parsed.current.ok_or(ParseError::MissingBlock("current"))?;
        let daily = parsed
            .daily
            .filter(|days| !days.is_empty())
            .ok_or(ParseError::MissingBlock("daily"))?;

        let today = daily[0]
            .temp
            .as_ref()
            .ok_or(ParseError::MissingField("daily.temp"))?;
        let low = today.min.ok_or(ParseError::MissingField("daily.temp.min"))?;
        let high = today.max.ok_or(ParseError::MissingField("daily.temp.max"))?;

        let wind_unit = wind_unit(units);
        let current = Condition {
            timestamp: current.dt.unwrap_or(UNSET_TIMESTAMP),
            temp: current.temp.unwrap_or(UNSET),
            feels_like: current.feels_like.unwrap_or(UNSET),
            humidity: current.humidity.unwrap_or(UNSET),
            wind_speed: current.wind_speed.unwrap_or(UNSET),
            wind_unit,
            wind_direction: current.wind_deg.unwrap_or(UNSET),
            cloud_cover: current.clouds.unwrap_or(UNSET),
            low,
            high,
            ..describe(current.weather.first())
        };

        let forecast = daily.iter().map(|day| day_condition(day, wind_unit)).collect();

        Ok(ParsedWeather { current, forecast })
    }
}

fn wind_unit(units: UnitSystem) -> SpeedUnit {
    match units {
        UnitSystem::Imperial => SpeedUnit::Mph,
        UnitSystem::Metric => SpeedUnit::Mps,
    }
}

fn day_condition(day: &OwDaily, wind_unit: SpeedUnit) -> Condition {
    let temp = day.temp.as_ref();
    Condition {
        timestamp: day.dt.unwrap_or(UNSET_TIMESTAMP),
        temp: temp.and_then(|t| t.day).unwrap_or(UNSET),
        feels_like: day.feels_like.as_ref().and_then(|f| f.day).unwrap_or(UNSET),
        low: temp.and_then(|t| t.min).unwrap_or(UNSET),
        high: temp.and_then(|t| t.max).unwrap_or(UNSET),
        humidity: day.humidity.unwrap_or(UNSET),
        wind_speed: day.wind_speed.unwrap_or(UNSET),
        wind_unit,
        wind_direction: day.wind_deg.unwrap_or(UNSET),
        cloud_cover: day.clouds.unwrap_or(UNSET),
        ..describe(day.weather.first())
    }
}

/// Description and icon from the first `weather` entry; defaults when absent.
fn describe(weather: Option<&OwWeather>) -> Condition {
    let mut condition = Condition::default();
    if let Some(w) = weather {
        condition.forecast = w.description.clone();
        condition.icon = w
            .icon
            .as_deref()
            .and_then(icon_for)
            .unwrap_or(crate::condition::UNKNOWN_ICON)
            .to_string();
    }
    condition
}

/// Maps an OpenWeather icon id such as `"10d"` to an icon name. The trailing
/// day/night letter is ignored.
pub fn icon_for(icon: &str) -> Option<&'static str> {
    let digits = icon.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let code: u32 = digits.parse().ok()?;
    let name = match code {
        1 => "sunny",
        2 => "partlycloudy",
        3 => "mostlycloudy",
        4 => "cloudy",
        9 | 10 => "rain",
        11 => "thunderstorm",
        13 => "snow",
        50 => "mist",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "lat": 51.5,
            "current": {
                "dt": 1700000000,
                "temp": 48.2,
                "feels_like": 44.0,
                "humidity": 72,
                "wind_speed": 11.5,
                "wind_deg": 250,
                "weather": [{"id": 500, "description": "light rain", "icon": "10n"}]
            },
            "daily": [
                {
                    "dt": 1699992000,
                    "temp": {"day": 49.0, "min": 41.0, "max": 51.0},
                    "feels_like": {"day": 45.0},
                    "humidity": 70,
                    "wind_speed": 12.0,
                    "weather": [{"description": "moderate rain", "icon": "10d"}]
                },
                {
                    "dt": 1700078400,
                    "temp": {"day": 46.0, "min": 39.0, "max": 48.0},
                    "weather": [{"description": "broken clouds", "icon": "04d"}]
                }
            ]
        })
    }

    fn params(api_key: Option<&str>) -> RequestParams {
        RequestParams {
            latitude: 51.5,
            longitude: -0.12,
            units: UnitSystem::Metric,
            forecast_days: 7,
            api_key: api_key.map(str::to_string),
        }
    }

    #[test]
    fn url_requires_api_key() {
        let backend = OpenWeatherBackend::new();
        assert_eq!(
            backend.build_url(&params(None)).unwrap_err(),
            ConfigError::MissingCredential(ProviderId::OpenWeather)
        );
        assert_eq!(
            backend.build_url(&params(Some("  "))).unwrap_err(),
            ConfigError::MissingCredential(ProviderId::OpenWeather)
        );

        let url = backend.build_url(&params(Some("KEY"))).unwrap();
        assert!(url.contains("appid=KEY"));
        assert!(url.contains("units=metric"));
        assert!(url.contains("lat=51.500000"));
    }

    #[test]
    fn parses_current_and_daily() {
        let parsed = OpenWeatherBackend::new()
            .parse(&payload(), UnitSystem::Imperial)
            .unwrap();

        let c = &parsed.current;
        assert_eq!(c.temp, 48.2);
        assert_eq!(c.feels_like, 44.0);
        assert_eq!(c.forecast, "light rain");
        assert_eq!(c.icon, "rain");
        assert_eq!(c.low, 41.0);
        assert_eq!(c.high, 51.0);
        assert_eq!(c.cloud_cover(), None);
        assert_eq!(c.wind_text(), "11.5 mph");

        assert_eq!(parsed.forecast.len(), 2);
        assert_eq!(parsed.forecast[1].icon, "cloudy");
        assert_eq!(parsed.forecast[1].feels_like, UNSET);
    }

    #[test]
    fn metric_wind_is_meters_per_second() {
        let parsed = OpenWeatherBackend::new()
            .parse(&payload(), UnitSystem::Metric)
            .unwrap();
        assert_eq!(parsed.current.wind_unit, SpeedUnit::Mps);
    }

    #[test]
    fn icon_mapping() {
        assert_eq!(icon_for("01d"), Some("sunny"));
        assert_eq!(icon_for("50n"), Some("mist"));
        assert_eq!(icon_for("09d"), Some("rain"));
        assert_eq!(icon_for("07d"), None);
        assert_eq!(icon_for("xx"), None);
    }

    #[test]
    fn missing_today_high_low_is_an_error() {
        let mut p = payload();
        p["daily"][0]["temp"] = json!({"day": 1.0});
        assert_eq!(
            OpenWeatherBackend::new()
                .parse(&p, UnitSystem::Metric)
                .unwrap_err(),
            ParseError::MissingField("daily.temp.min")
        );

        p["daily"] = json!([]);
        assert_eq!(
            OpenWeatherBackend::new()
                .parse(&p, UnitSystem::Metric)
                .unwrap_err(),
            ParseError::MissingBlock("daily")
        );
    }

    #[test]
    fn missing_current_is_an_error() {
        let mut p = payload();
        p.as_object_mut().unwrap().remove("current");
        assert_eq!(
            OpenWeatherBackend::new()
                .parse(&p, UnitSystem::Metric)
                .unwrap_err(),
            ParseError::MissingBlock("current")
        );
    }
}
