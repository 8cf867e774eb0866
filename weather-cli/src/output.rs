//! Human-friendly rendering of snapshots, settings and notifications.

use chrono::Local;
use std::{fmt::Write, path::Path};
use weather_engine::{
    Condition, GeoLocation, Notification, Notifier, Settings, UnitSystem, UpdateFormat,
    WeatherSnapshot, notify::NotificationKind,
};

fn temperature(value: Option<f64>, units: UnitSystem) -> String {
    match value {
        Some(t) => format!("{}{}", t.round() as i64, units.temperature_symbol()),
        None => "--".to_string(),
    }
}

fn day_label(condition: &Condition) -> String {
    condition
        .day()
        .map(|d| d.with_timezone(&Local).format("%a %b %-d").to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn or_unknown(text: &str) -> &str {
    if text.is_empty() { "unknown" } else { text }
}

pub fn snapshot_report(snapshot: &WeatherSnapshot, settings: &Settings, style: UpdateFormat) -> String {
    let units = snapshot.units;
    let current = &snapshot.current;
    let mut out = String::new();

    let _ = writeln!(out, "{} ({})", settings.location_name, snapshot.provider);
    let _ = writeln!(out, "  {}", or_unknown(&current.forecast));

    let actual = temperature(current.temperature(false), units);
    let feels = temperature(current.temperature(true), units);
    if settings.show_feels_like {
        let _ = writeln!(out, "  Feels like: {feels} (actual {actual})");
    } else {
        let _ = writeln!(out, "  Temperature: {actual} (feels like {feels})");
    }
    let _ = writeln!(
        out,
        "  High: {}  Low: {}",
        temperature(current.high(), units),
        temperature(current.low(), units)
    );

    let mut details = Vec::new();
    if !current.humidity_text().is_empty() {
        details.push(format!("Humidity: {}", current.humidity_text()));
    }
    if !current.wind_text().is_empty() {
        let mut wind = format!("Wind: {}", current.wind_text());
        if let Some(direction) = current.wind_direction() {
            let _ = write!(wind, " from {direction:.0}°");
        }
        details.push(wind);
    }
    if let Some(clouds) = current.cloud_cover() {
        details.push(format!("Clouds: {clouds:.0}%"));
    }
    if !details.is_empty() {
        let _ = writeln!(out, "  {}", details.join("  "));
    }
    let _ = writeln!(out, "  Updated: {}", snapshot.last_update(style));

    if !snapshot.forecast.is_empty() {
        let _ = writeln!(out, "\nForecast:");
        for day in &snapshot.forecast {
            let range = format!(
                "{} / {}",
                temperature(day.low(), units),
                temperature(day.high(), units)
            );
            if settings.compact_forecast {
                let _ = writeln!(out, "  {:<11} {range}", day_label(day));
            } else {
                let _ = writeln!(
                    out,
                    "  {:<11} {:<30} {range}",
                    day_label(day),
                    or_unknown(&day.forecast)
                );
            }
        }
    }

    out
}

pub fn location_report(found: &GeoLocation, cached: bool) -> String {
    let mut out = format!(
        "{}\n  Latitude: {:.4}\n  Longitude: {:.4}\n",
        found.name.as_deref().unwrap_or("(unnamed location)"),
        found.latitude,
        found.longitude
    );
    if cached {
        out.push_str("  (using cached location)\n");
    }
    out
}

/// Shows only the last four characters of a credential.
pub fn mask_key(key: &str) -> String {
    let count = key.chars().count();
    if count <= 4 {
        return "*".repeat(count);
    }
    let tail: String = key.chars().skip(count - 4).collect();
    format!("{}{tail}", "*".repeat(count - 4))
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

pub fn settings_report(settings: &Settings, path: Option<&Path>) -> String {
    let mut out = String::new();
    if let Some(path) = path {
        let _ = writeln!(out, "Settings file: {}", path.display());
    }
    let _ = writeln!(out, "Location:          {}", settings.location_name);
    let _ = writeln!(
        out,
        "Coordinates:       {:.6}, {:.6}",
        settings.latitude, settings.longitude
    );
    let _ = writeln!(out, "Units:             {}", settings.units);
    let _ = writeln!(out, "Refresh interval:  {}", settings.refresh_interval());
    let _ = writeln!(out, "Provider:          {}", settings.provider);
    let _ = writeln!(out, "Forecast days:     {}", settings.forecast_days);
    let _ = writeln!(out, "Geolocation:       {}", on_off(settings.geolocation_enabled));
    let _ = writeln!(
        out,
        "Geo cache max age: {}",
        settings
            .geo_cache_max_age_hours
            .map(|h| format!("{h} h"))
            .unwrap_or_else(|| "never expires".to_string())
    );
    let _ = writeln!(
        out,
        "Notifications:     refresh {}, geolocation {}, open forecast on click {}",
        on_off(settings.notify_on_refresh),
        on_off(settings.notify_on_geolocation),
        on_off(settings.notification_click)
    );
    let _ = writeln!(
        out,
        "Display:           feels like {}, compact forecast {}",
        on_off(settings.show_feels_like),
        on_off(settings.compact_forecast)
    );
    match &settings.font {
        Some(font) => {
            let _ = writeln!(
                out,
                "Font:              {} {} {}pt",
                font.family, font.style, font.size
            );
        }
        None => {
            let _ = writeln!(out, "Font:              system default");
        }
    }

    let mut keys: Vec<_> = settings.providers.iter().collect();
    keys.sort_by(|a, b| a.0.cmp(b.0));
    for (provider, cfg) in keys {
        let _ = writeln!(out, "API key [{provider}]: {}", mask_key(&cfg.api_key));
    }
    out
}

/// Prints notifications to the terminal.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notification: &Notification) {
        let text = format!(
            "== {} ==\n{}\n",
            notification.title,
            notification.content.replace("\n\n", "\n")
        );
        match notification.kind {
            NotificationKind::Information => println!("{text}"),
            NotificationKind::Error => eprintln!("{text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weather_engine::ProviderId;

    fn snapshot() -> WeatherSnapshot {
        WeatherSnapshot {
            provider: ProviderId::OpenMeteo,
            current: Condition {
                forecast: "Clear sky".into(),
                icon: "sunny".into(),
                temp: 72.5,
                feels_like: 70.2,
                low: 60.0,
                high: 80.4,
                humidity: 45.0,
                ..Condition::default()
            },
            forecast: vec![Condition {
                forecast: "Overcast".into(),
                low: 58.0,
                high: 77.0,
                ..Condition::default()
            }],
            updated_at: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            units: UnitSystem::Imperial,
        }
    }

    #[test]
    fn report_shows_current_and_forecast() {
        let report = snapshot_report(&snapshot(), &Settings::default(), UpdateFormat::Short);
        assert!(report.starts_with("Rapa Nui (openmeteo)\n"));
        assert!(report.contains("Temperature: 73°F (feels like 70°F)"));
        assert!(report.contains("High: 80°F  Low: 60°F"));
        assert!(report.contains("Humidity: 45%"));
        assert!(!report.contains("Wind:"));
        assert!(report.contains("Overcast"));
        assert!(report.contains("58°F / 77°F"));
    }

    #[test]
    fn feels_like_first_and_compact_forecast() {
        let settings = Settings {
            show_feels_like: true,
            compact_forecast: true,
            ..Settings::default()
        };
        let report = snapshot_report(&snapshot(), &settings, UpdateFormat::Short);
        assert!(report.contains("Feels like: 70°F (actual 73°F)"));
        assert!(!report.contains("Overcast"));
    }

    #[test]
    fn masks_all_but_last_four() {
        assert_eq!(mask_key("abcdef123"), "*****f123");
        assert_eq!(mask_key("abc"), "***");
    }

    #[test]
    fn settings_report_masks_keys() {
        let mut settings = Settings::default();
        settings.providers.insert(
            "openweather".into(),
            weather_engine::settings::ProviderConfig {
                api_key: "secret-key-9876".into(),
            },
        );
        let report = settings_report(&settings, None);
        assert!(report.contains("Refresh interval:  15 min"));
        assert!(report.contains("API key [openweather]: ***********9876"));
        assert!(!report.contains("secret"));
    }

    #[test]
    fn cached_location_is_marked() {
        let found = GeoLocation {
            name: Some("Sudbury, Ontario".into()),
            latitude: 46.49,
            longitude: -80.99,
        };
        let report = location_report(&found, true);
        assert!(report.starts_with("Sudbury, Ontario\n"));
        assert!(report.contains("Latitude: 46.4900"));
        assert!(report.ends_with("(using cached location)\n"));
    }
}
