use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use inquire::{Confirm, Password, PasswordDisplayMode};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc::UnboundedReceiver;
use weather_engine::{
    ConfigError, Engine, EngineEvent, EngineOptions, GeoLocationCompleted, ProviderId,
    RefreshCompleted, RefreshInterval, SettingsStore, UnitSystem, UpdateFormat,
    settings::SettingsGuard,
};

use crate::output::{self, ConsoleNotifier};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather", version, about = "Periodic weather client")]
pub struct Cli {
    /// Settings file to use instead of the platform default.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a specific provider.
    Configure {
        /// Provider short name, e.g. "openweather" or "openmeteo".
        provider: String,
    },

    /// Change a single setting.
    Set {
        #[command(subcommand)]
        setting: Setting,
    },

    /// Refresh once and print the current weather and forecast.
    Show {
        /// Print the last update time in the long format.
        #[arg(long)]
        long: bool,
    },

    /// Keep refreshing on the configured interval until Ctrl-C.
    Watch,

    /// Look up the current location from the public IP address.
    Locate {
        /// Ignore the cached lookup.
        #[arg(long)]
        force: bool,
    },

    /// Print the current settings.
    Settings,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl From<Toggle> for bool {
    fn from(value: Toggle) -> Self {
        matches!(value, Toggle::On)
    }
}

#[derive(Debug, Subcommand)]
pub enum Setting {
    /// Display name of the location.
    Location { name: String },
    /// Latitude and longitude in decimal degrees.
    Coordinates {
        #[arg(allow_negative_numbers = true)]
        latitude: f64,
        #[arg(allow_negative_numbers = true)]
        longitude: f64,
    },
    /// "imperial" or "metric".
    Units { units: String },
    /// Minutes between refreshes, or "manual".
    Interval { value: String },
    Geolocation { state: Toggle },
    ForecastDays { days: u32 },
    /// Weather provider to use.
    Provider { provider: String },
    FeelsLike { state: Toggle },
    CompactForecast { state: Toggle },
    /// Notify after each weather refresh.
    Notifications { state: Toggle },
    /// Notify after each location lookup.
    GeoNotifications { state: Toggle },
    NotificationClick { state: Toggle },
    Font {
        family: String,
        style: String,
        size: u32,
    },
    ResetFont,
    /// Hours a cached location lookup stays valid, or "never".
    GeoCacheMaxAge { value: String },
}

fn parse_interval(value: &str) -> Result<RefreshInterval> {
    if value.eq_ignore_ascii_case("manual") {
        return Ok(RefreshInterval::Manual);
    }
    let minutes: u32 = value
        .parse()
        .with_context(|| format!("Invalid interval '{value}'. Use minutes or \"manual\"."))?;
    Ok(RefreshInterval::Minutes(minutes))
}

fn parse_max_age(value: &str) -> Result<Option<u32>> {
    if value.eq_ignore_ascii_case("never") {
        return Ok(None);
    }
    let hours = value
        .parse()
        .with_context(|| format!("Invalid cache age '{value}'. Use hours or \"never\"."))?;
    Ok(Some(hours))
}

impl Setting {
    /// Applies the change and describes it.
    fn apply(self, settings: &mut SettingsGuard<'_>) -> Result<String> {
        let message = match self {
            Setting::Location { name } => {
                settings.set_location_name(&name);
                format!("Location set to {name}")
            }
            Setting::Coordinates {
                latitude,
                longitude,
            } => {
                if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
                    return Err(ConfigError::InvalidCoordinates {
                        latitude,
                        longitude,
                    }
                    .into());
                }
                settings.set_coordinates(latitude, longitude);
                format!("Coordinates set to {latitude}, {longitude}")
            }
            Setting::Units { units } => {
                let units = UnitSystem::try_from(units.as_str())?;
                settings.set_units(units);
                format!("Units set to {units}")
            }
            Setting::Interval { value } => {
                let interval = parse_interval(&value)?;
                settings.set_refresh_interval(interval)?;
                format!("Refresh interval set to {interval}")
            }
            Setting::Geolocation { state } => {
                let enabled = bool::from(state);
                settings.set_geolocation_enabled(enabled);
                format!("Geolocation {}", if enabled { "enabled" } else { "disabled" })
            }
            Setting::ForecastDays { days } => {
                settings.set_forecast_days(days);
                format!("Forecast days set to {days}")
            }
            Setting::Provider { provider } => {
                let id = ProviderId::try_from(provider.as_str())?;
                settings.set_provider(id);
                if id.requires_api_key() && settings.api_key(id).is_none() {
                    format!("Provider set to {id}. Run `weather configure {id}` to add an API key.")
                } else {
                    format!("Provider set to {id}")
                }
            }
            Setting::FeelsLike { state } => {
                settings.set_show_feels_like(state.into());
                "Feels-like display updated".to_string()
            }
            Setting::CompactForecast { state } => {
                settings.set_compact_forecast(state.into());
                "Compact forecast updated".to_string()
            }
            Setting::Notifications { state } => {
                settings.set_notify_on_refresh(state.into());
                "Refresh notifications updated".to_string()
            }
            Setting::GeoNotifications { state } => {
                settings.set_notify_on_geolocation(state.into());
                "Geolocation notifications updated".to_string()
            }
            Setting::NotificationClick { state } => {
                settings.set_notification_click(state.into());
                "Notification click action updated".to_string()
            }
            Setting::Font {
                family,
                style,
                size,
            } => {
                settings.set_font(&family, &style, size)?;
                format!("Font set to {family} {style} {size}pt")
            }
            Setting::ResetFont => {
                settings.reset_font();
                "Font reset to the system default".to_string()
            }
            Setting::GeoCacheMaxAge { value } => {
                let hours = parse_max_age(&value)?;
                settings.set_geo_cache_max_age_hours(hours);
                match hours {
                    Some(h) => format!("Cached locations now expire after {h} h"),
                    None => "Cached locations never expire".to_string(),
                }
            }
        };
        Ok(message)
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let store = match &self.config {
            Some(path) => SettingsStore::open(path)?,
            None => SettingsStore::open_default()?,
        };

        match self.command {
            Command::Configure { provider } => configure(&store, &provider)?,
            Command::Set { setting } => {
                let message = setting.apply(&mut store.lock())?;
                store.save()?;
                println!("{message}");
            }
            Command::Show { long } => show(store, long).await?,
            Command::Watch => watch(store).await?,
            Command::Locate { force } => locate(store, force).await?,
            Command::Settings => {
                let path = store.path();
                print!("{}", output::settings_report(&store.snapshot(), path.as_deref()));
            }
        }

        Ok(())
    }
}

fn configure(store: &SettingsStore, provider: &str) -> Result<()> {
    let id = ProviderId::try_from(provider)?;

    if id.requires_api_key() {
        let key = Password::new(&format!("API key for {id}:"))
            .with_display_mode(PasswordDisplayMode::Masked)
            .without_confirmation()
            .prompt()
            .context("Failed to read API key")?;
        if key.trim().is_empty() {
            bail!("API key must not be empty");
        }
        store.lock().set_api_key(id, key);
    } else {
        println!("Provider '{id}' does not need an API key.");
    }

    let active = store.lock().provider();
    if active != id {
        let switch = Confirm::new(&format!("Use {id} instead of {active}?"))
            .with_default(true)
            .prompt()
            .context("Failed to read answer")?;
        if switch {
            store.lock().set_provider(id);
        }
    }

    store.save()?;
    match store.path() {
        Some(path) => println!("Saved settings to {}", path.display()),
        None => println!("Settings updated"),
    }
    Ok(())
}

async fn next_refresh(events: &mut UnboundedReceiver<EngineEvent>) -> Result<RefreshCompleted> {
    loop {
        match events.recv().await {
            Some(EngineEvent::RefreshCompleted(done)) => return Ok(done),
            Some(EngineEvent::NotConfigured(err)) => return Err(err.into()),
            Some(EngineEvent::GeoLocationCompleted(done)) => {
                if let Err(err) = &done.outcome {
                    tracing::warn!("location lookup failed, using stored location: {}", err);
                }
            }
            Some(EngineEvent::AutoRefreshDisabled(err)) => {
                tracing::warn!("automatic refresh disabled: {}", err)
            }
            None => bail!("weather engine stopped unexpectedly"),
        }
    }
}

async fn next_geolocation(
    events: &mut UnboundedReceiver<EngineEvent>,
) -> Result<GeoLocationCompleted> {
    loop {
        match events.recv().await {
            Some(EngineEvent::GeoLocationCompleted(done)) => return Ok(done),
            Some(_) => {}
            None => bail!("weather engine stopped unexpectedly"),
        }
    }
}

async fn show(store: SettingsStore, long: bool) -> Result<()> {
    let (handle, mut events) = Engine::start(store.clone(), EngineOptions::default())?;
    let done = next_refresh(&mut events).await;
    handle.shutdown().await?;

    let done = done?;
    let status = done.status;
    let snapshot = done
        .outcome
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("Weather refresh failed (status {status})"))?;

    let style = if long {
        UpdateFormat::Long
    } else {
        UpdateFormat::Short
    };
    print!(
        "{}",
        output::snapshot_report(&snapshot, &store.snapshot(), style)
    );
    Ok(())
}

async fn watch(store: SettingsStore) -> Result<()> {
    let options = EngineOptions::default().with_notifier(Arc::new(ConsoleNotifier));
    let (handle, mut events) = Engine::start(store.clone(), options)?;

    println!(
        "Watching weather every {}. Press Ctrl-C to stop.",
        store.lock().refresh_interval()
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(EngineEvent::RefreshCompleted(done)) => {
                    if let Ok(snapshot) = &done.outcome {
                        println!(
                            "{}",
                            output::snapshot_report(snapshot, &store.snapshot(), UpdateFormat::Short)
                        );
                    }
                }
                Some(EngineEvent::NotConfigured(err)) => eprintln!("{err}"),
                Some(other) => tracing::debug!(?other, "engine event"),
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn locate(store: SettingsStore, force: bool) -> Result<()> {
    if !store.lock().geolocation_enabled() {
        bail!(
            "Geolocation is disabled.\n\
             Hint: run `weather set geolocation on` first."
        );
    }

    let (handle, mut events) = Engine::start(store.clone(), EngineOptions::default())?;
    let mut located = next_geolocation(&mut events).await;
    if force && matches!(&located, Ok(done) if done.cached) {
        handle.force_geolocation()?;
        located = next_geolocation(&mut events).await;
    }
    handle.shutdown().await?;

    let located = located?;
    let status = located.status;
    let found = located
        .outcome
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("Location lookup failed (status {status})"))?;

    print!("{}", output::location_report(&found, located.cached));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use weather_engine::Settings;

    #[test]
    fn interval_parsing() {
        assert_eq!(parse_interval("manual").unwrap(), RefreshInterval::Manual);
        assert_eq!(parse_interval("30").unwrap(), RefreshInterval::Minutes(30));
        assert!(parse_interval("soon").is_err());
    }

    #[test]
    fn max_age_parsing() {
        assert_eq!(parse_max_age("never").unwrap(), None);
        assert_eq!(parse_max_age("12").unwrap(), Some(12));
        assert!(parse_max_age("-1").is_err());
    }

    #[test]
    fn negative_coordinates_parse() {
        let cli = Cli::try_parse_from(["weather", "set", "coordinates", "-27.1", "-109.3"]).unwrap();
        match cli.command {
            Command::Set {
                setting:
                    Setting::Coordinates {
                        latitude,
                        longitude,
                    },
            } => assert_eq!((latitude, longitude), (-27.1, -109.3)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn apply_rejects_bad_values() {
        let store = SettingsStore::new(Settings::default());
        let mut guard = store.lock();

        assert!(
            Setting::Interval { value: "0".into() }
                .apply(&mut guard)
                .is_err()
        );
        assert!(
            Setting::Coordinates {
                latitude: 95.0,
                longitude: 0.0
            }
            .apply(&mut guard)
            .is_err()
        );
        assert!(
            Setting::Units {
                units: "kelvin".into()
            }
            .apply(&mut guard)
            .is_err()
        );

        let message = Setting::Provider {
            provider: "openweather".into(),
        }
        .apply(&mut guard)
        .unwrap();
        assert!(message.contains("weather configure openweather"));
        assert_eq!(guard.provider(), ProviderId::OpenWeather);
    }

    #[test]
    fn global_config_flag() {
        let cli = Cli::try_parse_from(["weather", "settings", "--config", "/tmp/w.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/w.toml")));
        assert!(matches!(cli.command, Command::Settings));
    }
}
