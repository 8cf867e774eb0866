use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    condition::UnitSystem,
    error::ConfigError,
    geo_cache::CacheExpiry,
    provider::{ProviderId, RequestParams},
    scheduler::ScheduleInput,
};

/// Stored interval value meaning "never refresh automatically".
pub const MANUAL_REFRESH_SENTINEL: u32 = 999_999;

pub const DEFAULT_LOCATION: &str = "Rapa Nui";
pub const DEFAULT_LATITUDE: f64 = -27.116667;
pub const DEFAULT_LONGITUDE: f64 = -109.366667;
pub const DEFAULT_INTERVAL_MINUTES: u32 = 15;
pub const DEFAULT_FORECAST_DAYS: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshInterval {
    Manual,
    Minutes(u32),
}

impl RefreshInterval {
    pub fn from_minutes(minutes: u32) -> Self {
        if minutes == MANUAL_REFRESH_SENTINEL {
            RefreshInterval::Manual
        } else {
            RefreshInterval::Minutes(minutes)
        }
    }

    /// Value as stored on disk.
    pub fn as_minutes(self) -> u32 {
        match self {
            RefreshInterval::Manual => MANUAL_REFRESH_SENTINEL,
            RefreshInterval::Minutes(m) => m,
        }
    }

    pub fn as_duration(self) -> Option<Duration> {
        match self {
            RefreshInterval::Manual => None,
            RefreshInterval::Minutes(m) => Some(Duration::from_secs(u64::from(m) * 60)),
        }
    }
}

impl std::fmt::Display for RefreshInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshInterval::Manual => f.write_str("manual"),
            RefreshInterval::Minutes(m) => write!(f, "{m} min"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontSpec {
    pub family: String,
    pub style: String,
    pub size: u32,
}

/// Credentials for a single provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
}

/// Settings record as stored on disk. Unknown or missing keys fall back to
/// the defaults so older files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub location_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub units: UnitSystem,
    /// Minutes between refreshes; [`MANUAL_REFRESH_SENTINEL`] disables them.
    pub refresh_interval_minutes: u32,
    pub geolocation_enabled: bool,
    pub notify_on_refresh: bool,
    pub notify_on_geolocation: bool,
    pub notification_click: bool,
    pub compact_forecast: bool,
    pub show_feels_like: bool,
    pub forecast_days: u32,
    pub provider: ProviderId,
    /// Hours a cached IP lookup stays valid. Absent means forever.
    pub geo_cache_max_age_hours: Option<u32>,
    pub font: Option<FontSpec>,

    /// Example TOML:
    /// [providers.openweather]
    /// api_key = "..."
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            location_name: DEFAULT_LOCATION.to_string(),
            latitude: DEFAULT_LATITUDE,
            longitude: DEFAULT_LONGITUDE,
            units: UnitSystem::Imperial,
            refresh_interval_minutes: DEFAULT_INTERVAL_MINUTES,
            geolocation_enabled: true,
            notify_on_refresh: true,
            notify_on_geolocation: true,
            notification_click: true,
            compact_forecast: false,
            show_feels_like: false,
            forecast_days: DEFAULT_FORECAST_DAYS,
            provider: ProviderId::default(),
            geo_cache_max_age_hours: None,
            font: None,
            providers: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or return defaults if it doesn't exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        let mut settings: Settings = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;

        if settings.refresh_interval_minutes == 0 {
            tracing::warn!(
                "refresh interval of 0 minutes in {}; using {} minutes",
                path.display(),
                DEFAULT_INTERVAL_MINUTES
            );
            settings.refresh_interval_minutes = DEFAULT_INTERVAL_MINUTES;
        }

        Ok(settings)
    }

    /// Save settings to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory: {}", parent.display())
            })?;
        }

        let toml = toml::to_string_pretty(self).context("Failed to serialize settings to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))?;

        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let dirs = project_dirs()?;
        Ok(dirs.config_dir().join("settings.toml"))
    }

    pub fn refresh_interval(&self) -> RefreshInterval {
        RefreshInterval::from_minutes(self.refresh_interval_minutes)
    }

    pub fn api_key(&self, provider: ProviderId) -> Option<&str> {
        self.providers
            .get(provider.as_str())
            .map(|cfg| cfg.api_key.as_str())
            .filter(|key| !key.is_empty())
    }

    /// Everything needed to build the weather request URL.
    pub fn request_params(&self) -> RequestParams {
        RequestParams {
            latitude: self.latitude,
            longitude: self.longitude,
            units: self.units,
            forecast_days: self.forecast_days,
            api_key: self.api_key(self.provider).map(str::to_string),
        }
    }

    pub fn schedule_input(&self) -> ScheduleInput {
        ScheduleInput {
            provider: self.provider,
            interval: self.refresh_interval(),
            credential_required: self.provider.requires_api_key(),
            credential_present: self.api_key(self.provider).is_some(),
        }
    }

    pub fn geo_cache_expiry(&self) -> CacheExpiry {
        match self.geo_cache_max_age_hours {
            Some(hours) => CacheExpiry::After(chrono::TimeDelta::hours(i64::from(hours))),
            None => CacheExpiry::Never,
        }
    }
}

pub(crate) fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "weather-engine", "weather")
        .ok_or_else(|| anyhow!("Could not determine platform config directory"))
}

#[derive(Debug)]
struct StoreInner {
    settings: Settings,
    dirty: bool,
    path: Option<PathBuf>,
}

/// Shared, lock-guarded settings. Clones refer to the same record.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl SettingsStore {
    /// In-memory store; `save` is a no-op.
    pub fn new(settings: Settings) -> Self {
        Self::with_path(settings, None)
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = Settings::load_from(&path)?;
        tracing::debug!(path = %path.display(), "settings loaded");
        Ok(Self::with_path(settings, Some(path)))
    }

    pub fn open_default() -> Result<Self> {
        Self::open(Settings::default_path()?)
    }

    fn with_path(settings: Settings, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                settings,
                dirty: false,
                path,
            })),
        }
    }

    /// Locks the record. Hold the guard for multi-field reads so they see
    /// one consistent state.
    pub fn lock(&self) -> SettingsGuard<'_> {
        SettingsGuard {
            inner: self.inner.lock(),
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.lock().settings.clone()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().path.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Writes the record to its file, if it has one, and clears the dirty flag.
    pub fn save(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(path) = inner.path.clone() {
            inner.settings.save_to(&path)?;
            tracing::debug!(path = %path.display(), "settings saved");
        }
        inner.dirty = false;
        Ok(())
    }

    /// Returns whether anything was written.
    pub fn save_if_dirty(&self) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }
}

/// Scoped access to the settings record. Every setter marks it dirty.
pub struct SettingsGuard<'a> {
    inner: MutexGuard<'a, StoreInner>,
}

impl SettingsGuard<'_> {
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    fn edit(&mut self) -> &mut Settings {
        self.inner.dirty = true;
        &mut self.inner.settings
    }

    pub fn location_name(&self) -> &str {
        &self.inner.settings.location_name
    }

    pub fn set_location_name(&mut self, name: impl Into<String>) {
        self.edit().location_name = name.into();
    }

    pub fn latitude(&self) -> f64 {
        self.inner.settings.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.inner.settings.longitude
    }

    pub fn set_coordinates(&mut self, latitude: f64, longitude: f64) {
        let settings = self.edit();
        settings.latitude = latitude;
        settings.longitude = longitude;
    }

    pub fn units(&self) -> UnitSystem {
        self.inner.settings.units
    }

    pub fn set_units(&mut self, units: UnitSystem) {
        self.edit().units = units;
    }

    pub fn refresh_interval(&self) -> RefreshInterval {
        self.inner.settings.refresh_interval()
    }

    pub fn set_refresh_interval(&mut self, interval: RefreshInterval) -> Result<(), ConfigError> {
        if interval == RefreshInterval::Minutes(0) {
            return Err(ConfigError::InvalidInterval);
        }
        self.edit().refresh_interval_minutes = interval.as_minutes();
        Ok(())
    }

    pub fn geolocation_enabled(&self) -> bool {
        self.inner.settings.geolocation_enabled
    }

    pub fn set_geolocation_enabled(&mut self, enabled: bool) {
        self.edit().geolocation_enabled = enabled;
    }

    pub fn notify_on_refresh(&self) -> bool {
        self.inner.settings.notify_on_refresh
    }

    pub fn set_notify_on_refresh(&mut self, enabled: bool) {
        self.edit().notify_on_refresh = enabled;
    }

    pub fn notify_on_geolocation(&self) -> bool {
        self.inner.settings.notify_on_geolocation
    }

    pub fn set_notify_on_geolocation(&mut self, enabled: bool) {
        self.edit().notify_on_geolocation = enabled;
    }

    pub fn notification_click(&self) -> bool {
        self.inner.settings.notification_click
    }

    pub fn set_notification_click(&mut self, enabled: bool) {
        self.edit().notification_click = enabled;
    }

    /// `None` until a font has been chosen.
    pub fn font(&self) -> Option<FontSpec> {
        self.inner.settings.font.clone()
    }

    pub fn set_font(
        &mut self,
        family: impl Into<String>,
        style: impl Into<String>,
        size: u32,
    ) -> Result<(), ConfigError> {
        let family = family.into();
        let style = style.into();
        if family.trim().is_empty() || style.trim().is_empty() {
            return Err(ConfigError::InvalidFont);
        }
        self.edit().font = Some(FontSpec {
            family,
            style,
            size,
        });
        Ok(())
    }

    pub fn reset_font(&mut self) {
        self.edit().font = None;
    }

    pub fn compact_forecast(&self) -> bool {
        self.inner.settings.compact_forecast
    }

    pub fn set_compact_forecast(&mut self, enabled: bool) {
        self.edit().compact_forecast = enabled;
    }

    pub fn show_feels_like(&self) -> bool {
        self.inner.settings.show_feels_like
    }

    pub fn set_show_feels_like(&mut self, enabled: bool) {
        self.edit().show_feels_like = enabled;
    }

    pub fn forecast_days(&self) -> u32 {
        self.inner.settings.forecast_days
    }

    pub fn set_forecast_days(&mut self, days: u32) {
        self.edit().forecast_days = days;
    }

    pub fn provider(&self) -> ProviderId {
        self.inner.settings.provider
    }

    pub fn set_provider(&mut self, provider: ProviderId) {
        self.edit().provider = provider;
    }

    pub fn api_key(&self, provider: ProviderId) -> Option<String> {
        self.inner.settings.api_key(provider).map(str::to_string)
    }

    /// Stores a trimmed key; an empty key removes the entry.
    pub fn set_api_key(&mut self, provider: ProviderId, api_key: impl AsRef<str>) {
        let api_key = api_key.as_ref().trim();
        if api_key.is_empty() {
            self.clear_api_key(provider);
            return;
        }
        self.edit().providers.insert(
            provider.as_str().to_string(),
            ProviderConfig {
                api_key: api_key.to_string(),
            },
        );
    }

    pub fn clear_api_key(&mut self, provider: ProviderId) {
        self.edit().providers.remove(provider.as_str());
    }

    pub fn geo_cache_expiry(&self) -> CacheExpiry {
        self.inner.settings.geo_cache_expiry()
    }

    pub fn set_geo_cache_max_age_hours(&mut self, hours: Option<u32>) {
        self.edit().geo_cache_max_age_hours = hours;
    }

    pub fn request_params(&self) -> RequestParams {
        self.inner.settings.request_params()
    }

    pub fn schedule_input(&self) -> ScheduleInput {
        self.inner.settings.schedule_input()
    }
}
