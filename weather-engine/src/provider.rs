use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    convert::TryFrom,
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    condition::{Condition, UnitSystem, UpdateFormat, WeatherSnapshot},
    error::{ConfigError, EngineError, ParseError},
    provider::{open_meteo::OpenMeteoBackend, openweather::OpenWeatherBackend},
    transport::{HttpFetch, JsonReply, JsonRequest},
};

pub mod open_meteo;
pub mod openweather;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    #[default]
    OpenMeteo,
    OpenWeather,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenMeteo => "openmeteo",
            ProviderId::OpenWeather => "openweather",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::OpenMeteo, ProviderId::OpenWeather]
    }

    pub fn requires_api_key(&self) -> bool {
        matches!(self, ProviderId::OpenWeather)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "openmeteo" | "open-meteo" => Ok(ProviderId::OpenMeteo),
            "openweather" => Ok(ProviderId::OpenWeather),
            _ => Err(anyhow::anyhow!(
                "Unknown provider '{value}'. Supported providers: openmeteo, openweather."
            )),
        }
    }
}

/// Everything a back-end needs to build its request URL. Read from the
/// settings in one lock acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParams {
    pub latitude: f64,
    pub longitude: f64,
    pub units: UnitSystem,
    pub forecast_days: u32,
    pub api_key: Option<String>,
}

/// Output of a back-end parse before it becomes a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedWeather {
    pub current: Condition,
    pub forecast: Vec<Condition>,
}

/// Provider-specific half of a weather provider: URL construction and JSON
/// shape parsing. Request lifecycle and state live in [`WeatherProvider`].
pub trait WeatherBackend: Send + Sync + Debug {
    fn id(&self) -> ProviderId;

    fn build_url(&self, params: &RequestParams) -> Result<String, ConfigError>;

    fn parse(&self, payload: &Value, units: UnitSystem) -> Result<ParsedWeather, ParseError>;
}

/// Base URLs for every remote service the engine talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub open_meteo: String,
    pub openweather: String,
    pub geolocation: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            open_meteo: open_meteo::DEFAULT_URL.to_string(),
            openweather: openweather::DEFAULT_URL.to_string(),
            geolocation: crate::location::DEFAULT_URL.to_string(),
        }
    }
}

/// Construct the back-end for a provider id.
pub fn backend_for(id: ProviderId, endpoints: &Endpoints) -> Box<dyn WeatherBackend> {
    match id {
        ProviderId::OpenMeteo => Box::new(OpenMeteoBackend::with_base_url(&endpoints.open_meteo)),
        ProviderId::OpenWeather => {
            Box::new(OpenWeatherBackend::with_base_url(&endpoints.openweather))
        }
    }
}

pub(crate) fn build_url_with(
    base: &str,
    params: &[(&str, String)],
) -> Result<String, ConfigError> {
    reqwest::Url::parse_with_params(base, params)
        .map(String::from)
        .map_err(|e| ConfigError::InvalidEndpoint {
            url: base.to_string(),
            reason: e.to_string(),
        })
}

pub(crate) fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), ConfigError> {
    if (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude) {
        Ok(())
    } else {
        Err(ConfigError::InvalidCoordinates {
            latitude,
            longitude,
        })
    }
}

/// Identifies one started request so late replies can be told apart.
/// Unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    pub(crate) fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Message the transport delivers when a weather request finishes.
#[derive(Debug)]
pub struct WeatherReply {
    pub request: RequestId,
    pub reply: JsonReply,
}

/// Result of [`WeatherProvider::rebuild_request_url`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlChange {
    Unchanged,
    Replaced { refresh_started: bool },
}

/// "Refresh completed" event for collaborators.
#[derive(Debug, Clone)]
pub struct RefreshCompleted {
    pub status: u16,
    pub status_text: String,
    pub outcome: Result<Arc<WeatherSnapshot>, EngineError>,
}

impl RefreshCompleted {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// A refresh that could not even be started.
    pub fn not_started(error: EngineError) -> Self {
        Self {
            status: 0,
            status_text: error.to_string(),
            outcome: Err(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RequestProfile {
    units: UnitSystem,
    forecast_days: u32,
}

#[derive(Debug, Default)]
enum RequestState {
    #[default]
    Idle,
    InFlight {
        id: RequestId,
        url: String,
        profile: RequestProfile,
        _request: JsonRequest,
    },
}

/// Owns the current/forecast state for one location and unit combination.
#[derive(Debug)]
pub struct WeatherProvider {
    backend: Box<dyn WeatherBackend>,
    fetch: Arc<dyn HttpFetch>,
    replies: UnboundedSender<WeatherReply>,
    url: Option<String>,
    profile: RequestProfile,
    state: RequestState,
    snapshot: Option<Arc<WeatherSnapshot>>,
}

impl WeatherProvider {
    pub fn new(
        backend: Box<dyn WeatherBackend>,
        fetch: Arc<dyn HttpFetch>,
        replies: UnboundedSender<WeatherReply>,
    ) -> Self {
        Self {
            backend,
            fetch,
            replies,
            url: None,
            profile: RequestProfile {
                units: UnitSystem::default(),
                forecast_days: crate::settings::DEFAULT_FORECAST_DAYS,
            },
            state: RequestState::Idle,
            snapshot: None,
        }
    }

    pub fn id(&self) -> ProviderId {
        self.backend.id()
    }

    pub fn request_url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn units(&self) -> UnitSystem {
        self.profile.units
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, RequestState::InFlight { .. })
    }

    /// Recomputes the request URL. Identical input is a no-op; a changed URL
    /// replaces the old one and, when an old one existed, starts a refresh.
    /// A configuration error clears the URL so no stale request goes out.
    pub fn rebuild_request_url(&mut self, params: &RequestParams) -> Result<UrlChange, EngineError> {
        let built = validate_coordinates(params.latitude, params.longitude)
            .and_then(|_| self.backend.build_url(params));

        let url = match built {
            Ok(url) => url,
            Err(err) => {
                self.url = None;
                return Err(err.into());
            }
        };

        let profile = RequestProfile {
            units: params.units,
            forecast_days: params.forecast_days,
        };

        if self.url.as_deref() == Some(url.as_str()) {
            // forecast_days 1 and 0 share a URL; the held snapshot still shrinks
            if profile.forecast_days < self.profile.forecast_days {
                self.trim_forecast(profile.forecast_days);
            }
            self.profile = profile;
            return Ok(UrlChange::Unchanged);
        }

        let had_previous = self.url.replace(url).is_some();
        self.profile = profile;
        tracing::debug!(provider = %self.id(), "request url rebuilt");

        if !had_previous {
            return Ok(UrlChange::Replaced {
                refresh_started: false,
            });
        }

        match self.refresh() {
            Ok(_) => Ok(UrlChange::Replaced {
                refresh_started: true,
            }),
            // picked up when the in-flight reply lands
            Err(EngineError::AlreadyInFlight) => Ok(UrlChange::Replaced {
                refresh_started: false,
            }),
            Err(err) => Err(err),
        }
    }

    /// Starts a fetch of the current URL. Fails fast if one is already
    /// running; the request is dropped, not queued.
    pub fn refresh(&mut self) -> Result<RequestId, EngineError> {
        if self.is_in_flight() {
            return Err(EngineError::AlreadyInFlight);
        }

        let url = self.url.clone().ok_or(EngineError::NoRequestUrl)?;
        let id = RequestId::next();

        let replies = self.replies.clone();
        let request = JsonRequest::start(self.fetch.clone(), url.clone(), move |reply| {
            let _ = replies.send(WeatherReply { request: id, reply });
        })?;

        tracing::debug!(provider = %self.id(), ?id, "weather refresh started");
        self.state = RequestState::InFlight {
            id,
            url,
            profile: self.profile,
            _request: request,
        };
        Ok(id)
    }

    /// Applies a transport reply. Replies that do not belong to the current
    /// in-flight request are ignored and yield `None`.
    pub fn handle_reply(&mut self, reply: WeatherReply) -> Option<RefreshCompleted> {
        let (url, profile) = match &self.state {
            RequestState::InFlight { id, url, profile, .. } if *id == reply.request => {
                (url.clone(), *profile)
            }
            _ => {
                tracing::debug!(request = ?reply.request, "ignoring stale weather reply");
                return None;
            }
        };
        self.state = RequestState::Idle;

        let WeatherReply { reply, .. } = reply;
        let status = reply.status;
        let status_text = reply.status_text.clone();

        let outcome = reply
            .into_json()
            .map_err(EngineError::from)
            .and_then(|payload| self.apply(&payload, profile).map_err(EngineError::from));

        match &outcome {
            Ok(_) => tracing::info!(provider = %self.id(), status, "weather refresh complete"),
            Err(err) => tracing::warn!(provider = %self.id(), status, "weather refresh failed: {}", err),
        }

        if self.url.as_deref() != Some(url.as_str()) && self.url.is_some() {
            tracing::debug!("request url changed while in flight, refreshing again");
            if let Err(err) = self.refresh() {
                tracing::warn!("follow-up refresh failed to start: {}", err);
            }
        }

        Some(RefreshCompleted {
            status,
            status_text,
            outcome,
        })
    }

    /// Parses a payload with the current unit settings and, on success,
    /// replaces the snapshot. On failure the previous snapshot is kept.
    pub fn parse_result(&mut self, payload: &Value) -> Result<Arc<WeatherSnapshot>, ParseError> {
        self.apply(payload, self.profile)
    }

    fn apply(
        &mut self,
        payload: &Value,
        profile: RequestProfile,
    ) -> Result<Arc<WeatherSnapshot>, ParseError> {
        let ParsedWeather {
            current,
            mut forecast,
        } = self.backend.parse(payload, profile.units)?;

        forecast.truncate(profile.forecast_days as usize);
        let updated_at = current.day().unwrap_or_else(Utc::now);

        let snapshot = Arc::new(WeatherSnapshot {
            provider: self.id(),
            current,
            forecast,
            updated_at,
            units: profile.units,
        });
        self.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    fn trim_forecast(&mut self, days: u32) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        if snapshot.forecast.len() <= days as usize {
            return;
        }
        let mut trimmed = WeatherSnapshot::clone(snapshot);
        trimmed.forecast.truncate(days as usize);
        self.snapshot = Some(Arc::new(trimmed));
    }

    pub fn snapshot(&self) -> Option<Arc<WeatherSnapshot>> {
        self.snapshot.clone()
    }

    pub fn current(&self) -> Option<&Condition> {
        self.snapshot.as_deref().map(|s| &s.current)
    }

    pub fn forecast(&self) -> Option<&[Condition]> {
        self.snapshot.as_deref().map(|s| s.forecast.as_slice())
    }

    pub fn last_update(&self, style: UpdateFormat) -> Option<String> {
        self.snapshot.as_deref().map(|s| s.last_update(style))
    }

    /// Abandons the in-flight request, if any. Its reply is never delivered.
    pub fn stop(&mut self) {
        if self.is_in_flight() {
            tracing::debug!(provider = %self.id(), "stopping in-flight weather request");
        }
        self.state = RequestState::Idle;
    }
}
