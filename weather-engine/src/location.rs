//! IP based location lookup with a single-entry file cache.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    error::{EngineError, ParseError},
    geo_cache::{CacheExpiry, GeoCache, GeoCacheEntry},
    provider::RequestId,
    settings::SettingsStore,
    transport::{HttpFetch, JsonReply, JsonRequest},
};

pub const DEFAULT_URL: &str =
    "http://ip-api.com/json/?fields=status,message,lat,lon,country,regionName,city";

/// A resolved location as written into the settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoLocation {
    /// `"city, region"`, or just the city. `None` if the service had no city.
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

/// Message the transport delivers when a lookup finishes.
#[derive(Debug)]
pub struct GeoReply {
    pub request: RequestId,
    pub reply: JsonReply,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Served from the cache file; settings are already updated.
    Cached(GeoLocation),
    /// A network lookup was started.
    Fetching(RequestId),
}

/// "Geolocation completed" event for collaborators.
#[derive(Debug, Clone)]
pub struct GeoLocationCompleted {
    pub status: u16,
    pub status_text: String,
    pub cached: bool,
    pub outcome: Result<GeoLocation, EngineError>,
}

impl GeoLocationCompleted {
    pub fn from_cache(location: GeoLocation) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            cached: true,
            outcome: Ok(location),
        }
    }

    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: Option<String>,
    message: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    city: Option<String>,
    region_name: Option<String>,
}

#[derive(Debug, Default)]
enum LookupState {
    #[default]
    Idle,
    Fetching {
        id: RequestId,
        _request: JsonRequest,
    },
}

#[derive(Debug)]
pub struct LocationProvider {
    settings: SettingsStore,
    cache: GeoCache,
    fetch: Arc<dyn HttpFetch>,
    url: String,
    replies: UnboundedSender<GeoReply>,
    state: LookupState,
}

impl LocationProvider {
    pub fn new(
        settings: SettingsStore,
        cache: GeoCache,
        fetch: Arc<dyn HttpFetch>,
        url: impl Into<String>,
        replies: UnboundedSender<GeoReply>,
    ) -> Self {
        Self {
            settings,
            cache,
            fetch,
            url: url.into(),
            replies,
            state: LookupState::Idle,
        }
    }

    pub fn is_fetching(&self) -> bool {
        matches!(self.state, LookupState::Fetching { .. })
    }

    pub fn set_cache_expiry(&mut self, expiry: CacheExpiry) {
        self.cache.set_expiry(expiry);
    }

    pub fn cache(&self) -> &GeoCache {
        &self.cache
    }

    /// Resolves the location. Unless `force` is set, a valid cache entry is
    /// applied synchronously and no request is made.
    pub fn run(&mut self, force: bool) -> Result<RunOutcome, EngineError> {
        if self.is_fetching() {
            return Err(EngineError::AlreadyInFlight);
        }

        if !force {
            if let Some(entry) = self.cache.load() {
                match self.parse_result(&entry.payload, false) {
                    Ok(location) => {
                        tracing::debug!(name = ?location.name, "using cached geolocation");
                        return Ok(RunOutcome::Cached(location));
                    }
                    Err(err) => {
                        tracing::warn!("cached geolocation unusable, looking up again: {}", err)
                    }
                }
            }
        }

        let id = RequestId::next();

        let replies = self.replies.clone();
        let request = JsonRequest::start(self.fetch.clone(), self.url.clone(), move |reply| {
            let _ = replies.send(GeoReply { request: id, reply });
        })?;

        tracing::debug!(?id, force, "geolocation lookup started");
        self.state = LookupState::Fetching {
            id,
            _request: request,
        };
        Ok(RunOutcome::Fetching(id))
    }

    /// Applies a transport reply. Replies that do not belong to the current
    /// lookup are ignored and yield `None`.
    pub fn handle_reply(&mut self, reply: GeoReply) -> Option<GeoLocationCompleted> {
        match &self.state {
            LookupState::Fetching { id, .. } if *id == reply.request => {}
            _ => {
                tracing::debug!(request = ?reply.request, "ignoring stale geolocation reply");
                return None;
            }
        }
        self.state = LookupState::Idle;

        let GeoReply { reply, .. } = reply;
        let status = reply.status;
        let status_text = reply.status_text.clone();

        let outcome = reply
            .into_json()
            .map_err(EngineError::from)
            .and_then(|payload| self.parse_result(&payload, true).map_err(EngineError::from));

        match &outcome {
            Ok(location) => tracing::info!(name = ?location.name, "geolocation lookup complete"),
            Err(err) => tracing::warn!(status, "geolocation lookup failed: {}", err),
        }

        Some(GeoLocationCompleted {
            status,
            status_text,
            cached: false,
            outcome,
        })
    }

    /// Writes the looked-up name and coordinates into the settings and,
    /// when `cache_result` is set, replaces the cache file.
    pub fn parse_result(
        &mut self,
        payload: &Value,
        cache_result: bool,
    ) -> Result<GeoLocation, ParseError> {
        let parsed: IpApiResponse = serde_json::from_value(payload.clone())
            .map_err(|e| ParseError::Invalid(e.to_string()))?;

        if parsed.status.as_deref() == Some("fail") {
            return Err(ParseError::Rejected(
                parsed.message.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        let latitude = parsed.lat.ok_or(ParseError::MissingField("lat"))?;
        let longitude = parsed.lon.ok_or(ParseError::MissingField("lon"))?;

        let name = parsed.city.filter(|c| !c.is_empty()).map(|city| {
            match parsed.region_name.filter(|r| !r.is_empty()) {
                Some(region) => format!("{city}, {region}"),
                None => city,
            }
        });

        {
            let mut settings = self.settings.lock();
            if let Some(name) = &name {
                settings.set_location_name(name.clone());
            }
            settings.set_coordinates(latitude, longitude);
        }

        if cache_result {
            let entry = GeoCacheEntry {
                name: name.clone(),
                latitude,
                longitude,
                fetched_at: Utc::now(),
                payload: payload.clone(),
            };
            if let Err(err) = self.cache.store(&entry) {
                tracing::warn!("failed to cache geolocation: {:#}", err);
            }
        }

        Ok(GeoLocation {
            name,
            latitude,
            longitude,
        })
    }

    /// Abandons the in-flight lookup, if any.
    pub fn stop(&mut self) {
        if self.is_fetching() {
            tracing::debug!("stopping in-flight geolocation lookup");
        }
        self.state = LookupState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        settings::Settings,
        testing::{PendingFetch, StaticFetch},
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    const LOOKUP: &str = r#"{
        "status": "success",
        "country": "Canada",
        "regionName": "Ontario",
        "city": "Sudbury",
        "lat": 46.49,
        "lon": -80.99
    }"#;

    struct Fixture {
        provider: LocationProvider,
        settings: SettingsStore,
        rx: mpsc::UnboundedReceiver<GeoReply>,
        _dir: tempfile::TempDir,
    }

    fn fixture(fetch: Arc<dyn HttpFetch>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = GeoCache::new(dir.path().join("geo.json"), CacheExpiry::Never);
        let settings = SettingsStore::new(Settings::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = LocationProvider::new(settings.clone(), cache, fetch, DEFAULT_URL, tx);
        Fixture {
            provider,
            settings,
            rx,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn no_cache_fetches_and_writes_cache() {
        let fetch = StaticFetch::ok(LOOKUP);
        let mut f = fixture(fetch.clone());

        let outcome = f.provider.run(false).unwrap();
        assert!(matches!(outcome, RunOutcome::Fetching(_)));

        let done = f.provider.handle_reply(f.rx.recv().await.unwrap()).unwrap();
        assert!(!done.cached);
        assert_eq!(done.status, 200);
        let location = done.outcome.unwrap();
        assert_eq!(location.name.as_deref(), Some("Sudbury, Ontario"));

        let g = f.settings.lock();
        assert_eq!(g.location_name(), "Sudbury, Ontario");
        assert_eq!((g.latitude(), g.longitude()), (46.49, -80.99));
        drop(g);

        assert_eq!(fetch.calls(), 1);
        assert!(f.provider.cache().load().is_some());
    }

    #[tokio::test]
    async fn valid_cache_is_used_without_network() {
        let fetch = StaticFetch::ok(LOOKUP);
        let mut f = fixture(fetch.clone());
        f.provider
            .parse_result(&serde_json::from_str(LOOKUP).unwrap(), true)
            .unwrap();
        f.settings.lock().set_location_name("elsewhere");

        let outcome = f.provider.run(false).unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Cached(GeoLocation {
                name: Some("Sudbury, Ontario".into()),
                latitude: 46.49,
                longitude: -80.99,
            })
        );
        assert_eq!(f.settings.lock().location_name(), "Sudbury, Ontario");

        tokio::task::yield_now().await;
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn forced_run_ignores_cache() {
        let fetch = StaticFetch::ok(LOOKUP);
        let mut f = fixture(fetch.clone());
        f.provider
            .parse_result(&serde_json::from_str(LOOKUP).unwrap(), true)
            .unwrap();

        assert!(matches!(f.provider.run(true).unwrap(), RunOutcome::Fetching(_)));
        f.rx.recv().await.unwrap();
        assert_eq!(fetch.calls(), 1);
    }

    #[tokio::test]
    async fn second_run_while_fetching_is_rejected() {
        let mut f = fixture(PendingFetch::new());
        f.provider.run(true).unwrap();
        assert_eq!(f.provider.run(true).unwrap_err(), EngineError::AlreadyInFlight);

        f.provider.stop();
        assert!(!f.provider.is_fetching());
    }

    #[test]
    fn failed_lookup_is_rejected_and_leaves_settings() {
        let mut f = fixture(PendingFetch::new());
        let err = f
            .provider
            .parse_result(&json!({"status": "fail", "message": "private range"}), true)
            .unwrap_err();
        assert_eq!(err, ParseError::Rejected("private range".into()));

        let g = f.settings.lock();
        assert_eq!(g.location_name(), crate::settings::DEFAULT_LOCATION);
        drop(g);
        assert!(f.provider.cache().load().is_none());
    }

    #[test]
    fn city_without_region_and_no_cache_write() {
        let mut f = fixture(PendingFetch::new());
        let location = f
            .provider
            .parse_result(&json!({"city": "Hilo", "lat": 19.7, "lon": -155.1}), false)
            .unwrap();
        assert_eq!(location.name.as_deref(), Some("Hilo"));
        assert!(f.provider.cache().load().is_none());
    }

    #[test]
    fn missing_coordinates_is_an_error() {
        let mut f = fixture(PendingFetch::new());
        let err = f
            .provider
            .parse_result(&json!({"status": "success", "city": "Hilo"}), true)
            .unwrap_err();
        assert_eq!(err, ParseError::MissingField("lat"));
        assert_eq!(
            f.settings.lock().location_name(),
            crate::settings::DEFAULT_LOCATION
        );
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let mut f = fixture(StaticFetch::with_status(503, "down for maintenance"));
        f.provider.run(false).unwrap();
        let done = f.provider.handle_reply(f.rx.recv().await.unwrap()).unwrap();
        assert_eq!(done.status, 503);
        assert_eq!(done.status_text, "down for maintenance");
        assert!(!done.success());
        assert!(!f.provider.is_fetching());
    }
}
