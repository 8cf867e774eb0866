//! End-to-end tests for the engine against a mock HTTP server.

use std::time::Duration;

use serde_json::json;
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};
use weather_engine::{
    Endpoints, Engine, EngineError, EngineEvent, EngineOptions, GeoLocationCompleted,
    ProviderId, RefreshCompleted, Settings, SettingsStore, SpeedUnit, TransportError,
    UnitSystem,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn open_meteo_body() -> serde_json::Value {
    json!({
        "latitude": 46.49,
        "longitude": -80.99,
        "current": {
            "time": 1700000000,
            "temperature_2m": 3.4,
            "apparent_temperature": -1.2,
            "relative_humidity_2m": 81,
            "wind_speed_10m": 14.8,
            "wind_direction_10m": 290,
            "cloud_cover": 100,
            "weathercode": 71
        },
        "daily": {
            "time": [1699920000, 1700006400, 1700092800],
            "temperature_2m_min": [-2.0, -4.5, -1.0],
            "temperature_2m_max": [4.0, 1.5, 3.0],
            "weathercode": [71, 3, 0]
        }
    })
}

fn endpoints(server: &MockServer) -> Endpoints {
    Endpoints {
        open_meteo: format!("{}/v1/forecast", server.uri()),
        openweather: format!("{}/data/3.0/onecall", server.uri()),
        geolocation: format!("{}/json/", server.uri()),
    }
}

fn store(settings: Settings) -> SettingsStore {
    SettingsStore::new(settings)
}

fn without_geolocation() -> Settings {
    Settings {
        geolocation_enabled: false,
        ..Settings::default()
    }
}

async fn next_event(events: &mut UnboundedReceiver<EngineEvent>) -> EngineEvent {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("engine event within timeout")
        .expect("engine still running")
}

async fn next_refresh(events: &mut UnboundedReceiver<EngineEvent>) -> RefreshCompleted {
    loop {
        if let EngineEvent::RefreshCompleted(done) = next_event(events).await {
            return done;
        }
    }
}

async fn next_geolocation(events: &mut UnboundedReceiver<EngineEvent>) -> GeoLocationCompleted {
    loop {
        if let EngineEvent::GeoLocationCompleted(done) = next_event(events).await {
            return done;
        }
    }
}

#[tokio::test]
async fn test_metric_refresh_end_to_end() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .and(query_param("temperature_unit", "celsius"))
        .and(query_param("wind_speed_unit", "kmh"))
        .and(query_param("forecast_days", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(open_meteo_body()))
        .expect(1)
        .mount(&server)
        .await;

    let settings = store(Settings {
        units: UnitSystem::Metric,
        forecast_days: 2,
        ..without_geolocation()
    });
    let options = EngineOptions::default().with_endpoints(endpoints(&server));
    let (handle, mut events) = Engine::start(settings, options).unwrap();

    let done = next_refresh(&mut events).await;
    assert!(done.success(), "refresh failed: {:?}", done.outcome);

    let snapshot = handle.snapshot().expect("snapshot published");
    assert_eq!(snapshot.units, UnitSystem::Metric);
    assert_eq!(snapshot.current.temp, 3.4);
    assert_eq!(snapshot.current.feels_like, -1.2);
    assert_eq!(snapshot.current.forecast, "Slight snow");
    assert_eq!(snapshot.current.icon, "snow");
    assert_eq!(snapshot.current.wind_unit, SpeedUnit::Kmh);
    assert_eq!(snapshot.current.humidity_text(), "81%");
    assert_eq!(snapshot.current.low, -2.0);
    assert_eq!(snapshot.current.high, 4.0);
    // forecast is cut to the requested horizon
    assert_eq!(snapshot.forecast.len(), 2);
    assert_eq!(snapshot.forecast[1].icon, "cloudy");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_error_is_reported_with_body_text() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Error"))
        .mount(&server)
        .await;

    let options = EngineOptions::default().with_endpoints(endpoints(&server));
    let (handle, mut events) = Engine::start(store(without_geolocation()), options).unwrap();

    let done = next_refresh(&mut events).await;
    assert_eq!(done.status, 500);
    assert_eq!(done.status_text, "Internal Error");
    assert_eq!(
        done.outcome.unwrap_err(),
        EngineError::Transport(TransportError::Status {
            code: 500,
            text: "Internal Error".into()
        })
    );
    assert!(handle.snapshot().is_none());
}

#[tokio::test]
async fn test_force_refresh_while_in_flight_sends_one_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(open_meteo_body())
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let options = EngineOptions::default().with_endpoints(endpoints(&server));
    let (handle, mut events) = Engine::start(store(without_geolocation()), options).unwrap();

    handle.force_refresh().unwrap();
    handle.force_refresh().unwrap();

    assert!(next_refresh(&mut events).await.success());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_geolocation_lookup_then_cache_hit() {
    let server = MockServer::start().await;
    let cache_dir = tempfile::tempdir().unwrap();
    let cache_path = cache_dir.path().join("geolocation.json");

    Mock::given(method("GET"))
        .and(path("/json/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "country": "Canada",
            "regionName": "Ontario",
            "city": "Sudbury",
            "lat": 46.49,
            "lon": -80.99
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .and(query_param("latitude", "46.490000"))
        .and(query_param("longitude", "-80.990000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(open_meteo_body()))
        .expect(2)
        .mount(&server)
        .await;

    // first run: nothing cached, the lookup goes to the network
    let settings = store(Settings::default());
    let options = EngineOptions::default()
        .with_endpoints(endpoints(&server))
        .with_geo_cache_path(&cache_path);
    let (handle, mut events) = Engine::start(settings.clone(), options).unwrap();

    let located = next_geolocation(&mut events).await;
    assert!(!located.cached);
    assert_eq!(
        located.outcome.unwrap().name.as_deref(),
        Some("Sudbury, Ontario")
    );
    assert!(next_refresh(&mut events).await.success());
    assert!(cache_path.exists());
    assert_eq!(settings.lock().location_name(), "Sudbury, Ontario");
    handle.shutdown().await.unwrap();

    // second run: same cache file, no lookup request
    let options = EngineOptions::default()
        .with_endpoints(endpoints(&server))
        .with_geo_cache_path(&cache_path);
    let (handle, mut events) = Engine::start(store(Settings::default()), options).unwrap();

    let located = next_geolocation(&mut events).await;
    assert!(located.cached);
    assert!(next_refresh(&mut events).await.success());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_openweather_with_credential() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data/3.0/onecall"))
        .and(query_param("appid", "SECRET"))
        .and(query_param("units", "imperial"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "current": {
                "dt": 1700000000,
                "temp": 58.1,
                "feels_like": 57.0,
                "humidity": 64,
                "wind_speed": 6.9,
                "wind_deg": 180,
                "clouds": 20,
                "weather": [{"description": "few clouds", "icon": "02d"}]
            },
            "daily": [
                {"dt": 1699992000, "temp": {"day": 58.0, "min": 49.0, "max": 61.0},
                 "weather": [{"description": "few clouds", "icon": "02d"}]}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let settings = store(without_geolocation());
    {
        let mut guard = settings.lock();
        guard.set_provider(ProviderId::OpenWeather);
        guard.set_api_key(ProviderId::OpenWeather, "SECRET");
    }

    let options = EngineOptions::default().with_endpoints(endpoints(&server));
    let (handle, mut events) = Engine::start(settings, options).unwrap();

    let done = next_refresh(&mut events).await;
    let snapshot = done.outcome.expect("openweather refresh succeeds");
    assert_eq!(snapshot.provider, ProviderId::OpenWeather);
    assert_eq!(snapshot.current.icon, "partlycloudy");
    assert_eq!(snapshot.current.forecast, "few clouds");
    assert_eq!(snapshot.current.high, 61.0);
    assert_eq!(snapshot.current.wind_unit, SpeedUnit::Mph);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_server_reports_status_zero() {
    let options = EngineOptions::default().with_endpoints(Endpoints {
        open_meteo: "http://127.0.0.1:9/v1/forecast".into(),
        ..Endpoints::default()
    });
    let (_handle, mut events) = Engine::start(store(without_geolocation()), options).unwrap();

    let done = next_refresh(&mut events).await;
    assert_eq!(done.status, 0);
    assert!(matches!(
        done.outcome,
        Err(EngineError::Transport(TransportError::Network(_)))
    ));
}
