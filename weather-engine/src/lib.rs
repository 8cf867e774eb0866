//! Refresh engine for a periodic weather client.
//!
//! This crate defines:
//! - Settings storage shared between the engine and its front ends
//! - Weather providers (Open-Meteo, OpenWeather) behind one back-end trait
//! - IP geolocation with a small file cache
//! - The refresh timer and the engine task that ties it all together
//!
//! It is used by `weather-cli`, but can also be embedded in other front ends.

pub mod condition;
pub mod engine;
pub mod error;
pub mod geo_cache;
pub mod location;
pub mod notify;
pub mod provider;
pub mod scheduler;
pub mod settings;
pub mod transport;

#[cfg(test)]
mod testing;

pub use condition::{Condition, SpeedUnit, UnitSystem, UpdateFormat, WeatherSnapshot};
pub use engine::{Engine, EngineEvent, EngineHandle, EngineOptions};
pub use error::{ConfigError, EngineError, ParseError, TransportError};
pub use location::{GeoLocation, GeoLocationCompleted};
pub use notify::{Notification, NotificationKind, Notifier};
pub use provider::{Endpoints, ProviderId, RefreshCompleted, WeatherBackend, WeatherProvider};
pub use settings::{RefreshInterval, Settings, SettingsStore};
pub use transport::{HttpFetch, ReqwestFetch};
