//! The engine task: owns the providers and the refresh timer, reacts to
//! commands from collaborators and to transport completions.

use std::{path::PathBuf, sync::Arc};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot, watch,
};

use crate::{
    condition::WeatherSnapshot,
    error::{ConfigError, EngineError, ParseError},
    geo_cache::GeoCache,
    location::{GeoLocation, GeoLocationCompleted, GeoReply, LocationProvider, RunOutcome},
    notify::{Notification, Notifier},
    provider::{
        Endpoints, RefreshCompleted, UrlChange, WeatherProvider, WeatherReply, backend_for,
    },
    scheduler::{ScheduleOutcome, Scheduler, SchedulerTick},
    settings::SettingsStore,
    transport::{HttpFetch, ReqwestFetch},
};

/// What collaborators hear about.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RefreshCompleted(RefreshCompleted),
    GeoLocationCompleted(GeoLocationCompleted),
    /// The settings cannot produce a usable request. Sent once per change
    /// of the problem, not on every refresh.
    NotConfigured(ConfigError),
    AutoRefreshDisabled(EngineError),
}

pub struct EngineOptions {
    pub endpoints: Endpoints,
    pub fetch: Arc<dyn HttpFetch>,
    /// Defaults to the platform cache directory.
    pub geo_cache_path: Option<PathBuf>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            fetch: Arc::new(ReqwestFetch::new()),
            geo_cache_path: None,
            notifier: None,
        }
    }
}

impl EngineOptions {
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_fetch(mut self, fetch: Arc<dyn HttpFetch>) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_geo_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.geo_cache_path = Some(path.into());
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

#[derive(Debug)]
enum Command {
    ForceRefresh,
    SettingsChanged { refresh: bool },
    ForceGeolocation,
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable access to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: UnboundedSender<Command>,
    snapshot: watch::Receiver<Option<Arc<WeatherSnapshot>>>,
    settings: SettingsStore,
}

impl EngineHandle {
    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::Stopped)
    }

    /// Refresh now, starting the timer first if it is not running.
    pub fn force_refresh(&self) -> Result<(), EngineError> {
        self.send(Command::ForceRefresh)
    }

    /// Re-read the settings, rebuild the request and reschedule.
    pub fn settings_changed(&self) -> Result<(), EngineError> {
        self.send(Command::SettingsChanged { refresh: true })
    }

    /// For display-only changes that do not affect requests.
    pub fn settings_changed_without_refresh(&self) -> Result<(), EngineError> {
        self.send(Command::SettingsChanged { refresh: false })
    }

    /// Look the location up again, bypassing the cache.
    pub fn force_geolocation(&self) -> Result<(), EngineError> {
        self.send(Command::ForceGeolocation)
    }

    /// Latest successful refresh.
    pub fn snapshot(&self) -> Option<Arc<WeatherSnapshot>> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<WeatherSnapshot>>> {
        self.snapshot.clone()
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Stops requests and the timer, saves dirty settings, and waits for
    /// the engine task to finish.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (done, finished) = oneshot::channel();
        self.send(Command::Shutdown(done))?;
        finished.await.map_err(|_| EngineError::Stopped)
    }
}

struct Inbox {
    commands: UnboundedReceiver<Command>,
    weather: UnboundedReceiver<WeatherReply>,
    geo: UnboundedReceiver<GeoReply>,
    ticks: UnboundedReceiver<SchedulerTick>,
}

pub struct Engine {
    settings: SettingsStore,
    endpoints: Endpoints,
    fetch: Arc<dyn HttpFetch>,
    geo_cache_path: PathBuf,
    notifier: Option<Arc<dyn Notifier>>,
    weather: WeatherProvider,
    location: Option<LocationProvider>,
    scheduler: Scheduler,
    weather_tx: UnboundedSender<WeatherReply>,
    geo_tx: UnboundedSender<GeoReply>,
    events: UnboundedSender<EngineEvent>,
    snapshot_tx: watch::Sender<Option<Arc<WeatherSnapshot>>>,
    url_error: Option<ConfigError>,
    config_problem: Option<ConfigError>,
}

impl Engine {
    /// Spawns the engine on the current tokio runtime. It builds the request,
    /// starts the timer and does a first lookup or refresh right away.
    pub fn start(
        settings: SettingsStore,
        options: EngineOptions,
    ) -> Result<(EngineHandle, UnboundedReceiver<EngineEvent>), EngineError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::NoRuntime(e.to_string()))?;

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (weather_tx, weather) = mpsc::unbounded_channel();
        let (geo_tx, geo) = mpsc::unbounded_channel();
        let (tick_tx, ticks) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(None);

        let geo_cache_path = match options.geo_cache_path {
            Some(path) => path,
            None => GeoCache::default_path().unwrap_or_else(|e| {
                tracing::warn!("{:#}; keeping the geolocation cache in the temp dir", e);
                std::env::temp_dir().join("weather-geolocation.json")
            }),
        };

        let provider = settings.lock().provider();
        let weather_provider = WeatherProvider::new(
            backend_for(provider, &options.endpoints),
            options.fetch.clone(),
            weather_tx.clone(),
        );

        let engine = Engine {
            settings: settings.clone(),
            endpoints: options.endpoints,
            fetch: options.fetch,
            geo_cache_path,
            notifier: options.notifier,
            weather: weather_provider,
            location: None,
            scheduler: Scheduler::new(tick_tx),
            weather_tx,
            geo_tx,
            events,
            snapshot_tx,
            url_error: None,
            config_problem: None,
        };

        runtime.spawn(engine.run(Inbox {
            commands,
            weather,
            geo,
            ticks,
        }));

        let handle = EngineHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            settings,
        };
        Ok((handle, events_rx))
    }

    async fn run(mut self, mut inbox: Inbox) {
        self.start_up();

        loop {
            tokio::select! {
                command = inbox.commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.shut_down();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shut_down();
                        break;
                    }
                },
                Some(reply) = inbox.weather.recv() => self.on_weather_reply(reply),
                Some(reply) = inbox.geo.recv() => self.on_geo_reply(reply),
                Some(tick) = inbox.ticks.recv() => self.on_tick(tick),
            }
        }

        tracing::debug!("engine stopped");
    }

    fn start_up(&mut self) {
        tracing::info!(provider = %self.weather.id(), "engine starting");
        self.rebuild_url();
        self.reschedule(false);

        let geolocation = self.settings.lock().geolocation_enabled();
        if geolocation {
            // the lookup's completion triggers the first refresh
            self.ensure_location_provider();
            self.run_geolocation(false);
        } else {
            self.force_refresh();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ForceRefresh => self.force_refresh(),
            Command::SettingsChanged { refresh } => self.settings_changed(refresh),
            Command::ForceGeolocation => self.run_geolocation(true),
            Command::Shutdown(_) => {}
        }
    }

    fn settings_changed(&mut self, refresh: bool) {
        if !refresh {
            tracing::debug!("settings changed; request unaffected");
            return;
        }

        let (provider, geolocation, expiry) = {
            let settings = self.settings.lock();
            (
                settings.provider(),
                settings.geolocation_enabled(),
                settings.geo_cache_expiry(),
            )
        };

        let mut switched = false;
        if provider != self.weather.id() {
            tracing::info!(from = %self.weather.id(), to = %provider, "switching weather provider");
            self.weather.stop();
            self.weather = WeatherProvider::new(
                backend_for(provider, &self.endpoints),
                self.fetch.clone(),
                self.weather_tx.clone(),
            );
            switched = true;
        }

        let mut lookup = false;
        match (geolocation, self.location.is_some()) {
            (true, false) => {
                self.ensure_location_provider();
                lookup = true;
            }
            (false, true) => {
                if let Some(mut location) = self.location.take() {
                    location.stop();
                }
                tracing::debug!("geolocation disabled");
            }
            _ => {}
        }
        if let Some(location) = self.location.as_mut() {
            location.set_cache_expiry(expiry);
        }

        let url_started = self.rebuild_url();
        let timer_started = self.reschedule(true);
        if switched && !url_started && !timer_started {
            self.refresh_weather();
        }

        if lookup {
            self.run_geolocation(false);
        }
    }

    /// Returns whether the rebuild started a refresh on its own.
    fn rebuild_url(&mut self) -> bool {
        let params = self.settings.lock().request_params();
        match self.weather.rebuild_request_url(&params) {
            Ok(UrlChange::Replaced { refresh_started }) => {
                self.url_error = None;
                refresh_started
            }
            Ok(UrlChange::Unchanged) => {
                self.url_error = None;
                self.publish_held_snapshot();
                false
            }
            Err(EngineError::Config(err)) => {
                self.url_error = Some(err);
                false
            }
            Err(err) => {
                tracing::warn!("refresh after request change did not start: {}", err);
                false
            }
        }
    }

    /// Republishes the provider's snapshot if it was replaced without a
    /// refresh, e.g. a shorter forecast on the same URL.
    fn publish_held_snapshot(&self) {
        let Some(snapshot) = self.weather.snapshot() else {
            return;
        };
        self.snapshot_tx.send_if_modified(|held| {
            if held.as_ref().is_some_and(|h| Arc::ptr_eq(h, &snapshot)) {
                return false;
            }
            *held = Some(snapshot);
            true
        });
    }

    /// Brings the timer in line with the settings. Returns whether a refresh
    /// was started because the timer was newly created.
    fn reschedule(&mut self, refresh_on_start: bool) -> bool {
        if let Some(err) = self.url_error.clone() {
            // without a request URL every tick would only repeat the failure
            self.scheduler.cancel();
            self.update_config_problem(Some(err));
            return false;
        }

        let input = self.settings.lock().schedule_input();

        let mut started = false;
        let schedule_problem = match self.scheduler.check_and_reschedule(&input) {
            Ok(ScheduleOutcome::NotConfigured(err)) => Some(err),
            Ok(ScheduleOutcome::Started) => {
                started = true;
                None
            }
            Ok(outcome) => {
                tracing::debug!(?outcome, "schedule checked");
                None
            }
            Err(EngineError::Config(err)) => Some(err),
            Err(err) => {
                self.auto_refresh_disabled(err);
                None
            }
        };

        self.update_config_problem(schedule_problem);

        // switched manual -> automatic, or a credential was just entered
        if started && refresh_on_start {
            self.refresh_weather();
            return true;
        }
        false
    }

    fn update_config_problem(&mut self, problem: Option<ConfigError>) {
        if problem == self.config_problem {
            return;
        }

        match &problem {
            Some(err) => {
                tracing::warn!("weather source not configured: {}", err);
                self.emit(EngineEvent::NotConfigured(err.clone()));
            }
            None => tracing::info!("weather source configuration is usable again"),
        }
        self.config_problem = problem;
    }

    fn auto_refresh_disabled(&mut self, err: EngineError) {
        tracing::warn!("automatic refresh disabled: {}", err);
        self.notify(Notification::error(
            "Automatic refresh disabled",
            err.to_string(),
        ));
        self.emit(EngineEvent::AutoRefreshDisabled(err));
    }

    fn force_refresh(&mut self) {
        // the timer may not exist yet, e.g. before a credential was entered
        if !self.scheduler.has_timer() && self.reschedule(true) {
            return;
        }
        self.refresh_weather();
    }

    fn refresh_weather(&mut self) {
        match self.weather.refresh() {
            Ok(id) => tracing::debug!(?id, "refresh requested"),
            Err(EngineError::AlreadyInFlight) => {
                tracing::debug!("refresh already in flight; request dropped")
            }
            Err(EngineError::NoRequestUrl) => {
                let err = self
                    .url_error
                    .clone()
                    .map(EngineError::from)
                    .unwrap_or(EngineError::NoRequestUrl);
                tracing::warn!("cannot refresh: {}", err);
                self.emit(EngineEvent::RefreshCompleted(RefreshCompleted::not_started(
                    err,
                )));
            }
            Err(err) => {
                tracing::warn!("cannot refresh: {}", err);
                self.emit(EngineEvent::RefreshCompleted(RefreshCompleted::not_started(
                    err,
                )));
            }
        }
    }

    fn on_tick(&mut self, tick: SchedulerTick) {
        if !self.scheduler.is_current(tick) {
            tracing::debug!(?tick, "ignoring tick from a cancelled timer");
            return;
        }
        self.refresh_weather();
    }

    fn on_weather_reply(&mut self, reply: WeatherReply) {
        let Some(done) = self.weather.handle_reply(reply) else {
            return;
        };

        match &done.outcome {
            Ok(snapshot) => {
                self.snapshot_tx.send_replace(Some(snapshot.clone()));
                self.notify_refresh(snapshot);
            }
            Err(err) if err.is_parse_error() => self.notify(Notification::error(
                "Json Parse Error",
                "There was an error parsing the returned weather data!",
            )),
            Err(_) => self.notify(Notification::error(
                "Weather Refresh Error",
                done.status_text.clone(),
            )),
        }

        self.emit(EngineEvent::RefreshCompleted(done));
    }

    fn notify_refresh(&self, snapshot: &WeatherSnapshot) {
        let (enabled, on_click, location) = {
            let settings = self.settings.lock();
            (
                settings.notify_on_refresh(),
                settings.notification_click(),
                settings.location_name().to_string(),
            )
        };
        if !enabled {
            return;
        }

        let temperature = snapshot
            .current
            .rounded_temperature(false)
            .map(|t| format!("{t}°"))
            .unwrap_or_else(|| "--".to_string());
        let mut notification = Notification::information(
            "Weather Refresh Complete",
            format!(
                "{location}\n\n{}\n\n{temperature}",
                snapshot.current.forecast
            ),
        );
        notification.open_forecast_on_click = on_click;
        self.notify(notification);
    }

    fn ensure_location_provider(&mut self) {
        if self.location.is_some() {
            return;
        }
        let expiry = self.settings.lock().geo_cache_expiry();
        self.location = Some(LocationProvider::new(
            self.settings.clone(),
            GeoCache::new(self.geo_cache_path.clone(), expiry),
            self.fetch.clone(),
            self.endpoints.geolocation.clone(),
            self.geo_tx.clone(),
        ));
    }

    fn run_geolocation(&mut self, force: bool) {
        let Some(location) = self.location.as_mut() else {
            tracing::debug!("geolocation is disabled; lookup skipped");
            return;
        };

        match location.run(force) {
            Ok(RunOutcome::Cached(found)) => {
                self.on_geolocation(GeoLocationCompleted::from_cache(found))
            }
            Ok(RunOutcome::Fetching(id)) => tracing::debug!(?id, "geolocation requested"),
            Err(EngineError::AlreadyInFlight) => {
                tracing::debug!("geolocation already in flight; request dropped")
            }
            Err(err) => {
                tracing::warn!("geolocation lookup did not start: {}", err);
                self.on_geolocation(GeoLocationCompleted {
                    status: 0,
                    status_text: err.to_string(),
                    cached: false,
                    outcome: Err(err),
                });
            }
        }
    }

    fn on_geo_reply(&mut self, reply: GeoReply) {
        let Some(done) = self
            .location
            .as_mut()
            .and_then(|location| location.handle_reply(reply))
        else {
            return;
        };
        self.on_geolocation(done);
    }

    fn on_geolocation(&mut self, done: GeoLocationCompleted) {
        self.emit(EngineEvent::GeoLocationCompleted(done.clone()));

        match done.outcome {
            Ok(found) => {
                self.notify_geolocation(&found, done.cached);
                let started = self.rebuild_url();
                self.reschedule(false);
                if !started {
                    self.force_refresh();
                }
            }
            Err(err) => {
                let notification = match &err {
                    EngineError::Parse(ParseError::Rejected(message)) => Notification::error(
                        "GeoLocation Lookup Error",
                        format!("GeoLocation Error: {message}"),
                    ),
                    err if err.is_parse_error() => Notification::error(
                        "GeoLocation Json Parse Error",
                        "There was an error parsing the returned location data!",
                    ),
                    _ => Notification::error(
                        "GeoLocation Lookup Error",
                        format!("GeoLocation Error: {}", done.status_text),
                    ),
                };
                self.notify(notification);

                // still show weather for the stored location on first run
                if self.weather.snapshot().is_none() {
                    self.force_refresh();
                }
            }
        }
    }

    fn notify_geolocation(&self, found: &GeoLocation, cached: bool) {
        let (enabled, location) = {
            let settings = self.settings.lock();
            (
                settings.notify_on_geolocation(),
                settings.location_name().to_string(),
            )
        };
        if !enabled {
            return;
        }

        let name = found.name.clone().unwrap_or(location);
        let mut content = format!(
            "{name}\n\nLatitude: {:.4}\n\nLongitude: {:.4}",
            found.latitude, found.longitude
        );
        if cached {
            content.push_str("\n\n(using cached location)");
        }
        self.notify(Notification::information(
            "GeoLocation Refresh Complete",
            content,
        ));
    }

    fn shut_down(&mut self) {
        tracing::debug!("engine shutting down");
        self.weather.stop();
        if let Some(location) = self.location.as_mut() {
            location.stop();
        }
        self.scheduler.cancel();

        match self.settings.save_if_dirty() {
            Ok(true) => tracing::debug!("settings saved on shutdown"),
            Ok(false) => {}
            Err(e) => tracing::warn!("failed to save settings: {:#}", e),
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn notify(&self, notification: Notification) {
        tracing::debug!(title = %notification.title, "notification");
        if let Some(notifier) = &self.notifier {
            notifier.notify(&notification);
        }
    }
}
