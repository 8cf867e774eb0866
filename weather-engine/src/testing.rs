//! In-process fakes for the transport seam.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    error::TransportError,
    notify::{Notification, Notifier},
    transport::{HttpFetch, RawResponse},
};

/// Answers every GET with the same response and records the URLs.
#[derive(Debug)]
pub struct StaticFetch {
    status: u16,
    body: String,
    urls: Mutex<Vec<String>>,
}

impl StaticFetch {
    pub fn ok(body: impl Into<String>) -> Arc<Self> {
        Self::with_status(200, body)
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            status,
            body: body.into(),
            urls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.urls.lock().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl HttpFetch for StaticFetch {
    async fn get(&self, url: &str) -> Result<RawResponse, TransportError> {
        self.urls.lock().push(url.to_string());
        Ok(RawResponse {
            status: self.status,
            status_text: if self.status == 200 { "OK" } else { "Error" }.to_string(),
            body: self.body.clone(),
        })
    }
}

/// Never completes.
#[derive(Debug, Default)]
pub struct PendingFetch {
    calls: AtomicUsize,
}

impl PendingFetch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpFetch for PendingFetch {
    async fn get(&self, _url: &str) -> Result<RawResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Answers by the first route whose fragment the URL contains; 404 otherwise.
#[derive(Debug, Default)]
pub struct RouteFetch {
    routes: Vec<(String, u16, String)>,
    urls: Mutex<Vec<String>>,
}

impl RouteFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, fragment: &str, status: u16, body: impl Into<String>) -> Self {
        self.routes.push((fragment.to_string(), status, body.into()));
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn urls_containing(&self, fragment: &str) -> Vec<String> {
        self.urls
            .lock()
            .iter()
            .filter(|url| url.contains(fragment))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpFetch for RouteFetch {
    async fn get(&self, url: &str) -> Result<RawResponse, TransportError> {
        self.urls.lock().push(url.to_string());
        let (status, body) = self
            .routes
            .iter()
            .find(|(fragment, _, _)| url.contains(fragment.as_str()))
            .map(|(_, status, body)| (*status, body.clone()))
            .unwrap_or((404, String::new()));
        Ok(RawResponse {
            status,
            status_text: if status == 200 { "OK" } else { "Error" }.to_string(),
            body,
        })
    }
}

/// Keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn titles(&self) -> Vec<String> {
        self.seen.lock().iter().map(|n| n.title.clone()).collect()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        self.seen.lock().push(notification.clone());
    }
}
