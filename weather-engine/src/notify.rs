//! User-facing notifications the engine raises. Delivery is up to the
//! embedding application.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Information,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub content: String,
    /// Clicking the notification should open the forecast view.
    pub open_forecast_on_click: bool,
}

impl Notification {
    pub fn information(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Information,
            title: title.into(),
            content: content.into(),
            open_forecast_on_click: false,
        }
    }

    pub fn error(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Error,
            title: title.into(),
            content: content.into(),
            open_forecast_on_click: false,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

impl<F> Notifier for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn notify(&self, notification: &Notification) {
        self(notification)
    }
}
