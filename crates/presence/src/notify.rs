//! User-facing result notifications.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use zbus::zvariant::Value;

const APP_NAME: &str = "presence";
const EXPIRE_DEFAULT: i32 = -1;
const URGENCY_NORMAL: u8 = 1;
const URGENCY_CRITICAL: u8 = 2;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub description: String,
}

impl Notification {
    pub fn success(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Success,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Error,
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Fire-and-forget sink. Delivery failures are logged, never returned.
///
/// Sinks that deliver in the background must finish every accepted
/// notification in [`flush`](Notifier::flush); callers flush before the
/// runtime shuts down.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);

    async fn flush(&self) {}
}

/// Background notification sends that can be awaited as a group.
#[derive(Clone, Default)]
pub struct PendingSends {
    tracker: TaskTracker,
}

impl PendingSends {
    pub fn spawn<F>(&self, send: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(send);
    }

    /// Sends spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `timeout` for every send spawned so far. Returns `false`
    /// if some were still running; those are left to the runtime.
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        self.tracker.reopen();

        if !drained {
            tracing::warn!(
                pending = self.in_flight(),
                timeout_ms = timeout.as_millis() as u64,
                "notifications still pending at flush"
            );
        }
        drained
    }
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        match n.kind {
            NotificationKind::Success => {
                tracing::info!(title = %n.title, "{}", n.description)
            }
            NotificationKind::Error => {
                tracing::warn!(title = %n.title, "{}", n.description)
            }
        }
    }
}

#[zbus::proxy(
    interface = "org.freedesktop.Notifications",
    default_service = "org.freedesktop.Notifications",
    default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
    #[allow(clippy::too_many_arguments)]
    async fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        app_icon: &str,
        summary: &str,
        body: &str,
        actions: &[&str],
        hints: HashMap<&str, Value<'_>>,
        expire_timeout: i32,
    ) -> zbus::Result<u32>;
}

/// Desktop notifications over the session bus.
///
/// Each notification is sent from a tracked task; must be used inside a
/// tokio runtime, and flushed before it shuts down.
#[derive(Clone)]
pub struct DesktopNotifier {
    proxy: NotificationsProxy<'static>,
    pending: PendingSends,
}

impl DesktopNotifier {
    pub async fn connect() -> zbus::Result<Self> {
        let conn = zbus::Connection::session().await?;
        let proxy = NotificationsProxy::new(&conn).await?;
        Ok(Self {
            proxy,
            pending: PendingSends::default(),
        })
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    fn notify(&self, n: Notification) {
        let proxy = self.proxy.clone();
        self.pending.spawn(async move {
            let urgency = match n.kind {
                NotificationKind::Success => URGENCY_NORMAL,
                NotificationKind::Error => URGENCY_CRITICAL,
            };
            let icon = match n.kind {
                NotificationKind::Success => "emblem-ok-symbolic",
                NotificationKind::Error => "dialog-error-symbolic",
            };
            let mut hints = HashMap::new();
            hints.insert("urgency", Value::from(urgency));

            if let Err(e) = proxy
                .notify(APP_NAME, 0, icon, &n.title, &n.description, &[], hints, EXPIRE_DEFAULT)
                .await
            {
                tracing::warn!(error = %e, title = %n.title, "desktop notification failed");
            }
        });
    }

    async fn flush(&self) {
        self.pending.flush(FLUSH_TIMEOUT).await;
    }
}
