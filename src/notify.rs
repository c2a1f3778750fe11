//! Fire-and-forget plan notifications.
//!
//! Sinks never influence plan state: a failing sink is logged and skipped.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::plan::{PlanId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Suspended,
    ReArmed,
    ReAnchored,
    Executed,
    Expired,
    Cancelled,
    Evicted,
    Overload,
    StoreOutage,
    FillConflict,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Suspended => "suspended",
            NotificationKind::ReArmed => "re_armed",
            NotificationKind::ReAnchored => "re_anchored",
            NotificationKind::Executed => "executed",
            NotificationKind::Expired => "expired",
            NotificationKind::Cancelled => "cancelled",
            NotificationKind::Evicted => "evicted",
            NotificationKind::Overload => "overload",
            NotificationKind::StoreOutage => "store_outage",
            NotificationKind::FillConflict => "fill_conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    /// None for loop-wide events.
    pub plan_id: Option<PlanId>,
    pub symbol: Option<String>,
    pub detail: String,
    pub ts: Timestamp,
}

impl Notification {
    pub fn plan(kind: NotificationKind, plan_id: PlanId, symbol: &str, detail: impl Into<String>, ts: Timestamp) -> Self {
        Self {
            kind,
            plan_id: Some(plan_id),
            symbol: Some(symbol.to_string()),
            detail: detail.into(),
            ts,
        }
    }

    pub fn system(kind: NotificationKind, detail: impl Into<String>, ts: Timestamp) -> Self {
        Self {
            kind,
            plan_id: None,
            symbol: None,
            detail: detail.into(),
            ts,
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications into the structured event log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, n: &Notification) -> Result<()> {
        let level = match n.kind {
            NotificationKind::Overload | NotificationKind::StoreOutage | NotificationKind::FillConflict => Level::Error,
            _ => Level::Info,
        };
        let mut fields = obj(&[("kind", v_str(n.kind.as_str())), ("detail", v_str(&n.detail))]);
        if let Some(id) = n.plan_id {
            fields.insert("plan_id".to_string(), json!(id));
        }
        if let Some(symbol) = &n.symbol {
            fields.insert("symbol".to_string(), v_str(symbol));
        }
        log(level, Domain::Notify, "notification", fields);
        Ok(())
    }
}

/// Hands notifications to an async consumer. Full or closed channels drop
/// the notification.
pub struct ChannelSink {
    tx: mpsc::Sender<Notification>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn notify(&self, n: &Notification) -> Result<()> {
        self.tx
            .try_send(n.clone())
            .map_err(|e| anyhow!("channel sink: {}", e))
    }
}

#[derive(Clone, Default)]
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn send(&self, notification: Notification) {
        for sink in &self.sinks {
            if let Err(err) = sink.notify(&notification) {
                log(
                    Level::Warn,
                    Domain::Notify,
                    "sink_failed",
                    obj(&[
                        ("sink", v_str(sink.name())),
                        ("kind", v_str(notification.kind.as_str())),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl NotificationSink for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn notify(&self, _n: &Notification) -> Result<()> {
            Err(anyhow!("smtp down"))
        }
    }

    #[test]
    fn test_failing_sink_does_not_block_others() {
        let (sink, mut rx) = ChannelSink::new(4);
        let notifier = Notifier::default()
            .with_sink(Arc::new(Broken))
            .with_sink(Arc::new(sink));
        notifier.send(Notification::plan(NotificationKind::Suspended, 3, "BTCUSDT", "bias_conflict", 10));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.kind, NotificationKind::Suspended);
        assert_eq!(got.plan_id, Some(3));
    }

    #[test]
    fn test_full_channel_drops() {
        let (sink, _rx) = ChannelSink::new(1);
        assert!(sink.notify(&Notification::system(NotificationKind::Overload, "a", 0)).is_ok());
        assert!(sink.notify(&Notification::system(NotificationKind::Overload, "b", 0)).is_err());
    }
}
