//! Feed event ingestion.
//!
//! Providers push [`FeedEvent`]s into one channel. The ingest loop tracks
//! connectivity per provider and hands every tick to the executor.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::lifecycle::LifecycleHandle;
use crate::models::RawRate;
use crate::pipeline::PipelineExecutor;

/// Everything a provider connection can report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum FeedEvent {
    Connected { provider: String },
    Disconnected { provider: String, reason: String },
    Tick(RawRate),
    Status { provider: String, message: String },
    Error { provider: String, message: String },
}

impl FeedEvent {
    pub fn provider(&self) -> &str {
        match self {
            Self::Connected { provider }
            | Self::Disconnected { provider, .. }
            | Self::Status { provider, .. }
            | Self::Error { provider, .. } => provider,
            Self::Tick(rate) => &rate.provider,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Last known state of one provider.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub state: ConnectionState,
    pub since: DateTime<Utc>,
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub last_error: Option<String>,
}

impl ProviderStatus {
    fn new(state: ConnectionState) -> Self {
        Self {
            state,
            since: Utc::now(),
            ticks: 0,
            last_tick_at: None,
            last_message: None,
            last_error: None,
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.since = Utc::now();
        }
    }
}

/// Per-provider connectivity, updated from feed events.
#[derive(Debug, Default)]
pub struct ProviderTracker {
    providers: DashMap<String, ProviderStatus>,
}

impl ProviderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &FeedEvent) {
        let provider = event.provider().to_string();
        match event {
            FeedEvent::Connected { .. } => {
                self.entry(provider, ConnectionState::Connected)
                    .set_state(ConnectionState::Connected);
            }
            FeedEvent::Disconnected { reason, .. } => {
                let mut status = self.entry(provider, ConnectionState::Disconnected);
                status.set_state(ConnectionState::Disconnected);
                status.last_message = Some(reason.clone());
            }
            FeedEvent::Tick(rate) => {
                // A tick implies a live connection
                let mut status = self.entry(provider, ConnectionState::Connected);
                status.set_state(ConnectionState::Connected);
                status.ticks += 1;
                status.last_tick_at = Some(rate.received_at);
            }
            FeedEvent::Status { message, .. } => {
                self.entry(provider, ConnectionState::Connected).last_message = Some(message.clone());
            }
            FeedEvent::Error { message, .. } => {
                self.entry(provider, ConnectionState::Connected).last_error = Some(message.clone());
            }
        }
    }

    fn entry(
        &self,
        provider: String,
        initial: ConnectionState,
    ) -> dashmap::mapref::one::RefMut<'_, String, ProviderStatus> {
        self.providers
            .entry(provider)
            .or_insert_with(|| ProviderStatus::new(initial))
    }

    pub fn get(&self, provider: &str) -> Option<ProviderStatus> {
        self.providers.get(provider).map(|status| status.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, ProviderStatus> {
        self.providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.providers
            .iter()
            .filter(|entry| entry.state == ConnectionState::Connected)
            .count()
    }
}

/// Routes feed events to the provider tracker and the executor.
pub struct Ingestor {
    executor: Arc<PipelineExecutor>,
    providers: Arc<ProviderTracker>,
}

impl Ingestor {
    pub fn new(executor: Arc<PipelineExecutor>, providers: Arc<ProviderTracker>) -> Self {
        Self { executor, providers }
    }

    /// Handle one event. Returns `false` once the executor stops accepting
    /// work.
    pub async fn handle(&self, event: FeedEvent) -> bool {
        self.providers.record(&event);
        match event {
            FeedEvent::Tick(rate) => {
                if let Err(e) = self.executor.submit(rate).await {
                    warn!(error = %e, "Tick dropped");
                    return false;
                }
            }
            FeedEvent::Connected { provider } => info!(provider = %provider, "Provider connected"),
            FeedEvent::Disconnected { provider, reason } => {
                warn!(provider = %provider, reason = %reason, "Provider disconnected")
            }
            FeedEvent::Status { provider, message } => {
                debug!(provider = %provider, message = %message, "Provider status")
            }
            FeedEvent::Error { provider, message } => {
                warn!(provider = %provider, message = %message, "Provider error")
            }
        }
        true
    }

    /// Consume events until the channel closes, the executor closes or the
    /// lifecycle leaves `Running`. On shutdown, events already queued are
    /// still processed.
    pub async fn run(self, mut rx: mpsc::Receiver<FeedEvent>, mut lifecycle: LifecycleHandle) {
        info!("Ingest loop started");
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        debug!("Feed channel closed");
                        break;
                    };
                    if !self.handle(event).await {
                        break;
                    }
                }
                _ = lifecycle.stopping() => {
                    // Refuse new events but finish the ones already queued
                    rx.close();
                    let mut drained = 0usize;
                    while let Some(event) = rx.recv().await {
                        drained += 1;
                        if !self.handle(event).await {
                            break;
                        }
                    }
                    debug!(drained, "Feed channel drained");
                    break;
                }
            }
        }
        info!("Ingest loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(provider: &str) -> FeedEvent {
        FeedEvent::Tick(RawRate::new(
            provider,
            format!("{}_USDTRY", provider),
            dec!(34.0),
            dec!(34.1),
            Utc::now(),
        ))
    }

    #[test]
    fn test_tracker_connect_disconnect() {
        let tracker = ProviderTracker::new();
        tracker.record(&FeedEvent::Connected {
            provider: "PF1".to_string(),
        });
        assert_eq!(tracker.get("PF1").unwrap().state, ConnectionState::Connected);
        assert_eq!(tracker.connected_count(), 1);

        tracker.record(&FeedEvent::Disconnected {
            provider: "PF1".to_string(),
            reason: "socket reset".to_string(),
        });
        let status = tracker.get("PF1").unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.last_message.as_deref(), Some("socket reset"));
        assert_eq!(tracker.connected_count(), 0);
    }

    #[test]
    fn test_tracker_counts_ticks() {
        let tracker = ProviderTracker::new();
        tracker.record(&tick("PF2"));
        tracker.record(&tick("PF2"));
        tracker.record(&FeedEvent::Error {
            provider: "PF2".to_string(),
            message: "bad frame".to_string(),
        });

        let status = tracker.get("PF2").unwrap();
        assert_eq!(status.ticks, 2);
        assert!(status.last_tick_at.is_some());
        assert_eq!(status.last_error.as_deref(), Some("bad frame"));
        assert_eq!(tracker.snapshot().len(), 1);
    }

    #[test]
    fn test_event_json_shape() {
        let json = r#"{"event":"disconnected","provider":"PF1","reason":"eof"}"#;
        let event: FeedEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.provider(), "PF1");

        let tick: FeedEvent = serde_json::from_str(
            r#"{"event":"tick","symbol":"PF1_USDTRY","provider":"PF1",
                "bid":"34.0","ask":"34.1","timestamp":"2026-01-05T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(tick, FeedEvent::Tick(ref rate) if rate.symbol == "PF1_USDTRY"));
    }
}
