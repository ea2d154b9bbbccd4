//! Rate sink trait and implementations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::batch::RateBatch;
use crate::errors::SinkError;
use crate::models::{DerivedRate, Rate};

/// A message leaving the engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "message", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SinkMessage {
    /// A single raw or calculated rate, published as soon as it is final.
    Rate(Rate),
    /// Everything one pipeline run produced.
    Batch(RateBatch),
}

/// Downstream destination for finished rates.
///
/// Implementations wrap the transport (message bus, socket, file). The
/// engine calls `publish` through a circuit breaker with a timeout and
/// never lets a failure here stop a pipeline run.
#[async_trait]
pub trait RateSink: Send + Sync {
    async fn publish(&self, message: SinkMessage) -> Result<(), SinkError>;
}

/// Discards every message.
#[derive(Clone, Default)]
pub struct NoOpRateSink;

#[async_trait]
impl RateSink for NoOpRateSink {
    async fn publish(&self, _message: SinkMessage) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Forwards messages into a tokio channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SinkMessage>,
}

impl ChannelSink {
    /// Create a sink and the receiver draining it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RateSink for ChannelSink {
    async fn publish(&self, message: SinkMessage) -> Result<(), SinkError> {
        self.tx.send(message).await.map_err(|_| SinkError::Closed)
    }
}

/// Mock sink for testing - collects published messages.
#[derive(Clone, Default)]
pub struct MockRateSink {
    messages: Arc<Mutex<Vec<SinkMessage>>>,
    failing: Arc<AtomicBool>,
}

impl MockRateSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SinkMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make subsequent publishes fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<SinkMessage> {
        self.lock().clone()
    }

    /// Individually published rates.
    pub fn rates(&self) -> Vec<Rate> {
        self.lock()
            .iter()
            .filter_map(|m| match m {
                SinkMessage::Rate(rate) => Some(rate.clone()),
                SinkMessage::Batch(_) => None,
            })
            .collect()
    }

    /// Individually published calculated rates for `symbol`.
    pub fn calculated(&self, symbol: &str) -> Vec<DerivedRate> {
        self.rates()
            .into_iter()
            .filter_map(|rate| match rate {
                Rate::Calculated(derived) if derived.symbol == symbol => Some(derived),
                _ => None,
            })
            .collect()
    }

    pub fn batches(&self) -> Vec<RateBatch> {
        self.lock()
            .iter()
            .filter_map(|m| match m {
                SinkMessage::Batch(batch) => Some(batch.clone()),
                SinkMessage::Rate(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl RateSink for MockRateSink {
    async fn publish(&self, message: SinkMessage) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Delivery("mock failure".into()));
        }
        self.lock().push(message);
        Ok(())
    }
}
