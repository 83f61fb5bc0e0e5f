//! Snapshot Sampler
//!
//! Polls the REST quote endpoint on a fixed interval, broadcasts the result
//! as a `snapshot_5min` message and appends it to the snapshot log.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{QuoteError, QuoteSource, SnapshotLog, SnapshotLogError};
use crate::application::services::registry::SubscriberRegistry;
use crate::domain::credential::exchange_offset;
use crate::domain::streaming::{RelayMessage, Snapshot};
use crate::infrastructure::metrics;

/// Sampler settings.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Time between samples.
    pub interval: Duration,
    /// Instrument to poll.
    pub stock_code: String,
    /// Offset used to stamp quotes that carry no business date.
    pub day_offset: FixedOffset,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            stock_code: "102110".to_string(),
            day_offset: exchange_offset(),
        }
    }
}

/// Sampler counters for the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplerStats {
    /// Successful samples.
    pub captured: u64,
    /// Failed samples.
    pub failed: u64,
    /// Time of the last successful sample.
    pub last_captured_at: Option<DateTime<Utc>>,
}

/// Periodic quote sampler.
pub struct SnapshotSampler {
    config: SamplerConfig,
    quotes: Option<Arc<dyn QuoteSource>>,
    registry: Arc<SubscriberRegistry>,
    log: Arc<dyn SnapshotLog>,
    captured: AtomicU64,
    failed: AtomicU64,
    last_captured_at: RwLock<Option<DateTime<Utc>>>,
}

impl SnapshotSampler {
    /// Create a sampler. With `quotes == None` every sample is a no-op.
    #[must_use]
    pub fn new(
        config: SamplerConfig,
        quotes: Option<Arc<dyn QuoteSource>>,
        registry: Arc<SubscriberRegistry>,
        log: Arc<dyn SnapshotLog>,
    ) -> Self {
        Self {
            config,
            quotes,
            registry,
            log,
            captured: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_captured_at: RwLock::new(None),
        }
    }

    /// Sample every interval until cancelled. The first sample is taken one
    /// interval after start.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.config.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = period.as_secs(),
            stock_code = %self.config.stock_code,
            "Snapshot sampler started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Snapshot sampler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.sample_once().await {
                        Ok(Some(snapshot)) => {
                            tracing::info!(
                                price = %snapshot.price,
                                change = %snapshot.change,
                                change_percent = %snapshot.change_percent,
                                "Captured snapshot"
                            );
                        }
                        Ok(None) => {
                            tracing::debug!("Skipping snapshot, credentials are not configured");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Snapshot sample failed");
                        }
                    }
                }
            }
        }
    }

    /// Take one sample.
    ///
    /// Returns `Ok(None)` when no quote source is configured.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Quote` when the quote fetch fails and
    /// `SnapshotError::Log` when the append fails. A snapshot that fails to
    /// append has already been broadcast.
    pub async fn sample_once(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let Some(quotes) = &self.quotes else {
            return Ok(None);
        };

        let quote = match quotes.fetch_quote(&self.config.stock_code).await {
            Ok(quote) => quote,
            Err(e) => {
                self.record_failure("quote");
                return Err(e.into());
            }
        };

        let captured_at = Utc::now();
        let fallback_date = captured_at.with_timezone(&self.config.day_offset).date_naive();
        let snapshot = Snapshot::from_quote(quote, captured_at, fallback_date);

        self.registry
            .broadcast(None, &RelayMessage::Snapshot(snapshot.clone()))
            .await;

        if let Err(e) = self.log.append(&snapshot).await {
            self.record_failure("log");
            return Err(e.into());
        }

        self.captured.fetch_add(1, Ordering::Relaxed);
        *self.last_captured_at.write() = Some(captured_at);
        metrics::record_snapshot("success");
        Ok(Some(snapshot))
    }

    fn record_failure(&self, outcome: &'static str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::record_snapshot(outcome);
    }

    /// Whether samples do anything.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.quotes.is_some()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            captured: self.captured.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_captured_at: *self.last_captured_at.read(),
        }
    }
}

impl std::fmt::Debug for SnapshotSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSampler")
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Sampling failed.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Quote fetch failed.
    #[error("quote fetch failed: {0}")]
    Quote(#[from] QuoteError),

    /// Appending to the log failed.
    #[error("snapshot append failed: {0}")]
    Log(#[from] SnapshotLogError),
}
