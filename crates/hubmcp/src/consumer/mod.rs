//! Inbound update consumer.
//!
//! One sequential loop: fetch a batch strictly after the cursor, dispatch each
//! item in arrival order, advance the cursor past every item that was
//! attempted. Transient fetch failures are retried at the same offset.
//!
//! The cursor also advances past items whose dispatch failed. Such an item
//! gets an error notification and is never fetched again, so delivery is
//! at-most-once per item. An item that cannot be parsed counts as a failed
//! dispatch; it does not hold back the rest of its batch.

pub mod telegram;

pub use telegram::{TelegramClient, Update};

use crate::{ConsumerConfig, HubError};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reply sent to the originating chat when handling a message fails
pub const ERROR_REPLY: &str = "Sorry, I encountered an error processing your message.";

/// An item whose id was readable but whose body was not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedUpdate {
    pub update_id: i64,
    /// Recovered from the raw item when present, for the error reply
    pub chat_id: Option<i64>,
    pub reason: String,
}

/// One fetched item
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Update(Update),
    Malformed(MalformedUpdate),
}

impl Inbound {
    pub fn update_id(&self) -> i64 {
        match self {
            Inbound::Update(update) => update.update_id,
            Inbound::Malformed(item) => item.update_id,
        }
    }

    pub fn chat_id(&self) -> Option<i64> {
        match self {
            Inbound::Update(update) => update.chat_id(),
            Inbound::Malformed(item) => item.chat_id,
        }
    }
}

impl From<Update> for Inbound {
    fn from(update: Update) -> Self {
        Inbound::Update(update)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// First id wanted; `None` until something has been processed
    pub offset: Option<i64>,
    pub limit: u32,
    pub timeout_secs: u64,
}

#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Inbound>, HubError>;
}

/// Handles one inbound item
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, update: &Update) -> anyhow::Result<()>;
}

/// Tells the sender that their item could not be handled
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_error(&self, item: &Inbound) -> Result<(), HubError>;
}

/// Outbound side of the chat channel
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), HubError>;

    /// Transient "typing" hint; callers may ignore the result
    async fn send_typing(&self, chat_id: i64) -> Result<(), HubError>;
}

/// Id of the last attempted update. Never moves backwards.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCursor {
    last_processed: Option<i64>,
}

impl UpdateCursor {
    pub fn last_processed(&self) -> Option<i64> {
        self.last_processed
    }

    pub fn next_offset(&self) -> Option<i64> {
        self.last_processed.map(|id| id + 1)
    }

    fn has_seen(&self, id: i64) -> bool {
        self.last_processed.is_some_and(|last| id <= last)
    }

    fn advance(&mut self, id: i64) {
        if !self.has_seen(id) {
            self.last_processed = Some(id);
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PollReport {
    pub fetched: usize,
    pub dispatched: usize,
    /// Ids whose dispatch failed; they will not be retried
    pub failed: Vec<i64>,
    /// Ids at or below the cursor that the source sent again
    pub skipped: usize,
    pub cursor: Option<i64>,
}

pub struct UpdateConsumer {
    source: Arc<dyn UpdateSource>,
    dispatcher: Arc<dyn Dispatcher>,
    notifier: Arc<dyn Notifier>,
    config: ConsumerConfig,
    cursor: UpdateCursor,
}

impl UpdateConsumer {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        dispatcher: Arc<dyn Dispatcher>,
        notifier: Arc<dyn Notifier>,
        config: ConsumerConfig,
    ) -> Result<Self, HubError> {
        config.validate()?;
        Ok(Self {
            source,
            dispatcher,
            notifier,
            config,
            cursor: UpdateCursor::default(),
        })
    }

    pub fn cursor(&self) -> UpdateCursor {
        self.cursor
    }

    fn retry_strategy(&self) -> ExponentialBuilder {
        let retry = &self.config.retry;
        let builder = ExponentialBuilder::default()
            .with_min_delay(retry.min_delay())
            .with_max_delay(retry.max_delay())
            .with_max_times(retry.max_attempts as usize);

        if retry.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    async fn fetch(&self) -> Result<Vec<Inbound>, HubError> {
        let request = FetchRequest {
            offset: self.cursor.next_offset(),
            limit: self.config.batch_limit,
            timeout_secs: self.config.long_poll_timeout_secs,
        };

        if !self.config.retry.retries_enabled() {
            return self.source.fetch(request).await;
        }

        // Same request on every attempt: the cursor cannot move while fetching
        (|| async { self.source.fetch(request).await })
            .retry(self.retry_strategy())
            .when(|e: &HubError| e.is_retryable())
            .notify(|e: &HubError, delay: Duration| {
                if e.is_timeout() {
                    debug!(error = %e, ?delay, "Fetch timed out, retrying");
                } else {
                    warn!(error = %e, ?delay, "Fetch failed, retrying");
                }
            })
            .await
    }

    /// Fetch one batch and dispatch it
    pub async fn poll_once(&mut self) -> Result<PollReport, HubError> {
        let items = self.fetch().await?;
        Ok(self.process_batch(items).await)
    }

    pub async fn process_batch(&mut self, items: Vec<Inbound>) -> PollReport {
        let mut report = PollReport {
            fetched: items.len(),
            ..Default::default()
        };

        for item in items {
            let id = item.update_id();
            if self.cursor.has_seen(id) {
                debug!(update_id = id, "Skipping already processed update");
                report.skipped += 1;
                continue;
            }

            let outcome = match &item {
                Inbound::Update(update) => self.dispatcher.dispatch(update).await,
                Inbound::Malformed(malformed) => {
                    Err(anyhow::anyhow!("malformed update: {}", malformed.reason))
                }
            };

            match outcome {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    warn!(update_id = id, error = %e, "Dispatch failed");
                    report.failed.push(id);
                    if let Err(e) = self.notifier.notify_error(&item).await {
                        warn!(update_id = id, error = %e, "Error notification not delivered");
                    }
                }
            }

            // At-most-once: advance whether or not dispatch succeeded
            self.cursor.advance(id);
        }

        report.cursor = self.cursor.last_processed();
        report
    }

    /// Poll until cancelled. Only permanent errors (e.g. a rejected token) end the loop early.
    pub async fn run(&mut self, token: CancellationToken) -> Result<(), HubError> {
        info!(
            interval = ?self.config.poll_interval(),
            batch_limit = self.config.batch_limit,
            "Update consumer started"
        );

        while !token.is_cancelled() {
            let pause = match self.poll_once().await {
                Ok(report) => {
                    if report.fetched > 0 {
                        info!(
                            fetched = report.fetched,
                            dispatched = report.dispatched,
                            failed = report.failed.len(),
                            cursor = ?report.cursor,
                            "Processed updates"
                        );
                    }
                    self.config.poll_interval()
                }
                Err(e) if e.is_permanent() => {
                    error!(error = %e, "Update consumer cannot continue");
                    return Err(e);
                }
                Err(e) => {
                    if e.is_timeout() {
                        debug!(error = %e, "Polling timed out");
                    } else {
                        warn!(error = %e, "Polling failed");
                    }
                    self.config.retry.max_delay().max(self.config.poll_interval())
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(cursor = ?self.cursor.last_processed(), "Update consumer stopped");
        Ok(())
    }
}
