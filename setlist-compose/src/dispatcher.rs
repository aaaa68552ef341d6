//! Mutation dispatcher
//!
//! Background task that moves a composer's pending mutations to the store
//! and feeds store traffic back into the session:
//!
//! - submits queued mutations, each bounded by the submit timeout
//! - applies change events from the store's stream
//! - checks the store with heartbeats and declares the stream lost after
//!   too many misses, or when the stream lags or closes
//! - while lost, retries a full resync on heartbeat ticks, doubling the
//!   number of ticks between failed attempts up to `resync_backoff_max_ms`
//!
//! All session access goes through the composer, one short turn at a time.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use setlist_common::config::SyncConfig;
use setlist_common::events::ChangeEvent;
use setlist_common::{Error, MutationId, Result, ServiceId};

use crate::composer::Composer;
use crate::store::{execute, BackingStore, EventStream, StoreError, StoreReply, StoreResult};

/// Outcome of one submission
struct Completed {
    mutation: MutationId,
    attempt: u32,
    result: StoreResult<StoreReply>,
}

type InFlight = FuturesUnordered<BoxFuture<'static, Completed>>;

/// Running dispatcher; stopping or dropping it cancels the task
pub struct DispatcherHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Cancel the task and wait for it to release the event stream
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Dispatcher task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct Dispatcher {
    composer: Composer,
    store: Arc<dyn BackingStore>,
    config: SyncConfig,
    service_id: ServiceId,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Subscribe to the store and spawn the dispatch loop
    ///
    /// The event stream is registered before this returns. If subscribing
    /// fails the loop starts in resync mode. Fails only on an invalid config.
    pub async fn start(
        composer: Composer,
        store: Arc<dyn BackingStore>,
        config: SyncConfig,
    ) -> Result<DispatcherHandle> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher {
            service_id: composer.service_id(),
            composer,
            store,
            config,
            cancel: cancel.clone(),
        };

        let events = match dispatcher.open_stream().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(service = %dispatcher.service_id, error = %e, "Could not open event stream");
                dispatcher.composer.mark_connection_lost(&e);
                None
            }
        };

        info!(service = %dispatcher.service_id, "Dispatcher started");
        let task = tokio::spawn(dispatcher.run(events));
        Ok(DispatcherHandle {
            cancel,
            task: Some(task),
        })
    }

    /// Subscribe, then refresh canonical state to cover the gap since connect
    async fn open_stream(&self) -> Result<EventStream> {
        let ctx = self.composer.request_context();
        let opened = async {
            let stream = self.store.subscribe().await?;
            let records = self.store.fetch_entries(&ctx, self.service_id).await?;
            Ok::<_, StoreError>((stream, records))
        };
        let (stream, records) = tokio::time::timeout(self.config.submit_timeout(), opened)
            .await
            .map_err(|_| Error::Timeout)??;
        self.composer.refresh(records);
        Ok(stream)
    }

    async fn run(self, mut events: Option<EventStream>) {
        let wake = self.composer.wake_handle();
        let mut inflight: InFlight = FuturesUnordered::new();

        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut misses = 0u32;

        // Resync backoff, counted in heartbeat ticks
        let max_backoff = (self.config.resync_backoff_max().as_millis() / period.as_millis().max(1))
            .clamp(1, u32::MAX as u128) as u32;
        let mut backoff = 1u32;
        let mut skip_ticks = 0u32;

        self.submit_ready(&mut inflight);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(done) = inflight.next(), if !inflight.is_empty() => {
                    debug!(mutation = %done.mutation, attempt = done.attempt, ok = done.result.is_ok(), "Submission finished");
                    self.composer.complete(done.mutation, done.attempt, done.result);
                    self.submit_ready(&mut inflight);
                }

                received = next_event(&mut events) => match received {
                    Ok(event) => {
                        self.composer.apply_event(event);
                        self.submit_ready(&mut inflight);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(service = %self.service_id, skipped, "Event stream lagged");
                        events = None;
                        self.composer.mark_connection_lost(&Error::ConnectionLost);
                    }
                    Err(RecvError::Closed) => {
                        warn!(service = %self.service_id, "Event stream closed");
                        events = None;
                        self.composer.mark_connection_lost(&Error::ConnectionLost);
                    }
                },

                _ = wake.notified() => self.submit_ready(&mut inflight),

                _ = heartbeat.tick() => {
                    if events.is_some() && self.composer.is_live() {
                        let Some(alive) = self.guarded(self.heartbeat_ok()).await else { break };
                        if alive {
                            misses = 0;
                        } else {
                            misses += 1;
                            debug!(service = %self.service_id, misses, "Heartbeat missed");
                            if misses >= self.config.heartbeat_miss_limit {
                                warn!(service = %self.service_id, misses, "Heartbeat lost");
                                events = None;
                                self.composer.mark_connection_lost(&Error::ConnectionLost);
                            }
                        }
                    } else {
                        // Lost: try to rebuild from a snapshot
                        events = None;
                        self.composer.mark_connection_lost(&Error::ConnectionLost);
                        if skip_ticks > 0 {
                            skip_ticks -= 1;
                            continue;
                        }
                        let Some(result) = self.guarded(self.resync()).await else { break };
                        match result {
                            Ok(stream) => {
                                events = Some(stream);
                                misses = 0;
                                backoff = 1;
                                self.submit_ready(&mut inflight);
                            }
                            Err(e) => {
                                error!(
                                    service = %self.service_id,
                                    error = %e,
                                    next_attempt_ticks = backoff,
                                    "Resync failed"
                                );
                                // Waiting will not fix a refusal; say so right away
                                let banner_after = if e.is_retryable() {
                                    self.config.resync_banner_after
                                } else {
                                    1
                                };
                                self.composer.note_resync_failure(banner_after);
                                skip_ticks = backoff - 1;
                                backoff = backoff.saturating_mul(2).min(max_backoff);
                            }
                        }
                    }
                }
            }
        }

        drop(events);
        drop(inflight);
        info!(service = %self.service_id, "Dispatcher stopped");
    }

    /// Run `fut` unless cancelled first
    async fn guarded<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    async fn heartbeat_ok(&self) -> bool {
        matches!(
            tokio::time::timeout(self.config.submit_timeout(), self.store.heartbeat()).await,
            Ok(Ok(()))
        )
    }

    /// One resync attempt; returns the new stream on success
    async fn resync(&self) -> Result<EventStream> {
        let ctx = self.composer.request_context();
        let attempt = async {
            self.store.heartbeat().await?;
            let stream = self.store.subscribe().await?;
            let snapshot = self.store.fetch_entries(&ctx, self.service_id).await?;
            Ok::<_, StoreError>((stream, snapshot))
        };

        let (stream, snapshot) = tokio::time::timeout(self.config.submit_timeout(), attempt)
            .await
            .map_err(|_| Error::Timeout)??;
        self.composer.resync(snapshot, self.config.retry_budget());
        Ok(stream)
    }

    /// Send every ready mutation
    fn submit_ready(&self, inflight: &mut InFlight) {
        let (ctx, submissions) = self.composer.take_submittable();
        for submission in submissions {
            let store = Arc::clone(&self.store);
            let ctx = ctx.for_mutation(submission.mutation);
            let timeout = self.config.submit_timeout();
            debug!(
                mutation = %submission.mutation,
                attempt = submission.attempt,
                request = submission.request.kind(),
                "Submitting"
            );
            inflight.push(Box::pin(async move {
                let result =
                    match tokio::time::timeout(timeout, execute(store.as_ref(), &ctx, submission.request)).await {
                        Ok(result) => result,
                        Err(_) => Err(StoreError::Timeout),
                    };
                Completed {
                    mutation: submission.mutation,
                    attempt: submission.attempt,
                    result,
                }
            }));
        }
    }
}

/// Next event, or never when there is no stream
async fn next_event(events: &mut Option<EventStream>) -> std::result::Result<ChangeEvent, RecvError> {
    match events {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}
