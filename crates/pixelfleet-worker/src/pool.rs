use crate::stream::WorkerStream;
use pixelfleet_common::error::{FleetError, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// Tuning for one per-worker stream pool.
#[derive(Debug, Clone)]
pub struct StreamPoolConfig {
    /// Streams kept per worker, already clamped to [1, 10] by config
    /// validation. Default: 3
    pub max_streams: usize,
    /// Stream open deadline. Default: 10s
    pub connect_timeout: Duration,
    /// How long an acquire waits for a stream before failing. Default: 30s
    pub acquire_timeout: Duration,
    /// Reconnect attempts after an unexpected close. Default: 5
    pub max_reconnect_attempts: u32,
}

impl Default for StreamPoolConfig {
    fn default() -> Self {
        Self {
            max_streams: 3,
            connect_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}

/// Observable pool state, for the operational endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub open: usize,
    pub waiters: usize,
}

struct PoolInner {
    idle: Vec<WorkerStream>,
    /// Streams currently open: idle + lent + being dialed.
    open_count: usize,
    /// FIFO queue of acquirers waiting for a release.
    waiters: VecDeque<oneshot::Sender<WorkerStream>>,
    closed: bool,
}

struct PoolShared {
    worker_id: String,
    ws_base: String,
    config: StreamPoolConfig,
    inner: Mutex<PoolInner>,
}

/// Bounded pool of streaming channels to one worker.
///
/// `acquire` hands out an idle stream, dials a new one while under the cap,
/// or queues the caller FIFO behind earlier waiters. `release` hands the
/// stream directly to the eldest live waiter so a release can never be stolen
/// by a later arrival. Dead streams are evicted on release and replaced by a
/// background reconnect with capped exponential back-off.
///
/// The handle is cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct StreamPool {
    shared: Arc<PoolShared>,
}

impl StreamPool {
    pub fn new(worker_id: &str, ws_base: &str, config: StreamPoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                worker_id: worker_id.to_string(),
                ws_base: ws_base.to_string(),
                config,
                inner: Mutex::new(PoolInner {
                    idle: Vec::new(),
                    open_count: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Borrows a stream for one submission.
    pub async fn acquire(&self) -> Result<WorkerStream> {
        let shared = &self.shared;
        let waiter = {
            let mut inner = shared.inner.lock().await;
            if inner.closed {
                return Err(FleetError::PoolClosed);
            }
            if let Some(mut stream) = inner.idle.pop() {
                stream.mark_used();
                return Ok(stream);
            }
            if inner.open_count < shared.config.max_streams {
                inner.open_count += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                Some(rx)
            }
        };

        match waiter {
            // Under the cap: dial a fresh stream, lending it directly.
            None => {
                match WorkerStream::connect(
                    &shared.worker_id,
                    &shared.ws_base,
                    shared.config.connect_timeout,
                )
                .await
                {
                    Ok(mut stream) => {
                        stream.mark_used();
                        Ok(stream)
                    }
                    Err(e) => {
                        shared.inner.lock().await.open_count -= 1;
                        Err(e)
                    }
                }
            }
            // At the cap: wait for a release, bounded by the acquire timeout.
            Some(rx) => match tokio::time::timeout(shared.config.acquire_timeout, rx).await {
                Ok(Ok(mut stream)) => {
                    stream.mark_used();
                    Ok(stream)
                }
                Ok(Err(_)) => Err(FleetError::PoolClosed),
                Err(_) => Err(FleetError::PoolTimeout(
                    shared.config.acquire_timeout.as_millis() as u64,
                )),
            },
        }
    }

    /// Returns a stream after a submission.
    ///
    /// A dead stream is evicted and a reconnect is scheduled instead of being
    /// handed back out.
    pub async fn release(&self, stream: WorkerStream) {
        if !stream.is_alive() {
            self.evict(stream).await;
            return;
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.closed {
            inner.open_count = inner.open_count.saturating_sub(1);
            drop(inner);
            stream.close().await;
            return;
        }

        let mut stream = stream;
        // Timed-out waiters have dropped their receiver; skip them.
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(stream) {
                Ok(()) => return,
                Err(returned) => stream = returned,
            }
        }
        inner.idle.push(stream);
    }

    /// Drops a dead stream and schedules a back-off reconnect.
    fn evict<'a>(&'a self, stream: WorkerStream) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            debug!(
                worker = %self.shared.worker_id,
                stream = %stream.id,
                uses = stream.use_count,
                "evicting dead stream"
            );
            {
                let mut inner = self.shared.inner.lock().await;
                inner.open_count = inner.open_count.saturating_sub(1);
                if inner.closed {
                    return;
                }
            }
            if self.shared.config.max_reconnect_attempts > 0 {
                let pool = self.clone();
                tokio::spawn(async move { pool.reconnect_loop().await });
            }
        })
    }

    /// Replaces an evicted stream: back-off, dial, hand to a waiter or park
    /// idle. Gives up after the configured number of attempts.
    fn reconnect_loop(self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
        let shared = &self.shared;
        for attempt in 1..=shared.config.max_reconnect_attempts {
            tokio::time::sleep(reconnect_backoff(attempt)).await;

            {
                let mut inner = shared.inner.lock().await;
                if inner.closed || inner.open_count >= shared.config.max_streams {
                    return;
                }
                inner.open_count += 1;
            }

            match WorkerStream::connect(
                &shared.worker_id,
                &shared.ws_base,
                shared.config.connect_timeout,
            )
            .await
            {
                Ok(stream) => {
                    debug!(worker = %shared.worker_id, attempt, "stream reconnected");
                    self.release(stream).await;
                    return;
                }
                Err(e) => {
                    shared.inner.lock().await.open_count -= 1;
                    warn!(
                        worker = %shared.worker_id,
                        attempt,
                        max = shared.config.max_reconnect_attempts,
                        "stream reconnect failed: {e}"
                    );
                }
            }
        }
        warn!(
            worker = %shared.worker_id,
            "giving up on stream reconnect after {} attempts",
            shared.config.max_reconnect_attempts
        );
        })
    }

    /// Pings every idle stream, evicting the ones that fail. Returns the
    /// number of evictions so the caller can count them toward the worker's
    /// breaker.
    ///
    /// Streams are taken out of the pool for the duration of the ping so the
    /// pool lock is never held across I/O.
    pub async fn ping_idle(&self, deadline: Duration) -> usize {
        let streams = {
            let mut inner = self.shared.inner.lock().await;
            if inner.closed {
                return 0;
            }
            std::mem::take(&mut inner.idle)
        };

        let mut evicted = 0;
        for mut stream in streams {
            match stream.ping(deadline).await {
                Ok(()) => self.release(stream).await,
                Err(e) => {
                    warn!(worker = %self.shared.worker_id, "idle stream failed ping: {e}");
                    self.evict(stream).await;
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Shuts the pool down: outstanding acquires fail, idle streams close,
    /// lent streams are dropped when released.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut inner = self.shared.inner.lock().await;
            inner.closed = true;
            inner.open_count = inner.open_count.saturating_sub(inner.idle.len());
            (
                std::mem::take(&mut inner.idle),
                std::mem::take(&mut inner.waiters),
            )
        };
        // Dropping the senders fails the corresponding acquires.
        drop(waiters);
        for stream in idle {
            stream.close().await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock().await;
        PoolStats {
            idle: inner.idle.len(),
            open: inner.open_count,
            waiters: inner.waiters.len(),
        }
    }
}

/// Back-off before reconnect attempt `n` (1-based): `min(1s * 2^(n-1), 30s)`.
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let secs = 1u64 << (attempt.saturating_sub(1)).min(5);
    Duration::from_secs(secs.min(30))
}
