// SPDX-License-Identifier: MIT OR Apache-2.0
//! gaffer-queue
#![deny(unsafe_code)]
//!
//! At-least-once job dispatch and the cluster-wide kill switch.
//!
//! The queue is a capability trait with two implementations: a Redis backend
//! for real deployments and an in-process backend for tests and single-box
//! setups. Workers claim envelopes (the entry moves to a processing list, so
//! a crashed worker's jobs can be reclaimed) and acknowledge them when the
//! runner returns. Redelivery is bounded by the retry schedule; in-handler
//! failures are the runner's business, not the queue's.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gaffer_config::QueueSettings;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Key under which the cluster kill switch lives. Absent means enabled.
pub const KILL_SWITCH_KEY: &str = "agents_enabled";

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The Redis backend failed.
    #[error("queue backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// An envelope failed to decode.
    #[error("malformed queue envelope: {0}")]
    Codec(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, QueueError>;

/// A queued unit of dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// The job to dispatch.
    pub job_id: Uuid,
    /// Zero-based delivery attempt.
    pub attempt: u32,
    /// When the envelope entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// Redelivery backoff: not claimable before this instant.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl JobEnvelope {
    /// First-delivery envelope for a job.
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            attempt: 0,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }

    fn ready(&self) -> bool {
        self.not_before.is_none_or(|t| t <= Utc::now())
    }
}

/// Normalize a retry schedule to the queue contract:
/// non-positive entries are dropped, an empty schedule defaults to `[30]`,
/// `max_retries <= 1` collapses to a single interval, and longer budgets pad
/// with the last value or truncate from the front.
pub fn normalize_retry_intervals(max_retries: u32, intervals: &[u64]) -> Vec<u64> {
    let mut sanitized: Vec<u64> = intervals.iter().copied().filter(|n| *n > 0).collect();
    if sanitized.is_empty() {
        sanitized.push(30);
    }
    if max_retries <= 1 {
        return vec![sanitized[0]];
    }
    let target = max_retries as usize;
    while sanitized.len() < target {
        let last = *sanitized.last().expect("schedule is non-empty");
        sanitized.push(last);
    }
    sanitized.truncate(target);
    sanitized
}

/// Retry policy derived from settings. `None` disables redelivery.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Redelivery budget.
    pub max_retries: u32,
    /// Normalized backoff schedule, one entry per retry.
    pub intervals: Vec<u64>,
}

/// Build the retry policy from queue settings; `retry_max == 0` disables it.
pub fn build_retry_policy(settings: &QueueSettings) -> Option<RetryPolicy> {
    if settings.retry_max == 0 {
        return None;
    }
    Some(RetryPolicy {
        max_retries: settings.retry_max,
        intervals: normalize_retry_intervals(settings.retry_max, &settings.retry_intervals),
    })
}

impl RetryPolicy {
    /// Backoff for a redelivery whose bumped attempt counter is `attempt`
    /// (1-based), or `None` when the budget is spent.
    fn backoff_for(&self, attempt: u32) -> Option<chrono::Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        let secs = match self.intervals.as_slice() {
            [] => 30,
            intervals => intervals[(attempt as usize - 1).min(intervals.len() - 1)],
        };
        Some(chrono::Duration::seconds(secs as i64))
    }
}

fn redeliver(mut envelope: JobEnvelope, policy: Option<&RetryPolicy>) -> Option<JobEnvelope> {
    let policy = policy?;
    envelope.attempt += 1;
    let backoff = policy.backoff_for(envelope.attempt)?;
    envelope.not_before = Some(Utc::now() + backoff);
    Some(envelope)
}

/// Capability surface every queue backend provides.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Push an envelope for dispatch.
    async fn push(&self, envelope: &JobEnvelope) -> Result<()>;

    /// Claim the next envelope, waiting up to `timeout`. The claim parks the
    /// entry on a processing list until [`ack`](Self::ack) or
    /// [`reclaim`](Self::reclaim).
    async fn claim(&self, timeout: Duration) -> Result<Option<JobEnvelope>>;

    /// Acknowledge a claimed envelope (removes it from the processing list).
    async fn ack(&self, envelope: &JobEnvelope) -> Result<()>;

    /// Move every parked envelope back onto the queue with its attempt
    /// counter bumped and the policy's backoff applied. Entries past the
    /// retry budget (or all of them, with no policy) are dropped. Returns
    /// how many were requeued.
    async fn reclaim(&self, policy: Option<&RetryPolicy>) -> Result<usize>;

    /// Approximate queue depth.
    async fn size(&self) -> Result<usize>;

    /// Read a cluster flag.
    async fn get_flag(&self, key: &str) -> Result<Option<String>>;

    /// Write a cluster flag.
    async fn set_flag(&self, key: &str, value: &str) -> Result<()>;

    /// Non-blocking lock acquisition with a TTL. Returns `false` immediately
    /// when the lock is held elsewhere.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Release a lock taken with [`try_lock`](Self::try_lock).
    async fn unlock(&self, key: &str) -> Result<()>;
}

/// Flip the cluster kill switch. `enabled = false` makes every fresh
/// dispatch fail with `KILL_SWITCH_ACTIVE`.
pub async fn set_kill_switch(backend: &dyn QueueBackend, enabled: bool) -> Result<()> {
    backend
        .set_flag(KILL_SWITCH_KEY, if enabled { "true" } else { "false" })
        .await
}

/// Whether agents may run. An absent flag means enabled.
pub async fn agents_enabled(backend: &dyn QueueBackend) -> Result<bool> {
    match backend.get_flag(KILL_SWITCH_KEY).await? {
        None => Ok(true),
        Some(value) => Ok(value.trim().eq_ignore_ascii_case("true")),
    }
}

/// Run `action` under a cluster lock. Returns `false` without running it
/// when the lock is not immediately available.
pub async fn with_lock<F, Fut>(
    backend: &dyn QueueBackend,
    key: &str,
    timeout: Duration,
    action: F,
) -> Result<bool>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = ()> + Send,
{
    if !backend.try_lock(key, timeout).await? {
        return Ok(false);
    }
    action().await;
    backend.unlock(key).await?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// In-process backend
// ---------------------------------------------------------------------------

struct InProcessState {
    queue: VecDeque<JobEnvelope>,
    processing: Vec<JobEnvelope>,
    flags: BTreeMap<String, String>,
    locks: BTreeMap<String, Instant>,
}

/// Process-local backend for tests and single-box deployments.
pub struct InProcessQueue {
    state: Mutex<InProcessState>,
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessQueue {
    /// An empty queue with no flags set.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InProcessState {
                queue: VecDeque::new(),
                processing: Vec::new(),
                flags: BTreeMap::new(),
                locks: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InProcessState> {
        self.state.lock().expect("queue lock poisoned")
    }
}

#[async_trait]
impl QueueBackend for InProcessQueue {
    async fn push(&self, envelope: &JobEnvelope) -> Result<()> {
        self.lock().queue.push_back(envelope.clone());
        Ok(())
    }

    async fn claim(&self, _timeout: Duration) -> Result<Option<JobEnvelope>> {
        let mut state = self.lock();
        let Some(envelope) = state.queue.pop_front() else {
            return Ok(None);
        };
        if !envelope.ready() {
            state.queue.push_back(envelope);
            return Ok(None);
        }
        state.processing.push(envelope.clone());
        Ok(Some(envelope))
    }

    async fn ack(&self, envelope: &JobEnvelope) -> Result<()> {
        let mut state = self.lock();
        state.processing.retain(|e| e != envelope);
        Ok(())
    }

    async fn reclaim(&self, policy: Option<&RetryPolicy>) -> Result<usize> {
        let mut state = self.lock();
        let parked: Vec<JobEnvelope> = state.processing.drain(..).collect();
        let mut requeued = 0;
        for envelope in parked {
            if let Some(next) = redeliver(envelope, policy) {
                state.queue.push_back(next);
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.lock().queue.len())
    }

    async fn get_flag(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().flags.get(key).cloned())
    }

    async fn set_flag(&self, key: &str, value: &str) -> Result<()> {
        self.lock().flags.insert(key.into(), value.into());
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.lock();
        let now = Instant::now();
        if let Some(expiry) = state.locks.get(key) {
            if *expiry > now {
                return Ok(false);
            }
        }
        state.locks.insert(key.into(), now + ttl);
        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.lock().locks.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

/// Redis-backed queue for multi-process deployments.
pub struct RedisQueue {
    manager: redis::aio::ConnectionManager,
    queue_key: String,
    processing_key: String,
}

impl RedisQueue {
    /// Connect to `redis_url` and bind to the named queue.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            queue_key: format!("gaffer:queue:{queue_name}"),
            processing_key: format!("gaffer:processing:{queue_name}"),
        })
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn push(&self, envelope: &JobEnvelope) -> Result<()> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(envelope)?;
        let _: () = conn.lpush(&self.queue_key, payload).await?;
        Ok(())
    }

    async fn claim(&self, timeout: Duration) -> Result<Option<JobEnvelope>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_key)
            .arg(&self.processing_key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        let Some(payload) = raw else {
            return Ok(None);
        };
        let envelope: JobEnvelope = serde_json::from_str(&payload)?;
        if !envelope.ready() {
            // Backoff not elapsed: return it to the queue tail unclaimed.
            let _: () = conn.lrem(&self.processing_key, 1, &payload).await?;
            let _: () = conn.lpush(&self.queue_key, &payload).await?;
            return Ok(None);
        }
        Ok(Some(envelope))
    }

    async fn ack(&self, envelope: &JobEnvelope) -> Result<()> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(envelope)?;
        let _: () = conn.lrem(&self.processing_key, 1, payload).await?;
        Ok(())
    }

    async fn reclaim(&self, policy: Option<&RetryPolicy>) -> Result<usize> {
        let mut conn = self.manager.clone();
        let parked: Vec<String> = conn.lrange(&self.processing_key, 0, -1).await?;
        let _: () = conn.del(&self.processing_key).await?;
        let mut requeued = 0;
        for raw in parked {
            let envelope: JobEnvelope = serde_json::from_str(&raw)?;
            match redeliver(envelope, policy) {
                Some(next) => {
                    let payload = serde_json::to_string(&next)?;
                    let _: () = conn.lpush(&self.queue_key, payload).await?;
                    requeued += 1;
                }
                None => {
                    tracing::warn!("dropping parked envelope past its retry budget");
                }
            }
        }
        Ok(requeued)
    }

    async fn size(&self) -> Result<usize> {
        let mut conn = self.manager.clone();
        let n: usize = conn.llen(&self.queue_key).await?;
        Ok(n)
    }

    async fn get_flag(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_flag(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("locked")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_retry_collapses_to_first_interval() {
        assert_eq!(normalize_retry_intervals(1, &[30, 120]), vec![30]);
        assert_eq!(normalize_retry_intervals(0, &[15]), vec![15]);
    }

    #[test]
    fn schedule_pads_with_last_value() {
        assert_eq!(normalize_retry_intervals(3, &[15]), vec![15, 15, 15]);
        assert_eq!(normalize_retry_intervals(4, &[5, 10]), vec![5, 10, 10, 10]);
    }

    #[test]
    fn schedule_truncates_from_the_front() {
        assert_eq!(normalize_retry_intervals(2, &[10, 20, 30]), vec![10, 20]);
    }

    #[test]
    fn empty_or_invalid_schedule_defaults() {
        assert_eq!(normalize_retry_intervals(1, &[]), vec![30]);
        assert_eq!(normalize_retry_intervals(2, &[0, 0]), vec![30, 30]);
    }

    #[test]
    fn retry_policy_disabled_at_zero() {
        let mut settings = QueueSettings::default();
        settings.retry_max = 0;
        assert!(build_retry_policy(&settings).is_none());

        settings.retry_max = 3;
        settings.retry_intervals = vec![5, 15];
        let policy = build_retry_policy(&settings).unwrap();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.intervals, vec![5, 15, 15]);
    }

    proptest! {
        #[test]
        fn normalized_length_matches_budget(
            max_retries in 0u32..=10,
            intervals in proptest::collection::vec(0u64..600, 0..8),
        ) {
            let normalized = normalize_retry_intervals(max_retries, &intervals);
            let expected = if max_retries <= 1 { 1 } else { max_retries as usize };
            prop_assert_eq!(normalized.len(), expected);
            prop_assert!(normalized.iter().all(|n| *n > 0));
        }
    }

    fn immediate_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            intervals: vec![0],
        }
    }

    #[tokio::test]
    async fn in_process_push_claim_ack() {
        let queue = InProcessQueue::new();
        let envelope = JobEnvelope::new(Uuid::new_v4());
        queue.push(&envelope).await.unwrap();
        assert_eq!(queue.size().await.unwrap(), 1);

        let claimed = queue.claim(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(claimed.job_id, envelope.job_id);
        assert_eq!(queue.size().await.unwrap(), 0);

        queue.ack(&claimed).await.unwrap();
        assert_eq!(queue.reclaim(Some(&immediate_policy(3))).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reclaim_requeues_unacked_with_bumped_attempt() {
        let queue = InProcessQueue::new();
        let policy = immediate_policy(2);
        queue.push(&JobEnvelope::new(Uuid::new_v4())).await.unwrap();
        let claimed = queue.claim(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 0);

        // Simulated worker crash: no ack.
        assert_eq!(queue.reclaim(Some(&policy)).await.unwrap(), 1);
        let redelivered = queue.claim(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(redelivered.job_id, claimed.job_id);
        assert_eq!(redelivered.attempt, 1);

        assert_eq!(queue.reclaim(Some(&policy)).await.unwrap(), 1);
        let last = queue.claim(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(last.attempt, 2);

        // Budget exhausted: dropped.
        assert_eq!(queue.reclaim(Some(&policy)).await.unwrap(), 0);
        assert!(queue.claim(Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaim_without_policy_drops_everything() {
        let queue = InProcessQueue::new();
        queue.push(&JobEnvelope::new(Uuid::new_v4())).await.unwrap();
        queue.claim(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(queue.reclaim(None).await.unwrap(), 0);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn redelivery_backoff_delays_claims() {
        let queue = InProcessQueue::new();
        let policy = RetryPolicy {
            max_retries: 1,
            intervals: vec![3600],
        };
        queue.push(&JobEnvelope::new(Uuid::new_v4())).await.unwrap();
        queue.claim(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(queue.reclaim(Some(&policy)).await.unwrap(), 1);

        // Requeued, but its backoff has not elapsed.
        assert_eq!(queue.size().await.unwrap(), 1);
        assert!(queue.claim(Duration::from_secs(1)).await.unwrap().is_none());
        assert_eq!(queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn kill_switch_defaults_to_enabled() {
        let queue = InProcessQueue::new();
        assert!(agents_enabled(&queue).await.unwrap());

        set_kill_switch(&queue, false).await.unwrap();
        assert!(!agents_enabled(&queue).await.unwrap());

        set_kill_switch(&queue, true).await.unwrap();
        assert!(agents_enabled(&queue).await.unwrap());
    }

    #[tokio::test]
    async fn kill_switch_flag_parsing_tolerates_case() {
        let queue = InProcessQueue::new();
        queue.set_flag(KILL_SWITCH_KEY, " True ").await.unwrap();
        assert!(agents_enabled(&queue).await.unwrap());
        queue.set_flag(KILL_SWITCH_KEY, "FALSE").await.unwrap();
        assert!(!agents_enabled(&queue).await.unwrap());
    }

    #[tokio::test]
    async fn lock_is_non_blocking() {
        let queue = InProcessQueue::new();
        assert!(queue.try_lock("bootstrap", Duration::from_secs(30)).await.unwrap());
        assert!(!queue.try_lock("bootstrap", Duration::from_secs(30)).await.unwrap());
        queue.unlock("bootstrap").await.unwrap();
        assert!(queue.try_lock("bootstrap", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_runs_action_once() {
        let queue = InProcessQueue::new();
        let ran = with_lock(&queue, "k", Duration::from_secs(10), || async {}).await.unwrap();
        assert!(ran);

        queue.try_lock("k2", Duration::from_secs(10)).await.unwrap();
        let ran = with_lock(&queue, "k2", Duration::from_secs(10), || async {
            panic!("must not run");
        })
        .await
        .unwrap();
        assert!(!ran);
    }

    #[tokio::test]
    async fn expired_locks_can_be_retaken() {
        let queue = InProcessQueue::new();
        assert!(queue.try_lock("short", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.try_lock("short", Duration::from_secs(1)).await.unwrap());
    }
}
