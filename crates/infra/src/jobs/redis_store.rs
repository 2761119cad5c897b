//! Redis-backed job store (shared by every producer, sweeper and dispatcher process).
//!
//! ## Layout
//!
//! - **Ready queue**: `<prefix>` list; `LPUSH` to enqueue, `RPOP` to dispatch (FIFO)
//! - **Delayed set**: `<prefix>:delayed` sorted set; member = job JSON, score = eligible-at millis
//! - **Dead letters**: `<prefix>:dead` list of job ids (newest first), with the job JSON in the
//!   `<prefix>:dead:jobs` hash and `{reason, movedAt}` in the `<prefix>:dead:meta` hash
//!
//! Multi-key mutations run as Lua scripts or `MULTI` pipelines so they are
//! indivisible even with many sweepers and dispatchers on the same keys.
//!
//! A ready entry that is not valid job JSON is moved, verbatim, into the
//! dead-letter keys under a fresh id instead of being handed to a dispatcher.
//! `list_dead` skips such entries; `dead_len` still counts them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use courier_core::JobId;

use super::store::{JobStore, JobStoreError};
use super::types::{DeadLetterRecord, Job, QueueMetrics, RequeueOutcome};

pub use super::DEFAULT_KEY_PREFIX;

/// Move due members from the delayed set to the ready list, earliest score first.
///
/// KEYS: delayed, ready. ARGV: now (ms), max batch.
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  redis.call('LPUSH', KEYS[2], member)
end
return #due
"#;

/// Remove one dead letter by job id and push its job back onto the ready list.
///
/// KEYS: dead list, dead jobs hash, dead meta hash, ready. ARGV: job id.
const REQUEUE_DEAD_SCRIPT: &str = r#"
local job = redis.call('HGET', KEYS[2], ARGV[1])
if not job then
  return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('LREM', KEYS[1], 1, ARGV[1])
redis.call('LPUSH', KEYS[4], job)
return 1
"#;

/// Read the newest dead letters as flat `[job, meta, job, meta, ...]`.
///
/// KEYS: dead list, dead jobs hash, dead meta hash. ARGV: limit.
const LIST_DEAD_SCRIPT: &str = r#"
local ids = redis.call('LRANGE', KEYS[1], 0, tonumber(ARGV[1]) - 1)
local out = {}
for _, id in ipairs(ids) do
  local job = redis.call('HGET', KEYS[2], id)
  local meta = redis.call('HGET', KEYS[3], id)
  if job and meta then
    table.insert(out, job)
    table.insert(out, meta)
  end
end
return out
"#;

/// Key names derived from one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    pub ready: String,
    pub delayed: String,
    pub dead: String,
    pub dead_jobs: String,
    pub dead_meta: String,
}

impl RedisKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            ready: prefix.to_string(),
            delayed: format!("{prefix}:delayed"),
            dead: format!("{prefix}:dead"),
            dead_jobs: format!("{prefix}:dead:jobs"),
            dead_meta: format!("{prefix}:dead:meta"),
        }
    }

    fn all(&self) -> [&str; 5] {
        [
            &self.ready,
            &self.delayed,
            &self.dead,
            &self.dead_jobs,
            &self.dead_meta,
        ]
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Everything in a dead-letter record except the job itself.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetterMeta {
    reason: Option<String>,
    moved_at: DateTime<Utc>,
}

pub struct RedisJobStore {
    conn: redis::aio::MultiplexedConnection,
    keys: RedisKeys,
    promote_due: redis::Script,
    requeue_dead: redis::Script,
    list_dead: redis::Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl RedisJobStore {
    /// Connect and verify the server answers `PING`.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `key_prefix` - Prefix for every queue key (default: "courier:notifications")
    pub async fn connect(
        redis_url: impl AsRef<str>,
        key_prefix: Option<&str>,
    ) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| JobStoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| JobStoreError::Connection(e.to_string()))?;

        let store = Self {
            conn,
            keys: RedisKeys::new(key_prefix.unwrap_or(DEFAULT_KEY_PREFIX)),
            promote_due: redis::Script::new(PROMOTE_DUE_SCRIPT),
            requeue_dead: redis::Script::new(REQUEUE_DEAD_SCRIPT),
            list_dead: redis::Script::new(LIST_DEAD_SCRIPT),
        };
        store.ping().await?;

        debug!(prefix = %store.keys.ready, "connected to redis job store");
        Ok(store)
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    pub async fn ping(&self) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Connection(format!("PING failed: {e}")))?;
        Ok(())
    }

    /// Delete every key owned by this store. Intended for tests and tooling.
    pub async fn purge(&self) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.keys.all().to_vec())
            .query_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("DEL failed: {e}")))?;
        Ok(())
    }

    /// Park an undecodable ready entry in the dead-letter keys, untouched.
    async fn quarantine(&self, raw: &str, cause: &JobStoreError) -> Result<(), JobStoreError> {
        let id = JobId::new().to_string();
        error!(
            dead_letter_id = %id,
            error = %cause,
            raw,
            "undecodable ready entry moved to dead letters"
        );

        let meta_json = encode(&DeadLetterMeta {
            reason: Some(format!("undecodable job: {cause}")),
            moved_at: Utc::now(),
        })?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&self.keys.dead_jobs)
            .arg(&id)
            .arg(raw)
            .ignore()
            .cmd("HSET")
            .arg(&self.keys.dead_meta)
            .arg(&id)
            .arg(meta_json)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.keys.dead)
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(raw, error = %e, "failed to park undecodable ready entry");
                JobStoreError::Command(format!("dead-letter MULTI failed: {e}"))
            })?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, JobStoreError> {
    serde_json::to_string(value).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, JobStoreError> {
    serde_json::from_str(raw).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

#[async_trait::async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn push_ready(&self, job: &Job) -> Result<(), JobStoreError> {
        let payload = encode(job)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.keys.ready)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("LPUSH failed: {e}")))?;
        Ok(())
    }

    async fn pop_ready(&self) -> Result<Option<Job>, JobStoreError> {
        let mut conn = self.conn.clone();
        loop {
            let raw: Option<String> = redis::cmd("RPOP")
                .arg(&self.keys.ready)
                .query_async(&mut conn)
                .await
                .map_err(|e| JobStoreError::Command(format!("RPOP failed: {e}")))?;

            let Some(raw) = raw else {
                return Ok(None);
            };
            match decode::<Job>(&raw) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => self.quarantine(&raw, &e).await?,
            }
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn schedule_delayed(
        &self,
        job: &Job,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let payload = encode(job)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.keys.delayed)
            .arg(eligible_at.timestamp_millis())
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("ZADD failed: {e}")))?;
        Ok(())
    }

    async fn promote_due(
        &self,
        now: DateTime<Utc>,
        max_batch: usize,
    ) -> Result<usize, JobStoreError> {
        if max_batch == 0 {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let mut invocation = self.promote_due.prepare_invoke();
        invocation
            .key(&self.keys.delayed)
            .key(&self.keys.ready)
            .arg(now.timestamp_millis())
            .arg(max_batch);

        let moved: usize = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("promote script failed: {e}")))?;
        Ok(moved)
    }

    #[instrument(skip(self, job, reason), fields(job_id = %job.id), err)]
    async fn archive_dead(&self, job: Job, reason: Option<String>) -> Result<(), JobStoreError> {
        let id = job.id.to_string();
        let job_json = encode(&job)?;
        let meta_json = encode(&DeadLetterMeta {
            reason,
            moved_at: Utc::now(),
        })?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&self.keys.dead_jobs)
            .arg(&id)
            .arg(job_json)
            .ignore()
            .cmd("HSET")
            .arg(&self.keys.dead_meta)
            .arg(&id)
            .arg(meta_json)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.keys.dead)
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("dead-letter MULTI failed: {e}")))?;
        Ok(())
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut invocation = self.list_dead.prepare_invoke();
        invocation
            .key(&self.keys.dead)
            .key(&self.keys.dead_jobs)
            .key(&self.keys.dead_meta)
            .arg(limit);

        let flat: Vec<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("list script failed: {e}")))?;

        let records = flat
            .chunks_exact(2)
            .filter_map(|pair| {
                let decoded = decode::<Job>(&pair[0]).and_then(|job| {
                    decode::<DeadLetterMeta>(&pair[1]).map(|meta| (job, meta))
                });
                match decoded {
                    Ok((job, meta)) => Some(DeadLetterRecord {
                        job,
                        reason: meta.reason,
                        moved_at: meta.moved_at,
                    }),
                    Err(e) => {
                        warn!(error = %e, raw = pair[0].as_str(), "skipping undecodable dead letter");
                        None
                    }
                }
            })
            .collect();
        Ok(records)
    }

    #[instrument(skip(self), err)]
    async fn requeue_dead(&self, job_id: JobId) -> Result<RequeueOutcome, JobStoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.requeue_dead.prepare_invoke();
        invocation
            .key(&self.keys.dead)
            .key(&self.keys.dead_jobs)
            .key(&self.keys.dead_meta)
            .key(&self.keys.ready)
            .arg(job_id.to_string());

        let moved: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("requeue script failed: {e}")))?;

        Ok(if moved == 1 {
            RequeueOutcome::requeued()
        } else {
            RequeueOutcome::not_found()
        })
    }

    async fn ready_len(&self) -> Result<u64, JobStoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(&self.keys.ready)
            .query_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("LLEN failed: {e}")))
    }

    async fn delayed_len(&self) -> Result<u64, JobStoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCARD")
            .arg(&self.keys.delayed)
            .query_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("ZCARD failed: {e}")))
    }

    async fn dead_len(&self) -> Result<u64, JobStoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(&self.keys.dead)
            .query_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("LLEN failed: {e}")))
    }

    async fn metrics(&self) -> Result<QueueMetrics, JobStoreError> {
        let mut conn = self.conn.clone();
        let (ready_length, delayed_length, dead_length): (u64, u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(&self.keys.ready)
            .cmd("ZCARD")
            .arg(&self.keys.delayed)
            .cmd("LLEN")
            .arg(&self.keys.dead)
            .query_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Command(format!("metrics pipeline failed: {e}")))?;

        Ok(QueueMetrics {
            ready_length,
            delayed_length,
            dead_length,
        })
    }
}

/// These run against a live server only when `COURIER_TEST_REDIS_URL` is set;
/// each test uses its own key prefix and purges it afterwards.
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::jobs::store::contract;

    async fn test_store() -> Option<RedisJobStore> {
        let url = std::env::var("COURIER_TEST_REDIS_URL").ok()?;
        let prefix = format!("courier:test:{}", JobId::new());
        Some(
            RedisJobStore::connect(url, Some(&prefix))
                .await
                .expect("COURIER_TEST_REDIS_URL set but redis is unreachable"),
        )
    }

    #[test]
    fn keys_derive_from_prefix() {
        let keys = RedisKeys::new("app:q");
        assert_eq!(keys.ready, "app:q");
        assert_eq!(keys.delayed, "app:q:delayed");
        assert_eq!(keys.dead, "app:q:dead");
        assert_eq!(keys.dead_jobs, "app:q:dead:jobs");
        assert_eq!(keys.dead_meta, "app:q:dead:meta");
        assert_eq!(RedisKeys::default().ready, DEFAULT_KEY_PREFIX);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let err = RedisJobStore::connect("redis://127.0.0.1:1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Connection(_)));
    }

    #[tokio::test]
    async fn ready_queue_is_fifo() {
        let Some(store) = test_store().await else { return };
        contract::ready_queue_is_fifo(&store).await;
        store.purge().await.unwrap();
    }

    #[tokio::test]
    async fn delay_is_respected() {
        let Some(store) = test_store().await else { return };
        contract::delay_is_respected(&store).await;
        store.purge().await.unwrap();
    }

    #[tokio::test]
    async fn promotion_is_bounded_and_score_ordered() {
        let Some(store) = test_store().await else { return };
        contract::promotion_is_bounded_and_score_ordered(&store).await;
        store.purge().await.unwrap();
    }

    #[tokio::test]
    async fn dead_letters_are_newest_first_and_bounded() {
        let Some(store) = test_store().await else { return };
        contract::dead_letters_are_newest_first_and_bounded(&store).await;
        store.purge().await.unwrap();
    }

    #[tokio::test]
    async fn requeue_moves_by_id_and_keeps_attempts() {
        let Some(store) = test_store().await else { return };
        contract::requeue_moves_by_id_and_keeps_attempts(&store).await;
        store.purge().await.unwrap();
    }

    #[tokio::test]
    async fn metrics_reflect_every_store() {
        let Some(store) = test_store().await else { return };
        contract::metrics_reflect_every_store(&store).await;
        store.purge().await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_ready_entry_is_parked_not_lost() {
        let Some(store) = test_store().await else { return };
        let mut conn = store.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&store.keys.ready)
            .arg("{bad")
            .query_async(&mut conn)
            .await
            .unwrap();
        let good = contract::job("after");
        store.push_ready(&good).await.unwrap();

        let popped = store.pop_ready().await.unwrap().unwrap();
        assert_eq!(popped.id, good.id);
        assert!(store.pop_ready().await.unwrap().is_none());

        assert_eq!(store.dead_len().await.unwrap(), 1);
        let parked: Vec<String> = redis::cmd("HVALS")
            .arg(&store.keys.dead_jobs)
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(parked, vec!["{bad".to_string()]);

        // Listing skips the unreadable entry instead of failing.
        store
            .archive_dead(contract::job("dead"), Some("boom".into()))
            .await
            .unwrap();
        let listed = store.list_dead(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reason.as_deref(), Some("boom"));

        store.purge().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pops_never_share_a_job() {
        let Some(store) = test_store().await else { return };
        let store = Arc::new(store);
        contract::concurrent_pops_never_share_a_job(store.clone()).await;
        store.purge().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sweepers_never_double_promote() {
        let Some(store) = test_store().await else { return };
        let store = Arc::new(store);
        let past = Utc::now() - chrono::Duration::seconds(1);
        for i in 0..100 {
            store
                .schedule_delayed(&contract::job(&i.to_string()), past)
                .await
                .unwrap();
        }

        let mut sweepers = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            sweepers.push(tokio::spawn(async move {
                let mut moved = 0;
                loop {
                    let n = store.promote_due(Utc::now(), 7).await.unwrap();
                    if n == 0 {
                        break moved;
                    }
                    moved += n;
                }
            }));
        }

        let mut total = 0;
        for s in sweepers {
            total += s.await.unwrap();
        }
        assert_eq!(total, 100);
        assert_eq!(store.ready_len().await.unwrap(), 100);
        assert_eq!(store.delayed_len().await.unwrap(), 0);
        store.purge().await.unwrap();
    }
}
