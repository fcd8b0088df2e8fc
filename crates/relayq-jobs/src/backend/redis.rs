//! Redis-backed provider.
//!
//! Every job lives in a hash (`job:{id}`) whose timestamps are stored as epoch
//! milliseconds so the Lua scripts can do arithmetic on them. Ready jobs sit in
//! one sorted set per type (`queue:{type}`), scored `rank * 10^13 + ready_at_ms`
//! so a single range query per priority band yields the oldest eligible job.
//! Leases are plain string keys with a native `PX` expiry. Only terminal job
//! hashes carry a TTL; queued and processing jobs never expire.
//!
//! Scripts build some key names from the prefix at run time, so the provider
//! assumes a single Redis node rather than a cluster.

use super::{
    backoff_gate, clamp_progress, global_quota_exceeded, job_missing, lease_holder_mismatch,
    lease_missing, queue_full, request_quota_exceeded, Backend, ProviderConfig, QueueProvider,
    Submitted, RATE_LIMIT_WINDOW,
};
use crate::clock::{shared_system_clock, Clock};
use crate::error::{redis_error, Result};
use crate::job::{
    ceil_secs, EnqueueRequest, Job, JobError, JobPriority, JobStatus, Payload, QueueStats,
    LEASE_EXPIRED,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use relayq_core::AppError;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Width of one priority band in the queue score.
const RANK_BAND: i64 = 10_000_000_000_000;

const OWNER_CHECK: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'no_job'} end
local holder = redis.call('GET', KEYS[2])
if not holder then return {'no_lease'} end
if holder ~= ARGV[1] then return {'forbidden'} end
"#;

const ENQUEUE: &str = r#"
if ARGV[3] ~= '' then
  local holder = redis.call('GET', ARGV[3])
  if holder then
    local held = ARGV[1] .. 'job:' .. holder
    local status = redis.call('HGET', held, 'status')
    if status == 'queued' or status == 'processing' then
      local reply = redis.call('HGETALL', held)
      table.insert(reply, 1, 'existing')
      return reply
    end
  end
  redis.call('SET', ARGV[3], ARGV[2], 'EX', ARGV[4])
end
for i = 8, #ARGV, 2 do redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1]) end
redis.call('ZADD', KEYS[2], ARGV[6], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[7])
redis.call('HINCRBY', KEYS[4], 'enqueued', 1)
if ARGV[5] ~= '' then redis.call('SADD', ARGV[5], ARGV[2]) end
return {'created'}
"#;

const RESERVE: &str = r#"
if redis.call('SCARD', KEYS[1]) >= tonumber(ARGV[5]) then return {'empty'} end
local types = {}
if #ARGV >= 6 then
  for i = 6, #ARGV do types[#types + 1] = ARGV[i] end
else
  types = redis.call('SMEMBERS', KEYS[2])
end
local now = tonumber(ARGV[3])
while true do
  local best_id, best_score, best_queue
  for rank = 0, 3 do
    local low = rank * 10000000000000
    for _, t in ipairs(types) do
      local queue = ARGV[1] .. 'queue:' .. t
      local hit = redis.call('ZRANGEBYSCORE', queue, string.format('%.0f', low),
        string.format('%.0f', low + now), 'WITHSCORES', 'LIMIT', 0, 1)
      if #hit > 0 then
        local score = tonumber(hit[2])
        if best_score == nil or score < best_score then
          best_id, best_score, best_queue = hit[1], score, queue
        end
      end
    end
    if best_id then break end
  end
  if not best_id then return {'empty'} end
  redis.call('ZREM', best_queue, best_id)
  local key = ARGV[1] .. 'job:' .. best_id
  if redis.call('EXISTS', key) == 1 then
    redis.call('HINCRBY', key, 'attempts', 1)
    redis.call('HSET', key, 'status', 'processing', 'started_at', ARGV[3], 'updated_at', ARGV[3])
    redis.call('HDEL', key, 'next_attempt_at')
    redis.call('PERSIST', key)
    redis.call('SADD', KEYS[1], best_id)
    redis.call('SET', ARGV[1] .. 'lease:' .. best_id, ARGV[2], 'PX', ARGV[4])
    redis.call('HINCRBY', KEYS[3], 'reserved', 1)
    local reply = redis.call('HGETALL', key)
    table.insert(reply, 1, 'ok')
    return reply
  end
end
"#;

const HEARTBEAT: &str = r#"
redis.call('PEXPIRE', KEYS[2], ARGV[2])
if ARGV[3] ~= '' then redis.call('HSET', KEYS[1], 'progress', ARGV[3]) end
redis.call('HSET', KEYS[1], 'updated_at', ARGV[4])
return {'ok'}
"#;

const COMPLETE: &str = r#"
redis.call('DEL', KEYS[2])
redis.call('SREM', KEYS[3], ARGV[5])
local started = tonumber(redis.call('HGET', KEYS[1], 'started_at') or ARGV[3])
redis.call('HSET', KEYS[1], 'status', 'completed', 'result', ARGV[2], 'progress', '100',
  'completed_at', ARGV[3], 'updated_at', ARGV[3])
redis.call('HDEL', KEYS[1], 'error', 'next_attempt_at')
redis.call('EXPIRE', KEYS[1], ARGV[4])
redis.call('DEL', KEYS[4])
redis.call('HINCRBY', KEYS[5], 'completed', 1)
redis.call('HINCRBY', KEYS[5], 'processed_count', 1)
redis.call('HINCRBY', KEYS[5], 'total_processing_ms', math.max(0, tonumber(ARGV[3]) - started))
local reply = redis.call('HGETALL', KEYS[1])
table.insert(reply, 1, 'ok')
return reply
"#;

const FAIL: &str = r#"
redis.call('DEL', KEYS[2])
redis.call('SREM', KEYS[3], ARGV[2])
if ARGV[3] == 'retry' then
  redis.call('HSET', KEYS[1], 'status', 'queued', 'last_error', ARGV[5],
    'next_attempt_at', ARGV[6], 'updated_at', ARGV[4])
  redis.call('ZADD', KEYS[6], ARGV[7], ARGV[2])
  redis.call('PERSIST', KEYS[1])
  redis.call('HINCRBY', KEYS[5], 'retried', 1)
else
  redis.call('HSET', KEYS[1], 'status', 'failed', 'error', ARGV[5], 'last_error', ARGV[5],
    'completed_at', ARGV[4], 'updated_at', ARGV[4])
  redis.call('HDEL', KEYS[1], 'next_attempt_at')
  redis.call('EXPIRE', KEYS[1], ARGV[9])
  redis.call('HINCRBY', KEYS[5], 'failed', 1)
end
redis.call('HINCRBY', KEYS[4], 'count', 1)
redis.call('HSET', KEYS[4], 'next_retry_at', ARGV[6], 'last_error', ARGV[5])
redis.call('PEXPIRE', KEYS[4], ARGV[8])
local reply = redis.call('HGETALL', KEYS[1])
table.insert(reply, 1, 'ok')
return reply
"#;

const RECLAIM: &str = r#"
local outcomes = {}
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', ARGV[1] .. 'lease:' .. id) == 0 then
    redis.call('SREM', KEYS[1], id)
    local key = ARGV[1] .. 'job:' .. id
    if redis.call('EXISTS', key) == 1 then
      local job = redis.call('HMGET', key, 'attempts', 'max_attempts', 'type', 'rank')
      redis.call('HSET', key, 'updated_at', ARGV[2])
      if tonumber(job[1]) >= tonumber(job[2]) then
        redis.call('HSET', key, 'status', 'failed', 'error', ARGV[4], 'last_error', ARGV[4],
          'completed_at', ARGV[2])
        redis.call('EXPIRE', key, ARGV[3])
        redis.call('HINCRBY', KEYS[2], 'failed', 1)
        outcomes[#outcomes + 1] = id
        outcomes[#outcomes + 1] = 'failed'
      else
        local score = tonumber(job[4]) * 10000000000000 + tonumber(ARGV[2])
        redis.call('HSET', key, 'status', 'queued')
        redis.call('PERSIST', key)
        redis.call('ZADD', ARGV[1] .. 'queue:' .. job[3], string.format('%.0f', score), id)
        outcomes[#outcomes + 1] = id
        outcomes[#outcomes + 1] = 'requeued'
      end
      redis.call('HINCRBY', KEYS[2], 'reclaimed', 1)
    end
  end
end
return outcomes
"#;

// A shared failure record survives while a newer holder of the key is gated.
const EVICT: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
local owns = true
if ARGV[3] ~= '' then
  owns = redis.call('GET', ARGV[3]) == ARGV[1]
  if owns then redis.call('DEL', ARGV[3]) end
end
local gate = tonumber(redis.call('HGET', KEYS[3], 'next_retry_at') or '0')
if owns or gate <= tonumber(ARGV[2]) then redis.call('DEL', KEYS[3]) end
if ARGV[4] ~= '' then redis.call('SREM', ARGV[4], ARGV[1]) end
return {'ok'}
"#;

const ADMIT: &str = r#"
local function full(key, limit)
  local count = tonumber(redis.call('GET', key) or '0')
  if count >= tonumber(limit) then
    local ttl = redis.call('PTTL', key)
    if ttl < 0 then ttl = tonumber(ARGV[3]) end
    return ttl
  end
  return nil
end
if KEYS[2] then
  local wait = full(KEYS[2], ARGV[2])
  if wait then return {'request', tostring(wait)} end
end
local wait = full(KEYS[1], ARGV[1])
if wait then return {'global', tostring(wait)} end
for _, key in ipairs(KEYS) do
  if redis.call('INCR', key) == 1 then redis.call('PEXPIRE', key, ARGV[3]) end
end
return {'ok'}
"#;

#[derive(Debug, Clone)]
struct Scripts {
    enqueue: Script,
    reserve: Script,
    heartbeat: Script,
    complete: Script,
    fail: Script,
    reclaim: Script,
    evict: Script,
    admit: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            reserve: Script::new(RESERVE),
            heartbeat: Script::new(&format!("{OWNER_CHECK}{HEARTBEAT}")),
            complete: Script::new(&format!("{OWNER_CHECK}{COMPLETE}")),
            fail: Script::new(&format!("{OWNER_CHECK}{FAIL}")),
            reclaim: Script::new(RECLAIM),
            evict: Script::new(EVICT),
            admit: Script::new(ADMIT),
        }
    }
}

/// Key names under one prefix.
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn job(&self, id: &str) -> String {
        format!("{}job:{id}", self.prefix)
    }

    fn queue(&self, job_type: &str) -> String {
        format!("{}queue:{job_type}", self.prefix)
    }

    fn types(&self) -> String {
        format!("{}types", self.prefix)
    }

    fn processing(&self) -> String {
        format!("{}processing", self.prefix)
    }

    fn lease(&self, id: &str) -> String {
        format!("{}lease:{id}", self.prefix)
    }

    fn idempotency(&self, key: &str) -> String {
        format!("{}idem:{}", self.prefix, digest(key))
    }

    /// Failures are tracked per idempotency key, or per job without one.
    fn failure(&self, idempotency_key: Option<&str>, job_id: &str) -> String {
        match idempotency_key {
            Some(key) => format!("{}failure:{}", self.prefix, digest(key)),
            None => format!("{}failure:{job_id}", self.prefix),
        }
    }

    fn request(&self, request_id: &str) -> String {
        format!("{}request:{request_id}", self.prefix)
    }

    fn global_rate(&self) -> String {
        format!("{}ratelimit:global", self.prefix)
    }

    fn request_rate(&self, request_id: &str) -> String {
        format!("{}ratelimit:req:{request_id}", self.prefix)
    }

    fn metrics(&self) -> String {
        format!("{}metrics", self.prefix)
    }

    fn job_pattern(&self) -> String {
        format!("{}job:*", self.prefix)
    }
}

fn digest(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

fn queue_score(priority: JobPriority, ready_at: DateTime<Utc>) -> i64 {
    i64::from(priority.rank()) * RANK_BAND + ready_at.timestamp_millis()
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn corrupt(field: &str) -> AppError {
    AppError::internal(format!("Stored job has a missing or malformed '{field}' field"))
}

fn parse_time(fields: &HashMap<String, String>, name: &str) -> Result<Option<DateTime<Utc>>> {
    fields
        .get(name)
        .map(|raw| {
            raw.parse::<i64>()
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .ok_or_else(|| corrupt(name))
        })
        .transpose()
}

fn parse_json<T: DeserializeOwned>(fields: &HashMap<String, String>, name: &str) -> Result<Option<T>> {
    fields
        .get(name)
        .map(|raw| serde_json::from_str(raw).map_err(AppError::from))
        .transpose()
}

fn parse_num<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T> {
    fields
        .get(name)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| corrupt(name))
}

fn required(fields: &HashMap<String, String>, name: &str) -> Result<String> {
    fields.get(name).cloned().ok_or_else(|| corrupt(name))
}

/// Flatten a job into hash fields. Absent optionals are left out.
fn job_to_fields(job: &Job) -> Result<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("id", job.id.clone()),
        ("type", job.job_type.clone()),
        ("status", job.status.as_str().to_string()),
        ("priority", job.priority.as_str().to_string()),
        ("rank", job.priority.rank().to_string()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("progress", job.progress.to_string()),
        ("attempts", job.attempts.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("created_at", job.created_at.timestamp_millis().to_string()),
        ("updated_at", job.updated_at.timestamp_millis().to_string()),
        ("trace_id", job.trace_id.clone()),
    ];
    if let Some(result) = &job.result {
        fields.push(("result", serde_json::to_string(result)?));
    }
    if let Some(error) = &job.error {
        fields.push(("error", serde_json::to_string(error)?));
    }
    if let Some(error) = &job.last_error {
        fields.push(("last_error", serde_json::to_string(error)?));
    }
    for (name, at) in [
        ("started_at", job.started_at),
        ("completed_at", job.completed_at),
        ("next_attempt_at", job.next_attempt_at),
    ] {
        if let Some(at) = at {
            fields.push((name, at.timestamp_millis().to_string()));
        }
    }
    if let Some(request_id) = &job.request_id {
        fields.push(("request_id", request_id.clone()));
    }
    if let Some(key) = &job.idempotency_key {
        fields.push(("idempotency_key", key.clone()));
    }
    if !job.metadata.is_empty() {
        fields.push(("metadata", serde_json::to_string(&job.metadata)?));
    }
    if let Some(policy) = &job.retry_policy {
        fields.push(("retry_policy", serde_json::to_string(policy)?));
    }
    Ok(fields)
}

fn job_from_fields(fields: &HashMap<String, String>) -> Result<Job> {
    let created_at = parse_time(fields, "created_at")?.ok_or_else(|| corrupt("created_at"))?;
    Ok(Job {
        id: required(fields, "id")?,
        job_type: required(fields, "type")?,
        status: required(fields, "status")?.parse()?,
        priority: required(fields, "priority")?
            .parse()
            .map_err(|_| corrupt("priority"))?,
        payload: parse_json(fields, "payload")?.unwrap_or_default(),
        result: parse_json(fields, "result")?,
        error: parse_json(fields, "error")?,
        last_error: parse_json(fields, "last_error")?,
        progress: parse_num(fields, "progress")?,
        attempts: parse_num(fields, "attempts")?,
        max_attempts: parse_num(fields, "max_attempts")?,
        created_at,
        started_at: parse_time(fields, "started_at")?,
        completed_at: parse_time(fields, "completed_at")?,
        updated_at: parse_time(fields, "updated_at")?.unwrap_or(created_at),
        request_id: fields.get("request_id").cloned(),
        idempotency_key: fields.get("idempotency_key").cloned(),
        metadata: parse_json(fields, "metadata")?.unwrap_or_default(),
        retry_policy: parse_json(fields, "retry_policy")?,
        next_attempt_at: parse_time(fields, "next_attempt_at")?,
        trace_id: fields.get("trace_id").cloned().unwrap_or_default(),
    })
}

fn pair_fields(mut items: impl Iterator<Item = String>) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    while let (Some(name), Some(value)) = (items.next(), items.next()) {
        fields.insert(name, value);
    }
    fields
}

/// Decode a script reply: a status word, then `HGETALL` pairs on success.
fn script_job(job_id: &str, reply: Vec<String>) -> Result<Option<Job>> {
    let mut items = reply.into_iter();
    match items.next().as_deref() {
        Some("ok") => job_from_fields(&pair_fields(items)).map(Some),
        Some("empty") => Ok(None),
        Some("forbidden") => Err(lease_holder_mismatch(job_id)),
        Some("no_lease") => Err(lease_missing(job_id)),
        Some("no_job") => Err(job_missing(job_id)),
        other => Err(AppError::internal(format!(
            "Unexpected script reply {other:?} for job {job_id}"
        ))),
    }
}

fn retry_after_from_ms(raw: Option<&String>) -> u64 {
    let ms = raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(60_000);
    ceil_secs(Duration::from_millis(ms)).max(1)
}

/// Durable provider over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisProvider {
    conn: MultiplexedConnection,
    keys: Keys,
    scripts: Scripts,
    config: ProviderConfig,
    job_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisProvider")
            .field("prefix", &self.keys.prefix)
            .field("config", &self.config)
            .field("job_ttl", &self.job_ttl)
            .finish_non_exhaustive()
    }
}

impl RedisProvider {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(
        url: &str,
        config: ProviderConfig,
        key_prefix: impl Into<String>,
        job_ttl: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(url).map_err(redis_error)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_error)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        let keys = Keys {
            prefix: key_prefix.into(),
        };
        tracing::info!(prefix = %keys.prefix, "connected to redis");
        Ok(Self {
            conn,
            keys,
            scripts: Scripts::load(),
            config,
            job_ttl,
            clock: shared_system_clock(),
        })
    }

    /// Use `clock` for job timestamps. Lease expiry stays on the server clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Delete every key under this provider's prefix.
    pub async fn flush(&self) -> Result<usize> {
        let keys = self.scan(&format!("{}*", self.keys.prefix)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(&keys).await.map_err(redis_error)?;
        Ok(removed)
    }

    /// Idempotency and request index keys for `job`, empty when it has none.
    fn index_keys(&self, job: &Job) -> (String, String) {
        let idem = job
            .idempotency_key
            .as_deref()
            .map(|key| self.keys.idempotency(key))
            .unwrap_or_default();
        let request = job
            .request_id
            .as_deref()
            .map(|id| self.keys.request(id))
            .unwrap_or_default();
        (idem, request)
    }

    fn job_ttl_secs(&self) -> u64 {
        self.job_ttl.as_secs().max(1)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            found.extend(batch);
            if next == 0 {
                return Ok(found);
            }
            cursor = next;
        }
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(self.keys.job(job_id)).await.map_err(redis_error)?;
        if fields.is_empty() {
            return Ok(None);
        }
        job_from_fields(&fields).map(Some)
    }

    async fn failure_gate(&self, idempotency_key: &str, now: DateTime<Utc>) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let next_retry_at: Option<i64> = conn
            .hget(self.keys.failure(Some(idempotency_key), ""), "next_retry_at")
            .await
            .map_err(redis_error)?;
        Ok(next_retry_at.and_then(|at| {
            let wait = at - now.timestamp_millis();
            (wait > 0).then(|| ceil_secs(Duration::from_millis(wait as u64)).max(1))
        }))
    }

    async fn queued_count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let types: Vec<String> = conn.smembers(self.keys.types()).await.map_err(redis_error)?;
        if types.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        for job_type in &types {
            pipe.zcard(self.keys.queue(job_type));
        }
        let sizes: Vec<usize> = pipe.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(sizes.into_iter().sum())
    }

    async fn admit(&self, request_id: Option<&str>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.admit.prepare_invoke();
        invocation.key(self.keys.global_rate());
        if let Some(request_id) = request_id {
            invocation.key(self.keys.request_rate(request_id));
        }
        invocation
            .arg(self.config.rate_limit_per_minute)
            .arg(self.config.rate_limit_per_request)
            .arg(millis(RATE_LIMIT_WINDOW));
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(redis_error)?;

        match (reply.first().map(String::as_str), request_id) {
            (Some("ok"), _) => Ok(()),
            (Some("request"), Some(request_id)) => Err(request_quota_exceeded(
                request_id,
                retry_after_from_ms(reply.get(1)),
            )),
            _ => Err(global_quota_exceeded(retry_after_from_ms(reply.get(1)))),
        }
    }
}

#[async_trait]
impl QueueProvider for RedisProvider {
    fn backend(&self) -> Backend {
        Backend::Durable
    }

    async fn submit(&self, request: EnqueueRequest) -> Result<Submitted> {
        request.validate()?;
        let now = self.clock.now();
        let mut conn = self.conn.clone();

        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(wait) = self.failure_gate(key, now).await? {
                return Err(backoff_gate(wait));
            }
            let holder: Option<String> = conn
                .get(self.keys.idempotency(key))
                .await
                .map_err(redis_error)?;
            if let Some(holder) = holder {
                if let Some(existing) = self.load_job(&holder).await? {
                    if existing.status.is_active() {
                        tracing::debug!(job_id = %existing.id, "idempotency key matched active job");
                        return Ok(Submitted::reused(existing));
                    }
                }
            }
        }

        if self.queued_count().await? >= self.config.max_queue_size {
            return Err(queue_full(self.config.max_queue_size));
        }
        self.admit(request.request_id.as_deref()).await?;

        let job = Job::from_request(request, self.config.default_max_attempts, now);
        let (idem_key, request_key) = self.index_keys(&job);
        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(self.keys.job(&job.id))
            .key(self.keys.queue(&job.job_type))
            .key(self.keys.types())
            .key(self.keys.metrics())
            .arg(&self.keys.prefix)
            .arg(&job.id)
            .arg(idem_key)
            .arg(self.config.idempotency_ttl.as_secs().max(1))
            .arg(request_key)
            .arg(queue_score(job.priority, now))
            .arg(&job.job_type);
        for (name, value) in job_to_fields(&job)? {
            invocation.arg(name).arg(value);
        }
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(redis_error)?;

        let mut items = reply.into_iter();
        match items.next().as_deref() {
            Some("created") => Ok(Submitted::created(job)),
            Some("existing") => {
                let winner = job_from_fields(&pair_fields(items))?;
                tracing::debug!(job_id = %winner.id, "lost idempotency race; reusing winner");
                Ok(Submitted::reused(winner))
            }
            other => Err(AppError::internal(format!(
                "Unexpected enqueue reply {other:?} for job {}",
                job.id
            ))),
        }
    }

    async fn reserve(&self, worker_id: &str, types: Option<&[String]>) -> Result<Option<Job>> {
        self.reclaim_expired_leases().await?;
        let now = self.clock.now();
        let mut conn = self.conn.clone();

        let mut invocation = self.scripts.reserve.prepare_invoke();
        invocation
            .key(self.keys.processing())
            .key(self.keys.types())
            .key(self.keys.metrics())
            .arg(&self.keys.prefix)
            .arg(worker_id)
            .arg(now.timestamp_millis())
            .arg(millis(self.config.visibility_timeout))
            .arg(self.config.max_concurrent);
        if let Some(types) = types {
            if types.is_empty() {
                return Ok(None);
            }
            for job_type in types {
                invocation.arg(job_type);
            }
        }
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(redis_error)?;
        script_job("<next>", reply)
    }

    async fn heartbeat(&self, job_id: &str, worker_id: &str, progress: Option<i64>) -> Result<()> {
        let now = self.clock.now();
        let mut conn = self.conn.clone();
        let progress = progress
            .map(|p| clamp_progress(p).to_string())
            .unwrap_or_default();
        let reply: Vec<String> = self
            .scripts
            .heartbeat
            .key(self.keys.job(job_id))
            .key(self.keys.lease(job_id))
            .arg(worker_id)
            .arg(millis(self.config.visibility_timeout))
            .arg(progress)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        match reply.first().map(String::as_str) {
            Some("ok") => Ok(()),
            _ => script_job(job_id, reply).map(|_| ()),
        }
    }

    async fn complete(&self, job_id: &str, worker_id: &str, result: Payload) -> Result<Job> {
        let now = self.clock.now();
        let mut conn = self.conn.clone();
        let idempotency_key: Option<String> = conn
            .hget(self.keys.job(job_id), "idempotency_key")
            .await
            .map_err(redis_error)?;

        let reply: Vec<String> = self
            .scripts
            .complete
            .key(self.keys.job(job_id))
            .key(self.keys.lease(job_id))
            .key(self.keys.processing())
            .key(self.keys.failure(idempotency_key.as_deref(), job_id))
            .key(self.keys.metrics())
            .arg(worker_id)
            .arg(serde_json::to_string(&result)?)
            .arg(now.timestamp_millis())
            .arg(self.job_ttl_secs())
            .arg(job_id)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        script_job(job_id, reply)?.ok_or_else(|| job_missing(job_id))
    }

    async fn fail(&self, job_id: &str, worker_id: &str, mut error: JobError) -> Result<Job> {
        let now = self.clock.now();
        let job = self.load_job(job_id).await?.ok_or_else(|| job_missing(job_id))?;

        let retry = job.should_retry(&error);
        let next_retry_at = if retry {
            let delay = job.retry_delay(&error);
            error.retry_after = Some(ceil_secs(delay));
            now + chrono::Duration::milliseconds(millis(delay) as i64)
        } else {
            error.retry_after = None;
            now
        };
        let failure_ttl = (next_retry_at - now).num_milliseconds().max(0) as u64
            + millis(self.config.idempotency_ttl);

        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .scripts
            .fail
            .key(self.keys.job(job_id))
            .key(self.keys.lease(job_id))
            .key(self.keys.processing())
            .key(self.keys.failure(job.idempotency_key.as_deref(), job_id))
            .key(self.keys.metrics())
            .key(self.keys.queue(&job.job_type))
            .arg(worker_id)
            .arg(job_id)
            .arg(if retry { "retry" } else { "terminal" })
            .arg(now.timestamp_millis())
            .arg(serde_json::to_string(&error)?)
            .arg(next_retry_at.timestamp_millis())
            .arg(queue_score(job.priority, next_retry_at))
            .arg(failure_ttl)
            .arg(self.job_ttl_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        script_job(job_id, reply)?.ok_or_else(|| job_missing(job_id))
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.load_job(job_id).await
    }

    async fn get_stats(&self) -> Result<QueueStats> {
        let keys = self.scan(&self.keys.job_pattern()).await?;
        let mut conn = self.conn.clone();
        let mut counts = [0u64; 5];

        if !keys.is_empty() {
            let mut pipe = redis::pipe();
            for key in &keys {
                pipe.hget(key, "status");
            }
            let statuses: Vec<Option<String>> =
                pipe.query_async(&mut conn).await.map_err(redis_error)?;
            for status in statuses.into_iter().flatten() {
                let slot = match status.parse::<JobStatus>()? {
                    JobStatus::Queued => 0,
                    JobStatus::Processing => 1,
                    JobStatus::Completed => 2,
                    JobStatus::Failed => 3,
                    JobStatus::Cancelled => 4,
                };
                counts[slot] += 1;
            }
        }

        let metrics: HashMap<String, i64> =
            conn.hgetall(self.keys.metrics()).await.map_err(redis_error)?;
        let processed = metrics.get("processed_count").copied().unwrap_or(0);
        let avg = (processed > 0).then(|| {
            metrics.get("total_processing_ms").copied().unwrap_or(0) as f64 / processed as f64
        });
        Ok(QueueStats::from_counts(
            counts[0], counts[1], counts[2], counts[3], counts[4], avg,
        ))
    }

    async fn clean_old_jobs(&self, max_age: Duration) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now.timestamp_millis() - millis(max_age) as i64;
        let keys = self.scan(&self.keys.job_pattern()).await?;
        let mut removed = 0;

        for key in keys {
            let mut conn = self.conn.clone();
            let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(redis_error)?;
            if fields.is_empty() {
                continue;
            }
            let job = match job_from_fields(&fields) {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "skipping unreadable job record");
                    continue;
                }
            };
            let finished = job.completed_at.unwrap_or(job.created_at);
            if !job.is_terminal() || finished.timestamp_millis() >= cutoff {
                continue;
            }

            let (idem_key, request_key) = self.index_keys(&job);
            let _: Vec<String> = self
                .scripts
                .evict
                .key(&key)
                .key(self.keys.queue(&job.job_type))
                .key(self.keys.failure(job.idempotency_key.as_deref(), &job.id))
                .arg(&job.id)
                .arg(now.timestamp_millis())
                .arg(idem_key)
                .arg(request_key)
                .invoke_async(&mut conn)
                .await
                .map_err(redis_error)?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn get_request_jobs(&self, request_id: &str) -> Result<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.keys.request(request_id))
            .await
            .map_err(redis_error)?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load_job(&id).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn get_request_job_count(&self, request_id: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.keys.request(request_id))
            .await
            .map_err(redis_error)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.exists(self.keys.job(id));
        }
        let present: Vec<bool> = pipe.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(present.into_iter().filter(|p| *p).count())
    }

    async fn reclaim_expired_leases(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut conn = self.conn.clone();
        let error = JobError::new(LEASE_EXPIRED, "Lease expired with no attempts left").non_retryable();
        let outcomes: Vec<String> = self
            .scripts
            .reclaim
            .key(self.keys.processing())
            .key(self.keys.metrics())
            .arg(&self.keys.prefix)
            .arg(now.timestamp_millis())
            .arg(self.job_ttl_secs())
            .arg(serde_json::to_string(&error)?)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        for pair in outcomes.chunks(2) {
            if let [job_id, outcome] = pair {
                if outcome == "failed" {
                    tracing::warn!(job_id = %job_id, "lease expired on final attempt; job failed");
                } else {
                    tracing::warn!(job_id = %job_id, "lease expired; job returned to queue");
                }
            }
        }
        Ok(outcomes.len() / 2)
    }
}
