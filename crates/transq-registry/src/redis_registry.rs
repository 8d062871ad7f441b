//! Job registry on Redis.
//!
//! Each job is a hash at `<prefix>:job:<id>`. Two sets index the records:
//! `<prefix>:jobs` holds every ID and `<prefix>:owner:<owner>` the IDs of one
//! owner. Create and conditional update run as Lua scripts so the check and
//! the write happen in one atomic step on the server.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::{debug, warn};

use transq_models::{Job, JobId, JobStatus};

use crate::error::{RegistryError, RegistryResult};
use crate::registry::{Condition, JobRegistry, JobUpdate, RegistryConfig};

/// KEYS: job, all-jobs index, owner index. ARGV: job id, then field/value pairs.
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 2))
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[1])
return 1
"#;

/// KEYS: job. ARGV: ",S1,S2," allowed statuses, expired-before ("" = any),
/// locked-by ("" = any), op, op args.
///
/// Returns -1 if the job is missing, 0 if the condition failed, 1 if applied.
const UPDATE_IF_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
    return -1
end
if not string.find(ARGV[1], ',' .. status .. ',', 1, true) then
    return 0
end
if ARGV[2] ~= '' then
    local expires = tonumber(redis.call('HGET', KEYS[1], 'lockExpiresAt'))
    if not expires or expires >= tonumber(ARGV[2]) then
        return 0
    end
end
if ARGV[3] ~= '' and redis.call('HGET', KEYS[1], 'lockedBy') ~= ARGV[3] then
    return 0
end

local op = ARGV[4]
if op == 'lock' then
    redis.call('HSET', KEYS[1], 'status', 'PROCESSING', 'lockedBy', ARGV[5], 'lockExpiresAt', ARGV[6])
    redis.call('HDEL', KEYS[1], 'completedAt', 'errorMessage')
elseif op == 'extend' then
    local current = tonumber(redis.call('HGET', KEYS[1], 'lockExpiresAt'))
    if not current or tonumber(ARGV[5]) > current then
        redis.call('HSET', KEYS[1], 'lockExpiresAt', ARGV[5])
    end
elseif op == 'release' then
    redis.call('HSET', KEYS[1], 'status', ARGV[5], 'completedAt', ARGV[6])
    redis.call('HDEL', KEYS[1], 'lockedBy', 'lockExpiresAt')
    if ARGV[7] ~= '' then
        redis.call('HSET', KEYS[1], 'errorMessage', ARGV[7])
    else
        redis.call('HDEL', KEYS[1], 'errorMessage')
    end
else
    return redis.error_reply('unknown op ' .. op)
end
return 1
"#;

/// Redis-backed [`JobRegistry`].
pub struct RedisRegistry {
    client: redis::Client,
    config: RegistryConfig,
    create_script: Script,
    update_script: Script,
}

impl RedisRegistry {
    pub fn new(config: RegistryConfig) -> RegistryResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            create_script: Script::new(CREATE_SCRIPT),
            update_script: Script::new(UPDATE_IF_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> RegistryResult<Self> {
        Self::new(RegistryConfig::from_env())
    }

    async fn conn(&self) -> RegistryResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RegistryError::ConnectionFailed(e.to_string()))
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.config.key_prefix, job_id)
    }

    fn index_key(&self) -> String {
        format!("{}:jobs", self.config.key_prefix)
    }

    fn owner_key(&self, owner_id: &str) -> String {
        format!("{}:owner:{}", self.config.key_prefix, owner_id)
    }

    async fn load_many(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        ids: Vec<String>,
    ) -> RegistryResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.job_key(&JobId::from(id.as_str())));
        }
        let rows: Vec<HashMap<String, String>> = pipe.query_async(conn).await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (id, row) in ids.iter().zip(rows) {
            if row.is_empty() {
                // Indexed but gone; skip rather than fail the whole listing
                warn!(job_id = %id, "Index entry without job record");
                continue;
            }
            jobs.push(decode_job(&row)?);
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}

/// Flatten a job into hash field/value pairs. Absent options are omitted.
fn encode_job(job: &Job) -> RegistryResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("jobId", job.job_id.to_string()),
        ("ownerId", job.owner_id.clone()),
        ("inputRef", job.input_ref.clone()),
        ("outputRef", job.output_ref.clone()),
        ("params", serde_json::to_string(&job.params)?),
        ("status", job.status.as_str().to_string()),
        ("createdAt", job.created_at.to_rfc3339()),
    ];
    if let Some(at) = job.completed_at {
        fields.push(("completedAt", at.to_rfc3339()));
    }
    if let Some(msg) = &job.error_message {
        fields.push(("errorMessage", msg.clone()));
    }
    if let Some(worker) = &job.locked_by {
        fields.push(("lockedBy", worker.clone()));
    }
    if let Some(expires) = job.lock_expires_at {
        fields.push(("lockExpiresAt", expires.to_string()));
    }
    Ok(fields)
}

fn decode_job(row: &HashMap<String, String>) -> RegistryResult<Job> {
    let field = |name: &str| {
        row.get(name)
            .cloned()
            .ok_or_else(|| RegistryError::corrupt(format!("missing field {name}")))
    };
    let timestamp = |raw: &str| {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| RegistryError::corrupt(format!("bad timestamp {raw}: {e}")))
    };

    let status: JobStatus = field("status")?
        .parse()
        .map_err(RegistryError::corrupt)?;

    Ok(Job {
        job_id: JobId::from(field("jobId")?),
        owner_id: field("ownerId")?,
        input_ref: field("inputRef")?,
        output_ref: field("outputRef")?,
        params: serde_json::from_str(&field("params")?)?,
        status,
        created_at: timestamp(&field("createdAt")?)?,
        completed_at: row
            .get("completedAt")
            .map(|raw| timestamp(raw))
            .transpose()?,
        error_message: row.get("errorMessage").cloned(),
        locked_by: row.get("lockedBy").cloned(),
        lock_expires_at: row
            .get("lockExpiresAt")
            .map(|raw| {
                raw.parse::<i64>()
                    .map_err(|e| RegistryError::corrupt(format!("bad lockExpiresAt {raw}: {e}")))
            })
            .transpose()?,
    })
}

/// Script arguments for a condition/update pair.
fn update_args(condition: &Condition, update: &JobUpdate) -> Vec<String> {
    let statuses = condition
        .status_in
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let mut args = vec![
        format!(",{statuses},"),
        condition
            .lock_expired_before
            .map(|t| t.to_string())
            .unwrap_or_default(),
        condition.locked_by.clone().unwrap_or_default(),
    ];

    match update {
        JobUpdate::Lock {
            worker_id,
            lock_expires_at,
        } => {
            args.push("lock".into());
            args.push(worker_id.clone());
            args.push(lock_expires_at.to_string());
        }
        JobUpdate::ExtendLease { lock_expires_at } => {
            args.push("extend".into());
            args.push(lock_expires_at.to_string());
        }
        JobUpdate::Release {
            status,
            completed_at,
            error_message,
        } => {
            args.push("release".into());
            args.push(status.as_str().into());
            args.push(completed_at.to_rfc3339());
            // Only FAILED carries an error message
            let error = match status {
                JobStatus::Failed => error_message.clone().unwrap_or_default(),
                _ => String::new(),
            };
            args.push(error);
        }
    }
    args
}

#[async_trait]
impl JobRegistry for RedisRegistry {
    async fn create(&self, job: &Job) -> RegistryResult<()> {
        let mut conn = self.conn().await?;

        let mut invocation = self.create_script.prepare_invoke();
        invocation
            .key(self.job_key(&job.job_id))
            .key(self.index_key())
            .key(self.owner_key(&job.owner_id))
            .arg(job.job_id.as_str());
        for (name, value) in encode_job(job)? {
            invocation.arg(name).arg(value);
        }

        let created: i32 = invocation.invoke_async(&mut conn).await?;
        if created == 0 {
            return Err(RegistryError::duplicate_job(job.job_id.as_str()));
        }

        debug!(job_id = %job.job_id, "Created job record");
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> RegistryResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let row: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.job_key(job_id))
            .query_async(&mut conn)
            .await?;
        if row.is_empty() {
            return Ok(None);
        }
        decode_job(&row).map(Some)
    }

    async fn scan(&self) -> RegistryResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index_key())
            .query_async(&mut conn)
            .await?;
        self.load_many(&mut conn, ids).await
    }

    async fn list_for_owner(&self, owner_id: &str) -> RegistryResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.owner_key(owner_id))
            .query_async(&mut conn)
            .await?;
        self.load_many(&mut conn, ids).await
    }

    async fn update_if(
        &self,
        job_id: &JobId,
        condition: &Condition,
        update: &JobUpdate,
    ) -> RegistryResult<bool> {
        update.check_against(condition)?;

        let mut conn = self.conn().await?;
        let mut invocation = self.update_script.prepare_invoke();
        invocation.key(self.job_key(job_id));
        for arg in update_args(condition, update) {
            invocation.arg(arg);
        }

        let outcome: i32 = invocation.invoke_async(&mut conn).await?;
        match outcome {
            -1 => Err(RegistryError::job_not_found(job_id.as_str())),
            0 => Ok(false),
            _ => Ok(true),
        }
    }
}
