//! RedisTaskQueue: the production queue.
//!
//! # Keys
//! - `{ns}:queue`: list of task ids, FIFO
//! - `{ns}:running`: set of popped, not yet closed task ids
//! - `{ns}:limits`: hash with `max_queued` / `max_running`
//! - `{ns}:task:{id}:body`: envelope JSON
//! - `{ns}:task:{id}:status`: status hash
//! - `{ns}:task:{id}:result`: hash ip -> host result JSON
//!
//! Admission checks run inside Lua scripts so the check and the mutation are
//! one atomic step. Counter changes go through `HINCRBY` in a MULTI block.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::domain::{HostResult, StatusChange, TaskEnvelope, TaskId, TaskPhase, TaskStatus};
use crate::domain::status::PHASE_FIELD;
use crate::ports::{AdmissionLimits, QueueError, QueueStats, TaskQueue};

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Backend(err.to_string())
    }
}

// KEYS: queue, limits, body, status
// ARGV: default max_queued, task id, body, status field/value pairs...
const PUSH_LUA: &str = r#"
local max = tonumber(redis.call('HGET', KEYS[2], 'max_queued') or ARGV[1])
local len = redis.call('LLEN', KEYS[1])
if len >= max then
  return {0, len, max}
end
redis.call('SET', KEYS[3], ARGV[3])
redis.call('DEL', KEYS[4])
redis.call('HSET', KEYS[4], unpack(ARGV, 4))
redis.call('RPUSH', KEYS[1], ARGV[2])
return {1, len + 1, max}
"#;

// KEYS: queue, running, limits
// ARGV: default max_running, task key prefix
const POP_LUA: &str = r#"
local max = tonumber(redis.call('HGET', KEYS[3], 'max_running') or ARGV[1])
if redis.call('SCARD', KEYS[2]) >= max then
  return false
end
local id = redis.call('LPOP', KEYS[1])
if not id then
  return false
end
local body = redis.call('GET', ARGV[2] .. id .. ':body')
if not body then
  redis.call('DEL', ARGV[2] .. id .. ':status', ARGV[2] .. id .. ':result')
  return {id}
end
redis.call('SADD', KEYS[2], id)
return {id, body}
"#;

#[derive(Debug, Clone)]
struct KeySpace {
    ns: String,
}

impl KeySpace {
    fn queue(&self) -> String {
        format!("{}:queue", self.ns)
    }

    fn running(&self) -> String {
        format!("{}:running", self.ns)
    }

    fn limits(&self) -> String {
        format!("{}:limits", self.ns)
    }

    fn task_prefix(&self) -> String {
        format!("{}:task:", self.ns)
    }

    fn body(&self, id: TaskId) -> String {
        format!("{}:task:{id}:body", self.ns)
    }

    fn status(&self, id: TaskId) -> String {
        format!("{}:task:{id}:status", self.ns)
    }

    fn result(&self, id: TaskId) -> String {
        format!("{}:task:{id}:result", self.ns)
    }
}

pub struct RedisTaskQueue {
    conn: ConnectionManager,
    keys: KeySpace,
    /// Used while the limits hash has no value for a field.
    defaults: AdmissionLimits,
    push_script: Script,
    pop_script: Script,
}

impl RedisTaskQueue {
    pub async fn connect(
        url: &str,
        namespace: &str,
        defaults: AdmissionLimits,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, namespace, defaults))
    }

    pub fn new(conn: ConnectionManager, namespace: &str, defaults: AdmissionLimits) -> Self {
        Self {
            conn,
            keys: KeySpace {
                ns: namespace.to_string(),
            },
            defaults,
            push_script: Script::new(PUSH_LUA),
            pop_script: Script::new(POP_LUA),
        }
    }

    fn parse_limits(&self, raw: &HashMap<String, String>) -> AdmissionLimits {
        let field = |name: &str, default: usize| {
            raw.get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        AdmissionLimits {
            max_queued: field("max_queued", self.defaults.max_queued),
            max_running: field("max_running", self.defaults.max_running),
        }
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn push(&self, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        let task_id = envelope.task_id();
        let phase = envelope.task.phase();
        if phase != Some(TaskPhase::Wait) {
            return Err(QueueError::InvalidPhase { task_id, phase });
        }
        let body = serde_json::to_string(envelope)?;
        let status = TaskStatus::queued(envelope.task.hosts.len());

        let mut invocation = self.push_script.prepare_invoke();
        invocation
            .key(self.keys.queue())
            .key(self.keys.limits())
            .key(self.keys.body(task_id))
            .key(self.keys.status(task_id))
            .arg(self.defaults.max_queued)
            .arg(task_id.to_string())
            .arg(body);
        for (field, value) in status.to_fields() {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        match reply.as_slice() {
            [1, ..] => Ok(()),
            [0, queued, max_queued] => Err(QueueError::QueueFull {
                queued: *queued as usize,
                max_queued: *max_queued as usize,
            }),
            other => Err(QueueError::Backend(format!(
                "unexpected push reply {other:?}"
            ))),
        }
    }

    async fn pop_or_none(&self) -> Result<Option<TaskEnvelope>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<String>> = self
            .pop_script
            .key(self.keys.queue())
            .key(self.keys.running())
            .key(self.keys.limits())
            .arg(self.defaults.max_running)
            .arg(self.keys.task_prefix())
            .invoke_async(&mut conn)
            .await?;

        let Some(reply) = reply else {
            return Ok(None);
        };
        match reply.as_slice() {
            [id] => {
                tracing::warn!(task_id = %id, "popped task has no body, dropping");
                Ok(None)
            }
            [id, body] => match serde_json::from_str::<TaskEnvelope>(body) {
                Ok(envelope) => Ok(Some(envelope)),
                Err(err) => {
                    tracing::warn!(task_id = %id, error = %err, "popped task has a malformed body, dropping");
                    let prefix = format!("{}{id}", self.keys.task_prefix());
                    let _: () = redis::pipe()
                        .atomic()
                        .cmd("SREM")
                        .arg(self.keys.running())
                        .arg(id)
                        .ignore()
                        .cmd("DEL")
                        .arg(format!("{prefix}:body"))
                        .arg(format!("{prefix}:status"))
                        .arg(format!("{prefix}:result"))
                        .ignore()
                        .query_async(&mut conn)
                        .await?;
                    Ok(None)
                }
            },
            other => Err(QueueError::Backend(format!(
                "unexpected pop reply with {} items",
                other.len()
            ))),
        }
    }

    async fn change_status(
        &self,
        task_id: TaskId,
        changes: &[StatusChange],
    ) -> Result<(), QueueError> {
        if changes.is_empty() {
            return Ok(());
        }
        let key = self.keys.status(task_id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for change in changes {
            let cmd = match change {
                StatusChange::Phase(phase) => {
                    pipe.cmd("HSET").arg(&key).arg(PHASE_FIELD).arg(phase.as_str())
                }
                StatusChange::Set(counter, value) => {
                    pipe.cmd("HSET").arg(&key).arg(counter.field()).arg(*value)
                }
                StatusChange::Incr(counter, by) => {
                    pipe.cmd("HINCRBY").arg(&key).arg(counter.field()).arg(*by)
                }
            };
            cmd.ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn write_host_result(
        &self,
        task_id: TaskId,
        result: &HostResult,
    ) -> Result<(), QueueError> {
        let json = serde_json::to_string(result)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(self.keys.result(task_id))
            .arg(&result.ip)
            .arg(json)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_status(&self, task_id: TaskId) -> Result<TaskStatus, QueueError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.status(task_id))
            .query_async(&mut conn)
            .await?;
        Ok(TaskStatus::from_fields(raw))
    }

    async fn get_result(
        &self,
        task_id: TaskId,
    ) -> Result<BTreeMap<String, HostResult>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.result(task_id))
            .query_async(&mut conn)
            .await?;

        let mut results = BTreeMap::new();
        for (ip, json) in raw {
            match serde_json::from_str::<HostResult>(&json) {
                Ok(result) => {
                    results.insert(ip, result);
                }
                Err(err) => {
                    tracing::warn!(%task_id, host = %ip, error = %err, "skipping malformed host result");
                }
            }
        }
        Ok(results)
    }

    async fn close_task(&self, task_id: TaskId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(self.keys.running())
            .arg(task_id.to_string())
            .ignore()
            .cmd("DEL")
            .arg(self.keys.body(task_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, task_id: TaskId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(self.keys.running())
            .arg(task_id.to_string())
            .ignore()
            .cmd("DEL")
            .arg(self.keys.status(task_id))
            .arg(self.keys.result(task_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_limits(&self, limits: AdmissionLimits) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(self.keys.limits())
            .arg("max_queued")
            .arg(limits.max_queued)
            .arg("max_running")
            .arg(limits.max_running)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn limits(&self) -> Result<AdmissionLimits, QueueError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.limits())
            .query_async(&mut conn)
            .await?;
        Ok(self.parse_limits(&raw))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let (queued, running, raw): (usize, usize, HashMap<String, String>) = redis::pipe()
            .atomic()
            .cmd("LLEN")
            .arg(self.keys.queue())
            .cmd("SCARD")
            .arg(self.keys.running())
            .cmd("HGETALL")
            .arg(self.keys.limits())
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats {
            queued,
            running,
            limits: self.parse_limits(&raw),
        })
    }
}
