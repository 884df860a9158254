//! Redis-backed broker.
//!
//! Each state transition is a single Lua script (see `scripts.rs`), so the
//! store never exposes a task that is in two collections at once or in
//! none. Scripts for one task only touch keys of that task's queue; the
//! queue name is the cluster hash tag.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::config::BrokerConfig;
use super::keys;
use super::scripts::Scripts;
use super::{
    add_duration, from_score, new_lease_id, score, Broker, LeasedTask, QueueStats, ServerInfo,
    TaskEntry, TaskState, BATCH_SIZE,
};
use crate::error::BrokerError;
use crate::task::TaskMessage;

/// Broker storing tasks in Redis.
pub struct RedisBroker {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    config: BrokerConfig,
    scripts: Scripts,
}

impl RedisBroker {
    /// Connects to the Redis instance named by `config.redis_url`.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Unavailable` if the connection fails.
    pub async fn connect(config: BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let redis = ConnectionManager::new(client).await?;

        Ok(Self::from_connection(redis, config))
    }

    /// Creates a broker from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, config: BrokerConfig) -> Self {
        Self {
            redis,
            config,
            scripts: Scripts::new(),
        }
    }

    /// Returns the broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    async fn register_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(keys::all_queues(), queue).await?;
        Ok(())
    }

    fn not_active(msg: &TaskMessage) -> BrokerError {
        BrokerError::TaskNotFound {
            id: msg.id.clone(),
            queue: msg.queue.clone(),
            state: TaskState::Active.as_str(),
        }
    }

    fn unique_lock(msg: &TaskMessage) -> Option<String> {
        msg.unique_key
            .as_deref()
            .map(|key| keys::unique(&msg.queue, key))
    }

    /// Fetches stored messages for `ids` of one queue, skipping ids whose
    /// record has vanished.
    async fn load_messages(
        &self,
        queue: &str,
        ids: &[String],
    ) -> Result<Vec<Option<TaskMessage>>, BrokerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hget(keys::task(queue, id), "msg");
        }

        let mut conn = self.redis.clone();
        let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        raw.into_iter()
            .map(|data| data.map(|d| TaskMessage::decode(&d)).transpose())
            .collect::<Result<Vec<_>, _>>()
            .map_err(BrokerError::from)
    }

    async fn insert(
        &self,
        msg: &TaskMessage,
        process_at: Option<DateTime<Utc>>,
        unique_ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.register_queue(&msg.queue).await?;

        let encoded = msg.encode()?;
        let task_key = keys::task(&msg.queue, &msg.id);
        let mut conn = self.redis.clone();

        let result: i64 = match (unique_ttl, Self::unique_lock(msg)) {
            (Some(ttl), Some(lock)) => {
                let ttl_secs = ttl.as_secs().max(1);
                match process_at {
                    None => {
                        self.scripts
                            .enqueue_unique
                            .key(&lock)
                            .key(&task_key)
                            .key(keys::pending(&msg.queue))
                            .arg(&msg.id)
                            .arg(ttl_secs)
                            .arg(&encoded)
                            .invoke_async(&mut conn)
                            .await?
                    }
                    Some(at) => {
                        self.scripts
                            .schedule_unique
                            .key(&lock)
                            .key(&task_key)
                            .key(keys::scheduled(&msg.queue))
                            .arg(&msg.id)
                            .arg(ttl_secs)
                            .arg(&encoded)
                            .arg(score(at))
                            .invoke_async(&mut conn)
                            .await?
                    }
                }
            }
            _ => match process_at {
                None => {
                    self.scripts
                        .enqueue
                        .key(&task_key)
                        .key(keys::pending(&msg.queue))
                        .arg(&encoded)
                        .arg(&msg.id)
                        .invoke_async(&mut conn)
                        .await?
                }
                Some(at) => {
                    self.scripts
                        .schedule
                        .key(&task_key)
                        .key(keys::scheduled(&msg.queue))
                        .arg(&encoded)
                        .arg(score(at))
                        .arg(&msg.id)
                        .invoke_async(&mut conn)
                        .await?
                }
            },
        };

        match result {
            1 => Ok(()),
            0 => Err(BrokerError::TaskIdConflict(msg.id.clone())),
            _ => Err(BrokerError::DuplicateTask(
                msg.unique_key.clone().unwrap_or_default(),
            )),
        }
    }

    /// Archives `msg`. With a `lease_id` the task must be active under
    /// that lease; without one it must not be stored yet.
    async fn archive_inner(
        &self,
        msg: &TaskMessage,
        error_msg: &str,
        lease_id: Option<&str>,
    ) -> Result<i64, BrokerError> {
        let now = Utc::now();
        let archived = msg.with_failure(error_msg, now);
        let cutoff = now
            - chrono::Duration::from_std(self.config.archived_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(90));

        let mut invocation = self.scripts.archive.prepare_invoke();
        invocation
            .key(keys::task(&msg.queue, &msg.id))
            .key(keys::active(&msg.queue))
            .key(keys::lease(&msg.queue))
            .key(keys::archived(&msg.queue))
            .key(keys::failed(&msg.queue));
        if let Some(lock) = Self::unique_lock(msg) {
            invocation.key(lock);
        }
        invocation
            .arg(&msg.id)
            .arg(archived.encode()?)
            .arg(score(now))
            .arg(score(cutoff))
            .arg(self.config.archived_max_size)
            .arg(keys::task_key_prefix(&msg.queue))
            .arg(if lease_id.is_some() { "1" } else { "0" })
            .arg(lease_id.unwrap_or_default());

        let mut conn = self.redis.clone();
        Ok(invocation.invoke_async(&mut conn).await?)
    }

    async fn scored_ids(&self, key: String) -> Result<Vec<(String, i64)>, BrokerError> {
        let mut conn = self.redis.clone();
        let entries: Vec<(String, f64)> = conn.zrange_withscores(key, 0, -1).await?;
        Ok(entries
            .into_iter()
            .map(|(id, s)| (id, s as i64))
            .collect())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn lease_duration(&self) -> Duration {
        self.config.lease_duration
    }

    async fn enqueue(
        &self,
        msg: &TaskMessage,
        unique_ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.insert(msg, None, unique_ttl).await
    }

    async fn schedule(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        unique_ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.insert(msg, Some(process_at), unique_ttl).await
    }

    async fn dequeue(&self, server_id: &str, queues: &[String]) -> Result<LeasedTask, BrokerError> {
        let mut conn = self.redis.clone();

        for queue in queues {
            let lease_deadline = add_duration(Utc::now(), self.config.lease_duration);
            let lease_id = new_lease_id();
            let data: Option<String> = self
                .scripts
                .dequeue
                .key(keys::pending(queue))
                .key(keys::active(queue))
                .key(keys::lease(queue))
                .arg(score(lease_deadline))
                .arg(keys::task_key_prefix(queue))
                .arg(server_id)
                .arg(&lease_id)
                .invoke_async(&mut conn)
                .await?;

            if let Some(data) = data {
                return Ok(LeasedTask {
                    message: TaskMessage::decode(&data)?,
                    lease_id,
                    lease_deadline,
                });
            }
        }

        Err(BrokerError::NoTaskAvailable)
    }

    async fn done(&self, msg: &TaskMessage, lease_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        let moved: i64 = if msg.retention.is_zero() {
            let mut invocation = self.scripts.done.prepare_invoke();
            invocation
                .key(keys::active(&msg.queue))
                .key(keys::lease(&msg.queue))
                .key(keys::task(&msg.queue, &msg.id))
                .key(keys::processed(&msg.queue));
            if let Some(lock) = Self::unique_lock(msg) {
                invocation.key(lock);
            }
            invocation.arg(&msg.id).arg(lease_id);
            invocation.invoke_async(&mut conn).await?
        } else {
            let now = Utc::now();
            let expiry = add_duration(now, msg.retention);

            let mut invocation = self.scripts.mark_complete.prepare_invoke();
            invocation
                .key(keys::active(&msg.queue))
                .key(keys::lease(&msg.queue))
                .key(keys::task(&msg.queue, &msg.id))
                .key(keys::processed(&msg.queue))
                .key(keys::completed(&msg.queue));
            if let Some(lock) = Self::unique_lock(msg) {
                invocation.key(lock);
            }
            invocation
                .arg(&msg.id)
                .arg(msg.completed(now).encode()?)
                .arg(score(expiry))
                .arg(lease_id);
            invocation.invoke_async(&mut conn).await?
        };

        if moved == 0 {
            return Err(Self::not_active(msg));
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        msg: &TaskMessage,
        lease_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let moved: i64 = self
            .scripts
            .retry
            .key(keys::task(&msg.queue, &msg.id))
            .key(keys::active(&msg.queue))
            .key(keys::lease(&msg.queue))
            .key(keys::scheduled(&msg.queue))
            .key(keys::failed(&msg.queue))
            .arg(&msg.id)
            .arg(msg.encode()?)
            .arg(score(retry_at))
            .arg(lease_id)
            .invoke_async(&mut conn)
            .await?;

        if moved == 0 {
            return Err(Self::not_active(msg));
        }
        Ok(())
    }

    async fn archive(
        &self,
        msg: &TaskMessage,
        lease_id: &str,
        error_msg: &str,
    ) -> Result<(), BrokerError> {
        match self.archive_inner(msg, error_msg, Some(lease_id)).await? {
            1 => Ok(()),
            _ => Err(Self::not_active(msg)),
        }
    }

    async fn archive_new(&self, msg: &TaskMessage, error_msg: &str) -> Result<(), BrokerError> {
        self.register_queue(&msg.queue).await?;
        match self.archive_inner(msg, error_msg, None).await? {
            1 => Ok(()),
            _ => Err(BrokerError::TaskIdConflict(msg.id.clone())),
        }
    }

    async fn requeue(&self, msg: &TaskMessage, lease_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let moved: i64 = self
            .scripts
            .requeue
            .key(keys::task(&msg.queue, &msg.id))
            .key(keys::active(&msg.queue))
            .key(keys::lease(&msg.queue))
            .key(keys::pending(&msg.queue))
            .arg(&msg.id)
            .arg(msg.encode()?)
            .arg(lease_id)
            .invoke_async(&mut conn)
            .await?;

        if moved == 0 {
            return Err(Self::not_active(msg));
        }
        Ok(())
    }

    async fn requeue_all(&self, server_id: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let mut total = 0;

        for queue in self.queues().await? {
            let moved: usize = self
                .scripts
                .requeue_all
                .key(keys::active(&queue))
                .key(keys::lease(&queue))
                .key(keys::pending(&queue))
                .arg(keys::task_key_prefix(&queue))
                .arg(server_id)
                .invoke_async(&mut conn)
                .await?;
            total += moved;
        }

        Ok(total)
    }

    async fn extend_lease(
        &self,
        msg: &TaskMessage,
        lease_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();
        let extended: i64 = self
            .scripts
            .extend_lease
            .key(keys::lease(&msg.queue))
            .key(keys::task(&msg.queue, &msg.id))
            .arg(score(deadline))
            .arg(&msg.id)
            .arg(lease_id)
            .invoke_async(&mut conn)
            .await?;

        Ok(extended == 1)
    }

    async fn list_lease_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeasedTask>, BrokerError> {
        let mut conn = self.redis.clone();
        let mut expired = Vec::new();

        for queue in self.queues().await? {
            let raw: Vec<String> = self
                .scripts
                .list_lease_expired
                .key(keys::lease(&queue))
                .arg(score(cutoff))
                .arg(keys::task_key_prefix(&queue))
                .invoke_async(&mut conn)
                .await?;

            for entry in raw.chunks_exact(3) {
                let deadline = entry[2].parse::<f64>().unwrap_or_default() as i64;
                expired.push(LeasedTask {
                    message: TaskMessage::decode(&entry[0])?,
                    lease_id: entry[1].clone(),
                    lease_deadline: from_score(deadline).unwrap_or(cutoff),
                });
            }
        }

        Ok(expired)
    }

    async fn forward_scheduled(&self, queues: &[String]) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let mut total = 0;

        for queue in queues {
            loop {
                let moved: usize = self
                    .scripts
                    .forward
                    .key(keys::scheduled(queue))
                    .key(keys::pending(queue))
                    .arg(score(Utc::now()))
                    .arg(keys::task_key_prefix(queue))
                    .arg(BATCH_SIZE)
                    .invoke_async(&mut conn)
                    .await?;
                total += moved;

                if moved < BATCH_SIZE {
                    break;
                }
            }
        }

        Ok(total)
    }

    async fn delete_expired_completed(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.redis.clone();
        let mut total = 0;

        loop {
            let deleted: usize = self
                .scripts
                .delete_expired_completed
                .key(keys::completed(queue))
                .arg(score(Utc::now()))
                .arg(keys::task_key_prefix(queue))
                .arg(BATCH_SIZE)
                .invoke_async(&mut conn)
                .await?;
            total += deleted;

            if deleted < BATCH_SIZE {
                break;
            }
        }

        Ok(total)
    }

    async fn write_server_state(
        &self,
        info: &ServerInfo,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        let expiry = add_duration(Utc::now(), ttl);

        self.scripts
            .write_server_state
            .key(keys::all_servers())
            .key(keys::server_info(&info.server_id))
            .arg(score(expiry))
            .arg(&info.server_id)
            .arg(ttl.as_secs().max(1))
            .arg(serde_json::to_string(info)?)
            .invoke_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn clear_server_state(&self, server_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        self.scripts
            .clear_server_state
            .key(keys::all_servers())
            .key(keys::server_info(server_id))
            .arg(server_id)
            .invoke_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn servers(&self) -> Result<Vec<ServerInfo>, BrokerError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(keys::all_servers(), score(Utc::now()), "+inf")
            .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.get(keys::server_info(id));
        }
        let raw: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        let mut servers = Vec::with_capacity(raw.len());
        for data in raw.into_iter().flatten() {
            servers.push(serde_json::from_str(&data)?);
        }
        Ok(servers)
    }

    async fn queues(&self) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let mut queues: Vec<String> = conn.smembers(keys::all_queues()).await?;
        queues.sort();
        Ok(queues)
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let mut conn = self.redis.clone();

        let (pending, active, scheduled, archived, completed, processed, failed): (
            usize,
            usize,
            usize,
            usize,
            usize,
            Option<u64>,
            Option<u64>,
        ) = redis::pipe()
            .llen(keys::pending(queue))
            .llen(keys::active(queue))
            .zcard(keys::scheduled(queue))
            .zcard(keys::archived(queue))
            .zcard(keys::completed(queue))
            .get(keys::processed(queue))
            .get(keys::failed(queue))
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queue: queue.to_string(),
            pending,
            active,
            scheduled,
            archived,
            completed,
            processed: processed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }

    async fn list(&self, queue: &str, state: TaskState) -> Result<Vec<TaskEntry>, BrokerError> {
        let scored: Vec<(String, Option<i64>)> = match state {
            TaskState::Pending => {
                let mut conn = self.redis.clone();
                let ids: Vec<String> = conn.lrange(keys::pending(queue), 0, -1).await?;
                // LPUSH in, RPOP out: the tail is served first.
                ids.into_iter().rev().map(|id| (id, None)).collect()
            }
            TaskState::Active => self
                .scored_ids(keys::lease(queue))
                .await?
                .into_iter()
                .map(|(id, s)| (id, Some(s)))
                .collect(),
            TaskState::Scheduled | TaskState::Archived | TaskState::Completed => {
                let key = match state {
                    TaskState::Scheduled => keys::scheduled(queue),
                    TaskState::Archived => keys::archived(queue),
                    _ => keys::completed(queue),
                };
                self.scored_ids(key)
                    .await?
                    .into_iter()
                    .map(|(id, s)| (id, Some(s)))
                    .collect()
            }
        };

        let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
        let messages = self.load_messages(queue, &ids).await?;

        Ok(scored
            .into_iter()
            .zip(messages)
            .filter_map(|((_, s), message)| {
                message.map(|message| TaskEntry {
                    message,
                    score: s.and_then(from_score),
                })
            })
            .collect())
    }
}
