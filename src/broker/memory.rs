//! In-process broker.
//!
//! Mirrors [`RedisBroker`](super::RedisBroker) transition for transition,
//! with every operation applied under one store-wide lock. Used by tests
//! and by single-process deployments that do not need durability.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::config::BrokerConfig;
use super::keys;
use super::{
    add_duration, from_score, new_lease_id, score, Broker, LeasedTask, QueueStats, ServerInfo,
    TaskEntry, TaskState,
};
use crate::error::BrokerError;
use crate::task::TaskMessage;

/// Members ordered by integer score, ties broken by member.
#[derive(Debug, Default)]
struct ScoredSet {
    ordered: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

impl ScoredSet {
    fn insert(&mut self, id: &str, score: i64) {
        if let Some(old) = self.scores.insert(id.to_string(), score) {
            self.ordered.remove(&(old, id.to_string()));
        }
        self.ordered.insert((score, id.to_string()));
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.scores.remove(id) {
            Some(old) => {
                self.ordered.remove(&(old, id.to_string()));
                true
            }
            None => false,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.scores.contains_key(id)
    }

    fn score(&self, id: &str) -> Option<i64> {
        self.scores.get(id).copied()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    /// Members with a score at or below `max`, lowest first.
    fn up_to(&self, max: i64) -> Vec<String> {
        self.ordered
            .iter()
            .take_while(|(s, _)| *s <= max)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Members with a score strictly below `max`, lowest first.
    fn below(&self, max: i64) -> Vec<String> {
        self.ordered
            .iter()
            .take_while(|(s, _)| *s < max)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn oldest(&self, n: usize) -> Vec<String> {
        self.ordered
            .iter()
            .take(n)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn entries(&self) -> Vec<(String, i64)> {
        self.ordered
            .iter()
            .map(|(s, id)| (id.clone(), *s))
            .collect()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Front is served next.
    pending: VecDeque<String>,
    /// Active tasks keyed by lease deadline.
    lease: ScoredSet,
    scheduled: ScoredSet,
    archived: ScoredSet,
    completed: ScoredSet,
    processed: u64,
    failed: u64,
}

#[derive(Debug)]
struct StoredTask {
    msg: TaskMessage,
    state: TaskState,
    /// Server holding the lease while active.
    owner: Option<String>,
    /// Token of the current lease while active.
    lease: Option<String>,
}

impl StoredTask {
    fn leased_by(&self, lease_id: &str) -> bool {
        self.state == TaskState::Active && self.lease.as_deref() == Some(lease_id)
    }
}

#[derive(Debug)]
struct UniqueLock {
    task_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Store {
    queues: BTreeMap<String, QueueState>,
    /// Keyed by queue then task id.
    tasks: HashMap<(String, String), StoredTask>,
    unique: HashMap<String, UniqueLock>,
    servers: HashMap<String, (ServerInfo, DateTime<Utc>)>,
}

impl Store {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn task_key(msg: &TaskMessage) -> (String, String) {
        (msg.queue.clone(), msg.id.clone())
    }

    fn lock_key(msg: &TaskMessage) -> Option<String> {
        msg.unique_key
            .as_deref()
            .map(|key| keys::unique(&msg.queue, key))
    }

    fn lock_held(&self, lock: &str, now: DateTime<Utc>) -> bool {
        self.unique
            .get(lock)
            .is_some_and(|held| held.expires_at > now)
    }

    /// Drops the uniqueness lock of `msg` if it still belongs to it.
    fn release_lock(&mut self, msg: &TaskMessage) {
        if let Some(lock) = Self::lock_key(msg) {
            if self
                .unique
                .get(&lock)
                .is_some_and(|held| held.task_id == msg.id)
            {
                self.unique.remove(&lock);
            }
        }
    }

    /// Removes `msg` from the active collection of its queue, provided it
    /// is still held under `lease_id`.
    fn take_active(&mut self, msg: &TaskMessage, lease_id: &str) -> Result<(), BrokerError> {
        let held = self
            .tasks
            .get(&Self::task_key(msg))
            .is_some_and(|t| t.leased_by(lease_id));
        let removed = held
            && self
                .queues
                .get_mut(&msg.queue)
                .is_some_and(|q| q.lease.remove(&msg.id));

        if !removed {
            return Err(BrokerError::TaskNotFound {
                id: msg.id.clone(),
                queue: msg.queue.clone(),
                state: TaskState::Active.as_str(),
            });
        }
        Ok(())
    }

    fn put(&mut self, msg: TaskMessage, state: TaskState) {
        self.tasks.insert(
            Self::task_key(&msg),
            StoredTask {
                msg,
                state,
                owner: None,
                lease: None,
            },
        );
    }

    fn trim_archive(&mut self, queue: &str, cutoff: i64, max_size: usize) {
        let q = self.queue(queue);
        let mut dropped = q.archived.up_to(cutoff);
        for id in &dropped {
            q.archived.remove(id);
        }

        let overflow = q.archived.len().saturating_sub(max_size);
        let oldest = q.archived.oldest(overflow);
        for id in &oldest {
            q.archived.remove(id);
        }
        dropped.extend(oldest);

        for id in dropped {
            self.tasks.remove(&(queue.to_string(), id));
        }
    }
}

/// Broker keeping all state in process memory.
pub struct MemoryBroker {
    config: BrokerConfig,
    store: Mutex<Store>,
}

impl MemoryBroker {
    /// Creates an empty broker with default configuration.
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Creates an empty broker. Only lease and archive limits are used
    /// from `config`.
    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            config,
            store: Mutex::new(Store::default()),
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(
        &self,
        msg: &TaskMessage,
        process_at: Option<DateTime<Utc>>,
        unique_ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let now = Utc::now();
        let mut store = self.store();
        store.queue(&msg.queue);

        if store.tasks.contains_key(&Store::task_key(msg)) {
            return Err(BrokerError::TaskIdConflict(msg.id.clone()));
        }

        if let (Some(ttl), Some(lock)) = (unique_ttl, Store::lock_key(msg)) {
            if store.lock_held(&lock, now) {
                return Err(BrokerError::DuplicateTask(
                    msg.unique_key.clone().unwrap_or_default(),
                ));
            }
            store.unique.insert(
                lock,
                UniqueLock {
                    task_id: msg.id.clone(),
                    expires_at: add_duration(now, ttl.max(Duration::from_secs(1))),
                },
            );
        }

        match process_at {
            None => {
                store.queue(&msg.queue).pending.push_back(msg.id.clone());
                store.put(msg.clone(), TaskState::Pending);
            }
            Some(at) => {
                store.queue(&msg.queue).scheduled.insert(&msg.id, score(at));
                store.put(msg.clone(), TaskState::Scheduled);
            }
        }
        Ok(())
    }

    /// Archives `msg`. With a `lease_id` the task must be active under
    /// that lease; without one it must not be stored yet.
    fn archive_inner(
        &self,
        msg: &TaskMessage,
        error_msg: &str,
        lease_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        let now = Utc::now();
        let mut store = self.store();

        if let Some(lease_id) = lease_id {
            store.take_active(msg, lease_id)?;
        } else if store.tasks.contains_key(&Store::task_key(msg)) {
            return Err(BrokerError::TaskIdConflict(msg.id.clone()));
        }

        let q = store.queue(&msg.queue);
        q.archived.insert(&msg.id, score(now));
        q.failed += 1;
        store.put(msg.with_failure(error_msg, now), TaskState::Archived);

        let cutoff = now
            - chrono::Duration::from_std(self.config.archived_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(90));
        store.trim_archive(&msg.queue, score(cutoff), self.config.archived_max_size);
        store.release_lock(msg);
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn lease_duration(&self) -> Duration {
        self.config.lease_duration
    }

    async fn enqueue(
        &self,
        msg: &TaskMessage,
        unique_ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.insert(msg, None, unique_ttl)
    }

    async fn schedule(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        unique_ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.insert(msg, Some(process_at), unique_ttl)
    }

    async fn dequeue(&self, server_id: &str, queues: &[String]) -> Result<LeasedTask, BrokerError> {
        let mut store = self.store();
        let Store {
            queues: all, tasks, ..
        } = &mut *store;

        for queue in queues {
            let Some(q) = all.get_mut(queue) else {
                continue;
            };

            // Ids whose record vanished are dropped.
            while let Some(id) = q.pending.pop_front() {
                let Some(task) = tasks.get_mut(&(queue.clone(), id.clone())) else {
                    continue;
                };

                let lease_deadline = add_duration(Utc::now(), self.config.lease_duration);
                let lease_id = new_lease_id();
                q.lease.insert(&id, score(lease_deadline));
                task.state = TaskState::Active;
                task.owner = Some(server_id.to_string());
                task.lease = Some(lease_id.clone());

                return Ok(LeasedTask {
                    message: task.msg.clone(),
                    lease_id,
                    lease_deadline,
                });
            }
        }

        Err(BrokerError::NoTaskAvailable)
    }

    async fn done(&self, msg: &TaskMessage, lease_id: &str) -> Result<(), BrokerError> {
        let now = Utc::now();
        let mut store = self.store();
        store.take_active(msg, lease_id)?;

        let q = store.queue(&msg.queue);
        q.processed += 1;

        if msg.retention.is_zero() {
            store.tasks.remove(&Store::task_key(msg));
        } else {
            let expiry = add_duration(now, msg.retention);
            q.completed.insert(&msg.id, score(expiry));
            store.put(msg.completed(now), TaskState::Completed);
        }

        store.release_lock(msg);
        Ok(())
    }

    async fn schedule_retry(
        &self,
        msg: &TaskMessage,
        lease_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let mut store = self.store();
        store.take_active(msg, lease_id)?;

        let q = store.queue(&msg.queue);
        q.scheduled.insert(&msg.id, score(retry_at));
        q.failed += 1;
        store.put(msg.clone(), TaskState::Scheduled);
        Ok(())
    }

    async fn archive(
        &self,
        msg: &TaskMessage,
        lease_id: &str,
        error_msg: &str,
    ) -> Result<(), BrokerError> {
        self.archive_inner(msg, error_msg, Some(lease_id))
    }

    async fn archive_new(&self, msg: &TaskMessage, error_msg: &str) -> Result<(), BrokerError> {
        self.archive_inner(msg, error_msg, None)
    }

    async fn requeue(&self, msg: &TaskMessage, lease_id: &str) -> Result<(), BrokerError> {
        let mut store = self.store();
        store.take_active(msg, lease_id)?;

        store.queue(&msg.queue).pending.push_front(msg.id.clone());
        store.put(msg.clone(), TaskState::Pending);
        Ok(())
    }

    async fn requeue_all(&self, server_id: &str) -> Result<usize, BrokerError> {
        let mut store = self.store();

        let mut owned: Vec<(i64, String, String)> = store
            .tasks
            .iter()
            .filter(|(_, t)| t.state == TaskState::Active && t.owner.as_deref() == Some(server_id))
            .filter_map(|((queue, id), _)| {
                let deadline = store.queues.get(queue)?.lease.score(id)?;
                Some((deadline, queue.clone(), id.clone()))
            })
            .collect();

        // Pushed latest deadline first, so the earliest ends up served first.
        owned.sort_unstable_by(|a, b| b.cmp(a));

        let mut moved = 0;
        for (_, queue, id) in owned {
            let q = store.queue(&queue);
            if !q.lease.remove(&id) {
                continue;
            }
            q.pending.push_front(id.clone());

            if let Some(task) = store.tasks.get_mut(&(queue, id)) {
                task.state = TaskState::Pending;
                task.owner = None;
                task.lease = None;
            }
            moved += 1;
        }

        Ok(moved)
    }

    async fn extend_lease(
        &self,
        msg: &TaskMessage,
        lease_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        let mut store = self.store();

        let held = store
            .tasks
            .get(&Store::task_key(msg))
            .is_some_and(|t| t.leased_by(lease_id));
        if !held {
            return Ok(false);
        }

        match store.queues.get_mut(&msg.queue) {
            Some(q) if q.lease.contains(&msg.id) => {
                q.lease.insert(&msg.id, score(deadline));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_lease_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LeasedTask>, BrokerError> {
        let store = self.store();
        let mut expired = Vec::new();

        for (name, q) in &store.queues {
            for id in q.lease.below(score(cutoff)) {
                let deadline = q.lease.score(&id).and_then(from_score).unwrap_or(cutoff);
                if let Some(task) = store.tasks.get(&(name.clone(), id)) {
                    expired.push(LeasedTask {
                        message: task.msg.clone(),
                        lease_id: task.lease.clone().unwrap_or_default(),
                        lease_deadline: deadline,
                    });
                }
            }
        }

        Ok(expired)
    }

    async fn forward_scheduled(&self, queues: &[String]) -> Result<usize, BrokerError> {
        let now = score(Utc::now());
        let mut store = self.store();
        let mut total = 0;

        for queue in queues {
            let Some(q) = store.queues.get_mut(queue) else {
                continue;
            };

            let due = q.scheduled.up_to(now);
            for id in &due {
                q.scheduled.remove(id);
                q.pending.push_back(id.clone());
            }
            total += due.len();

            for id in due {
                if let Some(task) = store.tasks.get_mut(&(queue.clone(), id)) {
                    task.state = TaskState::Pending;
                }
            }
        }

        Ok(total)
    }

    async fn delete_expired_completed(&self, queue: &str) -> Result<usize, BrokerError> {
        let now = score(Utc::now());
        let mut store = self.store();

        let Some(q) = store.queues.get_mut(queue) else {
            return Ok(0);
        };

        let expired = q.completed.up_to(now);
        for id in &expired {
            q.completed.remove(id);
        }
        for id in &expired {
            store.tasks.remove(&(queue.to_string(), id.clone()));
        }

        Ok(expired.len())
    }

    async fn write_server_state(
        &self,
        info: &ServerInfo,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let expiry = add_duration(Utc::now(), ttl);
        self.store()
            .servers
            .insert(info.server_id.clone(), (info.clone(), expiry));
        Ok(())
    }

    async fn clear_server_state(&self, server_id: &str) -> Result<(), BrokerError> {
        self.store().servers.remove(server_id);
        Ok(())
    }

    async fn servers(&self) -> Result<Vec<ServerInfo>, BrokerError> {
        let now = Utc::now();
        let mut servers: Vec<ServerInfo> = self
            .store()
            .servers
            .values()
            .filter(|(_, expiry)| *expiry >= now)
            .map(|(info, _)| info.clone())
            .collect();
        servers.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(servers)
    }

    async fn queues(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self.store().queues.keys().cloned().collect())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let store = self.store();

        Ok(match store.queues.get(queue) {
            Some(q) => QueueStats {
                queue: queue.to_string(),
                pending: q.pending.len(),
                active: q.lease.len(),
                scheduled: q.scheduled.len(),
                archived: q.archived.len(),
                completed: q.completed.len(),
                processed: q.processed,
                failed: q.failed,
            },
            None => QueueStats {
                queue: queue.to_string(),
                ..Default::default()
            },
        })
    }

    async fn list(&self, queue: &str, state: TaskState) -> Result<Vec<TaskEntry>, BrokerError> {
        let store = self.store();
        let Some(q) = store.queues.get(queue) else {
            return Ok(Vec::new());
        };

        let scored: Vec<(String, Option<i64>)> = match state {
            TaskState::Pending => q.pending.iter().map(|id| (id.clone(), None)).collect(),
            TaskState::Active => with_scores(q.lease.entries()),
            TaskState::Scheduled => with_scores(q.scheduled.entries()),
            TaskState::Archived => with_scores(q.archived.entries()),
            TaskState::Completed => with_scores(q.completed.entries()),
        };

        Ok(scored
            .into_iter()
            .filter_map(|(id, s)| {
                store
                    .tasks
                    .get(&(queue.to_string(), id))
                    .map(|task| TaskEntry {
                        message: task.msg.clone(),
                        score: s.and_then(from_score),
                    })
            })
            .collect())
    }
}

fn with_scores(entries: Vec<(String, i64)>) -> Vec<(String, Option<i64>)> {
    entries.into_iter().map(|(id, s)| (id, Some(s))).collect()
}
