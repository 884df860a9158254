//! Task handlers and the registry that routes task types to them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::task::{Task, TaskMessage};

/// Attempt metadata passed to a handler alongside its task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: String,
    queue: String,
    retried: u32,
    max_retry: u32,
    deadline: Option<DateTime<Utc>>,
}

impl TaskContext {
    pub(crate) fn from_message(msg: &TaskMessage) -> Self {
        Self {
            task_id: msg.id.clone(),
            queue: msg.queue.clone(),
            retried: msg.retried,
            max_retry: msg.max_retry,
            deadline: msg.deadline,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Number of earlier attempts that failed.
    pub fn retry_count(&self) -> u32 {
        self.retried
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }
}

/// Returned (possibly wrapped) by a handler to archive its task without
/// further attempts.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SkipRetry(pub String);

impl SkipRetry {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Processes tasks of one type.
///
/// An `Err` result counts as a failed attempt. Returning [`SkipRetry`]
/// anywhere in the error chain archives the task immediately.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn process_task(&self, ctx: TaskContext, task: Task) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process_task(&self, ctx: TaskContext, task: Task) -> anyhow::Result<()> {
        (self.0)(ctx, task).await
    }
}

/// Maps task type names to handlers.
///
/// Built before the processor starts and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `type_name`, replacing any previous one.
    pub fn register(&mut self, type_name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(type_name.into(), Arc::new(handler));
    }

    /// Registers an async closure for `type_name`.
    pub fn handle_fn<F, Fut>(&mut self, type_name: impl Into<String>, f: F)
    where
        F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(type_name, HandlerFn(f));
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(type_name).cloned()
    }

    /// Returns the registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Returns whether a handler error asks to skip further attempts.
pub(crate) fn is_skip_retry(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<SkipRetry>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn process_task(&self, _ctx: TaskContext, task: Task) -> anyhow::Result<()> {
            anyhow::ensure!(!task.payload().is_empty(), "empty payload");
            Ok(())
        }
    }

    fn context() -> TaskContext {
        TaskContext::from_message(&TaskMessage::new(&Task::new("echo", b"x".to_vec())))
    }

    #[tokio::test]
    async fn test_registry_routes_by_type() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Echo);
        registry.handle_fn("fail", |_ctx, _task| async {
            Err::<(), _>(anyhow::anyhow!("always fails"))
        });

        assert_eq!(registry.types(), vec!["echo", "fail"]);
        assert!(registry.get("missing").is_none());

        let echo = registry.get("echo").expect("echo registered");
        assert!(echo
            .process_task(context(), Task::new("echo", b"x".to_vec()))
            .await
            .is_ok());

        let fail = registry.get("fail").expect("fail registered");
        assert!(fail
            .process_task(context(), Task::new("fail", Vec::new()))
            .await
            .is_err());
    }

    #[test]
    fn test_skip_retry_detected_through_context() {
        let err = anyhow::Error::new(SkipRetry::new("malformed payload"));
        assert!(is_skip_retry(&err));

        let wrapped = Err::<(), _>(SkipRetry::new("malformed payload"))
            .context("decoding order")
            .unwrap_err();
        assert!(is_skip_retry(&wrapped));

        assert!(!is_skip_retry(&anyhow::anyhow!("transient")));
    }

    #[test]
    fn test_context_from_message() {
        let mut msg = TaskMessage::new(&Task::new("echo", b"x".to_vec()));
        msg.retried = 2;
        msg.max_retry = 5;
        let ctx = TaskContext::from_message(&msg);

        assert_eq!(ctx.task_id(), msg.id);
        assert_eq!(ctx.queue(), "default");
        assert_eq!(ctx.retry_count(), 2);
        assert_eq!(ctx.max_retry(), 5);
    }
}
