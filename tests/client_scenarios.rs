//! Producer and broker state machine tests against the in-memory broker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Barrier;
use taskq::broker::state::FailureTransition;
use taskq::broker::{Broker, BrokerConfig, MemoryBroker, TaskState};
use taskq::error::{BrokerError, ClientError};
use taskq::monitor::{Recoverer, LEASE_EXPIRED};
use taskq::task::{Task, TaskMessage, TaskOption};
use taskq::Client;

fn email_task() -> Task {
    Task::new("send_email", b"{\"to\":\"customer@gmail.com\"}".to_vec())
}

fn setup() -> (Arc<MemoryBroker>, Client) {
    let broker = Arc::new(MemoryBroker::new());
    let client = Client::new(broker.clone());
    (broker, client)
}

fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_enqueue_defaults_to_pending_in_default_queue() {
    let (broker, client) = setup();

    let info = client.enqueue(&email_task(), &[]).await.expect("enqueue should succeed");

    assert_eq!(info.queue, "default");
    assert_eq!(info.state, TaskState::Pending);
    assert_eq!(info.max_retry, 25);
    assert_eq!(info.retried, 0);

    let pending = broker.list("default", TaskState::Pending).await.expect("list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message.id, info.id);
    assert!(broker
        .list("default", TaskState::Scheduled)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn test_schedule_in_future_lands_in_scheduled_only() {
    let (broker, client) = setup();
    let at = Utc::now() + chrono::Duration::hours(1);

    let info = client
        .schedule(&email_task(), at, &[])
        .await
        .expect("schedule should succeed");

    assert_eq!(info.state, TaskState::Scheduled);
    assert_eq!(info.next_process_at, at);

    let scheduled = broker.list("default", TaskState::Scheduled).await.expect("list");
    assert_eq!(scheduled.len(), 1);
    assert_eq!(
        scheduled[0].score.map(|s| s.timestamp()),
        Some(at.timestamp())
    );
    assert!(broker
        .list("default", TaskState::Pending)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn test_schedule_in_past_enqueues_immediately() {
    let (broker, client) = setup();
    let at = Utc::now() - chrono::Duration::minutes(5);

    let info = client.schedule(&email_task(), at, &[]).await.expect("schedule");

    assert_eq!(info.state, TaskState::Pending);
    assert_eq!(broker.queue_stats("default").await.expect("stats").pending, 1);
}

#[tokio::test]
async fn test_option_folding() {
    let (_broker, client) = setup();

    let info = client
        .enqueue(&email_task(), &[TaskOption::MaxRetry(-2)])
        .await
        .expect("enqueue");
    assert_eq!(info.max_retry, 0);

    let info = client
        .enqueue(
            &email_task(),
            &[
                TaskOption::Queue("low".to_string()),
                TaskOption::MaxRetry(1),
                TaskOption::Queue("HIGH".to_string()),
                TaskOption::MaxRetry(7),
            ],
        )
        .await
        .expect("enqueue");
    assert_eq!(info.queue, "high");
    assert_eq!(info.max_retry, 7);
}

#[tokio::test]
async fn test_unique_rejects_duplicate_while_lock_held() {
    let (broker, client) = setup();
    let opts = [TaskOption::Unique(Duration::from_secs(60))];

    client.enqueue(&email_task(), &opts).await.expect("first enqueue");
    let second = client.enqueue(&email_task(), &opts).await;
    assert!(matches!(second, Err(ClientError::DuplicateTask(_))));

    // Different payload, different lock.
    let other = Task::new("send_email", b"{\"to\":\"other@gmail.com\"}".to_vec());
    client.enqueue(&other, &opts).await.expect("other payload");

    // Same payload in another queue is a different lock too.
    let opts_low = [
        TaskOption::Unique(Duration::from_secs(60)),
        TaskOption::Queue("low".to_string()),
    ];
    client.enqueue(&email_task(), &opts_low).await.expect("other queue");

    assert_eq!(broker.queue_stats("default").await.expect("stats").pending, 2);
}

#[tokio::test]
async fn test_unique_lock_released_after_success() {
    let (broker, client) = setup();
    let opts = [TaskOption::Unique(Duration::from_secs(60))];

    client.enqueue(&email_task(), &opts).await.expect("first enqueue");
    let leased = broker
        .dequeue("server-1", &queues(&["default"]))
        .await
        .expect("dequeue");
    broker
        .done(&leased.message, &leased.lease_id)
        .await
        .expect("done");

    client
        .enqueue(&email_task(), &opts)
        .await
        .expect("lock should be released once the task succeeded");
}

#[tokio::test]
async fn test_task_id_conflict() {
    let (_broker, client) = setup();
    let opts = [TaskOption::TaskId("order-42".to_string())];

    let info = client.enqueue(&email_task(), &opts).await.expect("first enqueue");
    assert_eq!(info.id, "order-42");

    let second = client.enqueue(&email_task(), &opts).await;
    assert!(matches!(second, Err(ClientError::TaskIdConflict(id)) if id == "order-42"));
}

#[tokio::test]
async fn test_passed_deadline_archives_task() {
    let (broker, client) = setup();
    let deadline = Utc::now() - chrono::Duration::minutes(1);

    let result = client
        .enqueue(&email_task(), &[TaskOption::Deadline(deadline)])
        .await;
    assert!(matches!(result, Err(ClientError::DeadlineExceeded)));

    let archived = broker.list("default", TaskState::Archived).await.expect("list");
    assert_eq!(archived.len(), 1);
    assert!(archived[0].message.error_msg.is_some());
    assert_eq!(broker.queue_stats("default").await.expect("stats").pending, 0);
}

#[tokio::test]
async fn test_invalid_queue_rejected() {
    let (_broker, client) = setup();

    let result = client
        .enqueue(&email_task(), &[TaskOption::Queue("tenant{1}".to_string())])
        .await;
    assert!(matches!(result, Err(ClientError::InvalidTask(_))));
}

#[tokio::test]
async fn test_retry_increments_then_archives_when_exhausted() {
    let broker = MemoryBroker::new();
    let q = queues(&["default"]);
    let mut msg = TaskMessage::new(&email_task());
    msg.max_retry = 2;
    broker.enqueue(&msg, None).await.expect("enqueue");

    for expected_retried in 1..=2 {
        let leased = broker.dequeue("server-1", &q).await.expect("dequeue");
        let transition = broker
            .retry(&leased.message, &leased.lease_id, Utc::now(), "boom")
            .await
            .expect("retry");
        assert_eq!(transition, FailureTransition::Retry);

        let scheduled = broker.list("default", TaskState::Scheduled).await.expect("list");
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].message.retried, expected_retried);
        assert_eq!(scheduled[0].message.error_msg.as_deref(), Some("boom"));

        assert_eq!(broker.forward_scheduled(&q).await.expect("forward"), 1);
    }

    let leased = broker.dequeue("server-1", &q).await.expect("dequeue");
    assert_eq!(leased.message.retried, 2);
    let transition = broker
        .retry(&leased.message, &leased.lease_id, Utc::now(), "boom")
        .await
        .expect("retry");
    assert_eq!(transition, FailureTransition::Archive);

    let archived = broker.list("default", TaskState::Archived).await.expect("list");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].message.retried, 2);

    let stats = broker.queue_stats("default").await.expect("stats");
    assert_eq!(stats.size(), 1);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
async fn test_priority_order_across_queues() {
    let broker = MemoryBroker::new();
    let mut low = TaskMessage::new(&email_task());
    low.queue = "low".to_string();
    let mut high = TaskMessage::new(&email_task());
    high.queue = "critical".to_string();

    broker.enqueue(&low, None).await.expect("enqueue");
    broker.enqueue(&high, None).await.expect("enqueue");

    let order = queues(&["critical", "low"]);
    let first = broker.dequeue("s", &order).await.expect("dequeue");
    let second = broker.dequeue("s", &order).await.expect("dequeue");

    assert_eq!(first.message.id, high.id);
    assert_eq!(second.message.id, low.id);
    assert!(matches!(
        broker.dequeue("s", &order).await,
        Err(BrokerError::NoTaskAvailable)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_dequeue_delivers_each_task_once() {
    let broker = Arc::new(MemoryBroker::new());
    let total = 200;
    let workers = 8;
    for _ in 0..total {
        broker
            .enqueue(&TaskMessage::new(&email_task()), None)
            .await
            .expect("enqueue");
    }

    let start = Arc::new(Barrier::new(workers));
    let mut handles = Vec::new();
    for i in 0..workers {
        let broker = Arc::clone(&broker);
        let start = Arc::clone(&start);
        handles.push(tokio::spawn(async move {
            let q = queues(&["default"]);
            let server = format!("server-{}", i);
            let mut ids = Vec::new();
            start.wait().await;
            loop {
                match broker.dequeue(&server, &q).await {
                    Ok(leased) => ids.push(leased.message.id),
                    Err(BrokerError::NoTaskAvailable) => break,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    let mut delivered = 0;
    for handle in handles {
        for id in handle.await.expect("join") {
            delivered += 1;
            seen.insert(id);
        }
    }

    assert_eq!(delivered, total);
    assert_eq!(seen.len(), total);
    assert_eq!(broker.queue_stats("default").await.expect("stats").active, total);
}

#[tokio::test]
async fn test_operations_on_inactive_task_fail() {
    let broker = MemoryBroker::new();
    let msg = TaskMessage::new(&email_task());
    broker.enqueue(&msg, None).await.expect("enqueue");

    assert!(matches!(
        broker.done(&msg, "no-lease").await,
        Err(BrokerError::TaskNotFound { .. })
    ));
    assert!(matches!(
        broker.archive(&msg, "no-lease", "nope").await,
        Err(BrokerError::TaskNotFound { .. })
    ));
    assert_eq!(broker.queue_stats("default").await.expect("stats").pending, 1);
}

#[tokio::test]
async fn test_stale_worker_cannot_touch_redelivered_task() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let q = queues(&["default"]);
    let mut msg = TaskMessage::new(&email_task());
    msg.max_retry = 1;
    broker.enqueue(&msg, None).await.expect("enqueue");

    // Worker A stalls past its lease.
    let stale = broker.dequeue("server-a", &q).await.expect("dequeue");
    broker
        .extend_lease(
            &stale.message,
            &stale.lease_id,
            Utc::now() - chrono::Duration::seconds(60),
        )
        .await
        .expect("extend");

    let report = Recoverer::new(Arc::clone(&broker), Duration::from_secs(1))
        .recover_once()
        .await
        .expect("recover");
    assert_eq!(report.requeued, 1);

    let current = broker.dequeue("server-b", &q).await.expect("dequeue");
    assert_eq!(current.message.id, msg.id);
    assert_eq!(current.message.retried, 1);
    assert_ne!(current.lease_id, stale.lease_id);

    // A's outcome must not roll back `retried` or steal the task from B.
    assert!(matches!(
        broker
            .retry(&stale.message, &stale.lease_id, Utc::now(), "late failure")
            .await,
        Err(BrokerError::TaskNotFound { .. })
    ));
    assert!(matches!(
        broker.done(&stale.message, &stale.lease_id).await,
        Err(BrokerError::TaskNotFound { .. })
    ));
    assert!(matches!(
        broker
            .archive(&stale.message, &stale.lease_id, "late failure")
            .await,
        Err(BrokerError::TaskNotFound { .. })
    ));
    assert!(!broker
        .extend_lease(&stale.message, &stale.lease_id, Utc::now())
        .await
        .expect("extend"));

    let stats = broker.queue_stats("default").await.expect("stats");
    assert_eq!(stats.active, 1);
    assert_eq!(stats.scheduled, 0);
    assert_eq!(stats.archived, 0);

    broker
        .done(&current.message, &current.lease_id)
        .await
        .expect("current holder completes the task");
    let stats = broker.queue_stats("default").await.expect("stats");
    assert_eq!(stats.active, 0);
    assert_eq!(stats.processed, 1);
}

#[tokio::test]
async fn test_lease_recovery_requeues_then_archives() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::with_config(
        BrokerConfig::default().with_lease_duration(Duration::from_secs(1)),
    ));
    let q = queues(&["default"]);

    let mut retryable = TaskMessage::new(&email_task());
    retryable.max_retry = 3;
    let mut exhausted = TaskMessage::new(&email_task());
    exhausted.max_retry = 0;
    broker.enqueue(&retryable, None).await.expect("enqueue");
    broker.enqueue(&exhausted, None).await.expect("enqueue");

    broker.dequeue("crashed", &q).await.expect("dequeue");
    broker.dequeue("crashed", &q).await.expect("dequeue");

    // Lease scores have one-second resolution.
    tokio::time::sleep(Duration::from_millis(2100)).await;

    let recoverer = Recoverer::new(Arc::clone(&broker), Duration::from_secs(1));
    let report = recoverer.recover_once().await.expect("recover");
    assert_eq!(report.requeued, 1);
    assert_eq!(report.archived, 1);

    let pending = broker.list("default", TaskState::Pending).await.expect("list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message.id, retryable.id);
    assert_eq!(pending[0].message.retried, 1);
    assert_eq!(pending[0].message.error_msg.as_deref(), Some(LEASE_EXPIRED));

    let archived = broker.list("default", TaskState::Archived).await.expect("list");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].message.id, exhausted.id);

    // Nothing left to recover.
    assert_eq!(recoverer.recover_once().await.expect("recover").total(), 0);
}
