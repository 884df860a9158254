//! Integration tests for the Redis broker.
//!
//! These tests need a running Redis server.
//! Run with: TASKQ_TEST_REDIS_URL=redis://localhost:6379 cargo test --test redis_integration -- --ignored

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Barrier;
use taskq::broker::state::FailureTransition;
use taskq::broker::{Broker, BrokerConfig, RedisBroker, ServerInfo, TaskState};
use taskq::error::{BrokerError, ClientError};
use taskq::monitor::{Recoverer, LEASE_EXPIRED};
use taskq::task::{Task, TaskMessage, TaskOption};
use taskq::Client;
use uuid::Uuid;

async fn create_test_broker(lease: Duration) -> RedisBroker {
    let url = std::env::var("TASKQ_TEST_REDIS_URL")
        .expect("TASKQ_TEST_REDIS_URL environment variable must be set for integration tests");
    let config = BrokerConfig::default()
        .with_redis_url(url)
        .with_lease_duration(lease);
    RedisBroker::connect(config)
        .await
        .expect("Should connect to Redis")
}

/// A queue name no other test run uses.
fn unique_queue() -> String {
    format!("test-{}", Uuid::new_v4().simple())
}

fn message(queue: &str, max_retry: u32) -> TaskMessage {
    let mut msg = TaskMessage::new(&Task::new("send_email", b"{\"to\":\"a@example.com\"}".to_vec()));
    msg.queue = queue.to_string();
    msg.max_retry = max_retry;
    msg
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_enqueue_dequeue_done() {
    let broker = create_test_broker(Duration::from_secs(30)).await;
    let queue = unique_queue();
    let msg = message(&queue, 3);

    broker.enqueue(&msg, None).await.expect("enqueue");
    assert!(broker.queues().await.expect("queues").contains(&queue));

    let leased = broker
        .dequeue("server-1", &[queue.clone()])
        .await
        .expect("dequeue");
    assert_eq!(leased.message, msg);
    assert!(leased.lease_deadline > Utc::now());

    let stats = broker.queue_stats(&queue).await.expect("stats");
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.active, 1);

    broker
        .done(&leased.message, &leased.lease_id)
        .await
        .expect("done");
    let stats = broker.queue_stats(&queue).await.expect("stats");
    assert_eq!(stats.active, 0);
    assert_eq!(stats.processed, 1);

    // A second done finds nothing active.
    assert!(matches!(
        broker.done(&leased.message, &leased.lease_id).await,
        Err(BrokerError::TaskNotFound { .. })
    ));
}

#[tokio::test]
#[ignore]
async fn test_client_unique_and_task_id() {
    let broker = Arc::new(create_test_broker(Duration::from_secs(30)).await);
    let client = Client::new(broker.clone());
    let queue = unique_queue();
    let task = Task::new("send_email", b"{\"to\":\"a@example.com\"}".to_vec());

    let opts = [
        TaskOption::Queue(queue.clone()),
        TaskOption::Unique(Duration::from_secs(60)),
    ];
    client.enqueue(&task, &opts).await.expect("first enqueue");
    assert!(matches!(
        client.enqueue(&task, &opts).await,
        Err(ClientError::DuplicateTask(_))
    ));

    let id = Uuid::new_v4().to_string();
    let opts = [TaskOption::Queue(queue.clone()), TaskOption::TaskId(id.clone())];
    client.enqueue(&task, &opts).await.expect("enqueue with id");
    assert!(matches!(
        client.enqueue(&task, &opts).await,
        Err(ClientError::TaskIdConflict(conflict)) if conflict == id
    ));

    assert_eq!(broker.queue_stats(&queue).await.expect("stats").pending, 2);
}

#[tokio::test]
#[ignore]
async fn test_retry_forward_and_archive() {
    let broker = create_test_broker(Duration::from_secs(30)).await;
    let queue = unique_queue();
    let queues = vec![queue.clone()];
    broker.enqueue(&message(&queue, 1), None).await.expect("enqueue");

    let leased = broker.dequeue("server-1", &queues).await.expect("dequeue");
    let transition = broker
        .retry(&leased.message, &leased.lease_id, Utc::now(), "boom")
        .await
        .expect("retry");
    assert_eq!(transition, FailureTransition::Retry);

    let scheduled = broker.list(&queue, TaskState::Scheduled).await.expect("list");
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].message.retried, 1);

    assert_eq!(broker.forward_scheduled(&queues).await.expect("forward"), 1);

    let leased = broker.dequeue("server-1", &queues).await.expect("dequeue");
    let transition = broker
        .retry(&leased.message, &leased.lease_id, Utc::now(), "boom again")
        .await
        .expect("retry");
    assert_eq!(transition, FailureTransition::Archive);

    let archived = broker.list(&queue, TaskState::Archived).await.expect("list");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].message.error_msg.as_deref(), Some("boom again"));
}

#[tokio::test]
#[ignore]
async fn test_lease_recovery() {
    let broker: Arc<dyn Broker> = Arc::new(create_test_broker(Duration::from_secs(1)).await);
    let queue = unique_queue();
    let msg = message(&queue, 3);
    broker.enqueue(&msg, None).await.expect("enqueue");
    broker
        .dequeue("crashed-server", &[queue.clone()])
        .await
        .expect("dequeue");

    tokio::time::sleep(Duration::from_millis(2100)).await;

    let report = Recoverer::new(Arc::clone(&broker), Duration::from_secs(1))
        .recover_once()
        .await
        .expect("recover");
    assert!(report.requeued >= 1);

    let pending = broker.list(&queue, TaskState::Pending).await.expect("list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message.retried, 1);
    assert_eq!(pending[0].message.error_msg.as_deref(), Some(LEASE_EXPIRED));
}

#[tokio::test]
#[ignore]
async fn test_requeue_all_and_server_state() {
    let broker = create_test_broker(Duration::from_secs(30)).await;
    let queue = unique_queue();
    let server_id = format!("test-server-{}", Uuid::new_v4());

    broker.enqueue(&message(&queue, 3), None).await.expect("enqueue");
    broker
        .dequeue(&server_id, &[queue.clone()])
        .await
        .expect("dequeue");

    let info = ServerInfo {
        server_id: server_id.clone(),
        host: "localhost".to_string(),
        pid: std::process::id(),
        queues: vec![queue.clone()],
        concurrency: 1,
        active_workers: 1,
        started_at: Utc::now(),
    };
    broker
        .write_server_state(&info, Duration::from_secs(10))
        .await
        .expect("write server state");
    assert!(broker
        .servers()
        .await
        .expect("servers")
        .iter()
        .any(|s| s.server_id == server_id));

    assert_eq!(broker.requeue_all(&server_id).await.expect("requeue"), 1);
    assert_eq!(broker.queue_stats(&queue).await.expect("stats").pending, 1);

    broker
        .clear_server_state(&server_id)
        .await
        .expect("clear server state");
    assert!(!broker
        .servers()
        .await
        .expect("servers")
        .iter()
        .any(|s| s.server_id == server_id));
}

#[tokio::test]
#[ignore]
async fn test_stale_worker_cannot_touch_redelivered_task() {
    let broker: Arc<dyn Broker> = Arc::new(create_test_broker(Duration::from_secs(30)).await);
    let queue = unique_queue();
    let q = vec![queue.clone()];
    broker.enqueue(&message(&queue, 1), None).await.expect("enqueue");

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
    assert!(report.requeued >= 1);

    let current = broker.dequeue("server-b", &q).await.expect("dequeue");
    assert_eq!(current.message.id, stale.message.id);
    assert_eq!(current.message.retried, 1);

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
    assert!(!broker
        .extend_lease(&stale.message, &stale.lease_id, Utc::now())
        .await
        .expect("extend"));

    let stats = broker.queue_stats(&queue).await.expect("stats");
    assert_eq!(stats.active, 1);
    assert_eq!(stats.scheduled, 0);

    broker
        .done(&current.message, &current.lease_id)
        .await
        .expect("current holder completes the task");
    assert_eq!(broker.queue_stats(&queue).await.expect("stats").processed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn test_concurrent_dequeue_delivers_each_task_once() {
    let broker = Arc::new(create_test_broker(Duration::from_secs(30)).await);
    let queue = unique_queue();
    let total = 200;
    let workers = 8;
    for _ in 0..total {
        broker.enqueue(&message(&queue, 3), None).await.expect("enqueue");
    }

    let start = Arc::new(Barrier::new(workers));
    let mut handles = Vec::new();
    for i in 0..workers {
        let broker = Arc::clone(&broker);
        let start = Arc::clone(&start);
        let q = vec![queue.clone()];
        handles.push(tokio::spawn(async move {
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
    assert_eq!(broker.queue_stats(&queue).await.expect("stats").active, total);
}
