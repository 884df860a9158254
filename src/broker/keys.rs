//! Redis key layout.
//!
//! Every per-queue key embeds the queue name in a `{hash tag}` so that all
//! keys a script touches for one queue live in the same cluster slot.
//!
//! | key                              | type   | contents                      |
//! |----------------------------------|--------|-------------------------------|
//! | `taskq:queues`                   | set    | known queue names             |
//! | `taskq:{q}:t:{id}`               | hash   | `msg`, `state`, `owner`       |
//! | `taskq:{q}:pending`              | list   | ids, LPUSH in / RPOP out      |
//! | `taskq:{q}:active`               | list   | ids being processed           |
//! | `taskq:{q}:lease`                | zset   | id -> lease deadline          |
//! | `taskq:{q}:scheduled`            | zset   | id -> process-at              |
//! | `taskq:{q}:archived`             | zset   | id -> archived-at             |
//! | `taskq:{q}:completed`            | zset   | id -> retention expiry        |
//! | `taskq:{q}:unique:{key}`         | string | owning task id, with TTL      |
//! | `taskq:{q}:processed` / `failed` | string | counters                      |
//! | `taskq:servers`                  | zset   | server id -> expiry           |
//! | `taskq:servers:{id}`             | string | server info JSON, with TTL    |

pub const KEY_PREFIX: &str = "taskq";

pub fn all_queues() -> String {
    format!("{}:queues", KEY_PREFIX)
}

pub fn all_servers() -> String {
    format!("{}:servers", KEY_PREFIX)
}

pub fn server_info(server_id: &str) -> String {
    format!("{}:servers:{}", KEY_PREFIX, server_id)
}

pub fn queue_prefix(queue: &str) -> String {
    format!("{}:{{{}}}:", KEY_PREFIX, queue)
}

pub fn task_key_prefix(queue: &str) -> String {
    format!("{}t:", queue_prefix(queue))
}

pub fn task(queue: &str, id: &str) -> String {
    format!("{}{}", task_key_prefix(queue), id)
}

pub fn pending(queue: &str) -> String {
    format!("{}pending", queue_prefix(queue))
}

pub fn active(queue: &str) -> String {
    format!("{}active", queue_prefix(queue))
}

pub fn lease(queue: &str) -> String {
    format!("{}lease", queue_prefix(queue))
}

pub fn scheduled(queue: &str) -> String {
    format!("{}scheduled", queue_prefix(queue))
}

pub fn archived(queue: &str) -> String {
    format!("{}archived", queue_prefix(queue))
}

pub fn completed(queue: &str) -> String {
    format!("{}completed", queue_prefix(queue))
}

pub fn unique(queue: &str, unique_key: &str) -> String {
    format!("{}unique:{}", queue_prefix(queue), unique_key)
}

pub fn processed(queue: &str) -> String {
    format!("{}processed", queue_prefix(queue))
}

pub fn failed(queue: &str) -> String {
    format!("{}failed", queue_prefix(queue))
}
