//! Lua scripts implementing each state transition atomically.
//!
//! Scripts that move a task out of `active` return 0 when the task is no
//! longer there under the caller's lease, leaving every key untouched. The
//! lease token lives in the `lease` field of the task hash from dequeue
//! until the task leaves `active`. Optional trailing KEYS (the
//! uniqueness lock) are absent when the task has no unique key.

use redis::Script;

// KEYS[1] task hash, KEYS[2] pending
// ARGV[1] encoded msg, ARGV[2] id
// Returns 1 on success, 0 on ID conflict.
const ENQUEUE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return 0
end
redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", "pending")
redis.call("LPUSH", KEYS[2], ARGV[2])
return 1
"#;

// KEYS[1] unique lock, KEYS[2] task hash, KEYS[3] pending
// ARGV[1] id, ARGV[2] lock ttl seconds, ARGV[3] encoded msg
// Returns 1 on success, 0 on ID conflict, -1 if the lock is held.
const ENQUEUE_UNIQUE: &str = r#"
if redis.call("EXISTS", KEYS[2]) == 1 then
  return 0
end
if not redis.call("SET", KEYS[1], ARGV[1], "NX", "EX", ARGV[2]) then
  return -1
end
redis.call("HSET", KEYS[2], "msg", ARGV[3], "state", "pending")
redis.call("LPUSH", KEYS[3], ARGV[1])
return 1
"#;

// KEYS[1] task hash, KEYS[2] scheduled
// ARGV[1] encoded msg, ARGV[2] process-at, ARGV[3] id
const SCHEDULE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
  return 0
end
redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", "scheduled")
redis.call("ZADD", KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

// KEYS[1] unique lock, KEYS[2] task hash, KEYS[3] scheduled
// ARGV[1] id, ARGV[2] lock ttl seconds, ARGV[3] encoded msg, ARGV[4] process-at
const SCHEDULE_UNIQUE: &str = r#"
if redis.call("EXISTS", KEYS[2]) == 1 then
  return 0
end
if not redis.call("SET", KEYS[1], ARGV[1], "NX", "EX", ARGV[2]) then
  return -1
end
redis.call("HSET", KEYS[2], "msg", ARGV[3], "state", "scheduled")
redis.call("ZADD", KEYS[3], ARGV[4], ARGV[1])
return 1
"#;

// KEYS[1] pending, KEYS[2] active, KEYS[3] lease
// ARGV[1] lease deadline, ARGV[2] task key prefix, ARGV[3] server id, ARGV[4] lease id
// Returns the encoded msg, or nil if the queue is empty.
// Ids whose record is gone are dropped and the next one is tried.
const DEQUEUE: &str = r#"
while true do
  local id = redis.call("RPOPLPUSH", KEYS[1], KEYS[2])
  if not id then
    return nil
  end
  local key = ARGV[2] .. id
  local msg = redis.call("HGET", key, "msg")
  if msg then
    redis.call("HSET", key, "state", "active", "owner", ARGV[3], "lease", ARGV[4])
    redis.call("ZADD", KEYS[3], ARGV[1], id)
    return msg
  end
  redis.call("LREM", KEYS[2], 1, id)
end
"#;

// KEYS[1] active, KEYS[2] lease, KEYS[3] task hash, KEYS[4] processed, [KEYS[5] unique lock]
// ARGV[1] id, ARGV[2] lease id
const DONE: &str = r#"
if redis.call("HGET", KEYS[3], "lease") ~= ARGV[2] then
  return 0
end
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return 0
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("DEL", KEYS[3])
redis.call("INCR", KEYS[4])
if KEYS[5] and redis.call("GET", KEYS[5]) == ARGV[1] then
  redis.call("DEL", KEYS[5])
end
return 1
"#;

// KEYS[1] active, KEYS[2] lease, KEYS[3] task hash, KEYS[4] processed,
// KEYS[5] completed, [KEYS[6] unique lock]
// ARGV[1] id, ARGV[2] encoded msg, ARGV[3] retention expiry, ARGV[4] lease id
const MARK_COMPLETE: &str = r#"
if redis.call("HGET", KEYS[3], "lease") ~= ARGV[4] then
  return 0
end
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return 0
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HSET", KEYS[3], "msg", ARGV[2], "state", "completed")
redis.call("HDEL", KEYS[3], "owner", "lease")
redis.call("ZADD", KEYS[5], ARGV[3], ARGV[1])
redis.call("INCR", KEYS[4])
if KEYS[6] and redis.call("GET", KEYS[6]) == ARGV[1] then
  redis.call("DEL", KEYS[6])
end
return 1
"#;

// KEYS[1] task hash, KEYS[2] active, KEYS[3] lease, KEYS[4] scheduled, KEYS[5] failed
// ARGV[1] id, ARGV[2] encoded msg, ARGV[3] retry-at, ARGV[4] lease id
const RETRY: &str = r#"
if redis.call("HGET", KEYS[1], "lease") ~= ARGV[4] then
  return 0
end
if redis.call("LREM", KEYS[2], 0, ARGV[1]) == 0 then
  return 0
end
redis.call("ZREM", KEYS[3], ARGV[1])
redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "scheduled")
redis.call("HDEL", KEYS[1], "owner", "lease")
redis.call("ZADD", KEYS[4], ARGV[3], ARGV[1])
redis.call("INCR", KEYS[5])
return 1
"#;

// KEYS[1] task hash, KEYS[2] active, KEYS[3] lease, KEYS[4] archived, KEYS[5] failed,
// [KEYS[6] unique lock]
// ARGV[1] id, ARGV[2] encoded msg, ARGV[3] now, ARGV[4] age cutoff, ARGV[5] max size,
// ARGV[6] task key prefix, ARGV[7] "1" if the task must be active, ARGV[8] lease id
// Returns 1 on success, 0 if not active, -1 on ID conflict for a new task.
const ARCHIVE: &str = r#"
if ARGV[7] == "1" then
  if redis.call("HGET", KEYS[1], "lease") ~= ARGV[8] then
    return 0
  end
  if redis.call("LREM", KEYS[2], 0, ARGV[1]) == 0 then
    return 0
  end
elseif redis.call("EXISTS", KEYS[1]) == 1 then
  return -1
end
redis.call("ZREM", KEYS[3], ARGV[1])
redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "archived")
redis.call("HDEL", KEYS[1], "owner", "lease")
redis.call("ZADD", KEYS[4], ARGV[3], ARGV[1])
local expired = redis.call("ZRANGEBYSCORE", KEYS[4], "-inf", ARGV[4])
for _, id in ipairs(expired) do
  redis.call("DEL", ARGV[6] .. id)
  redis.call("ZREM", KEYS[4], id)
end
local overflow = redis.call("ZCARD", KEYS[4]) - tonumber(ARGV[5])
if overflow > 0 then
  local oldest = redis.call("ZRANGE", KEYS[4], 0, overflow - 1)
  for _, id in ipairs(oldest) do
    redis.call("DEL", ARGV[6] .. id)
  end
  redis.call("ZREMRANGEBYRANK", KEYS[4], 0, overflow - 1)
end
redis.call("INCR", KEYS[5])
if KEYS[6] and redis.call("GET", KEYS[6]) == ARGV[1] then
  redis.call("DEL", KEYS[6])
end
return 1
"#;

// KEYS[1] task hash, KEYS[2] active, KEYS[3] lease, KEYS[4] pending
// ARGV[1] id, ARGV[2] encoded msg, ARGV[3] lease id
const REQUEUE: &str = r#"
if redis.call("HGET", KEYS[1], "lease") ~= ARGV[3] then
  return 0
end
if redis.call("LREM", KEYS[2], 0, ARGV[1]) == 0 then
  return 0
end
redis.call("ZREM", KEYS[3], ARGV[1])
redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "pending")
redis.call("HDEL", KEYS[1], "owner", "lease")
redis.call("RPUSH", KEYS[4], ARGV[1])
return 1
"#;

// KEYS[1] active, KEYS[2] lease, KEYS[3] pending
// ARGV[1] task key prefix, ARGV[2] server id
// Returns the number of tasks moved back to pending.
const REQUEUE_ALL: &str = r#"
local ids = redis.call("LRANGE", KEYS[1], 0, -1)
local moved = 0
for _, id in ipairs(ids) do
  local key = ARGV[1] .. id
  if redis.call("HGET", key, "owner") == ARGV[2] then
    redis.call("LREM", KEYS[1], 0, id)
    redis.call("ZREM", KEYS[2], id)
    redis.call("HSET", key, "state", "pending")
    redis.call("HDEL", key, "owner", "lease")
    redis.call("RPUSH", KEYS[3], id)
    moved = moved + 1
  end
end
return moved
"#;

// KEYS[1] lease, KEYS[2] task hash
// ARGV[1] new deadline, ARGV[2] id, ARGV[3] lease id
const EXTEND_LEASE: &str = r#"
if not redis.call("ZSCORE", KEYS[1], ARGV[2]) then
  return 0
end
if redis.call("HGET", KEYS[2], "lease") ~= ARGV[3] then
  return 0
end
redis.call("ZADD", KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

// KEYS[1] lease
// ARGV[1] cutoff, ARGV[2] task key prefix
// Returns a flat list of (encoded msg, lease id, lease deadline) triples.
const LIST_LEASE_EXPIRED: &str = r#"
local res = {}
local entries = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1], "WITHSCORES")
for i = 1, #entries, 2 do
  local key = ARGV[2] .. entries[i]
  local msg = redis.call("HGET", key, "msg")
  if msg then
    table.insert(res, msg)
    table.insert(res, redis.call("HGET", key, "lease") or "")
    table.insert(res, entries[i + 1])
  end
end
return res
"#;

// KEYS[1] scheduled, KEYS[2] pending
// ARGV[1] now, ARGV[2] task key prefix, ARGV[3] batch size
const FORWARD: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[3]))
for _, id in ipairs(ids) do
  redis.call("LPUSH", KEYS[2], id)
  redis.call("ZREM", KEYS[1], id)
  redis.call("HSET", ARGV[2] .. id, "state", "pending")
end
return #ids
"#;

// KEYS[1] completed
// ARGV[1] now, ARGV[2] task key prefix, ARGV[3] batch size
const DELETE_EXPIRED_COMPLETED: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[3]))
for _, id in ipairs(ids) do
  redis.call("DEL", ARGV[2] .. id)
  redis.call("ZREM", KEYS[1], id)
end
return #ids
"#;

// KEYS[1] all servers, KEYS[2] server info
// ARGV[1] expiry, ARGV[2] server id, ARGV[3] ttl seconds, ARGV[4] info json
const WRITE_SERVER_STATE: &str = r#"
redis.call("SETEX", KEYS[2], ARGV[3], ARGV[4])
redis.call("ZADD", KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

// KEYS[1] all servers, KEYS[2] server info
// ARGV[1] server id
const CLEAR_SERVER_STATE: &str = r#"
redis.call("ZREM", KEYS[1], ARGV[1])
redis.call("DEL", KEYS[2])
return 1
"#;

/// Compiled scripts, hashed once per broker.
pub(crate) struct Scripts {
    pub enqueue: Script,
    pub enqueue_unique: Script,
    pub schedule: Script,
    pub schedule_unique: Script,
    pub dequeue: Script,
    pub done: Script,
    pub mark_complete: Script,
    pub retry: Script,
    pub archive: Script,
    pub requeue: Script,
    pub requeue_all: Script,
    pub extend_lease: Script,
    pub list_lease_expired: Script,
    pub forward: Script,
    pub delete_expired_completed: Script,
    pub write_server_state: Script,
    pub clear_server_state: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            enqueue_unique: Script::new(ENQUEUE_UNIQUE),
            schedule: Script::new(SCHEDULE),
            schedule_unique: Script::new(SCHEDULE_UNIQUE),
            dequeue: Script::new(DEQUEUE),
            done: Script::new(DONE),
            mark_complete: Script::new(MARK_COMPLETE),
            retry: Script::new(RETRY),
            archive: Script::new(ARCHIVE),
            requeue: Script::new(REQUEUE),
            requeue_all: Script::new(REQUEUE_ALL),
            extend_lease: Script::new(EXTEND_LEASE),
            list_lease_expired: Script::new(LIST_LEASE_EXPIRED),
            forward: Script::new(FORWARD),
            delete_expired_completed: Script::new(DELETE_EXPIRED_COMPLETED),
            write_server_state: Script::new(WRITE_SERVER_STATE),
            clear_server_state: Script::new(CLEAR_SERVER_STATE),
        }
    }
}
