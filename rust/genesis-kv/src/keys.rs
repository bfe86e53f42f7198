//! Well-known key layout shared by all control-plane instances

use genesis_types::QueueName;

pub fn ready(queue: QueueName) -> String {
    format!("genesis:q:{}:ready", queue)
}

pub fn delayed(queue: QueueName) -> String {
    format!("genesis:q:{}:delayed", queue)
}

pub fn inflight(queue: QueueName) -> String {
    format!("genesis:q:{}:inflight", queue)
}

pub fn payloads(queue: QueueName) -> String {
    format!("genesis:q:{}:payloads", queue)
}

pub fn priorities(queue: QueueName) -> String {
    format!("genesis:q:{}:prio", queue)
}

pub fn dlq_index(queue: QueueName) -> String {
    format!("genesis:q:{}:dlq", queue)
}

pub fn dlq_entries(queue: QueueName) -> String {
    format!("genesis:q:{}:dlq:entries", queue)
}

pub fn governor_global() -> String {
    "genesis:governor:global".to_string()
}

pub fn governor_queue(queue: QueueName) -> String {
    format!("genesis:governor:queue:{}", queue)
}

pub fn governor_account(account: &str) -> String {
    format!("genesis:governor:account:{}", account)
}

pub fn breaker_failures(queue: QueueName) -> String {
    format!("genesis:breaker:{}:failures", queue)
}

pub fn breaker_open_until(queue: QueueName) -> String {
    format!("genesis:breaker:{}:open_until", queue)
}

pub fn breaker_probe(queue: QueueName) -> String {
    format!("genesis:breaker:{}:probe", queue)
}

pub fn queue_rate(queue: QueueName) -> String {
    format!("genesis:rate:queue:{}", queue)
}

pub fn account_rate(account: &str) -> String {
    format!("genesis:rate:account:{}", account)
}
