//! Heartbeat processor
//!
//! Subscribes to `heartbeat:*`, coalesces readings per tenant with
//! last-writer-wins, and flushes the buffer to the store in bulk every F
//! seconds. A failed flush re-buffers entries that were not overwritten in
//! the meantime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use genesis_kv::KvStore;
use genesis_store::Store;
use genesis_types::{Heartbeat, TenantId, HEARTBEAT_PATTERN};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

struct Buffered {
    heartbeat: Heartbeat,
    received_at: Instant,
}

pub struct HeartbeatProcessor {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn Store>,
    status: crate::status::ServiceStatusHandle,
    flush_interval: Duration,
    buffer: Mutex<HashMap<TenantId, Buffered>>,
    last_flush: Mutex<Option<Instant>>,
}

impl HeartbeatProcessor {
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn Store>,
        status: crate::status::ServiceStatusHandle,
        flush_interval_seconds: u64,
    ) -> Self {
        Self {
            kv,
            store,
            status,
            flush_interval: Duration::from_secs(flush_interval_seconds),
            buffer: Mutex::new(HashMap::new()),
            last_flush: Mutex::new(None),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = match self.kv.subscribe_pattern(HEARTBEAT_PATTERN).await {
            Ok(rx) => rx,
            Err(err) => {
                error!(error = %err, "heartbeat subscription failed, processor not running");
                let mut status = self.status.write();
                status.error_count += 1;
                status.last_error = Some(err.to_string());
                return;
            }
        };
        self.status.write().running = true;
        info!(flush_s = self.flush_interval.as_secs(), "heartbeat processor started");

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some((_, payload)) => self.ingest(&payload),
                    None => {
                        warn!("heartbeat pub/sub stream closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.flush().await,
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                // Final drain so buffered readings survive the restart.
                self.flush().await;
                break;
            }
        }
        self.status.write().running = false;
        info!("heartbeat processor stopped");
    }

    /// Parse and buffer one message; the latest reading per tenant wins.
    pub fn ingest(&self, payload: &str) {
        match serde_json::from_str::<Heartbeat>(payload) {
            Ok(heartbeat) => {
                self.buffer.lock().insert(
                    heartbeat.tenant_id.clone(),
                    Buffered {
                        heartbeat,
                        received_at: Instant::now(),
                    },
                );
            }
            Err(err) => {
                debug!(error = %err, "unparseable heartbeat dropped");
            }
        }
    }

    /// Drain the buffer into one bulk upsert. On failure, entries that no
    /// newer reading has replaced go back into the buffer for the next
    /// window; the error is counted and surfaced via status.
    pub async fn flush(&self) {
        let drained: Vec<(TenantId, Buffered)> = {
            let mut buffer = self.buffer.lock();
            buffer.drain().collect()
        };
        if !drained.is_empty() {
            let batch: Vec<Heartbeat> =
                drained.iter().map(|(_, b)| b.heartbeat.clone()).collect();
            if let Err(err) = self.store.update_gauges_bulk(&batch).await {
                warn!(error = %err, entries = batch.len(), "heartbeat flush failed, re-buffering");
                let mut buffer = self.buffer.lock();
                for (tenant, buffered) in drained {
                    buffer.entry(tenant).or_insert(buffered);
                }
                let mut status = self.status.write();
                status.error_count += 1;
                status.last_error = Some(err.to_string());
                return;
            }
        }
        *self.last_flush.lock() = Some(Instant::now());
        let mut status = self.status.write();
        status.last_run_at = Some(Utc::now());
        status.degraded = false;
        status.degraded_reason = None;
    }

    /// Healthy iff running and a flush landed within three windows.
    pub fn healthy(&self) -> bool {
        if !self.status.read().running {
            return false;
        }
        match *self.last_flush.lock() {
            Some(at) => at.elapsed() < self.flush_interval * 3,
            None => false,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::new_status;
    use genesis_kv::MemoryKv;
    use genesis_store::MemoryStore;
    use genesis_types::{derive_public_dns, AccountId, DropletHealth, DropletId, DropletState};

    async fn seed(store: &MemoryStore, tenant: &str, id: u64) {
        let ip = format!("203.0.113.{}", id);
        store
            .create_droplet(
                &DropletHealth {
                    tenant_id: TenantId::from(tenant),
                    droplet_id: DropletId(id),
                    account_id: AccountId::new("acct-1"),
                    region: "nyc3".into(),
                    size_slug: "s-2vcpu-4gb".into(),
                    public_dns: derive_public_dns(&ip),
                    public_ip: ip,
                    state: DropletState::ActiveHealthy,
                    last_heartbeat: None,
                    cpu_pct: 0.0,
                    mem_pct: 0.0,
                    disk_pct: 0.0,
                    engine_healthy: true,
                    sidecar_version: None,
                    credential_fingerprint: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                "seeded",
                "test",
            )
            .await
            .unwrap();
    }

    fn heartbeat(tenant: &str, id: u64, cpu: f64) -> String {
        serde_json::to_string(&Heartbeat {
            tenant_id: TenantId::from(tenant),
            droplet_id: DropletId(id),
            ts: Utc::now(),
            cpu_pct: cpu,
            mem_pct: 50.0,
            disk_pct: 30.0,
            engine_healthy: true,
        })
        .unwrap()
    }

    fn processor(store: Arc<MemoryStore>) -> HeartbeatProcessor {
        HeartbeatProcessor::new(
            Arc::new(MemoryKv::new()),
            store,
            new_status("heartbeat-processor"),
            10,
        )
    }

    #[tokio::test]
    async fn last_writer_wins_within_a_window() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "t-1", 1).await;
        let p = processor(store.clone());

        p.ingest(&heartbeat("t-1", 1, 11.0));
        p.ingest(&heartbeat("t-1", 1, 99.0));
        assert_eq!(p.buffered(), 1);
        p.flush().await;

        let row = store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.cpu_pct, 99.0);
        assert!(row.last_heartbeat.is_some());
        assert_eq!(p.buffered(), 0);
    }

    #[tokio::test]
    async fn failed_flush_rebuffers_entries_not_overwritten() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "t-1", 1).await;
        seed(&store, "t-2", 2).await;
        let p = processor(store.clone());

        p.ingest(&heartbeat("t-1", 1, 10.0));
        p.ingest(&heartbeat("t-2", 2, 20.0));
        store.fail_next_gauge_updates(1);
        p.flush().await;

        // Both entries survive the failed flush.
        assert_eq!(p.buffered(), 2);
        assert_eq!(p.status.read().error_count, 1);

        // A newer reading for t-1 wins over the re-buffered one.
        p.ingest(&heartbeat("t-1", 1, 77.0));
        p.flush().await;
        let row = store
            .get_droplet(&TenantId::from("t-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.cpu_pct, 77.0);
        let row2 = store
            .get_droplet(&TenantId::from("t-2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row2.cpu_pct, 20.0);
    }

    #[tokio::test]
    async fn health_requires_running_and_recent_flush() {
        let store = Arc::new(MemoryStore::new());
        let p = processor(store);
        assert!(!p.healthy());
        p.status.write().running = true;
        assert!(!p.healthy());
        p.flush().await;
        assert!(p.healthy());
    }
}
