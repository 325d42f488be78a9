//! Asynchronous audit and security-event pipeline. Writers enqueue into a
//! bounded in-process buffer and never block on storage; a background worker
//! drains batches. Under pressure the oldest event is dropped and counted, so
//! authentication latency stays independent of audit I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::database::models::{AuditEvent, AuditQuery, PrincipalType};
use crate::error::AuthError;
use crate::storage::AuditEventRepository;

struct Buffer {
    queue: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

/// Cheap cloneable writer handle. `emit` is synchronous and lock-bounded;
/// it never awaits.
#[derive(Clone)]
pub struct AuditRecorder {
    buffer: Arc<Buffer>,
}

impl AuditRecorder {
    pub fn emit(&self, event: AuditEvent) {
        let Ok(mut queue) = self.buffer.queue.lock() else {
            self.buffer.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if queue.len() >= self.buffer.capacity {
            queue.pop_front();
            self.buffer.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.buffer.notify.notify_one();
    }

    /// Events discarded under pressure since startup.
    pub fn dropped_events(&self) -> u64 {
        self.buffer.dropped.load(Ordering::Relaxed)
    }

    fn len(&self) -> usize {
        self.buffer.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn take_batch(&self, max: usize) -> Vec<AuditEvent> {
        let Ok(mut queue) = self.buffer.queue.lock() else {
            return Vec::new();
        };
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }
}

/// Filtered read path. SYSTEM principals may query across tenants; TENANT
/// principals always get their own tenant forced into the filter.
#[derive(Clone)]
pub struct AuditReader {
    repository: Arc<dyn AuditEventRepository>,
}

impl AuditReader {
    pub async fn query_scoped(
        &self,
        principal_type: PrincipalType,
        principal_tenant: Option<Uuid>,
        mut query: AuditQuery,
    ) -> Result<Vec<AuditEvent>, AuthError> {
        if principal_type == PrincipalType::Tenant {
            query.tenant_id = principal_tenant;
        }
        self.repository.query(&query).await
    }
}

/// The running pipeline: one worker task draining the buffer.
pub struct AuditPipeline {
    recorder: AuditRecorder,
    reader: AuditReader,
    worker: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_grace: Duration,
}

impl AuditPipeline {
    pub fn start(repository: Arc<dyn AuditEventRepository>, config: &AuditConfig) -> Self {
        let recorder = AuditRecorder {
            buffer: Arc::new(Buffer {
                queue: Mutex::new(VecDeque::with_capacity(config.buffer_capacity)),
                capacity: config.buffer_capacity,
                dropped: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(worker_loop(
            recorder.clone(),
            repository.clone(),
            config.batch_size,
            Duration::from_millis(config.flush_interval_ms),
            shutdown_rx,
        ));

        Self {
            recorder,
            reader: AuditReader { repository },
            worker,
            shutdown_tx,
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        }
    }

    pub fn recorder(&self) -> AuditRecorder {
        self.recorder.clone()
    }

    pub fn reader(&self) -> AuditReader {
        self.reader.clone()
    }

    /// Flush pending events within the grace period, then stop the worker.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(self.shutdown_grace, self.worker)
            .await
            .is_err()
        {
            tracing::warn!("Audit worker did not flush within the shutdown grace period");
        }
    }
}

async fn worker_loop(
    recorder: AuditRecorder,
    repository: Arc<dyn AuditEventRepository>,
    batch_size: usize,
    flush_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                drain(&recorder, repository.as_ref(), batch_size).await;
            }
            _ = recorder.buffer.notify.notified() => {
                // Early drain only once a full batch is waiting; the tick
                // handles stragglers.
                if recorder.len() >= batch_size {
                    drain(&recorder, repository.as_ref(), batch_size).await;
                }
            }
            _ = shutdown_rx.changed() => {
                drain(&recorder, repository.as_ref(), batch_size).await;
                tracing::debug!("Audit worker stopped");
                return;
            }
        }
    }
}

async fn drain(recorder: &AuditRecorder, repository: &dyn AuditEventRepository, batch_size: usize) {
    loop {
        let batch = recorder.take_batch(batch_size);
        if batch.is_empty() {
            return;
        }
        if let Err(e) = repository.insert_batch(&batch).await {
            recorder
                .buffer
                .dropped
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            tracing::error!(batch = batch.len(), "Failed to persist audit batch: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::database::models::AuditResult;
    use crate::storage::memory;

    fn fast_config() -> AuditConfig {
        AuditConfig {
            flush_interval_ms: 20,
            ..AppConfig::development().audit
        }
    }

    #[tokio::test]
    async fn events_flush_to_storage() {
        let storage = memory::build_storage();
        let pipeline = AuditPipeline::start(storage.audit_events.clone(), &fast_config());
        let recorder = pipeline.recorder();

        for _ in 0..3 {
            recorder.emit(AuditEvent::new("login.success", AuditResult::Success));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = storage
            .audit_events
            .query(&AuditQuery::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let storage = memory::build_storage();
        let config = AuditConfig {
            buffer_capacity: 4,
            batch_size: 100,
            flush_interval_ms: 60_000, // effectively never during the test
            shutdown_grace_ms: 1000,
        };
        let pipeline = AuditPipeline::start(storage.audit_events.clone(), &config);
        let recorder = pipeline.recorder();

        for i in 0..10 {
            let event = AuditEvent::new("login.failure", AuditResult::Failure)
                .with_error(&format!("attempt-{}", i));
            recorder.emit(event);
        }
        assert_eq!(recorder.dropped_events(), 6);

        // Shutdown flushes the surviving (newest) four.
        pipeline.shutdown().await;
        let events = storage
            .audit_events
            .query(&AuditQuery::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 4);
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| e.error.as_deref())
            .collect();
        assert!(errors.contains(&"attempt-9"));
        assert!(!errors.contains(&"attempt-0"));
    }

    #[tokio::test]
    async fn tenant_principals_only_see_their_tenant() {
        let storage = memory::build_storage();
        let pipeline = AuditPipeline::start(storage.audit_events.clone(), &fast_config());
        let recorder = pipeline.recorder();
        let reader = pipeline.reader();

        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        recorder.emit(AuditEvent::new("login.success", AuditResult::Success).with_tenant(Some(t1)));
        recorder.emit(AuditEvent::new("login.success", AuditResult::Success).with_tenant(Some(t2)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // TENANT principal: the cross-tenant filter is overridden.
        let sneaky = AuditQuery {
            tenant_id: Some(t2),
            ..Default::default()
        };
        let events = reader
            .query_scoped(PrincipalType::Tenant, Some(t1), sneaky)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tenant_id, Some(t1));

        // SYSTEM principal: sees everything.
        let events = reader
            .query_scoped(PrincipalType::System, None, AuditQuery::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        pipeline.shutdown().await;
    }
}
