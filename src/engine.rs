//! The analytics engine and its shared call discipline.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::models::{KpiReading, KpiTarget, Scope};
use crate::store::{GateStore, Page, ReadingQuery, ReadingSource, StoreError, TargetSource};

pub struct Engine {
    readings: Arc<dyn ReadingSource>,
    targets: Arc<dyn TargetSource>,
    store: Arc<dyn GateStore>,
    config: GateConfig,
    write_locks: KeyedLocks,
}

impl Engine {
    pub fn new(
        readings: Arc<dyn ReadingSource>,
        targets: Arc<dyn TargetSource>,
        store: Arc<dyn GateStore>,
        config: GateConfig,
    ) -> Self {
        Self {
            readings,
            targets,
            store,
            config,
            write_locks: KeyedLocks::default(),
        }
    }

    /// Engine over a single backend that serves all three boundaries.
    pub fn with_backend<B>(backend: Arc<B>, config: GateConfig) -> Self
    where
        B: ReadingSource + TargetSource + GateStore + 'static,
    {
        Self::new(backend.clone(), backend.clone(), backend, config)
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn GateStore {
        self.store.as_ref()
    }

    /// Runs a collaborator call under the configured timeout. No retries.
    pub(crate) async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        let timeout = self.config.upstream.timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(GateError::from_store(operation, err)),
            Err(_) => Err(GateError::UpstreamUnavailable {
                operation,
                reason: format!("timed out after {} ms", timeout.as_millis()),
            }),
        }
    }

    /// Drains every page of a reading query.
    pub(crate) async fn fetch_readings(
        &self,
        scope: &Scope,
        query: &ReadingQuery,
    ) -> Result<Vec<KpiReading>> {
        let mut readings = Vec::new();
        let mut page = Page {
            offset: 0,
            limit: self.config.upstream.page_size,
        };

        loop {
            let batch = self
                .bounded("list_readings", self.readings.list_readings_page(scope, query, page))
                .await?;
            readings.extend(batch.readings);
            match batch.next_offset {
                Some(next) if next > page.offset => page.offset = next,
                _ => break,
            }
        }

        debug!(kpi = %query.kpi_key, count = readings.len(), "Fetched readings");
        Ok(readings)
    }

    pub(crate) async fn target(&self, scope: &Scope, kpi_key: &str) -> Result<Option<KpiTarget>> {
        self.bounded("get_kpi_target", self.targets.get_kpi_target(scope, kpi_key))
            .await
    }

    /// Serializes writers of one idempotency key; other keys proceed.
    pub(crate) async fn lock_key(&self, key: String) -> OwnedMutexGuard<()> {
        self.write_locks.acquire(key).await
    }
}

#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: String) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}
