//! Periodic lifecycle scan.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::watch, time::MissedTickBehavior};

use crate::{AccountingService, Store};

/// Background task that scans every bucket and flushes the changes to a
/// store on a fixed interval.
pub struct Scanner {
    service: Arc<AccountingService>,
    interval: Duration,
    flush_on_shutdown: bool,
}

impl Scanner {
    pub fn new(service: Arc<AccountingService>, interval: Duration) -> Self {
        Self {
            service,
            interval,
            flush_on_shutdown: true,
        }
    }

    #[must_use]
    pub fn flush_on_shutdown(mut self, flush: bool) -> Self {
        self.flush_on_shutdown = flush;
        self
    }

    /// Runs one scan followed by a flush. A failed flush is logged and the
    /// changes stay queued for the next tick.
    pub async fn tick<S: Store>(&self, store: &S) {
        let outcome = self.service.scan_all(Utc::now());
        tracing::debug!(
            "Scan tick: {} activated, {} retired",
            outcome.activated,
            outcome.retired
        );
        if let Ok(written) = self.service.flush(store).await
            && written > 0
        {
            tracing::debug!("Flushed {written} accounting records");
        }
    }

    /// Ticks until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run<S: Store>(self, store: &S, mut shutdown: watch::Receiver<bool>) {
        let mut interval_timer = tokio::time::interval(self.interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval_timer.tick().await;

        tracing::info!("Scanner started with interval {:?}", self.interval);
        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    self.tick(store).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if self.flush_on_shutdown {
            match self.service.flush(store).await {
                Ok(written) => tracing::info!("Flushed {written} accounting records on shutdown"),
                Err(err) => tracing::error!("Final flush failed: {err}"),
            }
        }
        tracing::info!("Scanner stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration as ChronoDuration};
    use parking_lot::Mutex;

    use super::*;
    use crate::{AllocateCmd, LedgerRecords, ProductCategoryId, ResultAccounting};

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<LedgerRecords>>,
    }

    impl Store for MemoryStore {
        async fn load(&self) -> ResultAccounting<LedgerRecords> {
            Ok(LedgerRecords::default())
        }

        async fn save(&self, records: &LedgerRecords) -> ResultAccounting<()> {
            self.saved.lock().push(records.clone());
            Ok(())
        }
    }

    fn allocate_expired(service: &AccountingService) {
        let now: DateTime<Utc> = Utc::now();
        let category = ProductCategoryId::new("cpu", "hpc");
        let wallet = service.wallet_by_owner(now, &category, "alice").unwrap();
        let start = now - ChronoDuration::hours(2);
        let end = now - ChronoDuration::hours(1);
        service
            .allocate(start, &AllocateCmd::new(category, wallet, 10, start, end))
            .unwrap();
    }

    #[tokio::test]
    async fn tick_scans_and_flushes() {
        let service = Arc::new(AccountingService::new());
        allocate_expired(&service);
        let store = MemoryStore::default();

        Scanner::new(service.clone(), Duration::from_secs(60))
            .tick(&store)
            .await;

        let saved = store.saved.lock();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].allocations.iter().all(|alloc| alloc.is_retired()));
    }

    #[tokio::test]
    async fn shutdown_stops_and_flushes() {
        let service = Arc::new(AccountingService::new());
        allocate_expired(&service);
        let store = MemoryStore::default();
        let (tx, rx) = watch::channel(false);

        let scanner = Scanner::new(service, Duration::from_secs(3600));
        let run = scanner.run(&store, rx);
        tx.send(true).unwrap();
        run.await;

        assert_eq!(store.saved.lock().len(), 1);
    }
}
