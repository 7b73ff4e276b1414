use crate::{LedgerRecords, ResultAccounting, Store};

use super::AccountingService;

impl AccountingService {
    /// Reads the ledger from `store` and rebuilds the in-memory state.
    pub async fn load<S: Store>(store: &S) -> ResultAccounting<Self> {
        let records = store.load().await?;
        Self::builder().records(records).build()
    }

    /// Copies every dirty record out of the service and clears the flags.
    ///
    /// Every bucket stays write-locked until the scopes are drained. A usage
    /// report updates its wallet and its scope under the same bucket lock, so
    /// a batch never carries one without the other. Owners are collected
    /// after the buckets so every wallet in the batch finds its owner in the
    /// same batch or in the store.
    pub fn collect_changes(&self) -> LedgerRecords {
        let mut records = LedgerRecords::default();

        let buckets = self.all_buckets();
        let mut guards: Vec<_> = buckets.iter().map(|bucket| bucket.write()).collect();
        for bucket in &mut guards {
            let category = bucket.category.clone();
            let changes = bucket.take_changes();
            records
                .wallets
                .extend(changes.wallets.into_iter().map(|w| (category.clone(), w)));
            records.groups.extend(changes.groups);
            records.allocations.extend(changes.allocations);
        }

        records.owners = self.owners.lock().take_dirty();

        let scopes: Vec<_> = self.scopes.read().values().cloned().collect();
        for scope in scopes {
            let mut scope = scope.lock();
            if scope.dirty {
                scope.dirty = false;
                records.scopes.push(scope.clone());
            }
        }
        drop(guards);
        records.scopes.sort_by(|a, b| a.key.cmp(&b.key));

        records
    }

    /// Flags the records of a batch dirty again so the next flush retries
    /// them.
    pub fn requeue(&self, records: &LedgerRecords) {
        let wallets = records.wallet_ids();
        let groups = records.group_ids();
        let allocations = records.allocation_ids();
        for bucket in self.all_buckets() {
            bucket.write().requeue(&wallets, &groups, &allocations);
        }

        {
            let mut owners = self.owners.lock();
            for id in records.owner_ids() {
                owners.mark_dirty(id);
            }
        }

        let registry = self.scopes.read();
        for scope in &records.scopes {
            if let Some(current) = registry.get(&scope.key) {
                current.lock().dirty = true;
            }
        }
    }

    /// Writes all pending changes to `store`. On failure the changes are
    /// requeued and the error is returned; the in-memory state is untouched.
    pub async fn flush<S: Store>(&self, store: &S) -> ResultAccounting<usize> {
        let changes = self.collect_changes();
        if changes.is_empty() {
            return Ok(0);
        }

        match store.save(&changes).await {
            Ok(()) => Ok(changes.len()),
            Err(err) => {
                tracing::warn!(
                    "Failed to persist {} accounting records: {err}",
                    changes.len()
                );
                self.requeue(&changes);
                Err(err)
            }
        }
    }
}
