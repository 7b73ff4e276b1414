use chrono::{DateTime, Utc};

use crate::{AllocateCmd, AllocationId, GrantId, ProductCategoryId, ResultAccounting, WalletId};

use super::{AccountingService, wallet_or_init};

impl AccountingService {
    /// Returns the wallet of `reference` in `category`, creating the bucket
    /// and the wallet when they do not exist yet.
    pub fn wallet_by_owner(
        &self,
        now: DateTime<Utc>,
        category: &ProductCategoryId,
        reference: &str,
    ) -> ResultAccounting<WalletId> {
        let owner = self.owner(reference)?;
        let bucket = self.bucket_or_init(category);
        let mut bucket = bucket.write();
        Ok(wallet_or_init(&mut bucket, now, owner))
    }

    /// Creates an allocation. The allocation is active immediately when its
    /// window contains `now`.
    pub fn allocate(&self, now: DateTime<Utc>, cmd: &AllocateCmd) -> ResultAccounting<AllocationId> {
        let bucket = self.bucket_or_init(&cmd.category);
        let mut bucket = bucket.write();
        bucket.allocate(now, cmd)
    }

    /// Releases every allocation of `grant` for persistence. Returns how many
    /// were released.
    pub fn commit_grant(&self, grant: GrantId) -> usize {
        let committed = self
            .all_buckets()
            .iter()
            .map(|bucket| bucket.write().commit_grant(grant))
            .sum();
        tracing::debug!("Committed {committed} allocations of grant {grant}");
        committed
    }

    /// Releases a single allocation for persistence. `false` when the
    /// allocation does not exist.
    pub fn commit_allocation(&self, id: AllocationId) -> bool {
        self.all_buckets()
            .iter()
            .any(|bucket| bucket.write().commit_allocation(id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn grant_allocations_wait_for_commit() {
        let service = AccountingService::new();
        let category = ProductCategoryId::new("cpu", "hpc");
        let wallet = service.wallet_by_owner(at(0), &category, "alice").unwrap();

        let held = service
            .allocate(
                at(0),
                &AllocateCmd::new(category.clone(), wallet, 10, at(0), at(10)).granted_in(GrantId(4)),
            )
            .unwrap();
        let changes = service.collect_changes();
        assert!(changes.allocations.is_empty());

        assert_eq!(service.commit_grant(GrantId(4)), 1);
        assert_eq!(service.commit_grant(GrantId(4)), 0);
        let changes = service.collect_changes();
        assert_eq!(changes.allocation_ids(), vec![held]);

        assert!(!service.commit_allocation(AllocationId(99)));
    }

    #[test]
    fn fresh_wallet_starts_locked() {
        let service = AccountingService::new();
        let category = ProductCategoryId::new("cpu", "hpc");
        let wallet = service.wallet_by_owner(at(0), &category, "alice").unwrap();
        let again = service.wallet_by_owner(at(1), &category, " alice ").unwrap();
        assert_eq!(wallet, again);
        let snapshot = service.wallet_snapshot(at(1), wallet, false).unwrap();
        assert!(snapshot.locked);
        assert_eq!(snapshot.max_usable, 0);
    }
}
