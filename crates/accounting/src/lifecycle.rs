//! Allocation lifecycle: activation, retirement and lock re-evaluation.
//!
//! Transitions are driven by comparing `now` with the allocation window and
//! only move forward, so running a scan twice with the same `now` does
//! nothing the second time.

use chrono::{DateTime, Utc};

use crate::{AllocationId, AllocationState, Bucket, WalletId};

/// What a scan changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub activated: usize,
    pub retired: usize,
}

impl ScanOutcome {
    pub fn is_empty(&self) -> bool {
        self.activated == 0 && self.retired == 0
    }
}

impl std::ops::AddAssign for ScanOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.activated += rhs.activated;
        self.retired += rhs.retired;
    }
}

impl Bucket {
    /// Activates and retires every allocation whose window says so.
    pub fn scan_allocations(&mut self, now: DateTime<Utc>) -> ScanOutcome {
        let ids: Vec<AllocationId> = self.allocations().map(|alloc| alloc.id).collect();
        let mut outcome = ScanOutcome::default();
        for id in ids {
            if self.attempt_activation(now, id, true) {
                outcome.activated += 1;
            }
            if self.attempt_retirement(now, id, true) {
                outcome.retired += 1;
            }
        }
        outcome
    }

    pub fn attempt_activation(&mut self, now: DateTime<Utc>, id: AllocationId, log: bool) -> bool {
        let alloc = self.require_allocation_mut(id);
        if !alloc.should_activate(now) {
            return false;
        }

        alloc.state = AllocationState::Active;
        alloc.dirty = true;
        let wallet = alloc.belongs_to;

        self.reevaluate(now, wallet, true);
        self.mark_significant_update(now, wallet);

        if log {
            tracing::info!("Activating allocation: {id}");
        }
        true
    }

    /// Retires the allocation, freezing the usage it absorbed. The frozen
    /// amount keeps backing the group, the remaining quota does not.
    pub fn attempt_retirement(&mut self, now: DateTime<Utc>, id: AllocationId, log: bool) -> bool {
        let alloc = self.require_allocation(id);
        if !alloc.should_retire(now) {
            return false;
        }
        let (wallet, quota, group) = (alloc.belongs_to, alloc.quota, alloc.group);

        let group = self.require_group(group);
        let unattributed = group.tree_usage - self.group_retired_usage(group);
        let retired_usage = quota.min(unattributed).max(0);

        let alloc = self.require_allocation_mut(id);
        alloc.retired_usage = retired_usage;
        alloc.state = AllocationState::Retired;
        alloc.dirty = true;

        self.reevaluate(now, wallet, true);
        self.mark_significant_update(now, wallet);

        if log {
            tracing::info!("Retiring allocation: {id} (retired usage {retired_usage})");
        }
        true
    }

    /// Re-evaluates the lock flag of `wallet` and everything below it. With
    /// `reflow`, excess usage is first pushed back into the graph.
    pub fn reevaluate(&mut self, now: DateTime<Utc>, wallet: WalletId, reflow: bool) {
        if reflow {
            self.reflow_excess(now, wallet);
        }
        for id in self.descendants(wallet) {
            self.update_lock(now, id);
        }
    }

    /// Sets the lock flag from the current headroom. Returns whether it
    /// flipped.
    pub(crate) fn update_lock(&mut self, now: DateTime<Utc>, id: WalletId) -> bool {
        let locked = self.headroom(now, id) <= 0;
        let wallet = self.require_wallet_mut(id);
        if wallet.was_locked == locked {
            return false;
        }

        wallet.was_locked = locked;
        wallet.dirty = true;
        self.mark_significant_update(now, id);
        if locked {
            tracing::info!("Locking wallet {id} in {}", self.category);
        } else {
            tracing::info!("Unlocking wallet {id} in {}", self.category);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::{AllocateCmd, IdAllocator, Node, OwnerId, ProductCategoryId};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn bucket() -> Bucket {
        Bucket::new(
            ProductCategoryId::new("cpu", "hpc"),
            Arc::new(IdAllocator::default()),
        )
    }

    #[test]
    fn future_allocation_waits_for_scan() {
        let mut bucket = bucket();
        let wallet = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        let cmd = AllocateCmd::new(bucket.category.clone(), wallet, 100, at(10), at(20));
        let id = bucket.allocate(at(0), &cmd).unwrap();
        assert_eq!(bucket.allocation(id).unwrap().state, AllocationState::Pending);

        assert_eq!(bucket.scan_allocations(at(5)), ScanOutcome::default());
        let outcome = bucket.scan_allocations(at(10));
        assert_eq!(outcome.activated, 1);
        assert_eq!(bucket.allocation(id).unwrap().state, AllocationState::Active);
        assert_eq!(bucket.headroom(at(10), wallet), 100);
        assert_eq!(bucket.significant_update_at, Some(at(10)));
    }

    #[test]
    fn retirement_freezes_usage_and_is_idempotent() {
        let mut bucket = bucket();
        let wallet = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        let cmd = AllocateCmd::new(bucket.category.clone(), wallet, 100, at(0), at(10));
        let id = bucket.allocate(at(0), &cmd).unwrap();
        bucket.charge(at(1), wallet, 30).unwrap();

        let outcome = bucket.scan_allocations(at(11));
        assert_eq!(outcome.retired, 1);
        let alloc = bucket.allocation(id).unwrap();
        assert_eq!(alloc.state, AllocationState::Retired);
        assert_eq!(alloc.retired_usage, 30);
        assert_eq!(alloc.quota, 100);

        let group = bucket.group_between(wallet, Node::Root).unwrap();
        assert_eq!(bucket.group_contributing_quota(group), 30);
        assert_eq!(group.tree_usage, 30);
        assert!(bucket.wallet(wallet).unwrap().was_locked);

        assert!(bucket.scan_allocations(at(11)).is_empty());
        assert!(bucket.scan_allocations(at(50)).is_empty());
    }

    #[test]
    fn pending_allocation_can_retire_directly() {
        let mut bucket = bucket();
        let wallet = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        let cmd = AllocateCmd::new(bucket.category.clone(), wallet, 100, at(10), at(20));
        let id = bucket.allocate(at(0), &cmd).unwrap();

        let outcome = bucket.scan_allocations(at(30));
        assert_eq!(outcome, ScanOutcome { activated: 0, retired: 1 });
        let alloc = bucket.allocation(id).unwrap();
        assert_eq!(alloc.state, AllocationState::Retired);
        assert_eq!(alloc.retired_usage, 0);
    }

    #[test]
    fn activation_reflows_excess() {
        let mut bucket = bucket();
        let wallet = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        let first = AllocateCmd::new(bucket.category.clone(), wallet, 50, at(0), at(100));
        bucket.allocate(at(0), &first).unwrap();
        bucket.charge(at(1), wallet, 80).unwrap();
        assert_eq!(bucket.wallet_excess(wallet), 30);

        let second = AllocateCmd::new(bucket.category.clone(), wallet, 100, at(5), at(100));
        bucket.allocate(at(2), &second).unwrap();
        bucket.scan_allocations(at(5));

        assert_eq!(bucket.wallet_excess(wallet), 0);
        assert_eq!(bucket.wallet_propagated_usage(wallet), 80);
        assert_eq!(bucket.headroom(at(5), wallet), 70);
        assert!(!bucket.wallet(wallet).unwrap().was_locked);
    }
}
