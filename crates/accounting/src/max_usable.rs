//! Headroom of a wallet.
//!
//! The amount a wallet can still absorb is the maximum flow from the root to
//! the wallet over the unused contributing quota of every group above it. On a
//! chain this is the smallest remaining capacity, across parallel parents the
//! capacities add up.

use chrono::{DateTime, Utc};

use crate::{Bucket, Node, WalletId, error::invariant_violation};

impl Bucket {
    /// `None` when the wallet is not part of this bucket.
    pub fn max_usable(&self, now: DateTime<Utc>, wallet: WalletId) -> Option<i64> {
        self.wallet(wallet)?;
        Some(self.headroom(now, wallet))
    }

    pub(crate) fn headroom(&self, now: DateTime<Utc>, wallet: WalletId) -> i64 {
        let mut graph = self.build_graph(now, wallet, None);
        let Some(root) = graph.vertex(&Node::Root) else {
            invariant_violation("headroom graph without a root vertex");
        };
        graph.max_flow(root, 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::{AllocateCmd, IdAllocator, OwnerId, ProductCategoryId};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn min_along_chain_sum_across_parents() {
        let mut bucket = Bucket::new(
            ProductCategoryId::new("cpu", "hpc"),
            Arc::new(IdAllocator::default()),
        );
        let category = bucket.category.clone();
        let a = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        let b = bucket.wallet_by_owner_or_init(at(0), OwnerId(2));
        let child = bucket.wallet_by_owner_or_init(at(0), OwnerId(3));

        bucket
            .allocate(at(0), &AllocateCmd::new(category.clone(), a, 30, at(0), at(10)))
            .unwrap();
        bucket
            .allocate(at(0), &AllocateCmd::new(category.clone(), b, 500, at(0), at(10)))
            .unwrap();
        bucket
            .allocate(at(0), &AllocateCmd::new(category.clone(), child, 100, at(0), at(10)).parent(a))
            .unwrap();
        bucket
            .allocate(at(0), &AllocateCmd::new(category, child, 40, at(0), at(10)).parent(b))
            .unwrap();

        // min(30, 100) through a plus min(500, 40) through b.
        assert_eq!(bucket.max_usable(at(1), child), Some(70));
        assert_eq!(bucket.max_usable(at(1), a), Some(30));
        assert_eq!(bucket.max_usable(at(1), WalletId(999)), None);
    }
}
