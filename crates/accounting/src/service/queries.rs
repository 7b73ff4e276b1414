use chrono::{DateTime, Utc};

use crate::{
    Bucket, DumpRow, Node, OwnerId, ProductCategoryId, WalletFilter, WalletId, WalletOwner,
    WalletSnapshot,
};

use super::AccountingService;

impl AccountingService {
    fn owner_of(&self, id: OwnerId) -> Option<WalletOwner> {
        self.owners.lock().get(id).map(|owner| owner.wallet_owner())
    }

    fn snapshot_in(
        &self,
        bucket: &Bucket,
        now: DateTime<Utc>,
        wallet: WalletId,
        include_children: bool,
    ) -> Option<WalletSnapshot> {
        bucket.wallet_snapshot(now, wallet, include_children, |owner| self.owner_of(owner))
    }

    /// How much more usage `wallet` can absorb. `None` for an unknown wallet.
    pub fn max_usable(&self, now: DateTime<Utc>, wallet: WalletId) -> Option<i64> {
        self.bucket_of_wallet(wallet)?.read().max_usable(now, wallet)
    }

    pub fn wallet_snapshot(
        &self,
        now: DateTime<Utc>,
        wallet: WalletId,
        include_children: bool,
    ) -> Option<WalletSnapshot> {
        let bucket = self.bucket_of_wallet(wallet)?;
        let bucket = bucket.read();
        self.snapshot_in(&bucket, now, wallet, include_children)
    }

    /// Wallets of `reference` that have at least one allocation, ordered by
    /// provider and category. Nothing is created for owners or categories
    /// that are unknown.
    pub fn retrieve_wallets(
        &self,
        now: DateTime<Utc>,
        reference: &str,
        filter: &WalletFilter,
    ) -> Vec<WalletSnapshot> {
        let Some(owner) = self.owners.lock().by_reference(reference).map(|o| o.id) else {
            return Vec::new();
        };

        let buckets: Vec<_> = self
            .buckets
            .read()
            .iter()
            .filter(|(category, _)| filter.matches(category))
            .map(|(_, bucket)| bucket.clone())
            .collect();

        buckets
            .iter()
            .filter_map(|bucket| {
                let bucket = bucket.read();
                let wallet = bucket.wallet_by_owner(owner)?;
                let snapshot = self.snapshot_in(&bucket, now, wallet, filter.include_children)?;
                let include = if filter.require_active {
                    snapshot.has_active_allocation()
                } else {
                    !snapshot.groups.is_empty()
                };
                include.then_some(snapshot)
            })
            .collect()
    }

    /// The wallet of `reference` in `category` followed by every wallet above
    /// it.
    pub fn retrieve_ancestors(
        &self,
        now: DateTime<Utc>,
        category: &ProductCategoryId,
        reference: &str,
    ) -> Vec<WalletSnapshot> {
        let Some(owner) = self.owners.lock().by_reference(reference).map(|o| o.id) else {
            return Vec::new();
        };
        let Some(bucket) = self.bucket(category) else {
            return Vec::new();
        };
        let bucket = bucket.read();
        let Some(wallet) = bucket.wallet_by_owner(owner) else {
            return Vec::new();
        };

        bucket
            .ancestors(wallet)
            .into_iter()
            .filter_map(|id| self.snapshot_in(&bucket, now, id, false))
            .collect()
    }

    /// Wallets of `provider` with a significant update at or after
    /// `timestamp`.
    pub fn wallets_updated_after(&self, timestamp: DateTime<Utc>, provider: &str) -> Vec<WalletId> {
        let buckets: Vec<_> = self
            .buckets
            .read()
            .iter()
            .filter(|(category, _)| category.provider == provider)
            .map(|(_, bucket)| bucket.clone())
            .collect();

        let mut wallets: Vec<WalletId> = buckets
            .iter()
            .flat_map(|bucket| bucket.read().wallets_updated_after(timestamp))
            .collect();
        wallets.sort();
        wallets
    }

    /// Diagram of the wallet, its ancestors and their allocations.
    pub fn mermaid(&self, now: DateTime<Utc>, wallet: WalletId) -> Option<String> {
        self.bucket_of_wallet(wallet)?.read().to_mermaid(now, wallet)
    }

    /// Residual network a charge to `wallet` would start from.
    pub fn charge_graph_mermaid(&self, now: DateTime<Utc>, wallet: WalletId) -> Option<String> {
        let bucket = self.bucket_of_wallet(wallet)?;
        let graph = bucket.read().build_graph(now, wallet, None);
        Some(graph.to_mermaid(|node| match node {
            Node::Root => "Root".to_string(),
            Node::Wallet(id) => id.to_string(),
        }))
    }

    /// One row per wallet across all categories, ordered by wallet id.
    pub fn dump(&self, now: DateTime<Utc>) -> Vec<DumpRow> {
        let mut rows: Vec<DumpRow> = self
            .all_buckets()
            .iter()
            .flat_map(|bucket| bucket.read().dump_rows(now))
            .collect();
        rows.sort_by_key(|row| row.id);
        rows
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::AllocateCmd;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    #[test]
    fn retrieve_wallets_filters_and_sorts() {
        let service = AccountingService::new();
        let storage = ProductCategoryId::new("storage", "b");
        let cpu = ProductCategoryId::new("cpu", "b");
        let gpu = ProductCategoryId::new("gpu", "a");

        for (category, start) in [(&storage, 0), (&cpu, 0), (&gpu, 50)] {
            let wallet = service.wallet_by_owner(at(0), category, "alice").unwrap();
            service
                .allocate(at(0), &AllocateCmd::new(category.clone(), wallet, 10, at(start), at(100)))
                .unwrap();
        }

        let all = service.retrieve_wallets(at(1), "alice", &WalletFilter::default());
        let order: Vec<_> = all.iter().map(|w| w.category.clone()).collect();
        assert_eq!(order, vec![gpu.clone(), cpu.clone(), storage.clone()]);

        let active = service.retrieve_wallets(at(1), "alice", &WalletFilter::default().require_active());
        assert_eq!(active.len(), 2);

        let provider_b = service.retrieve_wallets(at(1), "alice", &WalletFilter::default().provider("b"));
        assert_eq!(provider_b.len(), 2);

        assert!(service.retrieve_wallets(at(1), "nobody", &WalletFilter::default()).is_empty());
    }

    #[test]
    fn ancestors_walk_up_to_the_root() {
        let service = AccountingService::new();
        let category = ProductCategoryId::new("cpu", "hpc");
        let top = service.wallet_by_owner(at(0), &category, "top").unwrap();
        let mid = service.wallet_by_owner(at(0), &category, "mid").unwrap();
        let leaf = service.wallet_by_owner(at(0), &category, "leaf").unwrap();

        service
            .allocate(at(0), &AllocateCmd::new(category.clone(), top, 100, at(0), at(10)))
            .unwrap();
        service
            .allocate(at(0), &AllocateCmd::new(category.clone(), mid, 50, at(0), at(10)).parent(top))
            .unwrap();
        service
            .allocate(at(0), &AllocateCmd::new(category.clone(), leaf, 20, at(0), at(10)).parent(mid))
            .unwrap();

        let ids: Vec<_> = service
            .retrieve_ancestors(at(1), &category, "leaf")
            .iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec![leaf, mid, top]);

        let mermaid = service.charge_graph_mermaid(at(1), leaf).unwrap();
        assert!(mermaid.contains("Root"));
        assert_eq!(service.dump(at(1)).len(), 3);
    }
}
