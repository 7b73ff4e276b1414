use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::{
    AccountingError, Bucket, IdAllocator, LedgerRecords, OwnerId, OwnerRegistry,
    ProductCategoryId, ResultAccounting, ScopedUsage, WalletId,
};

mod allocations;
mod persistence;
mod queries;
mod scans;
mod usage;

type SharedBucket = Arc<RwLock<Bucket>>;

/// The accounting engine.
///
/// Holds one [`Bucket`] per product category behind its own lock, the owner
/// registry and the scoped usage counters. Locks are always taken in the
/// order category registry, bucket, scoped usage. The owner registry is
/// only locked on its own.
#[derive(Debug, Default)]
pub struct AccountingService {
    buckets: RwLock<BTreeMap<ProductCategoryId, SharedBucket>>,
    owners: Mutex<OwnerRegistry>,
    scopes: RwLock<HashMap<String, Arc<Mutex<ScopedUsage>>>>,
    ids: Arc<IdAllocator>,
}

impl AccountingService {
    /// Return a builder for `AccountingService`.
    pub fn builder() -> AccountingServiceBuilder {
        AccountingServiceBuilder::default()
    }

    /// An empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner id for `reference`, registered on first use.
    pub fn owner(&self, reference: &str) -> ResultAccounting<OwnerId> {
        self.owners.lock().resolve(reference, &self.ids)
    }

    pub fn categories(&self) -> Vec<ProductCategoryId> {
        self.buckets.read().keys().cloned().collect()
    }

    fn bucket(&self, category: &ProductCategoryId) -> Option<SharedBucket> {
        self.buckets.read().get(category).cloned()
    }

    fn bucket_or_init(&self, category: &ProductCategoryId) -> SharedBucket {
        if let Some(bucket) = self.bucket(category) {
            return bucket;
        }
        let mut buckets = self.buckets.write();
        buckets
            .entry(category.clone())
            .or_insert_with(|| {
                tracing::debug!("Creating bucket for {category}");
                Arc::new(RwLock::new(Bucket::new(category.clone(), self.ids.clone())))
            })
            .clone()
    }

    /// All buckets in category order.
    fn all_buckets(&self) -> Vec<SharedBucket> {
        self.buckets.read().values().cloned().collect()
    }

    /// The bucket holding `wallet`. Wallet ids are unique across buckets.
    fn bucket_of_wallet(&self, wallet: WalletId) -> Option<SharedBucket> {
        self.all_buckets()
            .into_iter()
            .find(|bucket| bucket.read().wallet(wallet).is_some())
    }

    fn scope_or_init(&self, key: String) -> Arc<Mutex<ScopedUsage>> {
        if let Some(scope) = self.scopes.read().get(&key) {
            return scope.clone();
        }
        self.scopes
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ScopedUsage::new(key))))
            .clone()
    }
}

/// Returns the wallet of `owner`. A wallet created here has no quota yet, so
/// its lock flag is evaluated right away.
fn wallet_or_init(bucket: &mut Bucket, now: DateTime<Utc>, owner: OwnerId) -> WalletId {
    if let Some(id) = bucket.wallet_by_owner(owner) {
        return id;
    }
    let id = bucket.wallet_by_owner_or_init(now, owner);
    bucket.update_lock(now, id);
    id
}

/// The builder for `AccountingService`
#[derive(Default)]
pub struct AccountingServiceBuilder {
    records: LedgerRecords,
}

impl AccountingServiceBuilder {
    /// Records to start from, usually the output of
    /// [`Store::load`](crate::Store::load).
    pub fn records(mut self, records: LedgerRecords) -> AccountingServiceBuilder {
        self.records = records;
        self
    }

    /// Construct `AccountingService`
    pub fn build(self) -> ResultAccounting<AccountingService> {
        let LedgerRecords {
            owners,
            wallets,
            groups,
            allocations,
            scopes,
        } = self.records;

        let service = AccountingService::new();
        service.ids.observe(
            owners.iter().map(|owner| owner.id).max(),
            wallets.iter().map(|(_, wallet)| wallet.id).max(),
            groups.iter().map(|group| group.id).max(),
            allocations.iter().map(|alloc| alloc.id).max(),
        );

        {
            let mut registry = service.owners.lock();
            for mut owner in owners {
                owner.dirty = false;
                registry.insert(owner);
            }
        }

        let mut category_of = HashMap::new();
        for (category, mut wallet) in wallets {
            wallet.dirty = false;
            category_of.insert(wallet.id, category.clone());
            service.bucket_or_init(&category).write().insert_wallet(wallet);
        }

        let bucket_for = |wallet: WalletId| {
            category_of
                .get(&wallet)
                .and_then(|category| service.bucket(category))
                .ok_or_else(|| AccountingError::KeyNotFound(wallet.to_string()))
        };

        for mut group in groups {
            group.dirty = false;
            bucket_for(group.wallet)?.write().insert_group(group)?;
        }
        for mut allocation in allocations {
            allocation.dirty = false;
            allocation.committed = true;
            bucket_for(allocation.belongs_to)?
                .write()
                .insert_allocation(allocation)?;
        }

        {
            let mut registry = service.scopes.write();
            for mut scope in scopes {
                scope.dirty = false;
                registry.insert(scope.key.clone(), Arc::new(Mutex::new(scope)));
            }
        }

        tracing::info!(
            "Accounting state ready with {} owners in {} categories",
            service.owners.lock().len(),
            service.buckets.read().len()
        );
        Ok(service)
    }
}
