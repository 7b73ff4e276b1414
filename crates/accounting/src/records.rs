//! Batches of records exchanged with a [`Store`](crate::Store).

use crate::{
    Allocation, AllocationGroup, AllocationId, GroupId, Owner, OwnerId, ProductCategoryId,
    ScopedUsage, Wallet, WalletId,
};

/// Owners, wallets, groups, allocations and scopes. Used both for a full
/// load and for a batch of changes to write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LedgerRecords {
    pub owners: Vec<Owner>,
    pub wallets: Vec<(ProductCategoryId, Wallet)>,
    pub groups: Vec<AllocationGroup>,
    pub allocations: Vec<Allocation>,
    pub scopes: Vec<ScopedUsage>,
}

impl LedgerRecords {
    pub fn len(&self) -> usize {
        self.owners.len()
            + self.wallets.len()
            + self.groups.len()
            + self.allocations.len()
            + self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn owner_ids(&self) -> Vec<OwnerId> {
        self.owners.iter().map(|owner| owner.id).collect()
    }

    pub(crate) fn wallet_ids(&self) -> Vec<WalletId> {
        self.wallets.iter().map(|(_, wallet)| wallet.id).collect()
    }

    pub(crate) fn group_ids(&self) -> Vec<GroupId> {
        self.groups.iter().map(|group| group.id).collect()
    }

    pub(crate) fn allocation_ids(&self) -> Vec<AllocationId> {
        self.allocations.iter().map(|alloc| alloc.id).collect()
    }
}
