//! Numeric identifiers.
//!
//! Every entity is referenced by a plain integer wrapped in its own type so a
//! wallet id cannot be passed where an allocation id is expected. Ids are
//! global to the service, they are not namespaced by bucket.

use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
};

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Identifies an [`Owner`](crate::Owner).
    OwnerId,
    "O"
);
numeric_id!(
    /// Identifies a [`Wallet`](crate::Wallet).
    WalletId,
    "W"
);
numeric_id!(
    /// Identifies an [`AllocationGroup`](crate::AllocationGroup).
    GroupId,
    "G"
);
numeric_id!(
    /// Identifies an [`Allocation`](crate::Allocation).
    AllocationId,
    "A"
);
numeric_id!(
    /// Identifies the grant an allocation was awarded in.
    GrantId,
    "GR"
);

/// Monotonic id generators shared by every bucket of a service.
#[derive(Debug, Default)]
pub struct IdAllocator {
    owners: AtomicI64,
    wallets: AtomicI64,
    groups: AtomicI64,
    allocations: AtomicI64,
}

impl IdAllocator {
    pub fn next_owner(&self) -> OwnerId {
        OwnerId(self.owners.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn next_wallet(&self) -> WalletId {
        WalletId(self.wallets.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn next_group(&self) -> GroupId {
        GroupId(self.groups.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn next_allocation(&self) -> AllocationId {
        AllocationId(self.allocations.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Moves every generator past the ids already in use, after a load.
    pub(crate) fn observe(
        &self,
        owner: Option<OwnerId>,
        wallet: Option<WalletId>,
        group: Option<GroupId>,
        allocation: Option<AllocationId>,
    ) {
        if let Some(OwnerId(id)) = owner {
            self.owners.fetch_max(id, Ordering::Relaxed);
        }
        if let Some(WalletId(id)) = wallet {
            self.wallets.fetch_max(id, Ordering::Relaxed);
        }
        if let Some(GroupId(id)) = group {
            self.groups.fetch_max(id, Ordering::Relaxed);
        }
        if let Some(AllocationId(id)) = allocation {
            self.allocations.fetch_max(id, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_grow() {
        let ids = IdAllocator::default();
        assert_eq!(ids.next_wallet(), WalletId(1));
        assert_eq!(ids.next_wallet(), WalletId(2));
        assert_eq!(ids.next_allocation(), AllocationId(1));
    }

    #[test]
    fn observe_skips_loaded_ids() {
        let ids = IdAllocator::default();
        ids.observe(Some(OwnerId(7)), Some(WalletId(40)), None, Some(AllocationId(3)));
        assert_eq!(ids.next_owner(), OwnerId(8));
        assert_eq!(ids.next_wallet(), WalletId(41));
        assert_eq!(ids.next_group(), GroupId(1));
        assert_eq!(ids.next_allocation(), AllocationId(4));
    }

    #[test]
    fn display_uses_prefix() {
        assert_eq!(WalletId(12).to_string(), "W12");
        assert_eq!(AllocationId(3).to_string(), "A3");
    }
}
