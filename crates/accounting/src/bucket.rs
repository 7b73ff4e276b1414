//! The module contains `Bucket`, the per-category arena of wallets, groups and
//! allocations.
//!
//! A bucket is the unit of locking: every method here assumes the caller
//! holds the bucket lock (shared for `&self`, exclusive for `&mut self`).
//! Relations are plain id lookups. A lookup that fails for an id the bucket
//! itself handed out is a broken invariant and goes through
//! [`invariant_violation`].
//!
//! The routing, lifecycle and headroom algorithms live in `charge`,
//! `lifecycle` and `max_usable` as further `impl Bucket` blocks.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Utc};

use crate::{
    AccountingError, AllocateCmd, Allocation, AllocationGroup, AllocationId, AllocationState,
    GrantId, GroupId, IdAllocator, Node, OwnerId, ProductCategoryId, ResultAccounting, Wallet,
    WalletId,
    error::invariant_violation,
};

#[derive(Debug)]
pub struct Bucket {
    pub category: ProductCategoryId,
    /// Last time any wallet of the bucket changed lock state or saw an
    /// allocation transition.
    pub significant_update_at: Option<DateTime<Utc>>,
    wallets: BTreeMap<WalletId, Wallet>,
    wallets_by_owner: HashMap<OwnerId, WalletId>,
    groups: BTreeMap<GroupId, AllocationGroup>,
    allocations: BTreeMap<AllocationId, Allocation>,
    ids: Arc<IdAllocator>,
}

/// Dirty records copied out of a bucket for persistence.
#[derive(Debug, Default)]
pub(crate) struct BucketChanges {
    pub wallets: Vec<Wallet>,
    pub groups: Vec<AllocationGroup>,
    pub allocations: Vec<Allocation>,
}

impl Bucket {
    pub fn new(category: ProductCategoryId, ids: Arc<IdAllocator>) -> Self {
        Self {
            category,
            significant_update_at: None,
            wallets: BTreeMap::new(),
            wallets_by_owner: HashMap::new(),
            groups: BTreeMap::new(),
            allocations: BTreeMap::new(),
            ids,
        }
    }

    pub fn wallet(&self, id: WalletId) -> Option<&Wallet> {
        self.wallets.get(&id)
    }

    pub fn group(&self, id: GroupId) -> Option<&AllocationGroup> {
        self.groups.get(&id)
    }

    pub fn allocation(&self, id: AllocationId) -> Option<&Allocation> {
        self.allocations.get(&id)
    }

    pub fn wallets(&self) -> impl Iterator<Item = &Wallet> {
        self.wallets.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = &AllocationGroup> {
        self.groups.values()
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }

    pub fn wallet_by_owner(&self, owner: OwnerId) -> Option<WalletId> {
        self.wallets_by_owner.get(&owner).copied()
    }

    /// The group between `wallet` and `parent`, if any allocation was ever made.
    pub fn group_between(&self, wallet: WalletId, parent: Node) -> Option<&AllocationGroup> {
        self.wallet(wallet)
            .and_then(|w| w.group_for(parent))
            .and_then(|id| self.group(id))
    }

    /// Returns the wallet of `owner`, creating an empty one on first use.
    pub fn wallet_by_owner_or_init(&mut self, now: DateTime<Utc>, owner: OwnerId) -> WalletId {
        if let Some(id) = self.wallets_by_owner.get(&owner) {
            return *id;
        }

        let wallet = Wallet::new(self.ids.next_wallet(), owner, now);
        let id = wallet.id;
        tracing::debug!("Creating wallet {id} for owner {owner} in {}", self.category);
        self.wallets_by_owner.insert(owner, id);
        self.wallets.insert(id, wallet);
        id
    }

    pub(crate) fn require_wallet(&self, id: WalletId) -> &Wallet {
        match self.wallets.get(&id) {
            Some(wallet) => wallet,
            None => invariant_violation(format!("wallet {id} missing from {}", self.category)),
        }
    }

    pub(crate) fn require_wallet_mut(&mut self, id: WalletId) -> &mut Wallet {
        match self.wallets.get_mut(&id) {
            Some(wallet) => wallet,
            None => invariant_violation(format!("wallet {id} missing from {}", self.category)),
        }
    }

    pub(crate) fn require_group(&self, id: GroupId) -> &AllocationGroup {
        match self.groups.get(&id) {
            Some(group) => group,
            None => invariant_violation(format!("group {id} missing from {}", self.category)),
        }
    }

    pub(crate) fn require_group_mut(&mut self, id: GroupId) -> &mut AllocationGroup {
        match self.groups.get_mut(&id) {
            Some(group) => group,
            None => invariant_violation(format!("group {id} missing from {}", self.category)),
        }
    }

    pub(crate) fn require_allocation(&self, id: AllocationId) -> &Allocation {
        match self.allocations.get(&id) {
            Some(allocation) => allocation,
            None => invariant_violation(format!("allocation {id} missing from {}", self.category)),
        }
    }

    pub(crate) fn require_allocation_mut(&mut self, id: AllocationId) -> &mut Allocation {
        match self.allocations.get_mut(&id) {
            Some(allocation) => allocation,
            None => invariant_violation(format!("allocation {id} missing from {}", self.category)),
        }
    }

    fn group_allocations<'a>(
        &'a self,
        group: &'a AllocationGroup,
    ) -> impl Iterator<Item = &'a Allocation> + 'a {
        group
            .allocations
            .iter()
            .map(|id| self.require_allocation(*id))
    }

    // Metrics
    // ------------------------------------------------------------------------

    pub fn group_contributing_quota(&self, group: &AllocationGroup) -> i64 {
        self.group_allocations(group)
            .map(Allocation::contributing_quota)
            .fold(0, i64::saturating_add)
    }

    pub fn group_active_quota(&self, group: &AllocationGroup) -> i64 {
        self.group_allocations(group)
            .map(Allocation::active_quota)
            .fold(0, i64::saturating_add)
    }

    pub fn group_retired_usage(&self, group: &AllocationGroup) -> i64 {
        self.group_allocations(group)
            .map(|alloc| alloc.retired_usage)
            .fold(0, i64::saturating_add)
    }

    pub fn group_preferred_balance(&self, group: &AllocationGroup, now: DateTime<Utc>) -> i64 {
        self.group_allocations(group)
            .map(|alloc| alloc.preferred_balance(now))
            .fold(0, i64::saturating_add)
    }

    /// Earliest end among the active allocations of the group.
    pub fn group_earliest_expiration(&self, group: &AllocationGroup) -> Option<DateTime<Utc>> {
        self.group_allocations(group)
            .filter(|alloc| alloc.is_active())
            .map(|alloc| alloc.end)
            .min()
    }

    pub fn wallet_contributing_quota(&self, id: WalletId) -> i64 {
        self.require_wallet(id)
            .allocations_by_parent
            .values()
            .map(|group| self.group_contributing_quota(self.require_group(*group)))
            .fold(0, i64::saturating_add)
    }

    pub fn wallet_active_quota(&self, id: WalletId) -> i64 {
        self.require_wallet(id)
            .allocations_by_parent
            .values()
            .map(|group| self.group_active_quota(self.require_group(*group)))
            .fold(0, i64::saturating_add)
    }

    /// Local usage plus everything the children pushed into this wallet.
    pub fn wallet_usage_in_node(&self, id: WalletId) -> i64 {
        let wallet = self.require_wallet(id);
        let from_children: i64 = wallet
            .children
            .iter()
            .filter_map(|child| self.group_between(*child, Node::Wallet(id)))
            .map(|group| group.tree_usage)
            .fold(0, i64::saturating_add);
        wallet.local_usage.saturating_add(from_children)
    }

    /// Usage this wallet pushed to its parents. Never above
    /// [`Bucket::wallet_usage_in_node`].
    pub fn wallet_propagated_usage(&self, id: WalletId) -> i64 {
        self.require_wallet(id)
            .allocations_by_parent
            .values()
            .map(|group| self.require_group(*group).tree_usage)
            .fold(0, i64::saturating_add)
    }

    pub fn wallet_allocated_to_children(&self, id: WalletId) -> i64 {
        self.require_wallet(id)
            .children
            .iter()
            .filter_map(|child| self.group_between(*child, Node::Wallet(id)))
            .map(|group| self.group_contributing_quota(group))
            .fold(0, i64::saturating_add)
    }

    /// Usage sitting in the wallet that could not be pushed to a parent.
    pub fn wallet_excess(&self, id: WalletId) -> i64 {
        let excess = self.wallet_usage_in_node(id) - self.wallet_propagated_usage(id);
        if excess < 0 {
            invariant_violation(format!("wallet {id} propagates more than it holds"));
        }
        excess
    }

    /// `id` followed by every wallet below it, breadth first.
    pub fn descendants(&self, id: WalletId) -> Vec<WalletId> {
        let mut visited = BTreeSet::from([id]);
        let mut order = Vec::new();
        let mut queue = VecDeque::from([id]);

        while let Some(next) = queue.pop_front() {
            order.push(next);
            for child in &self.require_wallet(next).children {
                if visited.insert(*child) {
                    queue.push_back(*child);
                }
            }
        }
        order
    }

    /// `id` followed by every wallet above it, breadth first.
    pub fn ancestors(&self, id: WalletId) -> Vec<WalletId> {
        let mut visited = BTreeSet::from([id]);
        let mut order = Vec::new();
        let mut queue = VecDeque::from([id]);

        while let Some(next) = queue.pop_front() {
            order.push(next);
            for parent in self.require_wallet(next).parents() {
                if let Node::Wallet(parent) = parent
                    && visited.insert(parent)
                {
                    queue.push_back(parent);
                }
            }
        }
        order
    }

    pub(crate) fn mark_significant_update(&mut self, now: DateTime<Utc>, id: WalletId) {
        self.significant_update_at = Some(now);
        let wallet = self.require_wallet_mut(id);
        wallet.last_significant_update = now;
        wallet.dirty = true;
    }

    // Allocation
    // ------------------------------------------------------------------------

    /// Creates an allocation from `cmd.parent` to `cmd.recipient` and
    /// activates it right away when its window already started.
    pub fn allocate(&mut self, now: DateTime<Utc>, cmd: &AllocateCmd) -> ResultAccounting<AllocationId> {
        if cmd.quota < 0 {
            return Err(AccountingError::InvalidQuota(
                "quota must not be negative".to_string(),
            ));
        }
        if cmd.start >= cmd.end {
            return Err(AccountingError::InvalidPeriod(
                "start must occur before the end of an allocation".to_string(),
            ));
        }
        if self.wallet(cmd.recipient).is_none() {
            return Err(AccountingError::KeyNotFound(cmd.recipient.to_string()));
        }
        if let Node::Wallet(parent) = cmd.parent {
            if self.wallet(parent).is_none() {
                return Err(AccountingError::KeyNotFound(parent.to_string()));
            }
            if parent == cmd.recipient {
                return Err(AccountingError::InvalidAllocation(
                    "cannot allocate to yourself".to_string(),
                ));
            }
            if self.descendants(cmd.recipient).contains(&parent) {
                return Err(AccountingError::InvalidAllocation(format!(
                    "{parent} descends from {}, the allocation would create a cycle",
                    cmd.recipient
                )));
            }
        }
        self.check_quota_total(cmd)?;

        let group_id = match self.require_wallet(cmd.recipient).group_for(cmd.parent) {
            Some(id) => id,
            None => {
                let group = AllocationGroup::new(self.ids.next_group(), cmd.recipient, cmd.parent);
                let id = group.id;
                self.groups.insert(id, group);
                self.require_wallet_mut(cmd.recipient)
                    .allocations_by_parent
                    .insert(cmd.parent, id);
                id
            }
        };

        let allocation = Allocation {
            id: self.ids.next_allocation(),
            belongs_to: cmd.recipient,
            parent: cmd.parent,
            group: group_id,
            granted_in: cmd.granted_in,
            quota: cmd.quota,
            start: cmd.start,
            end: cmd.end,
            state: AllocationState::Pending,
            retired_usage: 0,
            committed: cmd.granted_in.is_none(),
            dirty: true,
        };
        let id = allocation.id;
        self.allocations.insert(id, allocation);

        let group = self.require_group_mut(group_id);
        group.allocations.insert(id);
        group.dirty = true;
        self.require_wallet_mut(cmd.recipient).dirty = true;

        if let Node::Wallet(parent) = cmd.parent {
            let parent = self.require_wallet_mut(parent);
            parent.children.insert(cmd.recipient);
            parent.dirty = true;
        }

        tracing::debug!(
            "Allocated {} to {} from {} as {id} in {}",
            cmd.quota,
            cmd.recipient,
            cmd.parent,
            self.category
        );

        self.attempt_activation(now, id, false);
        Ok(id)
    }

    /// Quota received by the recipient, and quota handed out by a wallet
    /// parent, must both stay representable.
    fn check_quota_total(&self, cmd: &AllocateCmd) -> ResultAccounting<()> {
        let total = |matches: &dyn Fn(&Allocation) -> bool| {
            self.allocations
                .values()
                .filter(|alloc| matches(alloc))
                .try_fold(cmd.quota, |sum, alloc| sum.checked_add(alloc.quota))
        };

        if total(&|alloc| alloc.belongs_to == cmd.recipient).is_none() {
            return Err(AccountingError::InvalidQuota(format!(
                "total quota of {} would overflow",
                cmd.recipient
            )));
        }
        if let Node::Wallet(parent) = cmd.parent
            && total(&|alloc| alloc.parent == cmd.parent).is_none()
        {
            return Err(AccountingError::InvalidQuota(format!(
                "quota handed out by {parent} would overflow"
            )));
        }
        Ok(())
    }

    // Persistence
    // ------------------------------------------------------------------------

    /// Marks the allocations of a grant as ready to be persisted.
    pub(crate) fn commit_grant(&mut self, grant: GrantId) -> usize {
        let mut committed = 0;
        for allocation in self.allocations.values_mut() {
            if allocation.granted_in == Some(grant) && !allocation.committed {
                allocation.committed = true;
                allocation.dirty = true;
                committed += 1;
            }
        }
        committed
    }

    pub(crate) fn commit_allocation(&mut self, id: AllocationId) -> bool {
        match self.allocations.get_mut(&id) {
            Some(allocation) => {
                allocation.committed = true;
                allocation.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Copies out every dirty record and clears the flags. Allocations that
    /// wait for their grant stay dirty.
    pub(crate) fn take_changes(&mut self) -> BucketChanges {
        let mut changes = BucketChanges::default();

        for wallet in self.wallets.values_mut().filter(|w| w.dirty) {
            wallet.dirty = false;
            changes.wallets.push(wallet.clone());
        }
        for group in self.groups.values_mut().filter(|g| g.dirty) {
            group.dirty = false;
            changes.groups.push(group.clone());
        }
        for allocation in self
            .allocations
            .values_mut()
            .filter(|a| a.dirty && a.committed)
        {
            allocation.dirty = false;
            changes.allocations.push(allocation.clone());
        }

        changes
    }

    /// Flags records again after a failed write.
    pub(crate) fn requeue(
        &mut self,
        wallets: &[WalletId],
        groups: &[GroupId],
        allocations: &[AllocationId],
    ) {
        for id in wallets {
            if let Some(wallet) = self.wallets.get_mut(id) {
                wallet.dirty = true;
            }
        }
        for id in groups {
            if let Some(group) = self.groups.get_mut(id) {
                group.dirty = true;
            }
        }
        for id in allocations {
            if let Some(allocation) = self.allocations.get_mut(id) {
                allocation.dirty = true;
            }
        }
    }

    // Loading
    // ------------------------------------------------------------------------

    pub(crate) fn insert_wallet(&mut self, wallet: Wallet) {
        self.significant_update_at = self
            .significant_update_at
            .max(Some(wallet.last_significant_update));
        self.wallets_by_owner.insert(wallet.owned_by, wallet.id);
        self.wallets.insert(wallet.id, wallet);
    }

    pub(crate) fn insert_group(&mut self, group: AllocationGroup) -> ResultAccounting<()> {
        if let Node::Wallet(parent) = group.parent {
            self.wallets
                .get_mut(&parent)
                .ok_or_else(|| AccountingError::KeyNotFound(parent.to_string()))?
                .children
                .insert(group.wallet);
        }
        self.wallets
            .get_mut(&group.wallet)
            .ok_or_else(|| AccountingError::KeyNotFound(group.wallet.to_string()))?
            .allocations_by_parent
            .insert(group.parent, group.id);
        self.groups.insert(group.id, group);
        Ok(())
    }

    pub(crate) fn insert_allocation(&mut self, allocation: Allocation) -> ResultAccounting<()> {
        self.groups
            .get_mut(&allocation.group)
            .ok_or_else(|| AccountingError::KeyNotFound(allocation.group.to_string()))?
            .allocations
            .insert(allocation.id);
        self.allocations.insert(allocation.id, allocation);
        Ok(())
    }
}
