//! Read-only views of a bucket: wallet snapshots, the mermaid diagram and
//! the CSV dump rows.
//!
//! Everything here copies data out so it can be used after the bucket lock is
//! released.

use std::{cmp::Ordering, fmt::Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    AllocationGroup, AllocationId, AllocationState, Bucket, GrantId, GroupId, Node, OwnerId,
    ProductCategoryId, WalletId, WalletOwner,
    mermaid::{Line, Mermaid, Shape},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSnapshot {
    pub id: AllocationId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub quota: i64,
    pub granted_in: Option<GrantId>,
    pub state: AllocationState,
    pub retired_usage: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub id: GroupId,
    pub wallet: WalletId,
    pub parent: Node,
    /// Owner on the other side of the edge: the parent for the wallet's own
    /// groups, the child for the groups of its children.
    pub counterpart: Option<WalletOwner>,
    pub usage: i64,
    pub quota: i64,
    pub active_quota: i64,
    /// Tree usage not frozen into retired allocations.
    pub active_usage: i64,
    pub allocations: Vec<AllocationSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub id: WalletId,
    pub owner: WalletOwner,
    pub category: ProductCategoryId,
    pub local_usage: i64,
    pub total_usage: i64,
    pub propagated_usage: i64,
    pub quota: i64,
    pub active_quota: i64,
    pub active_usage: i64,
    pub allocated_to_children: i64,
    pub max_usable: i64,
    pub locked: bool,
    pub last_significant_update: DateTime<Utc>,
    pub groups: Vec<GroupSnapshot>,
    pub children: Vec<GroupSnapshot>,
}

impl WalletSnapshot {
    pub fn has_active_allocation(&self) -> bool {
        self.groups
            .iter()
            .flat_map(|group| &group.allocations)
            .any(|alloc| alloc.state == AllocationState::Active)
    }
}

/// One line of the accounting dump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpRow {
    pub id: i64,
    #[serde(rename = "maxUsable")]
    pub max_usable: i64,
    #[serde(rename = "treeUsage")]
    pub tree_usage: i64,
    pub quota: i64,
}

/// Pending first, retired last, then newest start, earliest end and id.
fn allocation_order(a: &AllocationSnapshot, b: &AllocationSnapshot) -> Ordering {
    let rank = |state: AllocationState| match state {
        AllocationState::Pending => 0,
        AllocationState::Active => 1,
        AllocationState::Retired => 2,
    };
    rank(a.state)
        .cmp(&rank(b.state))
        .then_with(|| b.start.cmp(&a.start))
        .then_with(|| a.end.cmp(&b.end))
        .then_with(|| a.id.cmp(&b.id))
}

impl Bucket {
    fn group_snapshot(&self, group: &AllocationGroup, counterpart: Option<WalletOwner>) -> GroupSnapshot {
        let mut allocations: Vec<AllocationSnapshot> = group
            .allocations
            .iter()
            .map(|id| {
                let alloc = self.require_allocation(*id);
                AllocationSnapshot {
                    id: alloc.id,
                    start: alloc.start,
                    end: alloc.end,
                    quota: alloc.quota,
                    granted_in: alloc.granted_in,
                    state: alloc.state,
                    retired_usage: alloc.retired_usage,
                }
            })
            .collect();
        allocations.sort_by(allocation_order);

        GroupSnapshot {
            id: group.id,
            wallet: group.wallet,
            parent: group.parent,
            counterpart,
            usage: group.tree_usage,
            quota: self.group_contributing_quota(group),
            active_quota: self.group_active_quota(group),
            active_usage: group.tree_usage - self.group_retired_usage(group),
            allocations,
        }
    }

    /// Copies a wallet out of the bucket. `owner_of` resolves owner ids.
    pub fn wallet_snapshot(
        &self,
        now: DateTime<Utc>,
        id: WalletId,
        include_children: bool,
        owner_of: impl Fn(OwnerId) -> Option<WalletOwner>,
    ) -> Option<WalletSnapshot> {
        let wallet = self.wallet(id)?;
        let owner = owner_of(wallet.owned_by)?;
        let wallet_owner = |wallet: WalletId| {
            self.wallet(wallet)
                .and_then(|w| owner_of(w.owned_by))
        };

        let groups: Vec<GroupSnapshot> = wallet
            .allocations_by_parent
            .iter()
            .map(|(parent, group)| {
                let counterpart = parent.wallet().and_then(&wallet_owner);
                self.group_snapshot(self.require_group(*group), counterpart)
            })
            .collect();

        let children = if include_children {
            wallet
                .children
                .iter()
                .filter_map(|child| {
                    let group = self.group_between(*child, Node::Wallet(id))?;
                    Some(self.group_snapshot(group, wallet_owner(*child)))
                })
                .collect()
        } else {
            Vec::new()
        };

        let active_usage = groups.iter().map(|group| group.active_usage).sum();

        Some(WalletSnapshot {
            id,
            owner,
            category: self.category.clone(),
            local_usage: wallet.local_usage,
            total_usage: self.wallet_usage_in_node(id),
            propagated_usage: self.wallet_propagated_usage(id),
            quota: self.wallet_contributing_quota(id),
            active_quota: self.wallet_active_quota(id),
            active_usage,
            allocated_to_children: self.wallet_allocated_to_children(id),
            max_usable: self.headroom(now, id),
            locked: wallet.was_locked,
            last_significant_update: wallet.last_significant_update,
            groups,
            children,
        })
    }

    /// Wallet ids whose last significant update is at or after `timestamp`.
    pub fn wallets_updated_after(&self, timestamp: DateTime<Utc>) -> Vec<WalletId> {
        if self.significant_update_at.is_none_or(|at| at < timestamp) {
            return Vec::new();
        }
        self.wallets()
            .filter(|wallet| wallet.last_significant_update >= timestamp)
            .map(|wallet| wallet.id)
            .collect()
    }

    pub fn dump_rows(&self, now: DateTime<Utc>) -> Vec<DumpRow> {
        self.wallets()
            .map(|wallet| DumpRow {
                id: wallet.id.0,
                max_usable: self.headroom(now, wallet.id),
                tree_usage: self.wallet_propagated_usage(wallet.id),
                quota: self.wallet_contributing_quota(wallet.id),
            })
            .collect()
    }

    /// Diagram of `wallet` and its ancestors with their groups and
    /// allocations. Links carry the tree usage of each group.
    pub fn to_mermaid(&self, now: DateTime<Utc>, wallet: WalletId) -> Option<String> {
        self.wallet(wallet)?;
        let relevant = self.ancestors(wallet);

        Some(Mermaid::render(|b| {
            b.node("Root", "Root", Shape::Round, None);

            for id in &relevant {
                let wallet = self.require_wallet(*id);
                let name = id.to_string();

                let mut info = String::from("<b>Info</b><br>");
                let _ = write!(info, "local: {}<br>", wallet.local_usage);
                let _ = write!(info, "allocated: {}<br>", self.wallet_allocated_to_children(*id));
                let _ = write!(info, "quota: {}<br>", self.wallet_contributing_quota(*id));
                let _ = write!(info, "usable: {}<br>", self.headroom(now, *id));
                let _ = write!(info, "usage: {}<br>", self.wallet_usage_in_node(*id));
                let _ = write!(info, "..propagated: {}<br>", self.wallet_propagated_usage(*id));
                let _ = write!(info, "locked: {}", wallet.was_locked);

                let children: Vec<WalletId> = wallet
                    .children
                    .iter()
                    .filter(|child| relevant.contains(child))
                    .copied()
                    .collect();
                if !children.is_empty() {
                    info.push_str("<br>children:<br>");
                    for child in children {
                        let usage = self
                            .group_between(child, Node::Wallet(*id))
                            .map_or(0, |group| group.tree_usage);
                        let _ = write!(info, "+ {child} = {usage}<br>");
                    }
                }

                let mut links = Vec::new();
                b.subgraph(&name, &name, |g| {
                    g.node(&format!("{name}Info"), &info, Shape::Round, Some("text-align:left"));

                    for (parent, group) in &wallet.allocations_by_parent {
                        let group = self.require_group(*group);
                        let parent_name = match parent {
                            Node::Root => "Root".to_string(),
                            Node::Wallet(parent) => parent.to_string(),
                        };
                        let group_name = format!("{name}{parent_name}");
                        let body = format!(
                            "<b>parent:</b> {parent}<br><b>usage:</b> {}<br><b>preferred:</b> {}<br>",
                            group.tree_usage,
                            self.group_preferred_balance(group, now)
                        );

                        let subgraph = g.subgraph(&group_name, &format!("Group -> {parent_name}"), |gb| {
                            gb.node(&format!("{group_name}Info"), &body, Shape::Round, Some("text-align:left"));
                            for alloc_id in &group.allocations {
                                let alloc = self.require_allocation(*alloc_id);
                                gb.node(
                                    &alloc_id.to_string(),
                                    &format!(
                                        "<b>id:</b> {}<br><b>quota:</b> {}<br><b>state:</b> {}<br><b>retired usage:</b> {}",
                                        alloc.id.0, alloc.quota, alloc.state, alloc.retired_usage
                                    ),
                                    Shape::Round,
                                    Some("text-align:left"),
                                );
                            }
                        });
                        links.push((subgraph, parent_name, group.tree_usage));
                    }
                });

                for (from, to, usage) in links {
                    b.link(&from, &to, Some(&usage.to_string()), Line::Normal);
                }
            }
        }))
    }
}
