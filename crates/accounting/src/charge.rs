//! Charge routing.
//!
//! A charge turns the ancestry of the charged wallet into a residual graph:
//!
//! - every wallet above the charged one is a vertex, plus the root;
//! - every allocation group is an edge `parent -> wallet` whose capacity is
//!   the unused contributing quota;
//! - edge costs are negative, the more negative the more attractive;
//! - every wallet gets an over-allocation twin reachable from the root at a
//!   very high cost, so a charge is always absorbed in full.
//!
//! Min-cost flow from the root to the charged wallet then decides how much
//! each group absorbs. Flow through a twin is not attributed to any group: it
//! remains in the wallet as excess until capacity appears and
//! [`Bucket::reflow_excess`] pushes it back into the graph.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::{
    AccountingError, AllocationGroup, Bucket, Node, ResultAccounting, WalletId,
    error::invariant_violation,
    graph::Graph,
};

/// Upper bound on the magnitude of a natural edge cost. Keeps natural costs
/// far below the over-allocation and retirement costs.
pub const NATURAL_COST_CEILING: i128 = 1 << 70;
/// Cost of each of the two edges leading through an over-allocation twin.
pub const OVER_ALLOCATION_COST: i128 = 1 << 80;
/// Cost of an edge whose allocations have all expired, or that already
/// carries more usage than quota. Must stay above [`OVER_ALLOCATION_COST`].
pub const RETIRED_EDGE_COST: i128 = 1 << 85;

/// How a charge was applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChargeOutcome {
    /// Part of the charge that reached the wallet through its own groups. The
    /// rest stayed in the wallet as excess.
    pub routed: i64,
    /// Wallets that were part of the charge graph.
    pub wallets: Vec<WalletId>,
    /// Whether the charged wallet is locked afterwards.
    pub locked: bool,
}

impl Bucket {
    /// Builds the flow graph over `leaf` and all of its ancestors.
    ///
    /// Vertex 0 is always `leaf` and vertex 1 the root. With
    /// `over_allocation` set, every wallet vertex gets a twin connected to the
    /// root with that much capacity.
    pub fn build_graph(
        &self,
        now: DateTime<Utc>,
        leaf: WalletId,
        over_allocation: Option<i64>,
    ) -> Graph<Node> {
        let mut vertices = vec![Node::Wallet(leaf), Node::Root];
        vertices.extend(
            self.ancestors(leaf)
                .into_iter()
                .skip(1)
                .map(Node::Wallet),
        );

        let mut graph = match over_allocation {
            Some(_) => Graph::with_over_allocation(vertices.clone()),
            None => Graph::new(vertices.clone()),
        };
        let Some(root) = graph.vertex(&Node::Root) else {
            invariant_violation("charge graph without a root vertex");
        };

        for node in vertices {
            let Node::Wallet(id) = node else {
                continue;
            };
            let Some(destination) = graph.vertex(&node) else {
                invariant_violation(format!("wallet {id} missing from its own charge graph"));
            };

            for (parent, group) in &self.require_wallet(id).allocations_by_parent {
                let Some(source) = graph.vertex(parent) else {
                    invariant_violation(format!("parent {parent} of {id} missing from charge graph"));
                };
                let group = self.require_group(*group);
                let capacity = (self.group_contributing_quota(group) - group.tree_usage).max(0);
                graph.add_edge(source, destination, capacity, 0);
                graph.add_edge_cost(source, destination, self.edge_cost(now, group));
            }

            if let Some(capacity) = over_allocation {
                let twin = graph.over_allocation_vertex(destination);
                graph.add_edge(root, twin, capacity, 0);
                graph.add_edge_cost(root, twin, OVER_ALLOCATION_COST);
                graph.add_edge(twin, destination, capacity, 0);
                graph.add_edge_cost(twin, destination, OVER_ALLOCATION_COST);
            }
        }

        graph
    }

    /// Cost of routing through `group`.
    ///
    /// Groups that are behind their expected burn and expire later are
    /// cheaper: the cost is `-(max(1, preferred - usage) * ms_to_expiry)`,
    /// capped at [`NATURAL_COST_CEILING`].
    fn edge_cost(&self, now: DateTime<Utc>, group: &AllocationGroup) -> i128 {
        let Some(expiration) = self.group_earliest_expiration(group) else {
            return RETIRED_EDGE_COST;
        };
        let until_expiration = (expiration - now).num_milliseconds();
        if until_expiration < 0 || self.group_contributing_quota(group) < group.tree_usage {
            return RETIRED_EDGE_COST;
        }

        let not_consumed = (self.group_preferred_balance(group, now) - group.tree_usage).max(1);
        let cost = i128::from(not_consumed)
            .saturating_mul(i128::from(until_expiration))
            .min(NATURAL_COST_CEILING);
        -cost
    }

    /// Routes `amount` from the root to `wallet` and commits the flow onto the
    /// allocation groups. Returns the part that went through real groups.
    ///
    /// With `absorb_all` the graph carries over-allocation twins and the full
    /// amount must be routed. Without it, routing stops at the available
    /// capacity.
    pub(crate) fn route_usage(
        &mut self,
        now: DateTime<Utc>,
        wallet: WalletId,
        amount: i64,
        absorb_all: bool,
    ) -> (i64, Vec<WalletId>) {
        let mut graph = self.build_graph(now, wallet, absorb_all.then_some(amount));
        let wallets = graph.keys().iter().filter_map(|node| node.wallet()).collect();
        if amount <= 0 {
            return (0, wallets);
        }

        let Some(root) = graph.vertex(&Node::Root) else {
            invariant_violation("charge graph without a root vertex");
        };
        let leaf = 0;
        let flow = graph.min_cost_flow(root, leaf, amount);
        if absorb_all && flow != amount {
            invariant_violation(format!(
                "charge of {amount} to {wallet} in {} routed only {flow}",
                self.category
            ));
        }

        let routed = self.commit_flow(&graph, leaf);
        (routed, wallets)
    }

    /// Adds the net flow of every original edge to its group. Returns the
    /// flow that reached `leaf` through real groups.
    fn commit_flow(&mut self, graph: &Graph<Node>, leaf: usize) -> i64 {
        let count = graph.real_vertex_count();
        let mut into_leaf = 0;

        for child_vertex in 0..count {
            let Some(Node::Wallet(child)) = graph.key(child_vertex).copied() else {
                continue;
            };
            for parent_vertex in 0..count {
                if !graph.original[parent_vertex][child_vertex] {
                    continue;
                }
                let flow = graph.adjacent[child_vertex][parent_vertex];
                if flow < 0 {
                    invariant_violation(format!("negative flow into {child}"));
                }
                if flow == 0 {
                    continue;
                }
                let Some(parent) = graph.key(parent_vertex).copied() else {
                    invariant_violation(format!("unmapped parent vertex of {child}"));
                };
                let Some(group) = self.require_wallet(child).group_for(parent) else {
                    invariant_violation(format!("no group between {child} and {parent}"));
                };

                let group = self.require_group_mut(group);
                group.tree_usage += flow;
                group.dirty = true;
                self.require_wallet_mut(child).dirty = true;
                if let Node::Wallet(parent) = parent {
                    self.require_wallet_mut(parent).dirty = true;
                }
                if child_vertex == leaf {
                    into_leaf += flow;
                }
            }
        }

        into_leaf
    }

    /// Pushes usage that previously went through over-allocation back into
    /// the graph, as far as capacity allows. Children are handled first so
    /// their excess can land in this wallet before it reflows its own.
    pub fn reflow_excess(&mut self, now: DateTime<Utc>, wallet: WalletId) {
        let mut handled = BTreeSet::new();
        self.reflow_excess_from(now, wallet, &mut handled);
    }

    fn reflow_excess_from(
        &mut self,
        now: DateTime<Utc>,
        wallet: WalletId,
        handled: &mut BTreeSet<WalletId>,
    ) {
        handled.insert(wallet);
        let children: Vec<WalletId> = self.require_wallet(wallet).children.iter().copied().collect();
        for child in children {
            if !handled.contains(&child) {
                self.reflow_excess_from(now, child, handled);
            }
        }

        let excess = self.wallet_excess(wallet);
        if excess <= 0 {
            return;
        }
        let usable = self.headroom(now, wallet);
        let amount = excess.min(usable);
        if amount > 0 {
            let (routed, _) = self.route_usage(now, wallet, amount, false);
            tracing::debug!("Reflowed {routed} of excess {excess} from {wallet}");
        }
    }

    /// Applies a charge of `delta` to `wallet`. The delta is always
    /// absorbed; whatever exceeds the available quota stays as excess and
    /// locks the wallet.
    ///
    /// Callers have already converted absolute usage into a delta. A
    /// negative delta is rejected here, see [`Bucket::release`].
    pub fn charge(
        &mut self,
        now: DateTime<Utc>,
        wallet: WalletId,
        delta: i64,
    ) -> ResultAccounting<ChargeOutcome> {
        if delta < 0 {
            return Err(AccountingError::InvalidUsage(format!(
                "usage of {wallet} cannot decrease (delta {delta})"
            )));
        }
        if self.wallet(wallet).is_none() {
            return Err(AccountingError::KeyNotFound(wallet.to_string()));
        }
        if self.wallet_usage_in_node(wallet).checked_add(delta).is_none() {
            return Err(AccountingError::InvalidUsage(format!(
                "usage of {wallet} would overflow (delta {delta})"
            )));
        }
        if delta == 0 {
            return Ok(ChargeOutcome {
                routed: 0,
                wallets: vec![wallet],
                locked: self.require_wallet(wallet).was_locked,
            });
        }

        let (routed, wallets) = self.route_usage(now, wallet, delta, true);
        let charged = self.require_wallet_mut(wallet);
        charged.local_usage += delta;
        charged.dirty = true;

        for visited in &wallets {
            if self.update_lock(now, *visited) {
                for descendant in self.descendants(*visited).into_iter().skip(1) {
                    self.update_lock(now, descendant);
                }
            }
        }

        if routed < delta {
            tracing::debug!(
                "Charge of {delta} to {wallet} in {} exceeded quota by {}",
                self.category,
                delta - routed
            );
        }

        Ok(ChargeOutcome {
            routed,
            wallets,
            locked: self.require_wallet(wallet).was_locked,
        })
    }

    /// Lowers the local usage of `wallet` by up to `amount`. Only usage that
    /// never left the wallet can be given back; anything already pushed to a
    /// parent stays recorded there. Returns the amount released.
    pub fn release(&mut self, wallet: WalletId, amount: i64) -> ResultAccounting<i64> {
        let Some(local_usage) = self.wallet(wallet).map(|w| w.local_usage) else {
            return Err(AccountingError::KeyNotFound(wallet.to_string()));
        };
        let released = amount.min(self.wallet_excess(wallet)).min(local_usage).max(0);
        if released > 0 {
            let w = self.require_wallet_mut(wallet);
            w.local_usage -= released;
            w.dirty = true;
        }
        if released < amount {
            tracing::debug!(
                "Usage of {wallet} in {} lowered by {released} of {amount}, the rest already propagated",
                self.category
            );
        }
        Ok(released)
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

    fn bucket() -> Bucket {
        Bucket::new(
            ProductCategoryId::new("cpu", "hpc"),
            Arc::new(IdAllocator::default()),
        )
    }

    fn root_allocation(bucket: &mut Bucket, wallet: WalletId, quota: i64) {
        let cmd = AllocateCmd::new(bucket.category.clone(), wallet, quota, at(0), at(100));
        bucket.allocate(at(0), &cmd).unwrap();
    }

    #[test]
    fn graph_places_leaf_and_root_first() {
        let mut bucket = bucket();
        let parent = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        let child = bucket.wallet_by_owner_or_init(at(0), OwnerId(2));
        root_allocation(&mut bucket, parent, 100);
        let cmd = AllocateCmd::new(bucket.category.clone(), child, 40, at(0), at(100)).parent(parent);
        bucket.allocate(at(0), &cmd).unwrap();

        let graph = bucket.build_graph(at(1), child, None);
        assert_eq!(
            graph.keys(),
            &[Node::Wallet(child), Node::Root, Node::Wallet(parent)]
        );
        // root -> parent and parent -> child
        assert_eq!(graph.adjacent[1][2], 100);
        assert_eq!(graph.adjacent[2][0], 40);
        assert!(graph.cost[1][2] < 0);

        let doubled = bucket.build_graph(at(1), child, Some(7));
        assert_eq!(doubled.vertex_count, 6);
        assert_eq!(doubled.adjacent[1][doubled.over_allocation_vertex(0)], 7);
        assert_eq!(doubled.cost[1][doubled.over_allocation_vertex(0)], OVER_ALLOCATION_COST);
    }

    #[test]
    fn expired_groups_are_expensive() {
        let mut bucket = bucket();
        let wallet = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        root_allocation(&mut bucket, wallet, 100);

        // Past the end but not yet scanned.
        let graph = bucket.build_graph(at(150), wallet, None);
        assert_eq!(graph.cost[1][0], RETIRED_EDGE_COST);
    }

    #[test]
    fn charge_within_quota_is_fully_routed() {
        let mut bucket = bucket();
        let wallet = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        root_allocation(&mut bucket, wallet, 100);

        let outcome = bucket.charge(at(1), wallet, 60).unwrap();
        assert_eq!(outcome.routed, 60);
        assert!(!outcome.locked);
        assert_eq!(bucket.wallet_propagated_usage(wallet), 60);
        assert_eq!(bucket.require_wallet(wallet).local_usage, 60);
    }

    #[test]
    fn charge_over_quota_leaves_excess_and_locks() {
        let mut bucket = bucket();
        let wallet = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        root_allocation(&mut bucket, wallet, 100);

        let outcome = bucket.charge(at(1), wallet, 130).unwrap();
        assert_eq!(outcome.routed, 100);
        assert!(outcome.locked);
        assert_eq!(bucket.wallet_excess(wallet), 30);
        assert_eq!(bucket.wallet_usage_in_node(wallet), 130);
    }

    #[test]
    fn negative_delta_is_rejected_without_mutation() {
        let mut bucket = bucket();
        let wallet = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        root_allocation(&mut bucket, wallet, 100);
        bucket.charge(at(1), wallet, 10).unwrap();

        assert!(matches!(
            bucket.charge(at(2), wallet, -5),
            Err(AccountingError::InvalidUsage(_))
        ));
        assert_eq!(bucket.require_wallet(wallet).local_usage, 10);
        assert_eq!(bucket.wallet_propagated_usage(wallet), 10);
    }

    #[test]
    fn over_allocated_parent_takes_the_excess() {
        let mut bucket = bucket();
        let parent = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        let child = bucket.wallet_by_owner_or_init(at(0), OwnerId(2));
        root_allocation(&mut bucket, parent, 100);
        let cmd = AllocateCmd::new(bucket.category.clone(), child, 1000, at(0), at(100)).parent(parent);
        bucket.allocate(at(0), &cmd).unwrap();

        let outcome = bucket.charge(at(1), child, 500).unwrap();
        assert_eq!(outcome.routed, 500);
        assert!(outcome.locked);
        let group = bucket.group_between(child, Node::Wallet(parent)).unwrap();
        assert_eq!(group.tree_usage, 500);
        assert_eq!(bucket.wallet_propagated_usage(parent), 100);
        assert_eq!(bucket.wallet_excess(parent), 400);
        assert!(bucket.require_wallet(parent).was_locked);
    }

    #[test]
    fn release_gives_back_excess_only() {
        let mut bucket = bucket();
        let wallet = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        root_allocation(&mut bucket, wallet, 50);
        bucket.charge(at(1), wallet, 500).unwrap();
        assert_eq!(bucket.wallet_excess(wallet), 450);

        assert_eq!(bucket.release(wallet, 50).unwrap(), 50);
        assert_eq!(bucket.require_wallet(wallet).local_usage, 450);

        // Only 400 never left the wallet; the other 50 sit in the root group.
        assert_eq!(bucket.release(wallet, 1000).unwrap(), 400);
        assert_eq!(bucket.require_wallet(wallet).local_usage, 50);
        assert_eq!(bucket.wallet_propagated_usage(wallet), 50);
        assert_eq!(bucket.wallet_excess(wallet), 0);
    }

    #[test]
    fn charge_that_would_overflow_is_rejected() {
        let mut bucket = bucket();
        let wallet = bucket.wallet_by_owner_or_init(at(0), OwnerId(1));
        root_allocation(&mut bucket, wallet, 100);
        bucket.charge(at(1), wallet, i64::MAX - 10).unwrap();

        assert!(matches!(
            bucket.charge(at(2), wallet, 11),
            Err(AccountingError::InvalidUsage(_))
        ));
        assert_eq!(bucket.require_wallet(wallet).local_usage, i64::MAX - 10);
    }
}
