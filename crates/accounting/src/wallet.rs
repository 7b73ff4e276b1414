//! The module contains `Wallet` struct and the `Node` used to address parents.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use sea_orm::entity::{ActiveValue, prelude::*};
use serde::{Deserialize, Serialize};

use crate::{GroupId, OwnerId, ProductCategoryId, WalletId};

/// A vertex of the wallet forest: either a wallet or the synthetic root every
/// root allocation hangs from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Node {
    Root,
    Wallet(WalletId),
}

impl Node {
    pub fn wallet(self) -> Option<WalletId> {
        match self {
            Self::Root => None,
            Self::Wallet(id) => Some(id),
        }
    }
}

impl From<WalletId> for Node {
    fn from(value: WalletId) -> Self {
        Self::Wallet(value)
    }
}

impl From<Option<WalletId>> for Node {
    fn from(value: Option<WalletId>) -> Self {
        value.map_or(Self::Root, Self::Wallet)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Wallet(id) => write!(f, "{id}"),
        }
    }
}

/// A wallet.
///
/// One wallet exists per owner and product category. Wallets are created on
/// first use and never deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct Wallet {
    pub id: WalletId,
    pub owned_by: OwnerId,
    /// Usage reported directly against this wallet. Never negative.
    pub local_usage: i64,
    /// One group per parent the wallet has received allocations from.
    pub allocations_by_parent: BTreeMap<Node, GroupId>,
    /// Wallets that have received allocations from this one.
    pub children: BTreeSet<WalletId>,
    pub was_locked: bool,
    pub last_significant_update: DateTime<Utc>,
    pub(crate) dirty: bool,
}

impl Wallet {
    pub fn new(id: WalletId, owned_by: OwnerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owned_by,
            local_usage: 0,
            allocations_by_parent: BTreeMap::new(),
            children: BTreeSet::new(),
            was_locked: false,
            last_significant_update: now,
            dirty: true,
        }
    }

    pub fn parents(&self) -> impl Iterator<Item = Node> + '_ {
        self.allocations_by_parent.keys().copied()
    }

    pub fn group_for(&self, parent: Node) -> Option<GroupId> {
        self.allocations_by_parent.get(&parent).copied()
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "wallets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub owner_id: i64,
    pub provider: String,
    pub category: String,
    pub local_usage: i64,
    pub was_locked: bool,
    pub last_significant_update: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::owner::Entity",
        from = "Column::OwnerId",
        to = "super::owner::Column::Id",
        on_update = "NoAction",
        on_delete = "NoAction"
    )]
    Owners,
    #[sea_orm(has_many = "super::group::Entity")]
    Groups,
}

impl Related<super::owner::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Owners.def()
    }
}

impl Related<super::group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Groups.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<(&ProductCategoryId, &Wallet)> for ActiveModel {
    fn from((category, wallet): (&ProductCategoryId, &Wallet)) -> Self {
        Self {
            id: ActiveValue::Set(wallet.id.0),
            owner_id: ActiveValue::Set(wallet.owned_by.0),
            provider: ActiveValue::Set(category.provider.clone()),
            category: ActiveValue::Set(category.name.clone()),
            local_usage: ActiveValue::Set(wallet.local_usage),
            was_locked: ActiveValue::Set(wallet.was_locked),
            last_significant_update: ActiveValue::Set(wallet.last_significant_update),
        }
    }
}

impl From<Model> for (ProductCategoryId, Wallet) {
    fn from(value: Model) -> Self {
        let category = ProductCategoryId::new(value.category, value.provider);
        let wallet = Wallet {
            id: WalletId(value.id),
            owned_by: OwnerId(value.owner_id),
            local_usage: value.local_usage,
            allocations_by_parent: BTreeMap::new(),
            children: BTreeSet::new(),
            was_locked: value.was_locked,
            last_significant_update: value.last_significant_update,
            dirty: false,
        };
        (category, wallet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_sorts_before_wallets() {
        let mut nodes = vec![Node::Wallet(WalletId(2)), Node::Root, Node::Wallet(WalletId(1))];
        nodes.sort();
        assert_eq!(
            nodes,
            vec![Node::Root, Node::Wallet(WalletId(1)), Node::Wallet(WalletId(2))]
        );
    }

    #[test]
    fn node_conversions() {
        assert_eq!(Node::from(None), Node::Root);
        assert_eq!(Node::from(Some(WalletId(4))).wallet(), Some(WalletId(4)));
        assert_eq!(Node::Root.to_string(), "root");
        assert_eq!(Node::Wallet(WalletId(4)).to_string(), "W4");
    }

    #[test]
    fn model_round_trip_drops_derived_links() {
        let mut wallet = Wallet::new(WalletId(3), OwnerId(1), DateTime::<Utc>::UNIX_EPOCH);
        wallet.local_usage = 42;
        wallet.children.insert(WalletId(9));
        let category = ProductCategoryId::new("cpu", "hpc");

        let active = ActiveModel::from((&category, &wallet));
        assert_eq!(active.local_usage, ActiveValue::Set(42));
        assert_eq!(active.provider, ActiveValue::Set("hpc".to_string()));

        let model = Model {
            id: 3,
            owner_id: 1,
            provider: "hpc".to_string(),
            category: "cpu".to_string(),
            local_usage: 42,
            was_locked: true,
            last_significant_update: DateTime::<Utc>::UNIX_EPOCH,
        };
        let (loaded_category, loaded) = <(ProductCategoryId, Wallet)>::from(model);
        assert_eq!(loaded_category, category);
        assert_eq!(loaded.local_usage, 42);
        assert!(loaded.was_locked);
        assert!(loaded.children.is_empty());
        assert!(!loaded.dirty);
    }
}
