//! The module contains `AllocationGroup`, the edge between a wallet and one
//! of its parents.

use std::collections::BTreeSet;

use sea_orm::entity::{ActiveValue, prelude::*};

use crate::{AllocationId, GroupId, Node, WalletId};

/// All allocations a wallet received from one specific parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationGroup {
    pub id: GroupId,
    pub wallet: WalletId,
    pub parent: Node,
    /// Usage routed through this edge since the group was created. Only grows.
    pub tree_usage: i64,
    pub allocations: BTreeSet<AllocationId>,
    pub(crate) dirty: bool,
}

impl AllocationGroup {
    pub fn new(id: GroupId, wallet: WalletId, parent: Node) -> Self {
        Self {
            id,
            wallet,
            parent,
            tree_usage: 0,
            allocations: BTreeSet::new(),
            dirty: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "allocation_groups")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub wallet_id: i64,
    /// `None` for groups hanging from the root.
    pub parent_id: Option<i64>,
    pub tree_usage: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::wallet::Entity",
        from = "Column::WalletId",
        to = "super::wallet::Column::Id",
        on_update = "NoAction",
        on_delete = "NoAction"
    )]
    Wallets,
    #[sea_orm(has_many = "super::allocation::Entity")]
    Allocations,
}

impl Related<super::wallet::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Wallets.def()
    }
}

impl Related<super::allocation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Allocations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<&AllocationGroup> for ActiveModel {
    fn from(value: &AllocationGroup) -> Self {
        Self {
            id: ActiveValue::Set(value.id.0),
            wallet_id: ActiveValue::Set(value.wallet.0),
            parent_id: ActiveValue::Set(value.parent.wallet().map(|id| id.0)),
            tree_usage: ActiveValue::Set(value.tree_usage),
        }
    }
}

impl From<Model> for AllocationGroup {
    fn from(value: Model) -> Self {
        Self {
            id: GroupId(value.id),
            wallet: WalletId(value.wallet_id),
            parent: Node::from(value.parent_id.map(WalletId)),
            tree_usage: value.tree_usage,
            allocations: BTreeSet::new(),
            dirty: false,
        }
    }
}
