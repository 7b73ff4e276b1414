//! The module contains `Allocation` struct and its lifecycle rules.

use std::fmt;

use chrono::{DateTime, Utc};
use sea_orm::entity::{ActiveValue, prelude::*};
use serde::{Deserialize, Serialize};

use crate::{AccountingError, AllocationId, GrantId, GroupId, Node, WalletId};

/// Lifecycle of an allocation. Transitions only move forward:
/// `Pending -> Active -> Retired`, or straight from `Pending` to `Retired`
/// when a scan only runs after the window closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Pending,
    Active,
    Retired,
}

impl AllocationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for AllocationState {
    type Error = AccountingError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "retired" => Ok(Self::Retired),
            other => Err(AccountingError::InvalidAllocation(format!(
                "unknown allocation state: {other}"
            ))),
        }
    }
}

/// A time-bounded quota grant from `parent` to the wallet `belongs_to`.
///
/// The quota is immutable. What an allocation contributes to its group
/// depends on its state, see [`Allocation::contributing_quota`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub id: AllocationId,
    pub belongs_to: WalletId,
    pub parent: Node,
    pub group: GroupId,
    pub granted_in: Option<GrantId>,
    pub quota: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: AllocationState,
    /// Usage frozen into the allocation when it retired.
    pub retired_usage: i64,
    /// Allocations awarded in a grant are held back from persistence until
    /// the grant is committed.
    pub committed: bool,
    pub(crate) dirty: bool,
}

impl Allocation {
    pub fn should_activate(&self, now: DateTime<Utc>) -> bool {
        self.state == AllocationState::Pending && self.start <= now && now < self.end
    }

    pub fn should_retire(&self, now: DateTime<Utc>) -> bool {
        self.state != AllocationState::Retired && now >= self.end
    }

    pub fn is_active(&self) -> bool {
        self.state == AllocationState::Active
    }

    pub fn is_retired(&self) -> bool {
        self.state == AllocationState::Retired
    }

    /// Quota backing the edge: full quota while active, the sunk usage once
    /// retired, nothing while pending.
    pub fn contributing_quota(&self) -> i64 {
        match self.state {
            AllocationState::Pending => 0,
            AllocationState::Active => self.quota,
            AllocationState::Retired => self.retired_usage,
        }
    }

    pub fn active_quota(&self) -> i64 {
        if self.is_active() { self.quota } else { 0 }
    }

    /// How much of the quota should have been consumed by `now` if usage
    /// were spread evenly over the window.
    pub fn preferred_balance(&self, now: DateTime<Utc>) -> i64 {
        match self.state {
            AllocationState::Pending => 0,
            AllocationState::Retired => self.retired_usage,
            AllocationState::Active => {
                let duration = (self.end - self.start).num_milliseconds();
                if duration <= 0 {
                    return self.quota;
                }
                let elapsed = (now - self.start).num_milliseconds();
                let expected = i128::from(self.quota) * i128::from(elapsed) / i128::from(duration);
                expected.clamp(0, i128::from(self.quota)) as i64
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "allocations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub group_id: i64,
    pub wallet_id: i64,
    pub parent_id: Option<i64>,
    pub granted_in: Option<i64>,
    pub quota: i64,
    pub start_date: DateTimeUtc,
    pub end_date: DateTimeUtc,
    pub state: String,
    pub retired_usage: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::group::Entity",
        from = "Column::GroupId",
        to = "super::group::Column::Id",
        on_update = "NoAction",
        on_delete = "NoAction"
    )]
    Groups,
}

impl Related<super::group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Groups.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<&Allocation> for ActiveModel {
    fn from(value: &Allocation) -> Self {
        Self {
            id: ActiveValue::Set(value.id.0),
            group_id: ActiveValue::Set(value.group.0),
            wallet_id: ActiveValue::Set(value.belongs_to.0),
            parent_id: ActiveValue::Set(value.parent.wallet().map(|id| id.0)),
            granted_in: ActiveValue::Set(value.granted_in.map(|id| id.0)),
            quota: ActiveValue::Set(value.quota),
            start_date: ActiveValue::Set(value.start),
            end_date: ActiveValue::Set(value.end),
            state: ActiveValue::Set(value.state.as_str().to_string()),
            retired_usage: ActiveValue::Set(value.retired_usage),
        }
    }
}

impl TryFrom<Model> for Allocation {
    type Error = AccountingError;

    fn try_from(value: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: AllocationId(value.id),
            belongs_to: WalletId(value.wallet_id),
            parent: Node::from(value.parent_id.map(WalletId)),
            group: GroupId(value.group_id),
            granted_in: value.granted_in.map(GrantId),
            quota: value.quota,
            start: value.start_date,
            end: value.end_date,
            state: AllocationState::try_from(value.state.as_str())?,
            retired_usage: value.retired_usage,
            committed: true,
            dirty: false,
        })
    }
}
