//! Scoped usage counters.
//!
//! Providers may report absolute usage per scope (a job, a drive) rather than
//! per wallet. The last value seen for each scope is kept here so the next
//! absolute report can be turned into a delta.

use sea_orm::entity::{ActiveValue, prelude::*};

use crate::OwnerId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopedUsage {
    pub key: String,
    pub usage: i64,
    pub(crate) dirty: bool,
}

impl ScopedUsage {
    pub fn new(key: String) -> Self {
        Self {
            key,
            usage: 0,
            dirty: false,
        }
    }

    /// Scopes are per owner, not per wallet.
    pub fn key(owner: OwnerId, scope: &str) -> String {
        format!("{}\n{scope}", owner.0)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "scoped_usage")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,
    pub usage: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<&ScopedUsage> for ActiveModel {
    fn from(value: &ScopedUsage) -> Self {
        Self {
            key: ActiveValue::Set(value.key.clone()),
            usage: ActiveValue::Set(value.usage),
        }
    }
}

impl From<Model> for ScopedUsage {
    fn from(value: Model) -> Self {
        Self {
            key: value.key,
            usage: value.usage,
            dirty: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_owner_and_scope() {
        assert_eq!(ScopedUsage::key(OwnerId(12), "job-1"), "12\njob-1");
    }
}
