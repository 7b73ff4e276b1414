//! Owners of wallets: users and projects.
//!
//! An owner is only a stable numeric identity for a reference string. The
//! reference itself decides the kind of owner: project references are UUIDs,
//! anything else is a username.

use std::collections::HashMap;

use sea_orm::entity::{ActiveValue, prelude::*};
use serde::{Deserialize, Serialize};
use uuid::{Uuid, fmt::Hyphenated};

use crate::{AccountingError, IdAllocator, OwnerId, ResultAccounting};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "reference", rename_all = "snake_case")]
pub enum WalletOwner {
    User(String),
    Project(String),
}

impl WalletOwner {
    /// Classifies a reference string. Only the hyphenated UUID form names a
    /// project, so a project has exactly one reference.
    pub fn from_reference(reference: &str) -> Self {
        if reference.len() == Hyphenated::LENGTH && Uuid::parse_str(reference).is_ok() {
            Self::Project(reference.to_string())
        } else {
            Self::User(reference.to_string())
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            Self::User(username) => username,
            Self::Project(project) => project,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub id: OwnerId,
    pub reference: String,
    pub(crate) dirty: bool,
}

impl Owner {
    pub fn wallet_owner(&self) -> WalletOwner {
        WalletOwner::from_reference(&self.reference)
    }
}

/// Bidirectional owner lookup.
#[derive(Debug, Default)]
pub struct OwnerRegistry {
    by_reference: HashMap<String, OwnerId>,
    by_id: HashMap<OwnerId, Owner>,
}

impl OwnerRegistry {
    /// Returns the owner of `reference`, creating it on first sight.
    pub fn resolve(&mut self, reference: &str, ids: &IdAllocator) -> ResultAccounting<OwnerId> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(AccountingError::InvalidOwner(
                "owner reference must not be empty".to_string(),
            ));
        }

        if let Some(id) = self.by_reference.get(reference) {
            return Ok(*id);
        }

        let owner = Owner {
            id: ids.next_owner(),
            reference: reference.to_string(),
            dirty: true,
        };
        let id = owner.id;
        self.insert(owner);
        Ok(id)
    }

    pub fn by_reference(&self, reference: &str) -> Option<&Owner> {
        self.by_reference
            .get(reference.trim())
            .and_then(|id| self.by_id.get(id))
    }

    pub fn get(&self, id: OwnerId) -> Option<&Owner> {
        self.by_id.get(&id)
    }

    pub(crate) fn insert(&mut self, owner: Owner) {
        self.by_reference.insert(owner.reference.clone(), owner.id);
        self.by_id.insert(owner.id, owner);
    }

    /// Copies dirty owners out and clears their flag.
    pub(crate) fn take_dirty(&mut self) -> Vec<Owner> {
        let mut dirty: Vec<Owner> = self
            .by_id
            .values_mut()
            .filter(|owner| owner.dirty)
            .map(|owner| {
                owner.dirty = false;
                owner.clone()
            })
            .collect();
        dirty.sort_by_key(|owner| owner.id);
        dirty
    }

    pub(crate) fn mark_dirty(&mut self, id: OwnerId) {
        if let Some(owner) = self.by_id.get_mut(&id) {
            owner.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "owners")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    #[sea_orm(unique)]
    pub reference: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::wallet::Entity")]
    Wallets,
}

impl Related<super::wallet::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Wallets.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<&Owner> for ActiveModel {
    fn from(value: &Owner) -> Self {
        Self {
            id: ActiveValue::Set(value.id.0),
            reference: ActiveValue::Set(value.reference.clone()),
        }
    }
}

impl From<Model> for Owner {
    fn from(value: Model) -> Self {
        Self {
            id: OwnerId(value.id),
            reference: value.reference,
            dirty: false,
        }
    }
}
