//! Command structs for accounting operations.
//!
//! These types group the parameters of allocations, usage reports and wallet
//! queries, keeping call sites readable and avoiding long argument lists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GrantId, Node, ProductCategoryId, WalletId};

/// Create an allocation.
#[derive(Clone, Debug)]
pub struct AllocateCmd {
    pub category: ProductCategoryId,
    pub recipient: WalletId,
    pub parent: Node,
    pub quota: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub granted_in: Option<GrantId>,
}

impl AllocateCmd {
    /// A root allocation. Use [`AllocateCmd::parent`] for a sub-allocation.
    #[must_use]
    pub fn new(
        category: ProductCategoryId,
        recipient: WalletId,
        quota: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            category,
            recipient,
            parent: Node::Root,
            quota,
            start,
            end,
            granted_in: None,
        }
    }

    #[must_use]
    pub fn parent(mut self, parent: WalletId) -> Self {
        self.parent = Node::Wallet(parent);
        self
    }

    /// Holds the allocation back from persistence until the grant is
    /// committed.
    #[must_use]
    pub fn granted_in(mut self, grant: GrantId) -> Self {
        self.granted_in = Some(grant);
        self
    }
}

/// Free-form context attached to a usage report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDescription {
    /// Absolute reports with a scope are relative to the last value of that
    /// scope instead of the wallet's local usage.
    pub scope: Option<String>,
    pub description: Option<String>,
}

/// Report usage for the wallet of `owner` in `category`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportUsageRequest {
    pub owner: String,
    pub category: ProductCategoryId,
    pub usage: i64,
    pub is_delta_charge: bool,
    pub description: UsageDescription,
}

impl ReportUsageRequest {
    /// Adds `usage` to what was already reported.
    #[must_use]
    pub fn delta(owner: impl Into<String>, category: ProductCategoryId, usage: i64) -> Self {
        Self {
            owner: owner.into(),
            category,
            usage,
            is_delta_charge: true,
            description: UsageDescription::default(),
        }
    }

    /// Sets the total usage to `usage`.
    #[must_use]
    pub fn absolute(owner: impl Into<String>, category: ProductCategoryId, usage: i64) -> Self {
        Self {
            is_delta_charge: false,
            ..Self::delta(owner, category, usage)
        }
    }

    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.description.scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description.description = Some(description.into());
        self
    }
}

/// Which wallets of an owner to return.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalletFilter {
    pub provider: Option<String>,
    pub category: Option<String>,
    pub include_children: bool,
    /// Only wallets with at least one active allocation.
    pub require_active: bool,
}

impl WalletFilter {
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn include_children(mut self) -> Self {
        self.include_children = true;
        self
    }

    #[must_use]
    pub fn require_active(mut self) -> Self {
        self.require_active = true;
        self
    }

    pub(crate) fn matches(&self, category: &ProductCategoryId) -> bool {
        self.provider
            .as_deref()
            .is_none_or(|provider| provider == category.provider)
            && self
                .category
                .as_deref()
                .is_none_or(|name| name == category.name)
    }
}
