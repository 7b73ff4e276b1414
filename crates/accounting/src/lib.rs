//! Hierarchical resource accounting.
//!
//! Wallets hold usage of one product category for one owner. Quota flows from
//! a synthetic root down through time-bounded allocations, and usage flows
//! back up: every charge is routed over the allocations above the charged
//! wallet with a min-cost flow. [`AccountingService`] is the entry point.

pub use allocation::{Allocation, AllocationState};
pub use bucket::Bucket;
pub use category::ProductCategoryId;
pub use charge::ChargeOutcome;
pub use commands::{AllocateCmd, ReportUsageRequest, UsageDescription, WalletFilter};
pub use error::AccountingError;
pub use graph::{Graph, UNREACHABLE};
pub use group::AllocationGroup;
pub use ids::{AllocationId, GrantId, GroupId, IdAllocator, OwnerId, WalletId};
pub use lifecycle::ScanOutcome;
pub use owner::{Owner, OwnerRegistry, WalletOwner};
pub use records::LedgerRecords;
pub use scanner::Scanner;
pub use scope::ScopedUsage;
pub use service::{AccountingService, AccountingServiceBuilder};
pub use snapshot::{AllocationSnapshot, DumpRow, GroupSnapshot, WalletSnapshot};
pub use store::{SqlStore, Store};
pub use wallet::{Node, Wallet};

pub mod allocation;
mod bucket;
mod category;
mod charge;
mod commands;
mod error;
mod graph;
pub mod group;
mod ids;
mod lifecycle;
mod max_usable;
mod mermaid;
pub mod owner;
mod records;
mod scanner;
pub mod scope;
mod service;
mod snapshot;
mod store;
pub mod wallet;

pub type ResultAccounting<T> = Result<T, AccountingError>;
