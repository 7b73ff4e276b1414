//! Initial schema of the accounting ledger:
//!
//! - `owners`: users and projects, by reference
//! - `wallets`: one per owner and product category
//! - `allocation_groups`: allocations between a wallet and one parent
//! - `allocations`: time-bounded quota
//! - `scoped_usage`: last absolute usage reported per scope

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

// ─────────────────────────────────────────────────────────────────────────────
// Table identifiers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Iden)]
enum Owners {
    Table,
    Id,
    Reference,
}

#[derive(Iden)]
enum Wallets {
    Table,
    Id,
    OwnerId,
    Provider,
    Category,
    LocalUsage,
    WasLocked,
    LastSignificantUpdate,
}

#[derive(Iden)]
enum AllocationGroups {
    Table,
    Id,
    WalletId,
    ParentId,
    TreeUsage,
}

#[derive(Iden)]
enum Allocations {
    Table,
    Id,
    GroupId,
    WalletId,
    ParentId,
    GrantedIn,
    Quota,
    StartDate,
    EndDate,
    State,
    RetiredUsage,
}

#[derive(Iden)]
enum ScopedUsage {
    Table,
    Key,
    Usage,
}

// ─────────────────────────────────────────────────────────────────────────────
// Migration implementation
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ───────────────────────────────────────────────────────────────────
        // 1. Owners
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Owners::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Owners::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Owners::Reference)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 2. Wallets
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Wallets::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Wallets::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Wallets::OwnerId).big_integer().not_null())
                    .col(ColumnDef::new(Wallets::Provider).string().not_null())
                    .col(ColumnDef::new(Wallets::Category).string().not_null())
                    .col(
                        ColumnDef::new(Wallets::LocalUsage)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Wallets::WasLocked)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Wallets::LastSignificantUpdate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-wallets-owner_id")
                            .from(Wallets::Table, Wallets::OwnerId)
                            .to(Owners::Table, Owners::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-wallets-owner-category-unique")
                    .table(Wallets::Table)
                    .col(Wallets::OwnerId)
                    .col(Wallets::Provider)
                    .col(Wallets::Category)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 3. Allocation groups
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(AllocationGroups::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AllocationGroups::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AllocationGroups::WalletId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AllocationGroups::ParentId).big_integer())
                    .col(
                        ColumnDef::new(AllocationGroups::TreeUsage)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-allocation_groups-wallet_id")
                            .from(AllocationGroups::Table, AllocationGroups::WalletId)
                            .to(Wallets::Table, Wallets::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-allocation_groups-parent_id")
                            .from(AllocationGroups::Table, AllocationGroups::ParentId)
                            .to(Wallets::Table, Wallets::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-allocation_groups-wallet-parent")
                    .table(AllocationGroups::Table)
                    .col(AllocationGroups::WalletId)
                    .col(AllocationGroups::ParentId)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 4. Allocations
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(Allocations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Allocations::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Allocations::GroupId).big_integer().not_null())
                    .col(ColumnDef::new(Allocations::WalletId).big_integer().not_null())
                    .col(ColumnDef::new(Allocations::ParentId).big_integer())
                    .col(ColumnDef::new(Allocations::GrantedIn).big_integer())
                    .col(ColumnDef::new(Allocations::Quota).big_integer().not_null())
                    .col(
                        ColumnDef::new(Allocations::StartDate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Allocations::EndDate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Allocations::State)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Allocations::RetiredUsage)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-allocations-group_id")
                            .from(Allocations::Table, Allocations::GroupId)
                            .to(AllocationGroups::Table, AllocationGroups::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-allocations-granted_in")
                    .table(Allocations::Table)
                    .col(Allocations::GrantedIn)
                    .to_owned(),
            )
            .await?;

        // ───────────────────────────────────────────────────────────────────
        // 5. Scoped usage
        // ───────────────────────────────────────────────────────────────────
        manager
            .create_table(
                Table::create()
                    .table(ScopedUsage::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ScopedUsage::Key)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ScopedUsage::Usage)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Children first.
        manager
            .drop_table(Table::drop().table(ScopedUsage::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Allocations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AllocationGroups::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Wallets::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Owners::Table).to_owned())
            .await?;
        Ok(())
    }
}
