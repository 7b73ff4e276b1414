//! Persistence of the ledger.
//!
//! The engine keeps everything in memory. A [`Store`] loads the full ledger
//! once at start-up and receives batches of changed records afterwards.
//! [`SqlStore`] is the sea-orm implementation; every batch is written in one
//! database transaction with upserts.

use std::future::Future;

use sea_orm::{
    DatabaseConnection, EntityTrait, QueryOrder, TransactionTrait, sea_query::OnConflict,
};

use crate::{
    Allocation, AllocationGroup, LedgerRecords, Owner, ResultAccounting, ScopedUsage, allocation,
    group, owner, scope, wallet,
};

/// Rows per insert statement. Keeps well below the bind limit of sqlite.
const BATCH_SIZE: usize = 100;

pub trait Store: Send + Sync {
    /// Reads the whole ledger.
    fn load(&self) -> impl Future<Output = ResultAccounting<LedgerRecords>> + Send;

    /// Writes a batch of records. Either the whole batch is stored or none of
    /// it.
    fn save(&self, records: &LedgerRecords) -> impl Future<Output = ResultAccounting<()>> + Send;
}

#[derive(Clone, Debug)]
pub struct SqlStore {
    database: DatabaseConnection,
}

impl SqlStore {
    pub fn new(database: DatabaseConnection) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &DatabaseConnection {
        &self.database
    }
}

impl Store for SqlStore {
    async fn load(&self) -> ResultAccounting<LedgerRecords> {
        let owners = owner::Entity::find()
            .order_by_asc(owner::Column::Id)
            .all(&self.database)
            .await?
            .into_iter()
            .map(Owner::from)
            .collect();

        let wallets = wallet::Entity::find()
            .order_by_asc(wallet::Column::Id)
            .all(&self.database)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();

        let groups = group::Entity::find()
            .order_by_asc(group::Column::Id)
            .all(&self.database)
            .await?
            .into_iter()
            .map(AllocationGroup::from)
            .collect();

        let allocations = allocation::Entity::find()
            .order_by_asc(allocation::Column::Id)
            .all(&self.database)
            .await?
            .into_iter()
            .map(Allocation::try_from)
            .collect::<ResultAccounting<Vec<_>>>()?;

        let scopes = scope::Entity::find()
            .order_by_asc(scope::Column::Key)
            .all(&self.database)
            .await?
            .into_iter()
            .map(ScopedUsage::from)
            .collect();

        Ok(LedgerRecords {
            owners,
            wallets,
            groups,
            allocations,
            scopes,
        })
    }

    async fn save(&self, records: &LedgerRecords) -> ResultAccounting<()> {
        if records.is_empty() {
            return Ok(());
        }

        let db_tx = self.database.begin().await?;

        for chunk in records.owners.chunks(BATCH_SIZE) {
            owner::Entity::insert_many(chunk.iter().map(owner::ActiveModel::from))
                .on_conflict(
                    OnConflict::column(owner::Column::Id)
                        .update_column(owner::Column::Reference)
                        .to_owned(),
                )
                .exec_without_returning(&db_tx)
                .await?;
        }

        for chunk in records.wallets.chunks(BATCH_SIZE) {
            wallet::Entity::insert_many(
                chunk
                    .iter()
                    .map(|(category, w)| wallet::ActiveModel::from((category, w))),
            )
            .on_conflict(
                OnConflict::column(wallet::Column::Id)
                    .update_columns([
                        wallet::Column::LocalUsage,
                        wallet::Column::WasLocked,
                        wallet::Column::LastSignificantUpdate,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&db_tx)
            .await?;
        }

        for chunk in records.groups.chunks(BATCH_SIZE) {
            group::Entity::insert_many(chunk.iter().map(group::ActiveModel::from))
                .on_conflict(
                    OnConflict::column(group::Column::Id)
                        .update_column(group::Column::TreeUsage)
                        .to_owned(),
                )
                .exec_without_returning(&db_tx)
                .await?;
        }

        for chunk in records.allocations.chunks(BATCH_SIZE) {
            allocation::Entity::insert_many(chunk.iter().map(allocation::ActiveModel::from))
                .on_conflict(
                    OnConflict::column(allocation::Column::Id)
                        .update_columns([
                            allocation::Column::State,
                            allocation::Column::RetiredUsage,
                            allocation::Column::GrantedIn,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(&db_tx)
                .await?;
        }

        for chunk in records.scopes.chunks(BATCH_SIZE) {
            scope::Entity::insert_many(chunk.iter().map(scope::ActiveModel::from))
                .on_conflict(
                    OnConflict::column(scope::Column::Key)
                        .update_column(scope::Column::Usage)
                        .to_owned(),
                )
                .exec_without_returning(&db_tx)
                .await?;
        }

        db_tx.commit().await?;
        tracing::debug!("Persisted {} accounting records", records.len());
        Ok(())
    }
}
