use chrono::{DateTime, TimeZone, Utc};
use sea_orm::{ConnectionTrait, Database, EntityTrait, Statement};

use accounting::{
    AccountingService, AllocateCmd, AllocationState, GrantId, LedgerRecords, ProductCategoryId,
    ReportUsageRequest, SqlStore, Store, allocation, wallet,
};
use migration::MigratorTrait;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).unwrap()
}

async fn store() -> SqlStore {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    migration::Migrator::up(&db, None).await.unwrap();
    SqlStore::new(db)
}

fn category() -> ProductCategoryId {
    ProductCategoryId::new("storage", "hpc")
}

#[tokio::test]
async fn flushed_state_loads_back() {
    let store = store().await;
    let service = AccountingService::load(&store).await.unwrap();
    let category = category();

    let project = "6f1c0d55-40c4-4b0f-8b55-7a3c0e0b4a11";
    let parent = service.wallet_by_owner(at(0), &category, project).unwrap();
    let child = service.wallet_by_owner(at(0), &category, "alice").unwrap();
    service
        .allocate(at(0), &AllocateCmd::new(category.clone(), parent, 1000, at(0), at(100)))
        .unwrap();
    service
        .allocate(at(0), &AllocateCmd::new(category.clone(), child, 300, at(0), at(50)).parent(parent))
        .unwrap();
    service
        .report_usage(
            at(1),
            &ReportUsageRequest::absolute("alice", category.clone(), 120).scope("/home/alice"),
        )
        .unwrap();

    let written = service.flush(&store).await.unwrap();
    assert!(written > 0);
    assert_eq!(service.flush(&store).await.unwrap(), 0);

    let loaded = AccountingService::load(&store).await.unwrap();
    let before = service.wallet_snapshot(at(2), child, true).unwrap();
    let after = loaded.wallet_snapshot(at(2), child, true).unwrap();
    assert_eq!(before, after);
    assert_eq!(loaded.max_usable(at(2), child), Some(180));
    assert_eq!(loaded.max_usable(at(2), parent), Some(880));

    let parent_snapshot = loaded.wallet_snapshot(at(2), parent, false).unwrap();
    assert_eq!(parent_snapshot.owner, accounting::WalletOwner::Project(project.to_string()));

    // The scope survives the round trip: the next absolute report is a delta.
    loaded
        .report_usage(
            at(3),
            &ReportUsageRequest::absolute("alice", category.clone(), 150).scope("/home/alice"),
        )
        .unwrap();
    assert_eq!(loaded.max_usable(at(3), child), Some(150));

    // Ids continue after the loaded ones.
    let newcomer = loaded.wallet_by_owner(at(3), &category, "bob").unwrap();
    assert!(newcomer > child);
}

#[tokio::test]
async fn updates_overwrite_rows() {
    let store = store().await;
    let service = AccountingService::load(&store).await.unwrap();
    let category = category();
    let w = service.wallet_by_owner(at(0), &category, "alice").unwrap();
    service
        .allocate(at(0), &AllocateCmd::new(category.clone(), w, 100, at(0), at(10)))
        .unwrap();
    service.flush(&store).await.unwrap();

    service
        .report_usage(at(1), &ReportUsageRequest::delta("alice", category, 40))
        .unwrap();
    service.scan_all(at(11));
    service.flush(&store).await.unwrap();

    let wallets = wallet::Entity::find().all(store.database()).await.unwrap();
    assert_eq!(wallets.len(), 1);
    assert_eq!(wallets[0].local_usage, 40);
    assert!(wallets[0].was_locked);

    let allocations = allocation::Entity::find().all(store.database()).await.unwrap();
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].state, AllocationState::Retired.as_str());
    assert_eq!(allocations[0].retired_usage, 40);
}

#[tokio::test]
async fn grants_are_written_after_commit() {
    let store = store().await;
    let service = AccountingService::load(&store).await.unwrap();
    let category = category();
    let w = service.wallet_by_owner(at(0), &category, "alice").unwrap();
    service
        .allocate(
            at(0),
            &AllocateCmd::new(category, w, 100, at(0), at(10)).granted_in(GrantId(12)),
        )
        .unwrap();

    service.flush(&store).await.unwrap();
    assert!(allocation::Entity::find().all(store.database()).await.unwrap().is_empty());

    assert_eq!(service.commit_grant(GrantId(12)), 1);
    service.flush(&store).await.unwrap();
    let rows = allocation::Entity::find().all(store.database()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].granted_in, Some(12));
}

#[tokio::test]
async fn failed_flush_requeues_changes() {
    let store = store().await;
    let service = AccountingService::load(&store).await.unwrap();
    let category = category();
    let w = service.wallet_by_owner(at(0), &category, "alice").unwrap();
    service
        .allocate(at(0), &AllocateCmd::new(category, w, 100, at(0), at(10)))
        .unwrap();

    let db = store.database();
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "DROP TABLE scoped_usage",
    ))
    .await
    .unwrap();
    service
        .report_usage(
            at(1),
            &ReportUsageRequest::absolute("alice", ProductCategoryId::new("storage", "hpc"), 5)
                .scope("job"),
        )
        .unwrap();

    let err = service.flush(&store).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(wallet::Entity::find().all(db).await.unwrap().is_empty());

    let pending = service.collect_changes();
    assert_eq!(pending.wallets.len(), 1);
    assert_eq!(pending.scopes.len(), 1);
    assert_eq!(service.max_usable(at(1), w), Some(95));
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let store = store().await;
    store.save(&LedgerRecords::default()).await.unwrap();
    assert!(store.load().await.unwrap().is_empty());
}
