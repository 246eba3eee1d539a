use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tabula::prelude::*;
use tabula::test_utils::{MockDatabase, with_test_transaction};
use tabula::{ErrorKind, ExecutorConfig};

async fn setup() -> MockDatabase<tabula::sqlx::Sqlite> {
    let db = MockDatabase::new_sqlite().await.unwrap();
    db.run_script("CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT NOT NULL, balance INTEGER NOT NULL);")
        .await
        .unwrap();
    db
}

fn accounts() -> Arc<ModelSchema> {
    ModelSchema::builder("accounts")
        .fillable(["owner", "balance"])
        .without_timestamps()
        .build()
}

async fn count(db: &MockDatabase<tabula::sqlx::Sqlite>) -> u64 {
    accounts().query(&mut db.executor()).count().await.unwrap()
}

#[tokio::test]
async fn commit_keeps_every_write() {
    let db = setup().await;
    let schema = accounts();

    let ids = Tabula::transaction(db.pool(), move |tx| {
        Box::pin(async move {
            let a = schema.create(tx, [("owner", Value::from("ada")), ("balance", Value::from(10))]).await?;
            let b = schema.create(tx, [("owner", Value::from("grace")), ("balance", Value::from(5))]).await?;
            Ok((a.key().cloned(), b.key().cloned()))
        })
    })
    .await
    .unwrap();

    assert_eq!(ids, (Some(Value::Int(1)), Some(Value::Int(2))));
    assert_eq!(count(&db).await, 2);
}

#[tokio::test]
async fn error_rolls_back_every_write() {
    let db = setup().await;
    let schema = accounts();

    let err = Tabula::transaction(db.pool(), move |tx| {
        Box::pin(async move {
            schema.create(tx, [("owner", Value::from("ada")), ("balance", Value::from(10))]).await?;
            schema.create(tx, [("owner", Value::Null), ("balance", Value::from(5))]).await?;
            Ok(())
        })
    })
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Constraint);
    assert_eq!(count(&db).await, 0);
}

#[tokio::test]
async fn panic_rolls_back_and_propagates() {
    let db = setup().await;
    let schema = accounts();

    let outcome = AssertUnwindSafe(Tabula::transaction(db.pool(), move |tx| {
        Box::pin(async move {
            schema.create(tx, [("owner", Value::from("ada")), ("balance", Value::from(10))]).await?;
            if schema.table() == "accounts" {
                panic!("ledger out of balance");
            }
            Ok(())
        })
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(count(&db).await, 0);
}

#[tokio::test]
async fn cancelled_transaction_rolls_back() {
    let db = setup().await;
    let schema = accounts();

    let elapsed = tokio::time::timeout(
        Duration::from_millis(100),
        Tabula::transaction(db.pool(), move |tx| {
            Box::pin(async move {
                schema.create(tx, [("owner", Value::from("ghost")), ("balance", Value::from(1))]).await?;
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
        }),
    )
    .await;
    assert!(elapsed.is_err());

    assert_eq!(count(&db).await, 0);
    let schema = accounts();
    Tabula::transaction(db.pool(), move |tx| {
        Box::pin(async move {
            schema.create(tx, [("owner", Value::from("ada")), ("balance", Value::from(10))]).await?;
            Ok(())
        })
    })
    .await
    .unwrap();
    assert_eq!(count(&db).await, 1);
}

#[tokio::test]
async fn failed_commit_rolls_back() {
    let db = setup().await;
    db.run_script(
        "CREATE TABLE owners (id INTEGER PRIMARY KEY);
         CREATE TABLE pets (
             id INTEGER PRIMARY KEY,
             owner_id INTEGER REFERENCES owners(id) DEFERRABLE INITIALLY DEFERRED
         );",
    )
    .await
    .unwrap();
    let pets = ModelSchema::builder("pets").fillable(["owner_id"]).without_timestamps().build();

    let schema = Arc::clone(&pets);
    let err = Tabula::transaction(db.pool(), move |tx| {
        Box::pin(async move {
            schema.create(tx, [("owner_id", 99)]).await?;
            Ok(())
        })
    })
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Constraint);
    assert_eq!(pets.query(&mut db.executor()).count().await.unwrap(), 0);

    let schema = accounts();
    Tabula::transaction(db.pool(), move |tx| {
        Box::pin(async move {
            schema.create(tx, [("owner", Value::from("ada")), ("balance", Value::from(10))]).await?;
            Ok(())
        })
    })
    .await
    .unwrap();
    assert_eq!(count(&db).await, 1);
}

#[tokio::test]
async fn pool_executors_refuse_to_begin() {
    let db = setup().await;
    let err = transaction(&mut db.executor(), |_tx| Box::pin(async move { Ok(()) }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[tokio::test]
async fn model_updates_inside_a_transaction() {
    let db = setup().await;
    let schema = accounts();
    schema
        .create(&mut db.executor(), [("owner", Value::from("ada")), ("balance", Value::from(10))])
        .await
        .unwrap();

    let lookup = Arc::clone(&schema);
    Tabula::transaction_with(db.pool(), ExecutorConfig::default(), move |tx| {
        Box::pin(async move {
            let mut account = lookup.query(&mut *tx).find_or_fail(1).await?;
            let balance: i64 = account.get("balance")?;
            account.update(tx, [("balance", balance - 3)]).await
        })
    })
    .await
    .unwrap();

    let account = schema.query(&mut db.executor()).find_or_fail(1).await.unwrap();
    assert_eq!(account.get_attribute("balance"), Value::Int(7));
}

#[tokio::test]
async fn test_transactions_always_roll_back() {
    let db = setup().await;
    let schema = accounts();

    let inserted = with_test_transaction(db.pool(), move |mut tx| {
        Box::pin(async move {
            schema.create(&mut tx, [("owner", Value::from("tmp")), ("balance", Value::from(0))]).await?;
            schema.query(&mut tx).count().await
        })
    })
    .await
    .unwrap();

    assert_eq!(inserted, 1);
    assert_eq!(count(&db).await, 0);
}
