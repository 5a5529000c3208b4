//! Credit ledger against the SQLite store: conditional debits under
//! concurrency, exact refunds and idempotent external grants.

use std::sync::Arc;

use doctalk::config::{parse_config, CreditsConfig};
use doctalk::db;
use doctalk::error::LedgerError;
use doctalk::ledger::CreditLedger;
use doctalk::migrate;
use doctalk::models::{Plan, User};
use doctalk::store::{AccountStore, SqliteStore};
use tempfile::TempDir;

async fn open_store(tmp: &TempDir) -> Arc<SqliteStore> {
    let config = parse_config(&format!(
        "[db]\npath = \"{}\"\n",
        tmp.path().join("doctalk.sqlite").display()
    ))
    .unwrap();
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}

async fn ledger_with_user(tmp: &TempDir, balance: i64) -> (Arc<CreditLedger>, Arc<SqliteStore>) {
    let store = open_store(tmp).await;
    store
        .create_user(&User {
            id: "u1".into(),
            plan: Plan::Free,
            credits_balance: balance,
            monthly_credits_granted_at: None,
        })
        .await
        .unwrap();
    let ledger = Arc::new(CreditLedger::new(store.clone(), CreditsConfig::default()));
    (ledger, store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_never_overdraw() {
    let tmp = TempDir::new().unwrap();
    let (ledger, _store) = ledger_with_user(&tmp, 50).await;

    let mut handles = Vec::new();
    for i in 0..40 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .debit("u1", 40, "chat", Some("chat_turn"), Some(&format!("m{i}")))
                .await
        }));
    }

    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(LedgerError::InsufficientCredits { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(ledger.balance("u1").await.unwrap(), 10);
    assert_eq!(ledger.ledger("u1").await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_monthly_grants_apply_once() {
    let tmp = TempDir::new().unwrap();
    let (ledger, store) = ledger_with_user(&tmp, 0).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.ensure_monthly_credits("u1").await
        }));
    }

    let mut granted = 0;
    for h in handles {
        granted += h.await.unwrap().unwrap();
    }
    assert_eq!(granted, 5000);
    assert_eq!(ledger.balance("u1").await.unwrap(), 5000);

    let entries = ledger.ledger("u1").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "monthly_allowance");
    assert!(store
        .get_user("u1")
        .await
        .unwrap()
        .unwrap()
        .monthly_credits_granted_at
        .is_some());
}

#[tokio::test]
async fn refund_after_debit_nets_to_zero() {
    let tmp = TempDir::new().unwrap();
    let (ledger, _store) = ledger_with_user(&tmp, 500).await;

    let entry = ledger
        .debit("u1", 120, "chat", Some("chat_turn"), Some("m1"))
        .await
        .unwrap();
    assert_eq!(ledger.balance("u1").await.unwrap(), 380);
    ledger.refund(&entry.id).await.unwrap();
    assert_eq!(ledger.balance("u1").await.unwrap(), 500);
    assert!(ledger.ledger("u1").await.unwrap().is_empty());
    assert!(matches!(
        ledger.refund(&entry.id).await,
        Err(LedgerError::EntryNotFound(_))
    ));
}

#[tokio::test]
async fn external_grants_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (ledger, _store) = ledger_with_user(&tmp, 0).await;

    assert!(ledger
        .grant_external("u1", 1000, "stripe_payment", "stripe_payment", "pi_1")
        .await
        .unwrap());
    assert!(!ledger
        .grant_external("u1", 1000, "stripe_payment", "stripe_payment", "pi_1")
        .await
        .unwrap());
    assert!(ledger
        .grant_external("u1", 500, "stripe_payment", "stripe_payment", "pi_2")
        .await
        .unwrap());
    assert_eq!(ledger.balance("u1").await.unwrap(), 1500);

    let entries = ledger.ledger("u1").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries.last().unwrap().balance_after, 1500);
    assert!(matches!(
        ledger.grant_external("u1", 10, "gift", "gift", "g1").await,
        Err(LedgerError::UnknownRefType(_))
    ));
}

#[tokio::test]
async fn reconcile_and_monthly_allowance_over_sqlite() {
    let tmp = TempDir::new().unwrap();
    let (ledger, store) = ledger_with_user(&tmp, 200).await;

    let granted = ledger.ensure_monthly_credits("u1").await.unwrap();
    assert_eq!(granted, 5000);
    assert_eq!(ledger.ensure_monthly_credits("u1").await.unwrap(), 0);
    assert!(store
        .get_user("u1")
        .await
        .unwrap()
        .unwrap()
        .monthly_credits_granted_at
        .is_some());

    let pre = ledger
        .debit("u1", 100, "chat", Some("chat_turn"), Some("m1"))
        .await
        .unwrap();
    let outcome = ledger.reconcile("u1", &pre.id, 100, 40).await;
    assert_eq!(outcome, doctalk::ledger::Reconciliation::Refunded(60));
    assert_eq!(ledger.balance("u1").await.unwrap(), 5200 - 40);

    let sum: i64 = ledger.ledger("u1").await.unwrap().iter().map(|e| e.delta).sum();
    assert_eq!(200 + sum, ledger.balance("u1").await.unwrap());
}
