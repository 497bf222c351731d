use std::{
    collections::BTreeSet,
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use bankstore::{
    pool::PoolOptions,
    postgres_storage::PostgresStore,
    sqlite_storage::SqliteStore,
    storage::{Database, MemoryStore, Queries, StoreError, Transaction},
    Account, CancelFlag, CreateAccountParams, Store, TransferParams, TxContext, TxError,
};
use tempfile::TempDir;

const POSTGRES_URL_VAR: &str = "BANKSTORE_POSTGRES_URL";

/// A store plus whatever must outlive it.
struct Fixture {
    store: Store,
    _dir: Option<TempDir>,
}

fn memory_fixture() -> Fixture {
    Fixture {
        store: Store::new(Arc::new(MemoryStore::new())),
        _dir: None,
    }
}

fn sqlite_fixture() -> Fixture {
    sqlite_fixture_with_timeout(Duration::from_secs(10))
}

fn sqlite_fixture_with_timeout(lock_timeout: Duration) -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bankstore.db");
    let db = SqliteStore::with_options(&path.to_string_lossy(), lock_timeout, PoolOptions::default()).unwrap();
    Fixture {
        store: Store::new(Arc::new(db)),
        _dir: Some(dir),
    }
}

// PostgreSQL tests are `#[ignore]`d; once asked for with `--ignored`, a
// missing server is a failure rather than a skip.
fn require_postgres_url(value: Option<String>) -> String {
    match value {
        Some(url) if !url.is_empty() => url,
        _ => panic!("{} must point at a PostgreSQL database to run the PostgreSQL tests", POSTGRES_URL_VAR),
    }
}

fn postgres_fixture() -> Fixture {
    postgres_fixture_with_timeout(Duration::from_secs(10))
}

fn postgres_fixture_with_timeout(lock_timeout: Duration) -> Fixture {
    let url = require_postgres_url(std::env::var(POSTGRES_URL_VAR).ok());
    let db = PostgresStore::with_options(&url, lock_timeout, PoolOptions::default()).unwrap();
    Fixture {
        store: Store::new(Arc::new(db)),
        _dir: None,
    }
}

fn open_account(store: &Store, owner: &str, balance: i64) -> Account {
    store
        .queries()
        .unwrap()
        .create_account(&CreateAccountParams {
            owner: owner.to_string(),
            balance,
            currency: "USD".to_string(),
        })
        .unwrap()
}

fn balance(store: &Store, account: &Account) -> i64 {
    store.queries().unwrap().get_account(account.id).unwrap().balance
}

// --- Scenarios shared by every backend ---

fn five_concurrent_transfers(store: &Store) {
    let a = open_account(store, "alice", 100);
    let b = open_account(store, "bob", 50);
    let params = TransferParams::new(a.id, b.id, 10);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..5)
            .map(|i| {
                s.spawn(move || {
                    let ctx = TxContext::new().with_label(format!("tx {}", i));
                    store.transfer(&params, &ctx)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut debits = BTreeSet::new();
    let mut credits = BTreeSet::new();
    for result in results {
        let result = result.unwrap();
        assert_eq!(result.transfer.from_account_id, a.id);
        assert_eq!(result.transfer.to_account_id, b.id);
        assert_eq!(result.transfer.amount, 10);
        assert_eq!(result.from_entry.amount, -10);
        assert_eq!(result.to_entry.amount, 10);

        let debited = 100 - result.from_account.balance;
        let credited = result.to_account.balance - 50;
        assert_eq!(debited % 10, 0);
        assert_eq!(credited % 10, 0);
        assert!((10..=50).contains(&debited));
        assert!((10..=50).contains(&credited));
        debits.insert(debited);
        credits.insert(credited);
    }

    // Every transfer saw a distinct serial position.
    let expected: BTreeSet<i64> = [10, 20, 30, 40, 50].into_iter().collect();
    assert_eq!(debits, expected);
    assert_eq!(credits, expected);

    assert_eq!(balance(store, &a), 50);
    assert_eq!(balance(store, &b), 100);

    let mut q = store.queries().unwrap();
    assert_eq!(q.list_entries(a.id).unwrap().len(), 5);
    assert_eq!(q.list_entries(b.id).unwrap().len(), 5);
}

fn many_transfers_apply_exactly_once(store: &Store) {
    const K: i64 = 12;
    const AMOUNT: i64 = 7;
    let x = open_account(store, "xavier", 1_000);
    let y = open_account(store, "yolanda", 3);
    let params = TransferParams::new(y.id, x.id, AMOUNT);

    // Fund y first so every transfer out of it can succeed.
    store
        .transfer(&TransferParams::new(x.id, y.id, K * AMOUNT), &TxContext::new())
        .unwrap();

    thread::scope(|s| {
        for _ in 0..K {
            s.spawn(move || store.transfer(&params, &TxContext::new()).unwrap());
        }
    });

    assert_eq!(balance(store, &x), 1_000);
    assert_eq!(balance(store, &y), 3);

    let entries = store.queries().unwrap().list_entries(y.id).unwrap();
    assert_eq!(entries.len() as i64, K + 1);
    assert_eq!(entries.iter().map(|e| e.amount).sum::<i64>(), 0);
}

fn alternating_directions_all_complete(store: &Store) {
    let a = open_account(store, "ann", 100);
    let b = open_account(store, "ben", 100);

    let outcomes: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let params = if i % 2 == 0 {
                    TransferParams::new(a.id, b.id, 10)
                } else {
                    TransferParams::new(b.id, a.id, 10)
                };
                s.spawn(move || store.transfer(&params, &TxContext::new().with_timeout(Duration::from_secs(30))))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for outcome in outcomes {
        assert!(outcome.is_ok(), "transfer failed: {:?}", outcome.err());
    }
    assert_eq!(balance(store, &a), 100);
    assert_eq!(balance(store, &b), 100);
}

fn both_orderings_conserve_money(store: &Store) {
    let low = open_account(store, "low", 500);
    let high = open_account(store, "high", 500);
    assert!(low.id < high.id);

    let up = store.transfer(&TransferParams::new(low.id, high.id, 120), &TxContext::new()).unwrap();
    assert_eq!(500 - up.from_account.balance, 120);
    assert_eq!(up.to_account.balance - 500, 120);

    let down = store.transfer(&TransferParams::new(high.id, low.id, 45), &TxContext::new()).unwrap();
    assert_eq!(down.from_account.id, high.id);
    assert_eq!(down.to_account.id, low.id);
    assert_eq!(up.to_account.balance - down.from_account.balance, 45);
    assert_eq!(down.to_account.balance - up.from_account.balance, 45);

    assert_eq!(balance(store, &low), 425);
    assert_eq!(balance(store, &high), 575);
}

fn failed_transfer_is_atomic(store: &Store) {
    let a = open_account(store, "poor", 5);
    let b = open_account(store, "rich", 1_000);

    let err = store.transfer(&TransferParams::new(a.id, b.id, 6), &TxContext::new()).unwrap_err();
    assert!(matches!(err, TxError::Store(StoreError::ConstraintViolation(_))), "{:?}", err);

    // a has the lower id, so it is credited before b's debit fails.
    let err = store.transfer(&TransferParams::new(b.id, a.id, 2_000), &TxContext::new()).unwrap_err();
    assert!(matches!(err, TxError::Store(StoreError::ConstraintViolation(_))), "{:?}", err);

    let mut q = store.queries().unwrap();
    assert_eq!(q.get_account(a.id).unwrap().balance, 5);
    assert_eq!(q.get_account(b.id).unwrap().balance, 1_000);
    assert!(q.list_entries(a.id).unwrap().is_empty());
    assert!(q.list_entries(b.id).unwrap().is_empty());
}

fn result_matches_committed_state(store: &Store) {
    let a = open_account(store, "carla", 70);
    let b = open_account(store, "dmitri", 0);

    let result = store
        .transfer(&TransferParams::new(a.id, b.id, 70), &TxContext::new().with_label("drain"))
        .unwrap();

    let mut q = store.queries().unwrap();
    assert_eq!(q.get_transfer(result.transfer.id).unwrap(), result.transfer);
    assert_eq!(q.get_account(a.id).unwrap(), result.from_account);
    assert_eq!(q.get_account(b.id).unwrap(), result.to_account);
    assert_eq!(q.list_entries(a.id).unwrap(), vec![result.from_entry.clone()]);
    assert_eq!(q.list_entries(b.id).unwrap(), vec![result.to_entry.clone()]);
    assert_eq!(result.from_account.balance, 0);
}

macro_rules! backend_tests {
    ($backend:ident, $fixture:expr $(, #[$attr:meta])*) => {
        paste::paste! {
            #[test]
            $(#[$attr])*
            fn [<test_ $backend _five_concurrent_transfers>]() {
                let fixture = $fixture;
                five_concurrent_transfers(&fixture.store);
            }

            #[test]
            $(#[$attr])*
            fn [<test_ $backend _many_transfers_apply_exactly_once>]() {
                let fixture = $fixture;
                many_transfers_apply_exactly_once(&fixture.store);
            }

            #[test]
            $(#[$attr])*
            fn [<test_ $backend _alternating_directions_all_complete>]() {
                let fixture = $fixture;
                alternating_directions_all_complete(&fixture.store);
            }

            #[test]
            $(#[$attr])*
            fn [<test_ $backend _both_orderings_conserve_money>]() {
                let fixture = $fixture;
                both_orderings_conserve_money(&fixture.store);
            }

            #[test]
            $(#[$attr])*
            fn [<test_ $backend _failed_transfer_is_atomic>]() {
                let fixture = $fixture;
                failed_transfer_is_atomic(&fixture.store);
            }

            #[test]
            $(#[$attr])*
            fn [<test_ $backend _result_matches_committed_state>]() {
                let fixture = $fixture;
                result_matches_committed_state(&fixture.store);
            }
        }
    };
}

backend_tests!(memory, memory_fixture());
backend_tests!(sqlite, sqlite_fixture());
backend_tests!(postgres, postgres_fixture(), #[ignore = "requires BANKSTORE_POSTGRES_URL"]);

// --- Lock ordering ---

/// Two transactions lock the same pair of rows in opposite orders. Without a
/// shared order one of them must give up.
fn opposite_order_locking_fails(store: &Store) {
    let a = open_account(store, "first", 10);
    let b = open_account(store, "second", 10);
    let barrier = Barrier::new(2);

    let outcomes: Vec<Result<(), TxError>> = thread::scope(|s| {
        let handles: Vec<_> = [(a.id, b.id), (b.id, a.id)]
            .into_iter()
            .map(|(first, second)| {
                let barrier = &barrier;
                s.spawn(move || {
                    store.exec_tx(&TxContext::new(), |q| {
                        q.get_account_for_update(first)?;
                        barrier.wait();
                        q.get_account_for_update(second)?;
                        Ok(())
                    })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let failures: Vec<_> = outcomes.iter().filter_map(|o| o.as_ref().err()).collect();
    assert!(!failures.is_empty(), "opposite lock order should not succeed twice");
    for failure in failures {
        assert!(failure.is_retryable(), "unexpected error {:?}", failure);
    }
}

#[test]
fn test_memory_opposite_order_locking_times_out() {
    let store = Store::new(Arc::new(MemoryStore::with_lock_timeout(Duration::from_millis(200))));
    opposite_order_locking_fails(&store);
}

#[test]
#[ignore = "requires BANKSTORE_POSTGRES_URL"]
fn test_postgres_opposite_order_locking_fails() {
    let fixture = postgres_fixture_with_timeout(Duration::from_millis(500));
    opposite_order_locking_fails(&fixture.store);
}

#[test]
#[should_panic(expected = "BANKSTORE_POSTGRES_URL must point at a PostgreSQL database")]
fn test_postgres_tests_fail_without_a_url() {
    require_postgres_url(None);
}

#[test]
#[should_panic(expected = "BANKSTORE_POSTGRES_URL must point at a PostgreSQL database")]
fn test_postgres_tests_fail_with_an_empty_url() {
    require_postgres_url(Some(String::new()));
}

#[test]
fn test_postgres_url_is_passed_through() {
    let url = "postgres://bank@localhost/bank".to_string();
    assert_eq!(require_postgres_url(Some(url.clone())), url);
}

// --- Cancellation and deadlines while blocked ---

#[test]
fn test_memory_cancel_while_waiting_for_lock() {
    let db = Arc::new(MemoryStore::with_lock_timeout(Duration::from_secs(30)));
    let store = Store::new(db.clone());
    let a = open_account(&store, "held", 100);
    let b = open_account(&store, "free", 0);

    let mut holder = db.begin(&TxContext::new()).unwrap();
    holder.get_account_for_update(a.id).unwrap();

    let flag = CancelFlag::new();
    let result = thread::scope(|s| {
        let waiter = s.spawn(|| {
            let ctx = TxContext::new().with_label("waiter").with_cancel(flag.clone());
            store.transfer(&TransferParams::new(a.id, b.id, 10), &ctx)
        });
        thread::sleep(Duration::from_millis(100));
        flag.cancel();
        waiter.join().unwrap()
    });

    assert!(matches!(result, Err(TxError::Store(StoreError::Cancelled))), "{:?}", result);
    holder.rollback().unwrap();
    assert_eq!(balance(&store, &a), 100);
    assert_eq!(balance(&store, &b), 0);
    assert!(store.queries().unwrap().list_entries(b.id).unwrap().is_empty());
}

#[test]
fn test_memory_deadline_while_waiting_for_lock() {
    let db = Arc::new(MemoryStore::with_lock_timeout(Duration::from_secs(30)));
    let store = Store::new(db.clone());
    let a = open_account(&store, "held", 100);
    let b = open_account(&store, "free", 0);

    let mut holder = db.begin(&TxContext::new()).unwrap();
    holder.get_account_for_update(b.id).unwrap();

    let ctx = TxContext::new().with_timeout(Duration::from_millis(150));
    let result = store.transfer(&TransferParams::new(a.id, b.id, 10), &ctx);

    assert!(matches!(result, Err(TxError::Store(StoreError::DeadlineExceeded))), "{:?}", result);
    drop(holder);
    assert_eq!(balance(&store, &a), 100);
}

#[test]
fn test_sqlite_deadline_bounds_write_lock_wait() {
    let fixture = sqlite_fixture_with_timeout(Duration::from_secs(30));
    let store = &fixture.store;
    let a = open_account(store, "held", 100);
    let b = open_account(store, "free", 0);

    let holder = store.database().begin(&TxContext::new()).unwrap();

    let ctx = TxContext::new().with_timeout(Duration::from_millis(200));
    let result = store.transfer(&TransferParams::new(a.id, b.id, 10), &ctx);

    assert!(
        matches!(result, Err(TxError::Store(StoreError::DeadlineExceeded | StoreError::LockTimeout))),
        "{:?}",
        result
    );
    holder.rollback().unwrap();

    store.transfer(&TransferParams::new(a.id, b.id, 10), &TxContext::new()).unwrap();
    assert_eq!(balance(store, &b), 10);
}

// --- Async callers ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfers_from_blocking_tasks() {
    let store = Store::new(Arc::new(MemoryStore::new()));
    let a = open_account(&store, "async-a", 200);
    let b = open_account(&store, "async-b", 0);

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        let params = TransferParams::new(a.id, b.id, 10);
        handles.push(tokio::task::spawn_blocking(move || {
            store.transfer(&params, &TxContext::new().with_label(format!("async {}", i)))
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(balance(&store, &a), 0);
    assert_eq!(balance(&store, &b), 200);
}
