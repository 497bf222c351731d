use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use postgres::{error::SqlState, Client, NoTls, Row};

use bankstore_core::{Account, AccountId, CreateAccountParams, Entry, Transfer, TxContext};

use crate::{
    pool::{Pool, PoolOptions, PooledConnection},
    storage::{Database, Queries, StoreError, Transaction, TransactionId, DEFAULT_LOCK_TIMEOUT},
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id BIGSERIAL PRIMARY KEY,
        owner TEXT NOT NULL,
        balance BIGINT NOT NULL CHECK (balance >= 0),
        currency TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS entries (
        id BIGSERIAL PRIMARY KEY,
        account_id BIGINT NOT NULL REFERENCES accounts(id),
        amount BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS transfers (
        id BIGSERIAL PRIMARY KEY,
        from_account_id BIGINT NOT NULL REFERENCES accounts(id),
        to_account_id BIGINT NOT NULL REFERENCES accounts(id),
        amount BIGINT NOT NULL CHECK (amount > 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE INDEX IF NOT EXISTS idx_pg_accounts_owner ON accounts(owner);
    CREATE INDEX IF NOT EXISTS idx_pg_entries_account ON entries(account_id);
    CREATE INDEX IF NOT EXISTS idx_pg_transfers_from ON transfers(from_account_id);
    CREATE INDEX IF NOT EXISTS idx_pg_transfers_to ON transfers(to_account_id);
    CREATE INDEX IF NOT EXISTS idx_pg_transfers_pair ON transfers(from_account_id, to_account_id);
";

/// PostgreSQL backend with real row locks.
pub struct PostgresStore {
    pool: Pool<Client>,
    lock_timeout: Duration,
    tx_counter: AtomicU64,
}

impl PostgresStore {
    pub fn new(connection_string: &str) -> Result<Self, StoreError> {
        Self::with_options(connection_string, DEFAULT_LOCK_TIMEOUT, PoolOptions::default())
    }

    pub fn with_options(connection_string: &str, lock_timeout: Duration, pool: PoolOptions) -> Result<Self, StoreError> {
        let url = connection_string.to_string();
        let pool = Pool::new(pool, move || {
            Client::connect(&url, NoTls)
                .map_err(|e| StoreError::Connection(format!("PostgreSQL connection failed: {}", e)))
        });

        pool.get()?.batch_execute(SCHEMA).map_err(map_err)?;

        Ok(Self {
            pool,
            lock_timeout,
            tx_counter: AtomicU64::new(1),
        })
    }
}

fn map_err(e: postgres::Error) -> StoreError {
    if e.is_closed() {
        return StoreError::Connection(e.to_string());
    }
    match e.as_db_error() {
        Some(db) => {
            let code = db.code();
            if code == &SqlState::LOCK_NOT_AVAILABLE {
                StoreError::LockTimeout
            } else if code == &SqlState::T_R_DEADLOCK_DETECTED {
                StoreError::Deadlock
            } else if code == &SqlState::CHECK_VIOLATION
                || code == &SqlState::FOREIGN_KEY_VIOLATION
                || code == &SqlState::UNIQUE_VIOLATION
                || code == &SqlState::NOT_NULL_VIOLATION
            {
                StoreError::ConstraintViolation(db.message().to_string())
            } else {
                StoreError::Other(db.to_string())
            }
        }
        None => StoreError::Other(e.to_string()),
    }
}

fn account_from_row(row: &Row) -> Result<Account, StoreError> {
    Ok(Account {
        id: row.try_get("id").map_err(map_err)?,
        owner: row.try_get("owner").map_err(map_err)?,
        balance: row.try_get("balance").map_err(map_err)?,
        currency: row.try_get("currency").map_err(map_err)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
    })
}

fn transfer_from_row(row: &Row) -> Result<Transfer, StoreError> {
    Ok(Transfer {
        id: row.try_get("id").map_err(map_err)?,
        from_account_id: row.try_get("from_account_id").map_err(map_err)?,
        to_account_id: row.try_get("to_account_id").map_err(map_err)?,
        amount: row.try_get("amount").map_err(map_err)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
    })
}

fn entry_from_row(row: &Row) -> Result<Entry, StoreError> {
    Ok(Entry {
        id: row.try_get("id").map_err(map_err)?,
        account_id: row.try_get("account_id").map_err(map_err)?,
        amount: row.try_get("amount").map_err(map_err)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
    })
}

mod queries {
    use super::*;

    pub fn create_account(client: &mut Client, args: &CreateAccountParams) -> Result<Account, StoreError> {
        let row = client
            .query_one(
                "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3)
                 RETURNING id, owner, balance, currency, created_at",
                &[&args.owner, &args.balance, &args.currency],
            )
            .map_err(map_err)?;
        account_from_row(&row)
    }

    pub fn get_account(client: &mut Client, id: AccountId) -> Result<Account, StoreError> {
        let row = client
            .query_opt(
                "SELECT id, owner, balance, currency, created_at FROM accounts WHERE id = $1",
                &[&id],
            )
            .map_err(map_err)?
            .ok_or(StoreError::AccountNotFound(id))?;
        account_from_row(&row)
    }

    // NO KEY UPDATE leaves the KEY SHARE locks taken by foreign-key checks
    // on concurrent transfer/entry inserts compatible with this lock.
    pub fn get_account_for_update(client: &mut Client, id: AccountId) -> Result<Account, StoreError> {
        let row = client
            .query_opt(
                "SELECT id, owner, balance, currency, created_at FROM accounts
                 WHERE id = $1 LIMIT 1
                 FOR NO KEY UPDATE",
                &[&id],
            )
            .map_err(map_err)?
            .ok_or(StoreError::AccountNotFound(id))?;
        account_from_row(&row)
    }

    pub fn update_account(client: &mut Client, id: AccountId, balance: i64) -> Result<Account, StoreError> {
        let row = client
            .query_opt(
                "UPDATE accounts SET balance = $2 WHERE id = $1
                 RETURNING id, owner, balance, currency, created_at",
                &[&id, &balance],
            )
            .map_err(map_err)?
            .ok_or(StoreError::AccountNotFound(id))?;
        account_from_row(&row)
    }

    pub fn create_transfer(client: &mut Client, from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Result<Transfer, StoreError> {
        let row = client
            .query_one(
                "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3)
                 RETURNING id, from_account_id, to_account_id, amount, created_at",
                &[&from_account_id, &to_account_id, &amount],
            )
            .map_err(map_err)?;
        transfer_from_row(&row)
    }

    pub fn get_transfer(client: &mut Client, id: i64) -> Result<Transfer, StoreError> {
        let row = client
            .query_opt(
                "SELECT id, from_account_id, to_account_id, amount, created_at FROM transfers WHERE id = $1",
                &[&id],
            )
            .map_err(map_err)?
            .ok_or(StoreError::TransferNotFound(id))?;
        transfer_from_row(&row)
    }

    pub fn create_entry(client: &mut Client, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        let row = client
            .query_one(
                "INSERT INTO entries (account_id, amount) VALUES ($1, $2)
                 RETURNING id, account_id, amount, created_at",
                &[&account_id, &amount],
            )
            .map_err(map_err)?;
        entry_from_row(&row)
    }

    pub fn list_entries(client: &mut Client, account_id: AccountId) -> Result<Vec<Entry>, StoreError> {
        client
            .query(
                "SELECT id, account_id, amount, created_at FROM entries WHERE account_id = $1 ORDER BY id",
                &[&account_id],
            )
            .map_err(map_err)?
            .iter()
            .map(entry_from_row)
            .collect()
    }
}

impl Database for PostgresStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn connect(&self) -> Result<Box<dyn Queries + '_>, StoreError> {
        Ok(Box::new(PostgresConnection { client: self.pool.get()? }))
    }

    fn begin(&self, ctx: &TxContext) -> Result<Box<dyn Transaction + '_>, StoreError> {
        ctx.check()?;
        let mut client = self.pool.get()?;
        // A zero lock_timeout disables the limit, so never go below 1ms.
        let wait_ms = ctx.bound(self.lock_timeout).as_millis().max(1);
        if let Err(e) = client.batch_execute(&format!("BEGIN; SET LOCAL lock_timeout = '{}ms'", wait_ms)) {
            client.mark_broken();
            return Err(map_err(e));
        }

        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, label = ctx.label(), "PostgreSQL transaction started");
        Ok(Box::new(PostgresTransaction {
            client,
            id: tx_id,
            ctx: ctx.clone(),
            finished: false,
        }))
    }
}

/// Plain handle in autocommit mode.
pub struct PostgresConnection<'a> {
    client: PooledConnection<'a, Client>,
}

impl Queries for PostgresConnection<'_> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        queries::create_account(&mut self.client, params)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        queries::get_account(&mut self.client, id)
    }

    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError> {
        queries::get_account_for_update(&mut self.client, id)
    }

    fn update_account(&mut self, id: AccountId, balance: i64) -> Result<Account, StoreError> {
        queries::update_account(&mut self.client, id, balance)
    }

    fn create_transfer(&mut self, from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Result<Transfer, StoreError> {
        queries::create_transfer(&mut self.client, from_account_id, to_account_id, amount)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        queries::get_transfer(&mut self.client, id)
    }

    fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        queries::create_entry(&mut self.client, account_id, amount)
    }

    fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<Entry>, StoreError> {
        queries::list_entries(&mut self.client, account_id)
    }
}

pub struct PostgresTransaction<'a> {
    client: PooledConnection<'a, Client>,
    id: TransactionId,
    ctx: TxContext,
    finished: bool,
}

impl PostgresTransaction<'_> {
    fn finish(&mut self, sql: &str) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::NoActiveTransaction);
        }
        self.finished = true;
        let result = self.client.batch_execute(sql).map_err(map_err);
        if result.is_err() {
            // The session state is unknown after a failed COMMIT/ROLLBACK.
            self.client.mark_broken();
        }
        result
    }
}

impl Queries for PostgresTransaction<'_> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        queries::create_account(&mut self.client, params)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        queries::get_account(&mut self.client, id)
    }

    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.ctx.check()?;
        queries::get_account_for_update(&mut self.client, id)
    }

    fn update_account(&mut self, id: AccountId, balance: i64) -> Result<Account, StoreError> {
        queries::update_account(&mut self.client, id, balance)
    }

    fn create_transfer(&mut self, from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Result<Transfer, StoreError> {
        queries::create_transfer(&mut self.client, from_account_id, to_account_id, amount)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        queries::get_transfer(&mut self.client, id)
    }

    fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        queries::create_entry(&mut self.client, account_id, amount)
    }

    fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<Entry>, StoreError> {
        queries::list_entries(&mut self.client, account_id)
    }
}

impl Transaction for PostgresTransaction<'_> {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT")?;
        tracing::debug!(tx_id = self.id, label = self.ctx.label(), "PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK")?;
        tracing::debug!(tx_id = self.id, label = self.ctx.label(), "PostgreSQL transaction rolled back");
        Ok(())
    }
}

impl Drop for PostgresTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(tx_id = self.id, "PostgreSQL transaction dropped while open, rolling back");
            let _ = self.finish("ROLLBACK");
        }
    }
}
