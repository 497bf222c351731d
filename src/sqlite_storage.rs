use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use time::OffsetDateTime;

use bankstore_core::{Account, AccountId, CreateAccountParams, Entry, Transfer, TxContext};

use crate::{
    pool::{Pool, PoolOptions, PooledConnection},
    storage::{Database, Queries, StoreError, Transaction, TransactionId, DEFAULT_LOCK_TIMEOUT},
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner TEXT NOT NULL,
        balance INTEGER NOT NULL CHECK (balance >= 0),
        currency TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL,
        amount INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (account_id) REFERENCES accounts(id)
    );

    CREATE TABLE IF NOT EXISTS transfers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_account_id INTEGER NOT NULL,
        to_account_id INTEGER NOT NULL,
        amount INTEGER NOT NULL CHECK (amount > 0),
        created_at INTEGER NOT NULL,
        FOREIGN KEY (from_account_id) REFERENCES accounts(id),
        FOREIGN KEY (to_account_id) REFERENCES accounts(id)
    );

    CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner);
    CREATE INDEX IF NOT EXISTS idx_entries_account ON entries(account_id);
    CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers(from_account_id);
    CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers(to_account_id);
    CREATE INDEX IF NOT EXISTS idx_transfers_pair ON transfers(from_account_id, to_account_id);
";

/// SQLite backend. Transactions start with `BEGIN IMMEDIATE`, which takes the
/// database write lock up front; that lock stands in for row locks, so
/// `get_account_for_update` is a plain read inside such a transaction.
pub struct SqliteStore {
    pool: Pool<Connection>,
    lock_timeout: Duration,
    tx_counter: AtomicU64,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        Self::with_options(path, DEFAULT_LOCK_TIMEOUT, PoolOptions::default())
    }

    pub fn with_options(path: &str, lock_timeout: Duration, pool: PoolOptions) -> Result<Self, StoreError> {
        if path == ":memory:" {
            // Every pooled connection would see its own private database.
            return Err(StoreError::Other(
                "the sqlite backend needs a database file; use the memory backend instead".to_string(),
            ));
        }

        let db_path = path.to_string();
        let pool = Pool::new(pool, move || open_connection(&db_path, lock_timeout));

        pool.get()?
            .execute_batch(SCHEMA)
            .map_err(map_err)?;

        Ok(Self {
            pool,
            lock_timeout,
            tx_counter: AtomicU64::new(1),
        })
    }
}

fn open_connection(path: &str, lock_timeout: Duration) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).map_err(|e| StoreError::Connection(e.to_string()))?;
    conn.busy_timeout(lock_timeout).map_err(map_err)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        .map_err(map_err)?;
    Ok(conn)
}

fn map_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg) => match err.code {
            ErrorCode::ConstraintViolation => {
                StoreError::ConstraintViolation(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::LockTimeout,
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => StoreError::Connection(e.to_string()),
            _ => StoreError::Other(e.to_string()),
        },
        _ => StoreError::Other(e.to_string()),
    }
}

fn timestamp(row: &Row, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let secs: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
    })
}

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        owner: row.get(1)?,
        balance: row.get(2)?,
        currency: row.get(3)?,
        created_at: timestamp(row, 4)?,
    })
}

fn transfer_from_row(row: &Row) -> rusqlite::Result<Transfer> {
    Ok(Transfer {
        id: row.get(0)?,
        from_account_id: row.get(1)?,
        to_account_id: row.get(2)?,
        amount: row.get(3)?,
        created_at: timestamp(row, 4)?,
    })
}

fn entry_from_row(row: &Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        created_at: timestamp(row, 3)?,
    })
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

mod queries {
    use super::*;

    pub fn create_account(conn: &Connection, args: &CreateAccountParams) -> Result<Account, StoreError> {
        conn.query_row(
            "INSERT INTO accounts (owner, balance, currency, created_at) VALUES (?1, ?2, ?3, ?4)
             RETURNING id, owner, balance, currency, created_at",
            params![args.owner, args.balance, args.currency, now()],
            account_from_row,
        )
        .map_err(map_err)
    }

    pub fn get_account(conn: &Connection, id: AccountId) -> Result<Account, StoreError> {
        conn.query_row(
            "SELECT id, owner, balance, currency, created_at FROM accounts WHERE id = ?1",
            params![id],
            account_from_row,
        )
        .optional()
        .map_err(map_err)?
        .ok_or(StoreError::AccountNotFound(id))
    }

    pub fn update_account(conn: &Connection, id: AccountId, balance: i64) -> Result<Account, StoreError> {
        conn.query_row(
            "UPDATE accounts SET balance = ?2 WHERE id = ?1
             RETURNING id, owner, balance, currency, created_at",
            params![id, balance],
            account_from_row,
        )
        .optional()
        .map_err(map_err)?
        .ok_or(StoreError::AccountNotFound(id))
    }

    pub fn create_transfer(conn: &Connection, from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Result<Transfer, StoreError> {
        conn.query_row(
            "INSERT INTO transfers (from_account_id, to_account_id, amount, created_at) VALUES (?1, ?2, ?3, ?4)
             RETURNING id, from_account_id, to_account_id, amount, created_at",
            params![from_account_id, to_account_id, amount, now()],
            transfer_from_row,
        )
        .map_err(map_err)
    }

    pub fn get_transfer(conn: &Connection, id: i64) -> Result<Transfer, StoreError> {
        conn.query_row(
            "SELECT id, from_account_id, to_account_id, amount, created_at FROM transfers WHERE id = ?1",
            params![id],
            transfer_from_row,
        )
        .optional()
        .map_err(map_err)?
        .ok_or(StoreError::TransferNotFound(id))
    }

    pub fn create_entry(conn: &Connection, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        conn.query_row(
            "INSERT INTO entries (account_id, amount, created_at) VALUES (?1, ?2, ?3)
             RETURNING id, account_id, amount, created_at",
            params![account_id, amount, now()],
            entry_from_row,
        )
        .map_err(map_err)
    }

    pub fn list_entries(conn: &Connection, account_id: AccountId) -> Result<Vec<Entry>, StoreError> {
        let mut stmt = conn
            .prepare("SELECT id, account_id, amount, created_at FROM entries WHERE account_id = ?1 ORDER BY id")
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![account_id], entry_from_row)
            .map_err(map_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_err)
    }
}

impl Database for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn connect(&self) -> Result<Box<dyn Queries + '_>, StoreError> {
        Ok(Box::new(SqliteConnection { conn: self.pool.get()? }))
    }

    fn begin(&self, ctx: &TxContext) -> Result<Box<dyn Transaction + '_>, StoreError> {
        ctx.check()?;
        let conn = self.pool.get()?;
        conn.busy_timeout(ctx.bound(self.lock_timeout)).map_err(map_err)?;
        let begun = conn.execute_batch("BEGIN IMMEDIATE").map_err(map_err);
        // Restore the store-wide wait for the connection's next user.
        conn.busy_timeout(self.lock_timeout).map_err(map_err)?;
        if let Err(e) = begun {
            ctx.check()?;
            return Err(e);
        }

        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, label = ctx.label(), "SQLite transaction started");
        Ok(Box::new(SqliteTransaction {
            conn,
            id: tx_id,
            ctx: ctx.clone(),
            finished: false,
        }))
    }
}

/// Plain handle in autocommit mode.
pub struct SqliteConnection<'a> {
    conn: PooledConnection<'a, Connection>,
}

impl Queries for SqliteConnection<'_> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        queries::create_account(&self.conn, params)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        queries::get_account(&self.conn, id)
    }

    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError> {
        queries::get_account(&self.conn, id)
    }

    fn update_account(&mut self, id: AccountId, balance: i64) -> Result<Account, StoreError> {
        queries::update_account(&self.conn, id, balance)
    }

    fn create_transfer(&mut self, from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Result<Transfer, StoreError> {
        queries::create_transfer(&self.conn, from_account_id, to_account_id, amount)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        queries::get_transfer(&self.conn, id)
    }

    fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        queries::create_entry(&self.conn, account_id, amount)
    }

    fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<Entry>, StoreError> {
        queries::list_entries(&self.conn, account_id)
    }
}

pub struct SqliteTransaction<'a> {
    conn: PooledConnection<'a, Connection>,
    id: TransactionId,
    ctx: TxContext,
    finished: bool,
}

impl SqliteTransaction<'_> {
    fn finish(&mut self, sql: &str) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::NoActiveTransaction);
        }
        self.finished = true;
        let result = self.conn.execute_batch(sql).map_err(map_err);
        if result.is_err() && !self.conn.is_autocommit() {
            // Still inside the transaction: try to end it, else drop the connection.
            if self.conn.execute_batch("ROLLBACK").is_err() {
                self.conn.mark_broken();
            }
        }
        result
    }
}

impl Queries for SqliteTransaction<'_> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        queries::create_account(&self.conn, params)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        queries::get_account(&self.conn, id)
    }

    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.ctx.check()?;
        queries::get_account(&self.conn, id)
    }

    fn update_account(&mut self, id: AccountId, balance: i64) -> Result<Account, StoreError> {
        queries::update_account(&self.conn, id, balance)
    }

    fn create_transfer(&mut self, from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Result<Transfer, StoreError> {
        queries::create_transfer(&self.conn, from_account_id, to_account_id, amount)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        queries::get_transfer(&self.conn, id)
    }

    fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        queries::create_entry(&self.conn, account_id, amount)
    }

    fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<Entry>, StoreError> {
        queries::list_entries(&self.conn, account_id)
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT")?;
        tracing::debug!(tx_id = self.id, label = self.ctx.label(), "SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK")?;
        tracing::debug!(tx_id = self.id, label = self.ctx.label(), "SQLite transaction rolled back");
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(tx_id = self.id, "SQLite transaction dropped while open, rolling back");
            let _ = self.finish("ROLLBACK");
        }
    }
}
