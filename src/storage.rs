use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use time::OffsetDateTime;

use bankstore_core::{
    Account, AccountId, CreateAccountParams, Entry, Transfer, TxContext,
};

// Re-export core storage types so backends and callers can use crate::storage::*
pub use bankstore_core::storage::{Database, Queries, StoreError, Transaction, TransactionId};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

// Upper bound on a single condvar wait, so cancellation is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(20);

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    transfers: BTreeMap<i64, Transfer>,
    entries: BTreeMap<i64, Entry>,
    locks: HashMap<AccountId, TransactionId>,
}

/// Uncommitted rows of one transaction, applied in one step on commit.
#[derive(Default)]
struct WriteSet {
    accounts: BTreeMap<AccountId, Account>,
    transfers: Vec<Transfer>,
    entries: Vec<Entry>,
}

/// Process-local store with row-level locking and read-committed visibility.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    released: Condvar,
    account_seq: AtomicI64,
    transfer_seq: AtomicI64,
    entry_seq: AtomicI64,
    tx_counter: AtomicU64,
    lock_timeout: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            released: Condvar::new(),
            account_seq: AtomicI64::new(1),
            transfer_seq: AtomicI64::new(1),
            entry_seq: AtomicI64::new(1),
            tx_counter: AtomicU64::new(1),
            lock_timeout,
        }
    }

    /// Number of row locks currently held by open transactions.
    pub fn held_locks(&self) -> usize {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner).locks.len()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Other("memory store lock poisoned".to_string()))
    }

    fn begin_tx(&self, ctx: TxContext) -> MemoryTransaction<'_> {
        let id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id = id, label = ctx.label(), "Memory transaction started");
        MemoryTransaction {
            store: self,
            id,
            ctx,
            writes: WriteSet::default(),
            held: Vec::new(),
            finished: false,
        }
    }
}

impl Database for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn connect(&self) -> Result<Box<dyn Queries + '_>, StoreError> {
        Ok(Box::new(MemoryConnection { store: self }))
    }

    fn begin(&self, ctx: &TxContext) -> Result<Box<dyn Transaction + '_>, StoreError> {
        ctx.check()?;
        Ok(Box::new(self.begin_tx(ctx.clone())))
    }
}

pub struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    id: TransactionId,
    ctx: TxContext,
    writes: WriteSet,
    held: Vec<AccountId>,
    finished: bool,
}

impl MemoryTransaction<'_> {
    fn visible_account(&self, tables: &Tables, id: AccountId) -> Option<Account> {
        self.writes
            .accounts
            .get(&id)
            .or_else(|| tables.accounts.get(&id))
            .cloned()
    }

    fn read_account(&self, id: AccountId) -> Result<Account, StoreError> {
        let tables = self.store.tables()?;
        self.visible_account(&tables, id)
            .ok_or(StoreError::AccountNotFound(id))
    }

    fn require_account(&self, id: AccountId) -> Result<(), StoreError> {
        let tables = self.store.tables()?;
        match self.visible_account(&tables, id) {
            Some(_) => Ok(()),
            None => Err(StoreError::ConstraintViolation(format!(
                "account {} does not exist",
                id
            ))),
        }
    }

    /// Takes the exclusive row lock on `id`, waiting for the current owner to
    /// finish. Gives up at the store's lock timeout or the context deadline,
    /// whichever comes first, and as soon as the context is cancelled.
    fn lock_row(&mut self, id: AccountId) -> Result<(), StoreError> {
        let started = Instant::now();
        let limit = match self.ctx.deadline() {
            Some(deadline) => deadline.min(started + self.store.lock_timeout),
            None => started + self.store.lock_timeout,
        };
        let mut tables = self.store.tables()?;

        loop {
            self.ctx.check()?;
            if self.visible_account(&tables, id).is_none() {
                return Err(StoreError::AccountNotFound(id));
            }

            match tables.locks.get(&id) {
                Some(owner) if *owner == self.id => return Ok(()),
                Some(owner) => {
                    let now = Instant::now();
                    if now >= limit {
                        tracing::debug!(tx_id = self.id, owner, account_id = id, "Row lock wait timed out");
                        self.ctx.check()?;
                        return Err(StoreError::LockTimeout);
                    }
                    let wait = (limit - now).min(WAIT_SLICE);
                    tables = self
                        .store
                        .released
                        .wait_timeout(tables, wait)
                        .map_err(|_| StoreError::Other("memory store lock poisoned".to_string()))?
                        .0;
                }
                None => {
                    tables.locks.insert(id, self.id);
                    self.held.push(id);
                    tracing::trace!(
                        tx_id = self.id,
                        account_id = id,
                        waited_us = started.elapsed().as_micros() as u64,
                        "Row lock acquired"
                    );
                    return Ok(());
                }
            }
        }
    }

    fn finish(&mut self, commit: bool) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::NoActiveTransaction);
        }
        self.finished = true;

        // A poisoned table still has to give its locks back.
        let mut tables = self.store.tables.lock().unwrap_or_else(PoisonError::into_inner);
        if commit {
            let writes = std::mem::take(&mut self.writes);
            tables.accounts.extend(writes.accounts);
            for transfer in writes.transfers {
                tables.transfers.insert(transfer.id, transfer);
            }
            for entry in writes.entries {
                tables.entries.insert(entry.id, entry);
            }
        }
        for id in self.held.drain(..) {
            tables.locks.remove(&id);
        }
        drop(tables);
        self.store.released.notify_all();

        if commit {
            tracing::debug!(tx_id = self.id, label = self.ctx.label(), "Memory transaction committed");
        } else {
            tracing::debug!(tx_id = self.id, label = self.ctx.label(), "Memory transaction rolled back");
        }
        Ok(())
    }
}

impl Queries for MemoryTransaction<'_> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        if params.balance < 0 {
            return Err(StoreError::ConstraintViolation(
                "account balance must not be negative".to_string(),
            ));
        }
        let account = Account {
            id: self.store.account_seq.fetch_add(1, Ordering::SeqCst),
            owner: params.owner.clone(),
            balance: params.balance,
            currency: params.currency.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.writes.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.read_account(id)
    }

    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.lock_row(id)?;
        self.read_account(id)
    }

    fn update_account(&mut self, id: AccountId, balance: i64) -> Result<Account, StoreError> {
        self.lock_row(id)?;
        let mut account = self.read_account(id)?;
        if balance < 0 {
            return Err(StoreError::ConstraintViolation(format!(
                "balance of account {} must not be negative",
                id
            )));
        }
        account.balance = balance;
        self.writes.accounts.insert(id, account.clone());
        Ok(account)
    }

    fn create_transfer(&mut self, from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Result<Transfer, StoreError> {
        if amount <= 0 {
            return Err(StoreError::ConstraintViolation(
                "transfer amount must be positive".to_string(),
            ));
        }
        self.require_account(from_account_id)?;
        self.require_account(to_account_id)?;

        let transfer = Transfer {
            id: self.store.transfer_seq.fetch_add(1, Ordering::SeqCst),
            from_account_id,
            to_account_id,
            amount,
            created_at: OffsetDateTime::now_utc(),
        };
        self.writes.transfers.push(transfer.clone());
        Ok(transfer)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        if let Some(transfer) = self.writes.transfers.iter().find(|t| t.id == id) {
            return Ok(transfer.clone());
        }
        let tables = self.store.tables()?;
        tables
            .transfers
            .get(&id)
            .cloned()
            .ok_or(StoreError::TransferNotFound(id))
    }

    fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        self.require_account(account_id)?;
        let entry = Entry {
            id: self.store.entry_seq.fetch_add(1, Ordering::SeqCst),
            account_id,
            amount,
            created_at: OffsetDateTime::now_utc(),
        };
        self.writes.entries.push(entry.clone());
        Ok(entry)
    }

    fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<Entry>, StoreError> {
        let tables = self.store.tables()?;
        let mut entries: Vec<Entry> = tables
            .entries
            .values()
            .chain(self.writes.entries.iter())
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish(true)
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.finish(false)
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(tx_id = self.id, "Memory transaction dropped while open, rolling back");
            let _ = self.finish(false);
        }
    }
}

/// Plain handle: every call runs in its own implicit transaction.
pub struct MemoryConnection<'a> {
    store: &'a MemoryStore,
}

impl MemoryConnection<'_> {
    fn autocommit<T>(&self, op: impl FnOnce(&mut MemoryTransaction<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut tx = self.store.begin_tx(TxContext::default());
        match op(&mut tx) {
            Ok(value) => {
                tx.finish(true)?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.finish(false);
                Err(e)
            }
        }
    }
}

impl Queries for MemoryConnection<'_> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError> {
        self.autocommit(|tx| tx.create_account(params))
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.autocommit(|tx| tx.get_account(id))
    }

    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError> {
        self.autocommit(|tx| tx.get_account_for_update(id))
    }

    fn update_account(&mut self, id: AccountId, balance: i64) -> Result<Account, StoreError> {
        self.autocommit(|tx| tx.update_account(id, balance))
    }

    fn create_transfer(&mut self, from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Result<Transfer, StoreError> {
        self.autocommit(|tx| tx.create_transfer(from_account_id, to_account_id, amount))
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError> {
        self.autocommit(|tx| tx.get_transfer(id))
    }

    fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError> {
        self.autocommit(|tx| tx.create_entry(account_id, amount))
    }

    fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<Entry>, StoreError> {
        self.autocommit(|tx| tx.list_entries(account_id))
    }
}
