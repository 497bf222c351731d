use crate::{
    context::TxContext,
    models::{
        write::CreateAccountParams,
        Account, AccountId, Entry, Transfer,
    },
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("transfer not found: {0}")]
    TransferNotFound(i64),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("lock wait timeout")]
    LockTimeout,
    #[error("deadlock detected")]
    Deadlock,
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Contention failures that a caller may resolve by retrying the whole call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockTimeout | StoreError::Deadlock)
    }
}

pub type TransactionId = u64;

/// Query capability shared by plain connections and transaction handles.
///
/// On a plain connection every call runs in its own implicit transaction, so
/// the row lock taken by `get_account_for_update` ends with the call. On a
/// transaction handle the lock is held until commit or rollback.
pub trait Queries {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StoreError>;
    fn get_account(&mut self, id: AccountId) -> Result<Account, StoreError>;
    /// Reads an account and takes an exclusive lock on its row.
    fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, StoreError>;
    fn update_account(&mut self, id: AccountId, balance: i64) -> Result<Account, StoreError>;
    fn create_transfer(&mut self, from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Result<Transfer, StoreError>;
    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StoreError>;
    fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry, StoreError>;
    fn list_entries(&mut self, account_id: AccountId) -> Result<Vec<Entry>, StoreError>;
}

/// A transaction-scoped query handle.
///
/// Dropping a handle without calling `commit` or `rollback` rolls it back.
pub trait Transaction: Queries {
    fn id(&self) -> TransactionId;
    fn queries(&mut self) -> &mut dyn Queries;
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

pub trait Database: Send + Sync {
    fn name(&self) -> &'static str;
    fn connect(&self) -> Result<Box<dyn Queries + '_>, StoreError>;
    fn begin(&self, ctx: &TxContext) -> Result<Box<dyn Transaction + '_>, StoreError>;
}
