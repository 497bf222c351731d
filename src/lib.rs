pub mod config;
pub mod logging;
pub mod pool;
pub mod postgres_storage;
pub mod sqlite_storage;
pub mod storage;
pub mod store;
pub mod transfer;

pub use bankstore_core::{
    Account, AccountId, CancelFlag, CreateAccountParams, Entry, Transfer, TransferParams, TransferResult, TxContext,
};
pub use store::{Store, TxError};
pub use transfer::TransferStage;
