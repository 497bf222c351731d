//! Core types and traits for BankStore storage backends.
//!
//! This crate provides the `Queries` capability trait, the `Database` and
//! `Transaction` traits and all associated types, enabling pluggable storage
//! implementations in the root crate.

pub mod context;
pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use context::{CancelFlag, TxContext};
pub use models::{entries_table, Account, AccountId, Entry, Transfer, TransferResult};
pub use models::write::{CreateAccountParams, TransferParams};
pub use storage::{Database, Queries, StoreError, Transaction, TransactionId};
