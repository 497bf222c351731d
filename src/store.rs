use std::sync::Arc;

use thiserror::Error;

use bankstore_core::TxContext;

use crate::storage::{Database, Queries, StoreError};

#[derive(Debug, Error)]
pub enum TxError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The unit of work failed and so did the rollback that followed.
    #[error("tx err: {source}, rb err: {rollback}")]
    Rollback {
        source: Box<TxError>,
        rollback: StoreError,
    },
}

impl TxError {
    /// Whether a caller may retry the whole operation. A failed rollback is
    /// never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            TxError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Runs units of work inside database transactions. Holds nothing but the
/// shared database handle, so one `Store` can serve any number of threads.
#[derive(Clone)]
pub struct Store {
    db: Arc<dyn Database>,
}

impl Store {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &dyn Database {
        self.db.as_ref()
    }

    /// A plain handle whose statements commit individually.
    pub fn queries(&self) -> Result<Box<dyn Queries + '_>, StoreError> {
        self.db.connect()
    }

    /// Executes `work` exactly once inside a new transaction.
    ///
    /// Commits when `work` succeeds and the context is still live; otherwise
    /// rolls back. A rollback failure is reported together with the error
    /// that caused it. A commit failure is returned as is.
    pub fn exec_tx<T, F>(&self, ctx: &TxContext, work: F) -> Result<T, TxError>
    where
        F: FnOnce(&mut dyn Queries) -> Result<T, TxError>,
    {
        let mut tx = self.db.begin(ctx)?;
        let tx_id = tx.id();

        let outcome = work(tx.queries()).and_then(|value| {
            // Cancellation observed at commit time counts as a failed unit of work.
            ctx.check()?;
            Ok(value)
        });

        match outcome {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(tx_id, label = ctx.label(), error = %err, "Unit of work failed, rolling back");
                match tx.rollback() {
                    Ok(()) => Err(err),
                    Err(rollback) => {
                        tracing::error!(tx_id, label = ctx.label(), error = %err, rollback_error = %rollback, "Rollback failed");
                        Err(TxError::Rollback {
                            source: Box::new(err),
                            rollback,
                        })
                    }
                }
            }
        }
    }
}
