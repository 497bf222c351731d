use bankstore_core::{Account, AccountId, TransferParams, TransferResult, TxContext};

use crate::{
    storage::Queries,
    store::{Store, TxError},
};

/// Progress of one transfer, reported through `tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Started,
    TransferRecorded,
    EntriesRecorded,
    AccountLocked(AccountId),
    BalancesUpdated,
    Committed,
    RolledBack,
}

/// One side of a transfer: the balance change applied to one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Leg {
    account_id: AccountId,
    delta: i64,
}

impl Store {
    /// Moves `params.amount` from one account to another in a single
    /// transaction: records the transfer, one entry per account, and updates
    /// both balances under row locks taken in ascending account id order.
    ///
    /// On success everything is committed; on error nothing is.
    pub fn transfer(&self, params: &TransferParams, ctx: &TxContext) -> Result<TransferResult, TxError> {
        validate(params)?;
        record_stage(ctx, TransferStage::Started);

        let result = self.exec_tx(ctx, |q| transfer_tx(q, params, ctx));

        match &result {
            Ok(done) => tracing::info!(
                label = ctx.label(),
                stage = ?TransferStage::Committed,
                transfer_id = done.transfer.id,
                from_account_id = params.from_account_id,
                to_account_id = params.to_account_id,
                amount = params.amount,
                "Transfer committed"
            ),
            Err(e) => tracing::warn!(
                label = ctx.label(),
                stage = ?TransferStage::RolledBack,
                from_account_id = params.from_account_id,
                to_account_id = params.to_account_id,
                amount = params.amount,
                error = %e,
                retryable = e.is_retryable(),
                "Transfer rolled back"
            ),
        }
        result
    }
}

fn validate(params: &TransferParams) -> Result<(), TxError> {
    if params.amount <= 0 {
        return Err(TxError::Validation(format!(
            "transfer amount must be positive, got {}",
            params.amount
        )));
    }
    if params.from_account_id == params.to_account_id {
        return Err(TxError::Validation(format!(
            "cannot transfer from account {} to itself",
            params.from_account_id
        )));
    }
    Ok(())
}

fn transfer_tx(q: &mut dyn Queries, params: &TransferParams, ctx: &TxContext) -> Result<TransferResult, TxError> {
    ctx.check()?;
    let transfer = q.create_transfer(params.from_account_id, params.to_account_id, params.amount)?;
    record_stage(ctx, TransferStage::TransferRecorded);

    ctx.check()?;
    let from_entry = q.create_entry(params.from_account_id, -params.amount)?;
    let to_entry = q.create_entry(params.to_account_id, params.amount)?;
    record_stage(ctx, TransferStage::EntriesRecorded);

    let [first, second] = lock_order(params);
    let first_account = apply_leg(q, ctx, first)?;
    let second_account = apply_leg(q, ctx, second)?;
    record_stage(ctx, TransferStage::BalancesUpdated);

    let (from_account, to_account) = if first.account_id == params.from_account_id {
        (first_account, second_account)
    } else {
        (second_account, first_account)
    };

    Ok(TransferResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

/// Both legs, lower account id first. Every transfer touching the same pair
/// of accounts locks them in this order regardless of direction, so two
/// transfers can never each hold the lock the other is waiting for.
fn lock_order(params: &TransferParams) -> [Leg; 2] {
    let debit = Leg {
        account_id: params.from_account_id,
        delta: -params.amount,
    };
    let credit = Leg {
        account_id: params.to_account_id,
        delta: params.amount,
    };
    if debit.account_id < credit.account_id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}

// The new balance is computed from the row as read under the lock.
fn apply_leg(q: &mut dyn Queries, ctx: &TxContext, leg: Leg) -> Result<Account, TxError> {
    ctx.check()?;
    let locked = q.get_account_for_update(leg.account_id)?;
    record_stage(ctx, TransferStage::AccountLocked(leg.account_id));

    let balance = locked.balance.checked_add(leg.delta).ok_or_else(|| {
        TxError::Validation(format!("balance of account {} would overflow", leg.account_id))
    })?;
    Ok(q.update_account(leg.account_id, balance)?)
}

fn record_stage(ctx: &TxContext, stage: TransferStage) {
    tracing::debug!(label = ctx.label(), stage = ?stage, "Transfer stage");
}
