use serde::{Deserialize, Serialize};

use super::AccountId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

impl TransferParams {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }
}
