use std::fmt::Display;

use prettytable::{row, Table};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod write;

pub type AccountId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub balance: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A signed balance delta attributed to one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub account_id: AccountId,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Everything one committed transfer produced. The accounts carry the
/// balances as written by that transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

impl Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Id", "Owner", "Balance", "Currency", "Created"]);
        table.add_empty_row();
        table.add_row(row![self.id, self.owner, self.balance, self.currency, self.created_at]);

        write!(f, "\n{}\n", table)
    }
}

impl Display for TransferResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Transfer", "From", "To", "Amount"]);
        table.add_empty_row();
        table.add_row(row![
            self.transfer.id,
            self.transfer.from_account_id,
            self.transfer.to_account_id,
            self.transfer.amount
        ]);

        let mut accounts = Table::new();
        accounts.add_row(row!["Account", "Entry", "Delta", "Balance"]);
        accounts.add_empty_row();
        accounts.add_row(row![
            self.from_account.id,
            self.from_entry.id,
            self.from_entry.amount,
            self.from_account.balance
        ]);
        accounts.add_row(row![
            self.to_account.id,
            self.to_entry.id,
            self.to_entry.amount,
            self.to_account.balance
        ]);

        write!(f, "\n{}\n{}\n", table, accounts)
    }
}

/// Renders a list of entries as a statement-style table.
pub fn entries_table(entries: &[Entry]) -> String {
    let mut table = Table::new();
    table.add_row(row!["Entry", "Account", "Amount", "Created"]);
    table.add_empty_row();

    for entry in entries {
        table.add_row(row![entry.id, entry.account_id, entry.amount, entry.created_at]);
    }

    format!("\n{}\n", table)
}
