use std::{process::ExitCode, sync::Arc, time::{Duration, Instant}};

use bankstore::{
    config::{CliArgs, Command, Config},
    logging,
    storage::StoreError,
    CreateAccountParams, Store, TransferParams, TxContext, TxError,
};
use bankstore_core::entries_table;
use clap::Parser;
use prettytable::{row, Table};
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
struct StressReport {
    backend: &'static str,
    attempted: usize,
    committed: usize,
    retryable_failures: usize,
    other_failures: usize,
    elapsed_ms: u128,
    from_balance: i64,
    to_balance: i64,
}

impl std::fmt::Display for StressReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Backend", "Attempted", "Committed", "Retryable", "Failed", "Elapsed (ms)", "From", "To"]);
        table.add_empty_row();
        table.add_row(row![
            self.backend,
            self.attempted,
            self.committed,
            self.retryable_failures,
            self.other_failures,
            self.elapsed_ms,
            self.from_balance,
            self.to_balance
        ]);
        write!(f, "\n{}\n", table)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    logging::init_logging(&config.logging);

    let db = match config.open_database() {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let store = Store::new(db);

    match run(store, cli.command, cli.json).await {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(store: Store, command: Command, json: bool) -> Result<String, TxError> {
    match command {
        Command::CreateAccount { owner, balance, currency } => {
            let account = store.queries()?.create_account(&CreateAccountParams { owner, balance, currency })?;
            tracing::info!(account_id = account.id, "Account created");
            render(&account, json)
        }
        Command::Account { id } => {
            let account = store.queries()?.get_account(id)?;
            render(&account, json)
        }
        Command::Entries { account_id } => {
            let entries = store.queries()?.list_entries(account_id)?;
            if json {
                to_json(&entries)
            } else {
                Ok(entries_table(&entries))
            }
        }
        Command::Transfer { from, to, amount, label, timeout_ms } => {
            let mut ctx = TxContext::new();
            if let Some(label) = label {
                ctx = ctx.with_label(label);
            }
            if let Some(ms) = timeout_ms {
                ctx = ctx.with_timeout(Duration::from_millis(ms));
            }
            let result = store.transfer(&TransferParams::new(from, to, amount), &ctx)?;
            render(&result, json)
        }
        Command::Stress { from, to, amount, workers, per_worker, alternate } => {
            let report = stress(store, TransferParams::new(from, to, amount), workers, per_worker, alternate).await?;
            render(&report, json)
        }
    }
}

/// Fires `workers * per_worker` transfers from blocking worker threads and
/// reports how many committed.
async fn stress(
    store: Store,
    params: TransferParams,
    workers: usize,
    per_worker: usize,
    alternate: bool,
) -> Result<StressReport, TxError> {
    let started = Instant::now();
    let store = Arc::new(store);
    let mut handles = Vec::with_capacity(workers);

    for worker in 0..workers {
        let store = store.clone();
        let params = if alternate && worker % 2 == 1 {
            TransferParams::new(params.to_account_id, params.from_account_id, params.amount)
        } else {
            params
        };
        handles.push(tokio::task::spawn_blocking(move || {
            let mut outcome = StressReport::default();
            for round in 0..per_worker {
                let ctx = TxContext::new().with_label(format!("stress-{}-{}", worker, round));
                outcome.attempted += 1;
                match store.transfer(&params, &ctx) {
                    Ok(_) => outcome.committed += 1,
                    Err(e) if e.is_retryable() => outcome.retryable_failures += 1,
                    Err(_) => outcome.other_failures += 1,
                }
            }
            outcome
        }));
    }

    let mut report = StressReport {
        backend: store.database().name(),
        ..StressReport::default()
    };
    for handle in handles {
        let outcome = handle
            .await
            .map_err(|e| TxError::Store(StoreError::Other(format!("stress worker failed: {}", e))))?;
        report.attempted += outcome.attempted;
        report.committed += outcome.committed;
        report.retryable_failures += outcome.retryable_failures;
        report.other_failures += outcome.other_failures;
    }

    let mut q = store.queries()?;
    report.from_balance = q.get_account(params.from_account_id)?.balance;
    report.to_balance = q.get_account(params.to_account_id)?.balance;
    report.elapsed_ms = started.elapsed().as_millis();
    Ok(report)
}

fn render<T: Serialize + std::fmt::Display>(value: &T, json: bool) -> Result<String, TxError> {
    if json {
        to_json(value)
    } else {
        Ok(value.to_string())
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, TxError> {
    serde_json::to_string_pretty(value).map_err(|e| TxError::Store(StoreError::Other(e.to_string())))
}
