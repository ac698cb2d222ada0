use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::calendar;
use crate::config::Config;
use crate::db::Ledger;
use crate::models::{Account, Budget, RecurringInterval, Transaction, TransactionType, User};
use crate::scheduler::Scheduler;

pub(crate) async fn as_cli(args: &[String], config: &Config) -> Result<()> {
    match args[1].as_str() {
        "run" => cli_run(&args[2..], config).await,
        "status" => cli_status(&super::open_ledger(config)?).await,
        "add-user" => cli_add_user(&args[2..], &super::open_ledger(config)?).await,
        "add-account" => cli_add_account(&args[2..], &super::open_ledger(config)?).await,
        "add" => cli_add(&args[2..], &super::open_ledger(config)?).await,
        "budget" => cli_budget(&args[2..], &super::open_ledger(config)?).await,
        "accounts" => cli_accounts(&super::open_ledger(config)?).await,
        "transactions" => cli_transactions(&args[2..], &super::open_ledger(config)?).await,
        "verify" => cli_verify(&super::open_ledger(config)?).await,
        "dead-letters" => cli_dead_letters(&super::open_ledger(config)?).await,
        "outbox" => cli_outbox(&args[2..], &super::open_ledger(config)?).await,
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        "--version" | "-V" | "version" => {
            println!("budgetd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => {
            print_usage();
            anyhow::bail!("Unknown command: {other}");
        }
    }
}

fn print_usage() {
    println!("budgetd - recurring transactions, budget alerts and monthly reports");
    println!();
    println!("Usage: budgetd [command]");
    println!();
    println!("Commands:");
    println!("  (none)                        Run the scheduler until Ctrl-C");
    println!("  run recurring                 Materialize every due recurring transaction now");
    println!("  run budgets                   Run one budget alert check now");
    println!("  run reports                   Send last month's reports now");
    println!("  status                        Show due recurring transactions and backlog");
    println!("  add-user <id> <email> [name]  Register a user");
    println!("  add-account <user> <name>     Open an account");
    println!("    --default                   Make it the account budgets watch");
    println!("  add <user> <account> <type> <amount> <category>");
    println!("                                Record INCOME, EXPENSE or TRANSFER");
    println!("    --description <text>        Entry description");
    println!("    --date <YYYY-MM-DD>         Entry date (default: now)");
    println!("    --recurring <interval>      DAILY, WEEKLY, FORTNIGHTLY, MONTHLY or YEARLY");
    println!("  budget <user> <amount>        Set a monthly budget");
    println!("  accounts                      List all accounts");
    println!("  transactions <account>        List an account's entries and recurring templates");
    println!("  verify                        Check every account balance against its entries");
    println!("  dead-letters                  List work that exhausted its retries");
    println!("  outbox [N]                    Show the N most recent notifications (default 20)");
    println!("    --payload                   Include each notification's JSON payload");
    println!("  --help, -h                    Show this help");
    println!("  --version, -V                 Show version");
    println!();
    println!("Environment:");
    println!("  BUDGETD_DB_PATH, BUDGETD_WORKERS, BUDGETD_USER_RATE_LIMIT,");
    println!("  BUDGETD_TASK_TIMEOUT_SECS, BUDGETD_MAX_ATTEMPTS, BUDGETD_ALERT_THRESHOLD,");
    println!("  GEMINI_API_KEY, GEMINI_MODEL, RUST_LOG");
}

async fn cli_run(args: &[String], config: &Config) -> Result<()> {
    let Some(pipeline) = args.first() else {
        anyhow::bail!("Usage: budgetd run <recurring|budgets|reports>");
    };
    let scheduler = Scheduler::from_config(config, super::open_ledger(config)?)?;

    match pipeline.as_str() {
        "recurring" => {
            let (dispatched, summary) = scheduler.run_recurring_once().await?;
            println!(
                "Dispatched {dispatched}: {} recorded, {} skipped, {} dead-lettered",
                summary.processed, summary.skipped, summary.dead_lettered
            );
        }
        "budgets" => {
            let summary = scheduler.run_budgets_once().await?;
            println!(
                "Checked {} budgets: {} alerts sent, {} failed",
                summary.checked, summary.alerted, summary.failed
            );
        }
        "reports" => {
            let summary = scheduler.run_reports_once().await?;
            println!("Reports sent: {}, failed: {}", summary.sent, summary.failed);
        }
        other => anyhow::bail!("Unknown pipeline: {other} (expected recurring, budgets or reports)"),
    }
    Ok(())
}

async fn cli_verify(ledger: &Ledger) -> Result<()> {
    let rows = ledger
        .call(|db| {
            let mut rows = Vec::new();
            for account in db.get_accounts()? {
                let Some(id) = account.id else { continue };
                rows.push((id, account.user_id, account.name, account.balance, db.ledger_drift(id)?));
            }
            Ok(rows)
        })
        .await?;

    if rows.is_empty() {
        println!("No accounts");
        return Ok(());
    }

    println!("{:<6} {:<20} {:<20} {:>14} {:>12}", "ID", "User", "Account", "Balance", "Drift");
    println!("{}", "─".repeat(76));
    let mut drifted = 0;
    for (id, user_id, name, balance, drift) in &rows {
        if *drift != Decimal::ZERO {
            drifted += 1;
        }
        println!("{id:<6} {user_id:<20} {name:<20} {balance:>14.2} {drift:>12.2}");
    }

    if drifted > 0 {
        anyhow::bail!("{drifted} account(s) out of balance");
    }
    println!();
    println!("All {} accounts balanced", rows.len());
    Ok(())
}

async fn cli_dead_letters(ledger: &Ledger) -> Result<()> {
    let letters = ledger.call(|db| db.list_dead_letters()).await?;
    if letters.is_empty() {
        println!("No dead letters");
        return Ok(());
    }
    for letter in &letters {
        println!(
            "#{} {} after {} attempt(s): {}",
            letter.id, letter.failed_at, letter.attempts, letter.error
        );
        println!("    {}", letter.task);
    }
    Ok(())
}

async fn cli_outbox(args: &[String], ledger: &Ledger) -> Result<()> {
    let show_payload = args.iter().any(|a| a == "--payload");
    let limit: u32 = match args.iter().find(|a| !a.starts_with("--")) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid count: {raw}"))?,
        None => 20,
    };
    let records = ledger.call(move |db| db.list_notifications(limit)).await?;
    if records.is_empty() {
        println!("Outbox is empty");
        return Ok(());
    }
    for record in &records {
        println!(
            "#{} {} [{}] to {}: {}",
            record.id, record.created_at, record.kind, record.recipient, record.subject
        );
        if show_payload {
            println!("    {}", record.payload);
        }
    }
    Ok(())
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == name).map(|w| w[1].as_str())
}

fn parse_amount(raw: &str) -> Result<Decimal> {
    let amount = Decimal::from_str(raw).with_context(|| format!("Invalid amount: {raw}"))?;
    if amount <= Decimal::ZERO {
        anyhow::bail!("Amount must be positive: {raw}");
    }
    Ok(amount)
}

async fn cli_status(ledger: &Ledger) -> Result<()> {
    let now = Utc::now();
    let (due, accounts, dead) = ledger
        .call(move |db| {
            Ok((
                db.count_due_recurring(now)?,
                db.get_accounts()?.len(),
                db.list_dead_letters()?.len(),
            ))
        })
        .await?;
    println!("Accounts:               {accounts}");
    println!("Recurring due now:      {due}");
    println!("Dead letters:           {dead}");
    Ok(())
}

async fn cli_add_user(args: &[String], ledger: &Ledger) -> Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: budgetd add-user <id> <email> [name]");
    }
    let user = User::new(args[0].clone(), args[1].clone(), args.get(2).cloned());
    let id = user.id.clone();
    ledger.call(move |db| db.insert_user(&user)).await?;
    println!("Added user {id}");
    Ok(())
}

async fn cli_add_account(args: &[String], ledger: &Ledger) -> Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: budgetd add-account <user> <name> [--default]");
    }
    let is_default = args.iter().any(|a| a == "--default");
    let account = Account::new(args[0].clone(), args[1].clone(), is_default);
    let id = ledger.call(move |db| db.insert_account(&account)).await?;
    println!("Added account {id}");
    Ok(())
}

async fn cli_add(args: &[String], ledger: &Ledger) -> Result<()> {
    if args.len() < 5 {
        anyhow::bail!(
            "Usage: budgetd add <user> <account> <type> <amount> <category> \
             [--description <text>] [--date <YYYY-MM-DD>] [--recurring <interval>]"
        );
    }
    let account_id: i64 = args[1]
        .parse()
        .with_context(|| format!("Invalid account id: {}", args[1]))?;
    let txn_type = TransactionType::from_str(&args[2].to_uppercase())?;
    let amount = parse_amount(&args[3])?;

    let date = match flag(args, "--date") {
        Some(raw) => {
            let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .with_context(|| format!("Invalid date: {raw} (expected YYYY-MM-DD)"))?;
            calendar::local_midnight(day)
        }
        None => Utc::now(),
    };

    let mut txn = Transaction::new(
        args[0].clone(),
        account_id,
        txn_type,
        amount,
        args[4].clone(),
        date,
    );
    if let Some(description) = flag(args, "--description") {
        txn = txn.with_description(description);
    }
    if let Some(raw) = flag(args, "--recurring") {
        let interval = RecurringInterval::from_str(&raw.to_uppercase()).with_context(|| {
            let names: Vec<&str> = RecurringInterval::all().iter().map(|i| i.as_str()).collect();
            format!("Expected one of {}", names.join(", "))
        })?;
        txn = txn.recurring(interval);
    }

    let id = ledger.call(move |db| db.record_transaction(&txn)).await?;
    println!("Recorded transaction {id}");
    Ok(())
}

async fn cli_budget(args: &[String], ledger: &Ledger) -> Result<()> {
    if args.len() < 2 {
        anyhow::bail!("Usage: budgetd budget <user> <amount>");
    }
    let budget = Budget::new(args[0].clone(), parse_amount(&args[1])?);
    let id = ledger.call(move |db| db.upsert_budget(&budget)).await?;
    println!("Budget {id} set to {}", args[1]);
    Ok(())
}

async fn cli_transactions(args: &[String], ledger: &Ledger) -> Result<()> {
    let Some(raw) = args.first() else {
        anyhow::bail!("Usage: budgetd transactions <account>");
    };
    let account_id: i64 = raw
        .parse()
        .with_context(|| format!("Invalid account id: {raw}"))?;
    let txns = ledger
        .call(move |db| db.get_account_transactions(account_id))
        .await?;
    if txns.is_empty() {
        println!("No transactions for account {account_id}");
        return Ok(());
    }

    println!(
        "{:<6} {:<10} {:<8} {:>12} {:<14} {:<24} Next",
        "ID", "Date", "Type", "Amount", "Category", "Description"
    );
    println!("{}", "─".repeat(92));
    for txn in &txns {
        let next = match (txn.recurring_interval, txn.next_recurring_date) {
            (Some(interval), Some(next)) => format!("{interval} {}", next.format("%Y-%m-%d")),
            (Some(interval), None) => interval.to_string(),
            _ => String::new(),
        };
        println!(
            "{:<6} {:<10} {:<8} {:>12.2} {:<14} {:<24} {}",
            txn.id.unwrap_or(0),
            txn.date.format("%Y-%m-%d"),
            txn.txn_type.as_str(),
            txn.amount,
            txn.category,
            txn.description,
            next
        );
    }
    Ok(())
}

async fn cli_accounts(ledger: &Ledger) -> Result<()> {
    let accounts = ledger.call(|db| db.get_accounts()).await?;
    if accounts.is_empty() {
        println!("No accounts");
        return Ok(());
    }

    println!("{:<4} {:<20} {:<20} {:>14} Default", "ID", "User", "Name", "Balance");
    println!("{}", "─".repeat(68));
    for acct in &accounts {
        println!(
            "{:<4} {:<20} {:<20} {:>14.2} {}",
            acct.id.unwrap_or(0),
            acct.user_id,
            acct.name,
            acct.balance,
            if acct.is_default { "yes" } else { "" }
        );
    }
    Ok(())
}
