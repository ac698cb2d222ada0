mod schema;
mod shared;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

use crate::calendar::{self, DateRange};
use crate::models::*;

pub(crate) use shared::Ledger;

/// Result of the atomic occurrence write.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Materialization {
    /// The entry was created, the balance moved and the schedule advanced.
    Created {
        entry_id: i64,
        account_id: i64,
        new_balance: Decimal,
        next_recurring_date: DateTime<Utc>,
    },
    /// The template no longer exists for this user.
    Missing,
    /// Another delivery already advanced the schedule, or the template was
    /// switched off. Nothing was written.
    Stale,
    /// The template is recurring but carries no interval.
    NoInterval,
}

pub(crate) struct Database {
    conn: Connection,
}

impl Database {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("Failed to set database pragmas")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let mut db = Self { conn };
        db.migrate().context("Database migration failed")?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let mut db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&mut self) -> Result<()> {
        let has_version_table: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            [],
            |row| row.get(0),
        )?;

        if !has_version_table {
            self.conn.execute_batch(schema::SCHEMA_V1)?;
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![schema::CURRENT_VERSION],
            )?;
            return Ok(());
        }

        let current: i32 = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        for &(from_version, sql) in schema::MIGRATIONS {
            if current <= from_version {
                self.conn.execute_batch(sql)?;
            }
        }

        if current < schema::CURRENT_VERSION {
            self.conn.execute(
                "UPDATE schema_version SET version = ?1",
                params![schema::CURRENT_VERSION],
            )?;
        }

        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────

    pub(crate) fn insert_user(&self, user: &User) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, email, name) VALUES (?1, ?2, ?3)",
            params![user.id, user.email, user.name],
        )?;
        Ok(())
    }

    pub(crate) fn get_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, email, name FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(User {
                id: row.get(0)?,
                email: row.get(1)?,
                name: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // ── Accounts ──────────────────────────────────────────────

    pub(crate) fn insert_account(&self, account: &Account) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO accounts (user_id, name, balance, is_default, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                account.user_id,
                account.name,
                account.balance.to_string(),
                account.is_default,
                account.created_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub(crate) fn get_accounts(&self) -> Result<Vec<Account>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, name, balance, is_default, created_at FROM accounts ORDER BY id",
        )?;
        let rows = stmt.query_map([], account_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub(crate) fn get_account_by_id(&self, id: i64) -> Result<Option<Account>> {
        let result = self.conn.query_row(
            "SELECT id, user_id, name, balance, is_default, created_at FROM accounts WHERE id = ?1",
            params![id],
            account_from_row,
        );
        match result {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── Transactions ──────────────────────────────────────────

    /// Records a user-entered transaction and moves the account balance in
    /// one commit. Recurring entries get their first `next_recurring_date`
    /// from the entry date.
    pub(crate) fn record_transaction(&mut self, txn: &Transaction) -> Result<i64> {
        let mut txn = txn.clone();
        txn.next_recurring_date = match (txn.is_recurring, txn.recurring_interval) {
            (true, Some(interval)) => Some(calendar::next_occurrence(txn.date, interval)),
            _ => None,
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let owned = tx
            .query_row(
                "SELECT 1 FROM accounts WHERE id = ?1 AND user_id = ?2",
                params![txn.account_id, txn.user_id],
                |_| Ok(()),
            )
            .optional()?;
        if owned.is_none() {
            return Err(anyhow!("Account not found: {}", txn.account_id));
        }
        let id = insert_transaction_in(&tx, &txn)?;
        apply_balance_change(&tx, txn.account_id, txn.signed_amount())?;
        tx.commit()?;
        Ok(id)
    }

    pub(crate) fn get_transaction(&self, id: i64, user_id: &str) -> Result<Option<Transaction>> {
        load_transaction(&self.conn, id, user_id)
    }

    pub(crate) fn get_account_transactions(&self, account_id: i64) -> Result<Vec<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE account_id = ?1 ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_id], transaction_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// One page of due recurring templates, ordered by id, strictly after
    /// `after_id`.
    pub(crate) fn find_due_recurring_page(
        &self,
        now: DateTime<Utc>,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<DueItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id FROM transactions
             WHERE is_recurring = 1
               AND status = 'COMPLETED'
               AND (last_processed IS NULL OR next_recurring_date <= ?1)
               AND id > ?2
             ORDER BY id
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![ts_to_sql(&now), after_id, limit as i64],
            |row| {
                Ok(DueItem {
                    transaction_id: row.get(0)?,
                    user_id: row.get(1)?,
                })
            },
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub(crate) fn count_due_recurring(&self, now: DateTime<Utc>) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM transactions
             WHERE is_recurring = 1
               AND status = 'COMPLETED'
               AND (last_processed IS NULL OR next_recurring_date <= ?1)",
            params![ts_to_sql(&now)],
            |row| row.get(0),
        )?)
    }

    /// Materializes one occurrence of a recurring template.
    ///
    /// The schedule advance, the new entry and the balance change share one
    /// `BEGIN IMMEDIATE` transaction. The due check is repeated as a
    /// conditional update under the write lock, so two deliveries of the same
    /// task can never both create an entry.
    pub(crate) fn materialize_occurrence(
        &mut self,
        id: i64,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Materialization> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(template) = load_transaction(&tx, id, user_id)? else {
            return Ok(Materialization::Missing);
        };
        if !template.is_recurring || template.status != TransactionStatus::Completed {
            return Ok(Materialization::Stale);
        }
        let Some(next) = template.next_after(now) else {
            return Ok(Materialization::NoInterval);
        };

        let now_sql = ts_to_sql(&now);
        let advanced = tx.execute(
            "UPDATE transactions
             SET last_processed = ?1, next_recurring_date = ?2
             WHERE id = ?3 AND user_id = ?4
               AND (last_processed IS NULL OR next_recurring_date <= ?1)",
            params![now_sql, ts_to_sql(&next), id, user_id],
        )?;
        if advanced == 0 {
            return Ok(Materialization::Stale);
        }

        let entry = template.occurrence(now);
        let entry_id = insert_transaction_in(&tx, &entry)?;
        let new_balance = apply_balance_change(&tx, entry.account_id, entry.signed_amount())?;
        tx.commit()?;

        Ok(Materialization::Created {
            entry_id,
            account_id: entry.account_id,
            new_balance,
            next_recurring_date: next,
        })
    }

    // ── Budgets ───────────────────────────────────────────────

    /// Creates the user's budget, or replaces the amount of the existing one.
    /// The alert timestamp of an existing budget is kept.
    pub(crate) fn upsert_budget(&self, budget: &Budget) -> Result<i64> {
        Ok(self.conn.query_row(
            "INSERT INTO budgets (user_id, amount, last_alert_sent) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET amount = excluded.amount
             RETURNING id",
            params![
                budget.user_id,
                budget.amount.map(|a| a.to_string()),
                budget.last_alert_sent.as_ref().map(ts_to_sql),
            ],
            |row| row.get(0),
        )?)
    }

    #[cfg(test)]
    pub(crate) fn get_budget(&self, id: i64) -> Result<Option<Budget>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, user_id, amount, last_alert_sent FROM budgets WHERE id = ?1",
                params![id],
                budget_from_row,
            )
            .optional()?)
    }

    /// Budgets whose owner has a default account, joined with that account
    /// and the owner's contact details. Others are not monitored.
    pub(crate) fn budgets_with_default_account(&self) -> Result<Vec<BudgetTarget>> {
        let mut stmt = self.conn.prepare(
            "SELECT b.id, b.user_id, b.amount, b.last_alert_sent, a.id, a.name, u.email, u.name
             FROM budgets b
             JOIN users u ON u.id = b.user_id
             JOIN accounts a ON a.id = (
                 SELECT MIN(id) FROM accounts WHERE user_id = b.user_id AND is_default = 1
             )
             ORDER BY b.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BudgetTarget {
                budget: budget_from_row(row)?,
                account_id: row.get(4)?,
                account_name: row.get(5)?,
                email: row.get(6)?,
                user_name: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub(crate) fn update_budget_alert_timestamp(
        &self,
        budget_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE budgets SET last_alert_sent = ?1 WHERE id = ?2",
            params![ts_to_sql(&at), budget_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("Budget {budget_id} not found"));
        }
        Ok(())
    }

    // ── Analytics ─────────────────────────────────────────────

    /// Sum of EXPENSE amounts on one account within `range`.
    pub(crate) fn aggregate_expenses(&self, account_id: i64, range: DateRange) -> Result<Decimal> {
        let mut stmt = self.conn.prepare(
            "SELECT amount FROM transactions
             WHERE account_id = ?1 AND type = 'EXPENSE' AND date >= ?2 AND date < ?3",
        )?;
        let mut rows = stmt.query(params![
            account_id,
            ts_to_sql(&range.start),
            ts_to_sql(&range.end)
        ])?;
        let mut total = Decimal::ZERO;
        while let Some(row) = rows.next()? {
            total += decimal_at(row, 0)?;
        }
        Ok(total)
    }

    /// Income, expenses and per-category expenses for one user within `range`.
    pub(crate) fn aggregate_monthly(&self, user_id: &str, range: DateRange) -> Result<MonthlyStats> {
        let mut stmt = self.conn.prepare(
            "SELECT type, amount, category FROM transactions
             WHERE user_id = ?1 AND date >= ?2 AND date < ?3",
        )?;
        let mut rows = stmt.query(params![
            user_id,
            ts_to_sql(&range.start),
            ts_to_sql(&range.end)
        ])?;
        let mut stats = MonthlyStats::default();
        while let Some(row) = rows.next()? {
            let txn_type: TransactionType = parse_at(row, 0)?;
            let amount = decimal_at(row, 1)?;
            match txn_type {
                TransactionType::Income => stats.add_income(amount),
                TransactionType::Expense => {
                    let category: String = row.get(2)?;
                    stats.add_expense(&category, amount);
                }
                TransactionType::Transfer => {}
            }
        }
        Ok(stats)
    }

    /// Stored balance minus the signed sum of the account's entries.
    pub(crate) fn ledger_drift(&self, account_id: i64) -> Result<Decimal> {
        let account = self
            .get_account_by_id(account_id)?
            .ok_or_else(|| anyhow!("Account {account_id} not found"))?;
        let mut stmt = self
            .conn
            .prepare("SELECT type, amount FROM transactions WHERE account_id = ?1")?;
        let mut rows = stmt.query(params![account_id])?;
        let mut sum = Decimal::ZERO;
        while let Some(row) = rows.next()? {
            let txn_type: TransactionType = parse_at(row, 0)?;
            let amount = decimal_at(row, 1)?;
            sum += match txn_type {
                TransactionType::Expense => -amount,
                TransactionType::Income | TransactionType::Transfer => amount,
            };
        }
        Ok(account.balance - sum)
    }

    // ── Outbox & dead letters ─────────────────────────────────

    pub(crate) fn insert_notification(
        &self,
        recipient: &str,
        subject: &str,
        kind: &str,
        payload: &str,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO notifications (recipient, subject, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![recipient, subject, kind, payload, ts_to_sql(&at)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub(crate) fn list_notifications(&self, limit: u32) -> Result<Vec<NotificationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, recipient, subject, kind, payload, created_at
             FROM notifications ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(NotificationRecord {
                id: row.get(0)?,
                recipient: row.get(1)?,
                subject: row.get(2)?,
                kind: row.get(3)?,
                payload: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub(crate) fn insert_dead_letter(
        &self,
        task: &str,
        error: &str,
        attempts: u32,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO dead_letters (task, error, attempts, failed_at) VALUES (?1, ?2, ?3, ?4)",
            params![task, error, attempts, ts_to_sql(&at)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub(crate) fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task, error, attempts, failed_at FROM dead_letters ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DeadLetter {
                id: row.get(0)?,
                task: row.get(1)?,
                error: row.get(2)?,
                attempts: row.get(3)?,
                failed_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

// ── Row helpers ───────────────────────────────────────────────

const TRANSACTION_COLUMNS: &str = "id, user_id, account_id, type, amount, description, date, category,
     is_recurring, recurring_interval, next_recurring_date, last_processed, status, created_at";

/// Fixed-width UTC timestamps so SQL string comparison orders them.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => ts_at(row, idx).map(Some),
        None => Ok(None),
    }
}

fn parse_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: Some(row.get(0)?),
        user_id: row.get(1)?,
        name: row.get(2)?,
        balance: decimal_at(row, 3)?,
        is_default: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn budget_from_row(row: &Row<'_>) -> rusqlite::Result<Budget> {
    let id: i64 = row.get(0)?;
    // A malformed amount is treated like a missing one so the monitor can
    // report it against this budget alone.
    let amount = match row.get::<_, Option<String>>(2)? {
        Some(raw) => match Decimal::from_str(&raw) {
            Ok(amount) => Some(amount),
            Err(e) => {
                tracing::warn!(budget_id = id, error = %e, "unparsable budget amount");
                None
            }
        },
        None => None,
    };
    Ok(Budget {
        id: Some(id),
        user_id: row.get(1)?,
        amount,
        last_alert_sent: opt_ts_at(row, 3)?,
    })
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let interval = match row.get::<_, Option<String>>(9)? {
        Some(raw) => Some(raw.parse().map_err(|e| conversion_error(9, e))?),
        None => None,
    };
    Ok(Transaction {
        id: Some(row.get(0)?),
        user_id: row.get(1)?,
        account_id: row.get(2)?,
        txn_type: parse_at(row, 3)?,
        amount: decimal_at(row, 4)?,
        description: row.get(5)?,
        date: ts_at(row, 6)?,
        category: row.get(7)?,
        is_recurring: row.get(8)?,
        recurring_interval: interval,
        next_recurring_date: opt_ts_at(row, 10)?,
        last_processed: opt_ts_at(row, 11)?,
        status: parse_at(row, 12)?,
        created_at: row.get(13)?,
    })
}

fn load_transaction(conn: &Connection, id: i64, user_id: &str) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1 AND user_id = ?2");
    Ok(conn
        .query_row(&sql, params![id, user_id], transaction_from_row)
        .optional()?)
}

fn insert_transaction_in(conn: &Connection, txn: &Transaction) -> Result<i64> {
    conn.execute(
        "INSERT INTO transactions (user_id, account_id, type, amount, description, date, category,
                                   is_recurring, recurring_interval, next_recurring_date,
                                   last_processed, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            txn.user_id,
            txn.account_id,
            txn.txn_type.as_str(),
            txn.amount.to_string(),
            txn.description,
            ts_to_sql(&txn.date),
            txn.category,
            txn.is_recurring,
            txn.recurring_interval.map(|i| i.as_str()),
            txn.next_recurring_date.as_ref().map(ts_to_sql),
            txn.last_processed.as_ref().map(ts_to_sql),
            txn.status.as_str(),
            txn.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Adds `delta` to an account balance. Callers hold an IMMEDIATE transaction,
/// so the read and the write happen under one write lock.
fn apply_balance_change(conn: &Connection, account_id: i64, delta: Decimal) -> Result<Decimal> {
    let current: String = conn
        .query_row(
            "SELECT balance FROM accounts WHERE id = ?1",
            params![account_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| anyhow!("Account {account_id} not found"))?;
    let current = Decimal::from_str(&current)
        .with_context(|| format!("Account {account_id} has a malformed balance"))?;
    let updated = current + delta;
    conn.execute(
        "UPDATE accounts SET balance = ?1 WHERE id = ?2",
        params![updated.to_string(), account_id],
    )?;
    Ok(updated)
}
