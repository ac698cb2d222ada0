use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::calendar;

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Income,
    Expense,
    Transfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "INCOME",
            Self::Expense => "EXPENSE",
            Self::Transfer => "TRANSFER",
        }
    }
}

impl FromStr for TransactionType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INCOME" => Ok(Self::Income),
            "EXPENSE" => Ok(Self::Expense),
            "TRANSFER" => Ok(Self::Transfer),
            other => Err(ParseEnumError::new("transaction type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("transaction status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurringInterval {
    Daily,
    Weekly,
    Fortnightly,
    Monthly,
    Yearly,
}

impl RecurringInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Fortnightly => "FORTNIGHTLY",
            Self::Monthly => "MONTHLY",
            Self::Yearly => "YEARLY",
        }
    }

    pub fn all() -> &'static [RecurringInterval] {
        &[
            Self::Daily,
            Self::Weekly,
            Self::Fortnightly,
            Self::Monthly,
            Self::Yearly,
        ]
    }
}

impl FromStr for RecurringInterval {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DAILY" => Ok(Self::Daily),
            "WEEKLY" => Ok(Self::Weekly),
            "FORTNIGHTLY" => Ok(Self::Fortnightly),
            "MONTHLY" => Ok(Self::Monthly),
            "YEARLY" => Ok(Self::Yearly),
            other => Err(ParseEnumError::new("recurring interval", other)),
        }
    }
}

impl std::fmt::Display for RecurringInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Suffix marking entries the scheduler created from a recurring template.
pub const OCCURRENCE_SUFFIX: &str = " (Recurring)";

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Option<i64>,
    pub user_id: String,
    pub account_id: i64,
    pub txn_type: TransactionType,
    /// Always positive; direction comes from `txn_type`.
    pub amount: Decimal,
    pub description: String,
    pub date: DateTime<Utc>,
    pub category: String,
    pub is_recurring: bool,
    pub recurring_interval: Option<RecurringInterval>,
    pub next_recurring_date: Option<DateTime<Utc>>,
    pub last_processed: Option<DateTime<Utc>>,
    pub status: TransactionStatus,
    pub created_at: String,
}

impl Transaction {
    pub fn new(
        user_id: String,
        account_id: i64,
        txn_type: TransactionType,
        amount: Decimal,
        category: String,
        date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            user_id,
            account_id,
            txn_type,
            amount,
            description: String::new(),
            date,
            category,
            is_recurring: false,
            recurring_interval: None,
            next_recurring_date: None,
            last_processed: None,
            status: TransactionStatus::Completed,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn recurring(mut self, interval: RecurringInterval) -> Self {
        self.is_recurring = true;
        self.recurring_interval = Some(interval);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// The amount as it moves the account balance.
    pub fn signed_amount(&self) -> Decimal {
        match self.txn_type {
            TransactionType::Expense => -self.amount,
            TransactionType::Income | TransactionType::Transfer => self.amount,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match (self.last_processed, self.next_recurring_date) {
            (None, _) => true,
            (Some(_), Some(next)) => next <= now,
            (Some(_), None) => false,
        }
    }

    /// Schedule advance applied when an occurrence is materialized at `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.recurring_interval
            .map(|interval| calendar::next_occurrence(now, interval))
    }

    /// The one-off ledger entry representing this template's occurrence at `now`.
    pub fn occurrence(&self, now: DateTime<Utc>) -> Transaction {
        Transaction {
            id: None,
            user_id: self.user_id.clone(),
            account_id: self.account_id,
            txn_type: self.txn_type,
            amount: self.amount,
            description: format!("{}{OCCURRENCE_SUFFIX}", self.description),
            date: now,
            category: self.category.clone(),
            is_recurring: false,
            recurring_interval: None,
            next_recurring_date: None,
            last_processed: None,
            status: TransactionStatus::Completed,
            created_at: now.to_rfc3339(),
        }
    }
}

/// A due recurring template as returned by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueItem {
    pub transaction_id: i64,
    pub user_id: String,
}
