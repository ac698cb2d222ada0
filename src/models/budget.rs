use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct Budget {
    pub id: Option<i64>,
    pub user_id: String,
    /// Monthly ceiling. Required, but stored nullable so a missing value
    /// surfaces as a data-integrity error instead of a silent zero.
    pub amount: Option<Decimal>,
    pub last_alert_sent: Option<DateTime<Utc>>,
}

impl Budget {
    pub fn new(user_id: String, amount: Decimal) -> Self {
        Self {
            id: None,
            user_id,
            amount: Some(amount),
            last_alert_sent: None,
        }
    }
}

/// A budget joined with the owner's default account and contact details.
#[derive(Debug, Clone)]
pub struct BudgetTarget {
    pub budget: Budget,
    pub account_id: i64,
    pub account_name: String,
    pub email: String,
    pub user_name: Option<String>,
}
