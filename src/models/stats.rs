use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;

/// Aggregate of one user's ledger over a date range.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonthlyStats {
    pub total_income: Decimal,
    pub total_expenses: Decimal,
    /// Expense totals per category.
    pub by_category: BTreeMap<String, Decimal>,
    pub transaction_count: usize,
}

impl MonthlyStats {
    pub fn net(&self) -> Decimal {
        self.total_income - self.total_expenses
    }

    pub fn add_income(&mut self, amount: Decimal) {
        self.total_income += amount;
        self.transaction_count += 1;
    }

    pub fn add_expense(&mut self, category: &str, amount: Decimal) {
        self.total_expenses += amount;
        *self.by_category.entry(category.to_string()).or_default() += amount;
        self.transaction_count += 1;
    }
}
