mod account;
mod budget;
mod outbox;
mod stats;
mod transaction;
mod user;

pub use account::Account;
pub use budget::{Budget, BudgetTarget};
pub use outbox::{DeadLetter, NotificationRecord};
pub use stats::MonthlyStats;
pub use transaction::{
    DueItem, RecurringInterval, Transaction, TransactionStatus, TransactionType,
};
pub use user::User;
