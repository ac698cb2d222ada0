use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct Account {
    pub id: Option<i64>,
    pub user_id: String,
    pub name: String,
    /// Running balance; always equals the signed sum of the account's entries.
    pub balance: Decimal,
    pub is_default: bool,
    pub created_at: String,
}

impl Account {
    pub fn new(user_id: String, name: String, is_default: bool) -> Self {
        Self {
            id: None,
            user_id,
            name,
            balance: Decimal::ZERO,
            is_default,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
