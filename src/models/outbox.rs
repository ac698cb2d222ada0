/// A notification persisted for the external mailer.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub id: i64,
    pub recipient: String,
    pub subject: String,
    pub kind: String,
    /// JSON payload.
    pub payload: String,
    pub created_at: String,
}

/// A task that exhausted its attempts, kept for manual inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: i64,
    /// JSON-encoded task.
    pub task: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: String,
}
