/// Identity is resolved elsewhere; the scheduler only needs who to notify.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
}

impl User {
    pub fn new(id: String, email: String, name: Option<String>) -> Self {
        Self { id, email, name }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}
