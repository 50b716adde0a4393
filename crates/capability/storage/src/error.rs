//! 存储层错误类型
//!
//! 唯一约束冲突单独成一类：meta 表重复插入被上层视为成功。

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Database(String),
    #[error("UNIQUE constraint failed: {0}")]
    UniqueViolation(String),
    #[error("invalid store config: {0}")]
    Config(String),
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// 唯一约束冲突：含 `UNIQUE constraint failed`，或以 `are not unique` /
    /// `constraint failed` 结尾。
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::UniqueViolation(_) => true,
            StoreError::Database(message) => is_unique_message(message),
            StoreError::Config(_) => false,
        }
    }
}

fn is_unique_message(message: &str) -> bool {
    let message = message.trim_end();
    message.contains("UNIQUE constraint failed")
        || message.ends_with("are not unique")
        || message.ends_with("constraint failed")
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::UniqueViolation(db.message().to_string())
            }
            _ => Self::new(err.to_string()),
        }
    }
}
