use std::time::Duration;

/// Failure of one scheduled unit of work (an occurrence task, a budget
/// check, a user report). Not-found and already-processed cases are not
/// errors; they come back as skipped outcomes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SchedulerError {
    /// A required field is missing or unreadable. Retrying cannot help.
    #[error("data integrity: {0}")]
    DataIntegrity(String),
    #[error("store: {0:#}")]
    Store(anyhow::Error),
    #[error("notification dispatch: {0:#}")]
    Notification(anyhow::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl SchedulerError {
    pub(crate) fn is_retryable(&self) -> bool {
        !matches!(self, Self::DataIntegrity(_))
    }

    /// Classifies a store failure: rows that cannot be decoded are data
    /// problems, everything else is treated as transient I/O.
    pub(crate) fn from_store(err: anyhow::Error) -> Self {
        match err.downcast_ref::<rusqlite::Error>() {
            Some(rusqlite::Error::FromSqlConversionFailure(..))
            | Some(rusqlite::Error::InvalidColumnType(..)) => {
                Self::DataIntegrity(format!("{err:#}"))
            }
            _ => Self::Store(err),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_only_data_integrity_is_final() {
        assert!(!SchedulerError::DataIntegrity("budget 1 has no amount".into()).is_retryable());
        assert!(SchedulerError::Store(anyhow::anyhow!("disk I/O error")).is_retryable());
        assert!(SchedulerError::Notification(anyhow::anyhow!("smtp down")).is_retryable());
        assert!(SchedulerError::Timeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn test_conversion_failures_are_data_integrity() {
        let parse_err = "x".parse::<i64>().unwrap_err();
        let sql_err = rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(parse_err),
        );
        let err = SchedulerError::from_store(anyhow::Error::new(sql_err));
        assert!(matches!(err, SchedulerError::DataIntegrity(_)));

        let busy = SchedulerError::from_store(anyhow::Error::new(
            rusqlite::Error::QueryReturnedNoRows,
        ));
        assert!(matches!(busy, SchedulerError::Store(_)));
    }
}
