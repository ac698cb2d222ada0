use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
    #[error("could not determine data directory; set BUDGETD_DB_PATH")]
    NoDataDir,
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub db_path: PathBuf,
    /// Tasks processed in parallel across all users.
    pub workers: usize,
    /// Occurrence tasks admitted per user per rolling minute.
    pub user_rate_limit: usize,
    pub task_timeout: Duration,
    /// Attempts per task before it is dead-lettered.
    pub max_attempts: u32,
    /// Percentage of the monthly budget that triggers an alert.
    pub alert_threshold: Decimal,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
}

impl Config {
    pub(crate) fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = match lookup("BUDGETD_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        let workers = parse_positive(&lookup, "BUDGETD_WORKERS", 8)?;
        let user_rate_limit = parse_positive(&lookup, "BUDGETD_USER_RATE_LIMIT", 10)?;
        let timeout_secs = parse_positive(&lookup, "BUDGETD_TASK_TIMEOUT_SECS", 30)?;
        let max_attempts = parse_positive(&lookup, "BUDGETD_MAX_ATTEMPTS", 2)?;

        let alert_threshold = match lookup("BUDGETD_ALERT_THRESHOLD") {
            Some(raw) => {
                let value = Decimal::from_str(raw.trim()).map_err(|e| {
                    ConfigError::InvalidValue("BUDGETD_ALERT_THRESHOLD".into(), e.to_string())
                })?;
                if value <= Decimal::ZERO {
                    return Err(ConfigError::InvalidValue(
                        "BUDGETD_ALERT_THRESHOLD".into(),
                        "must be greater than zero".into(),
                    ));
                }
                value
            }
            None => Decimal::from(80),
        };

        Ok(Self {
            db_path,
            workers,
            user_rate_limit,
            task_timeout: Duration::from_secs(timeout_secs),
            max_attempts,
            alert_threshold,
            gemini_api_key: lookup("GEMINI_API_KEY").filter(|k| !k.trim().is_empty()),
            gemini_model: lookup("GEMINI_MODEL").unwrap_or_else(|| "gemini-1.5-flash".into()),
        })
    }
}

fn parse_positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(key.into(), e.to_string()))?;
    if value <= T::default() {
        return Err(ConfigError::InvalidValue(
            key.into(),
            "must be greater than zero".into(),
        ));
    }
    Ok(value)
}

fn default_db_path() -> Result<PathBuf, ConfigError> {
    let proj_dirs = directories::ProjectDirs::from("com", "budgetd", "budgetd")
        .ok_or(ConfigError::NoDataDir)?;
    Ok(proj_dirs.data_dir().join("budgetd.db"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let mut map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.entry("BUDGETD_DB_PATH".into())
            .or_insert_with(|| "/tmp/budgetd-test.db".into());
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/budgetd-test.db"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.user_rate_limit, 10);
        assert_eq!(config.task_timeout, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.alert_threshold, Decimal::from(80));
        assert!(config.gemini_api_key.is_none());
        assert_eq!(config.gemini_model, "gemini-1.5-flash");
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("BUDGETD_WORKERS", "2"),
            ("BUDGETD_USER_RATE_LIMIT", " 5 "),
            ("BUDGETD_TASK_TIMEOUT_SECS", "3"),
            ("BUDGETD_MAX_ATTEMPTS", "4"),
            ("BUDGETD_ALERT_THRESHOLD", "92.5"),
            ("GEMINI_API_KEY", "secret"),
        ])
        .unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.user_rate_limit, 5);
        assert_eq!(config.task_timeout, Duration::from_secs(3));
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.alert_threshold.to_string(), "92.5");
        assert_eq!(config.gemini_api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_blank_api_key_is_absent() {
        let config = config_from(&[("GEMINI_API_KEY", "   ")]).unwrap();
        assert!(config.gemini_api_key.is_none());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(config_from(&[("BUDGETD_WORKERS", "many")]).is_err());
        assert!(config_from(&[("BUDGETD_WORKERS", "0")]).is_err());
        assert!(config_from(&[("BUDGETD_MAX_ATTEMPTS", "-1")]).is_err());
        let err = config_from(&[("BUDGETD_ALERT_THRESHOLD", "0")]).unwrap_err();
        assert!(err.to_string().contains("BUDGETD_ALERT_THRESHOLD"));
    }
}
