//! Quota rules configuration and lookup.
//!
//! Rules are kept in a YAML document listing per-account quotas and an
//! optional quota shared by anonymous callers:
//!
//! ```yaml
//! anonymous:
//!   capacity: 5
//!   refill_rate_per_second: 1
//! accounts:
//!   alice@example.com:
//!     capacity: 100
//!     refill_rate_per_second: 50
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::bucket::Limits;
use super::key::RateLimitKey;
use super::quota::QuotaSource;
use crate::error::{Result, TurnstileError};

/// Quotas for accounts and anonymous callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaRules {
    /// Quota applied to each anonymous source address
    #[serde(default)]
    pub anonymous: Option<Limits>,
    /// Map of account ID to that account's quota
    #[serde(default)]
    pub accounts: HashMap<String, Limits>,
}

impl QuotaRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading quota rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: QuotaRules = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse quota rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    fn validate(&self) -> Result<()> {
        if let Some(anonymous) = &self.anonymous {
            anonymous.validate()?;
        }
        for (account, limits) in &self.accounts {
            if account.is_empty() {
                return Err(TurnstileError::Config("account ID must not be empty".to_string()));
            }
            limits
                .validate()
                .map_err(|e| TurnstileError::Config(format!("account {}: {}", account, e)))?;
        }
        Ok(())
    }

    /// Find the quota for a key, if the rules name one.
    pub fn find_limits(&self, key: &RateLimitKey) -> Option<Limits> {
        match key {
            RateLimitKey::Account(account) => self.accounts.get(account).copied(),
            RateLimitKey::Address(_) => self.anonymous,
        }
    }
}

#[async_trait]
impl QuotaSource for QuotaRules {
    async fn fetch(&self, key: &str) -> Result<Option<Limits>> {
        let key = RateLimitKey::from_string_key(key)
            .ok_or_else(|| TurnstileError::Quota(format!("unrecognized rate limit key {}", key)))?;
        Ok(self.find_limits(&key))
    }
}

/// A quota source that re-reads its rules file on every fetch.
///
/// Edits to the file take effect as cached quotas go stale.
#[derive(Debug, Clone)]
pub struct QuotaFile {
    path: PathBuf,
}

impl QuotaFile {
    /// Create a source reading `path`, which must hold valid rules right away.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        QuotaRules::from_file(&path)?;
        Ok(Self { path })
    }
}

#[async_trait]
impl QuotaSource for QuotaFile {
    async fn fetch(&self, key: &str) -> Result<Option<Limits>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let rules = QuotaRules::from_yaml(&contents)?;
        rules.fetch(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
anonymous:
  capacity: 5
  refill_rate_per_second: 1
accounts:
  alice@example.com:
    capacity: 100
    refill_rate_per_second: 50
  bob@example.com:
    capacity: 20
    refill_rate_per_second: 2.5
"#;

    #[test]
    fn test_parse_rules() {
        let rules = QuotaRules::from_yaml(RULES).unwrap();
        assert_eq!(rules.anonymous, Some(Limits::new(5, 1.0)));
        assert_eq!(rules.accounts.len(), 2);
        assert_eq!(rules.accounts["bob@example.com"], Limits::new(20, 2.5));
    }

    #[test]
    fn test_find_limits() {
        let rules = QuotaRules::from_yaml(RULES).unwrap();

        let alice = RateLimitKey::Account("alice@example.com".to_string());
        assert_eq!(rules.find_limits(&alice), Some(Limits::new(100, 50.0)));

        let stranger = RateLimitKey::Account("mallory@example.com".to_string());
        assert_eq!(rules.find_limits(&stranger), None);

        let anonymous = RateLimitKey::Address("10.0.0.1".parse().unwrap());
        assert_eq!(rules.find_limits(&anonymous), Some(Limits::new(5, 1.0)));
    }

    #[test]
    fn test_empty_rules() {
        let rules = QuotaRules::from_yaml("{}").unwrap();
        assert!(rules.anonymous.is_none());
        assert!(rules.accounts.is_empty());

        let anonymous = RateLimitKey::Address("10.0.0.1".parse().unwrap());
        assert_eq!(rules.find_limits(&anonymous), None);
    }

    #[test]
    fn test_invalid_account_quota_rejected() {
        let yaml = r#"
accounts:
  broken@example.com:
    capacity: 0
    refill_rate_per_second: 1
"#;
        let err = QuotaRules::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("broken@example.com"));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = r#"
default:
  capacity: 5
  refill_rate_per_second: 1
"#;
        assert!(matches!(QuotaRules::from_yaml(yaml), Err(TurnstileError::Config(_))));

        let yaml = r#"
accounts:
  alice@example.com:
    capacity: 5
    refill_rate_per_second: 1
    burst: 10
"#;
        assert!(QuotaRules::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        assert!(QuotaRules::from_yaml("accounts: [1, 2").is_err());
    }

    #[test]
    fn test_rules_as_quota_source() {
        let rules = QuotaRules::from_yaml(RULES).unwrap();

        let quota = tokio_test::block_on(rules.fetch("account:alice@example.com")).unwrap();
        assert_eq!(quota, Some(Limits::new(100, 50.0)));

        assert_eq!(tokio_test::block_on(rules.fetch("account:nobody")).unwrap(), None);
        assert!(matches!(
            tokio_test::block_on(rules.fetch("garbage")),
            Err(TurnstileError::Quota(_))
        ));
    }

    #[tokio::test]
    async fn test_quota_file_rereads_rules() {
        let path = std::env::temp_dir().join(format!("turnstile-quotas-{}.yaml", std::process::id()));
        std::fs::write(&path, RULES).unwrap();

        let source = QuotaFile::open(&path).unwrap();
        let quota = source.fetch("account:bob@example.com").await.unwrap();
        assert_eq!(quota, Some(Limits::new(20, 2.5)));

        std::fs::write(
            &path,
            "accounts:\n  bob@example.com:\n    capacity: 7\n    refill_rate_per_second: 7\n",
        )
        .unwrap();
        let quota = source.fetch("account:bob@example.com").await.unwrap();
        assert_eq!(quota, Some(Limits::new(7, 7.0)));

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            source.fetch("account:bob@example.com").await,
            Err(TurnstileError::Io(_))
        ));
    }

    #[test]
    fn test_quota_file_requires_valid_rules() {
        assert!(QuotaFile::open("/nonexistent/quotas.yaml").is_err());
    }
}
