//! Server configuration, loaded from a TOML file.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rasvn_core::{DeletePolicy, RebasePolicy, TxnOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address.
    pub addr: String,
    /// "strict" or "permissive".
    pub rebase_policy: String,
    /// "recursive" or "explicit".
    pub delete_policy: String,
    /// Whether copy sources may name the current transaction.
    pub copy_from_txn: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            addr: "0.0.0.0:3690".to_string(),
            rebase_policy: "strict".to_string(),
            delete_policy: "recursive".to_string(),
            copy_from_txn: true,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn txn_options(&self) -> Result<TxnOptions> {
        let rebase = match self.rebase_policy.as_str() {
            "strict" => RebasePolicy::Strict,
            "permissive" => RebasePolicy::Permissive,
            other => return Err(anyhow!("unknown rebase policy {other:?}")),
        };
        let delete = match self.delete_policy.as_str() {
            "recursive" => DeletePolicy::Recursive,
            "explicit" => DeletePolicy::RequireExplicit,
            other => return Err(anyhow!("unknown delete policy {other:?}")),
        };
        Ok(TxnOptions {
            rebase,
            delete,
            copy_from_txn: self.copy_from_txn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let config = Config::default();
        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.addr, config.addr);
        assert!(parsed.txn_options().is_ok());
    }

    #[test]
    fn bad_policy_is_rejected() {
        let config = Config {
            rebase_policy: "optimistic".to_string(),
            ..Config::default()
        };
        assert!(config.txn_options().is_err());
    }
}
