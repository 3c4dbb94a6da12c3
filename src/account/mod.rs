//! Account registry: validates configured user entries, owns per-account
//! identity and enable/disable state, and announces accounts on the bus.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::{topics, EventBus};
use crate::config::{AccountsConfig, UserEntry};
use crate::error::{Error, Result};

/// API credentials, kept in memory only. Never logged or serialized
/// into events.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// A validated trading account.
#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: String,
    pub name: String,
    pub credentials: ApiCredentials,
    pub strategy: String,
    pub testnet: bool,
    pub is_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountLoaded {
    pub user_id: String,
    pub name: String,
    pub strategy: String,
    pub testnet: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountLoadFailed {
    pub user_id: String,
    pub reason: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManagerReady {
    pub loaded: usize,
    pub failed: usize,
    pub user_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountToggled {
    pub user_id: String,
}

/// Owns every account for the process lifetime. Other components look
/// up identity and credentials here but never mutate.
pub struct AccountRegistry {
    bus: Arc<EventBus>,
    accounts: RwLock<HashMap<String, Account>>,
}

impl AccountRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and register every configured user. Invalid entries are
    /// skipped and reported; valid ones are announced individually,
    /// followed by a single readiness event for the batch.
    pub fn load(&self, config: &AccountsConfig) -> (usize, usize) {
        let mut loaded = Vec::new();
        let mut failed = 0usize;

        for (user_id, raw) in &config.users {
            match Self::validate_entry(user_id, raw) {
                Ok(account) => {
                    info!(user_id = %user_id, name = %account.name, "account loaded");
                    let payload = AccountLoaded {
                        user_id: account.user_id.clone(),
                        name: account.name.clone(),
                        strategy: account.strategy.clone(),
                        testnet: account.testnet,
                    };
                    self.accounts.write().insert(user_id.clone(), account);
                    loaded.push(user_id.clone());
                    self.bus.emit(topics::ACCOUNT_LOADED, &payload);
                }
                Err(e) => {
                    warn!(user_id = %user_id, reason = %e, "skipping invalid account entry");
                    failed += 1;
                    self.bus.emit(
                        topics::ACCOUNT_LOAD_FAILED,
                        &AccountLoadFailed {
                            user_id: user_id.clone(),
                            reason: e.to_string(),
                            code: e.code().to_string(),
                        },
                    );
                }
            }
        }

        self.bus.emit(
            topics::PM_READY,
            &ManagerReady {
                loaded: loaded.len(),
                failed,
                user_ids: loaded.clone(),
            },
        );
        (loaded.len(), failed)
    }

    fn validate_entry(user_id: &str, raw: &serde_json::Value) -> Result<Account> {
        let entry: UserEntry = serde_json::from_value(raw.clone())
            .map_err(|e| Error::Config(format!("malformed entry: {e}")))?;
        for (field, value) in [
            ("name", &entry.name),
            ("api_key", &entry.api_key),
            ("api_secret", &entry.api_secret),
            ("strategy", &entry.strategy),
        ] {
            if value.is_empty() {
                return Err(Error::Config(format!("{field} cannot be empty")));
            }
        }
        Ok(Account {
            user_id: user_id.to_string(),
            name: entry.name,
            credentials: ApiCredentials {
                api_key: entry.api_key,
                api_secret: entry.api_secret,
            },
            strategy: entry.strategy,
            testnet: entry.testnet,
            is_enabled: true,
        })
    }

    pub fn get(&self, user_id: &str) -> Option<Account> {
        self.accounts.read().get(user_id).cloned()
    }

    pub fn credentials(&self, user_id: &str) -> Option<ApiCredentials> {
        self.accounts.read().get(user_id).map(|a| a.credentials.clone())
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.accounts.read().keys().cloned().collect()
    }

    pub fn enable(&self, user_id: &str) -> Result<()> {
        self.toggle(user_id, true)
    }

    pub fn disable(&self, user_id: &str) -> Result<()> {
        self.toggle(user_id, false)
    }

    fn toggle(&self, user_id: &str, enabled: bool) -> Result<()> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(user_id)
            .ok_or_else(|| Error::UnknownAccount(user_id.to_string()))?;
        account.is_enabled = enabled;
        drop(accounts);

        let topic = if enabled { topics::ACCOUNT_ENABLED } else { topics::ACCOUNT_DISABLED };
        self.bus.emit(topic, &AccountToggled { user_id: user_id.to_string() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryJournal;
    use serde_json::json;

    fn registry() -> AccountRegistry {
        AccountRegistry::new(Arc::new(EventBus::new(Arc::new(MemoryJournal::new()))))
    }

    fn config(users: serde_json::Value) -> AccountsConfig {
        serde_json::from_value(json!({ "users": users })).unwrap()
    }

    #[tokio::test]
    async fn valid_and_invalid_entries_are_split() {
        let registry = registry();
        let config = config(json!({
            "u1": { "name": "alice", "api_key": "k", "api_secret": "s", "strategy": "ma_stop_st" },
            "u2": { "name": "", "api_key": "k", "api_secret": "s", "strategy": "x" },
            "u3": { "name": "carol", "api_key": "k", "api_secret": "s", "strategy": "x", "testnet": "yes" }
        }));

        let (loaded, failed) = registry.load(&config);
        assert_eq!(loaded, 1);
        assert_eq!(failed, 2);
        assert!(registry.get("u1").is_some());
        assert!(registry.get("u2").is_none());

        let subjects: Vec<String> = registry
            .bus
            .query_recent(10)
            .into_iter()
            .map(|e| e.subject)
            .collect();
        assert!(subjects.contains(&topics::PM_READY.to_string()));
        assert!(subjects.contains(&topics::ACCOUNT_LOADED.to_string()));
        assert_eq!(
            subjects.iter().filter(|s| *s == topics::ACCOUNT_LOAD_FAILED).count(),
            2
        );
    }

    #[tokio::test]
    async fn testnet_defaults_to_false() {
        let registry = registry();
        let config = config(json!({
            "u1": { "name": "alice", "api_key": "k", "api_secret": "s", "strategy": "x" }
        }));
        registry.load(&config);
        assert!(!registry.get("u1").unwrap().testnet);
    }

    #[tokio::test]
    async fn enable_disable_flips_state_and_publishes() {
        let registry = registry();
        let config = config(json!({
            "u1": { "name": "alice", "api_key": "k", "api_secret": "s", "strategy": "x" }
        }));
        registry.load(&config);

        registry.disable("u1").unwrap();
        assert!(!registry.get("u1").unwrap().is_enabled);
        registry.enable("u1").unwrap();
        assert!(registry.get("u1").unwrap().is_enabled);
        assert!(registry.disable("nope").is_err());

        let subjects: Vec<String> = registry
            .bus
            .query_recent(10)
            .into_iter()
            .map(|e| e.subject)
            .collect();
        assert!(subjects.contains(&topics::ACCOUNT_ENABLED.to_string()));
        assert!(subjects.contains(&topics::ACCOUNT_DISABLED.to_string()));
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = ApiCredentials { api_key: "key".into(), api_secret: "hunter2".into() };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
    }
}
