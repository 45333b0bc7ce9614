//! Account registry: the configured master and slave accounts, their
//! credentials, and the single-active-master invariant.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;

use crate::db::{Database, NewAccount};
use crate::error::RegistryError;
use crate::models::{Account, AccountConfiguration, Credentials};

/// Narrow read/write surface over the account store. Replication components
/// only read; writes come from the configuration surface (CLI/REST).
pub struct AccountRegistry {
    db: Arc<Database>,
}

impl AccountRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create an account. Validates at write time that at most one active
    /// account carries the master flag and that the risk multiplier lies in
    /// (0, 10]; ambiguous configurations are rejected here rather than
    /// guessed at during replication.
    pub async fn create_account(&self, account: NewAccount) -> Result<Account, RegistryError> {
        if account.risk_multiplier <= Decimal::ZERO || account.risk_multiplier > dec!(10) {
            return Err(RegistryError::InvalidRiskMultiplier(account.risk_multiplier));
        }

        if account.is_master && account.is_active {
            let existing = self.db.count_active_masters(None).await? as usize;
            if existing > 0 {
                return Err(RegistryError::AmbiguousMaster(existing + 1));
            }
        }

        let id = self.db.insert_account(&account).await?;
        info!(account = id, name = %account.name, master = account.is_master, "Account created");

        self.db
            .get_account(id)
            .await?
            .ok_or(RegistryError::AccountNotFound(id))
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, RegistryError> {
        Ok(self.db.list_accounts().await?)
    }

    pub async fn get_account(&self, id: i64) -> Result<Account, RegistryError> {
        self.db
            .get_account(id)
            .await?
            .ok_or(RegistryError::AccountNotFound(id))
    }

    pub async fn delete_account(&self, id: i64) -> Result<(), RegistryError> {
        if !self.db.delete_account(id).await? {
            return Err(RegistryError::AccountNotFound(id));
        }
        info!(account = id, "Account deleted");
        Ok(())
    }

    /// The single active master account. Zero or multiple masters is a
    /// configuration fault, reported rather than resolved by guessing.
    pub async fn active_master(&self) -> Result<Account, RegistryError> {
        let mut masters: Vec<Account> = self
            .db
            .list_accounts()
            .await?
            .into_iter()
            .filter(|a| a.is_master && a.is_active)
            .collect();

        if masters.len() == 1 {
            Ok(masters.remove(0))
        } else {
            Err(RegistryError::AmbiguousMaster(masters.len()))
        }
    }

    /// Active, non-master accounts with a complete configuration, paired
    /// with their credentials. Accounts with incomplete configuration are
    /// excluded from connection attempts and fan-out entirely.
    pub async fn eligible_slaves(&self) -> Result<Vec<(Account, Credentials)>, RegistryError> {
        let mut eligible = Vec::new();
        for account in self.db.list_accounts().await? {
            if account.is_master || !account.is_active {
                continue;
            }
            let Some(config) = self.db.get_configuration(account.id).await? else {
                continue;
            };
            if let Some(credentials) = config.credentials(account.platform) {
                eligible.push((account, credentials));
            }
        }
        Ok(eligible)
    }

    pub async fn configuration(&self, account_id: i64) -> Result<AccountConfiguration, RegistryError> {
        // Ensure the account exists so a missing row means "empty draft",
        // not a dangling id.
        self.get_account(account_id).await?;
        Ok(self
            .db
            .get_configuration(account_id)
            .await?
            .unwrap_or(AccountConfiguration {
                account_id,
                ..Default::default()
            }))
    }

    /// Apply a partial configuration update; absent fields keep their value.
    pub async fn update_configuration(
        &self,
        config: &AccountConfiguration,
    ) -> Result<AccountConfiguration, RegistryError> {
        self.get_account(config.account_id).await?;
        self.db.upsert_configuration(config).await?;
        self.configuration(config.account_id).await
    }

    /// Credentials for one account, or `ConfigIncomplete` when any required
    /// field is missing.
    pub async fn credentials(&self, account_id: i64) -> Result<Credentials, RegistryError> {
        let account = self.get_account(account_id).await?;
        let config = self
            .db
            .get_configuration(account_id)
            .await?
            .ok_or(RegistryError::ConfigIncomplete(account_id))?;
        config
            .credentials(account.platform)
            .ok_or(RegistryError::ConfigIncomplete(account_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictPolicy, Platform};

    async fn registry() -> AccountRegistry {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        AccountRegistry::new(db)
    }

    fn new_account(name: &str, is_master: bool) -> NewAccount {
        NewAccount {
            name: name.to_string(),
            platform: Platform::MetaTrader,
            is_master,
            is_active: true,
            risk_multiplier: dec!(1),
            conflict_policy: ConflictPolicy::PauseReplication,
            allow_manual_trading: true,
        }
    }

    #[tokio::test]
    async fn second_active_master_is_rejected() {
        let registry = registry().await;
        registry.create_account(new_account("master", true)).await.unwrap();

        let err = registry
            .create_account(new_account("second master", true))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AmbiguousMaster(2)));
    }

    #[tokio::test]
    async fn inactive_master_does_not_conflict() {
        let registry = registry().await;
        registry.create_account(new_account("master", true)).await.unwrap();

        let inactive = NewAccount {
            is_active: false,
            ..new_account("standby master", true)
        };
        registry.create_account(inactive).await.unwrap();

        let master = registry.active_master().await.unwrap();
        assert_eq!(master.name, "master");
    }

    #[tokio::test]
    async fn zero_masters_is_reported_not_guessed() {
        let registry = registry().await;
        registry.create_account(new_account("slave", false)).await.unwrap();

        let err = registry.active_master().await.unwrap_err();
        assert!(matches!(err, RegistryError::AmbiguousMaster(0)));
    }

    #[tokio::test]
    async fn out_of_range_multiplier_rejected_at_write_time() {
        let registry = registry().await;
        let bad = NewAccount {
            risk_multiplier: dec!(11),
            ..new_account("slave", false)
        };
        let err = registry.create_account(bad).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRiskMultiplier(_)));
    }

    #[tokio::test]
    async fn eligible_slaves_require_complete_configuration() {
        let registry = registry().await;
        registry.create_account(new_account("master", true)).await.unwrap();
        let configured = registry.create_account(new_account("configured", false)).await.unwrap();
        registry.create_account(new_account("unconfigured", false)).await.unwrap();
        let inactive = NewAccount {
            is_active: false,
            ..new_account("inactive", false)
        };
        registry.create_account(inactive).await.unwrap();

        registry
            .update_configuration(&AccountConfiguration {
                account_id: configured.id,
                server: Some("demo.broker.com".to_string()),
                login: Some("10042".to_string()),
                password: Some("secret".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let eligible = registry.eligible_slaves().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].0.id, configured.id);
        assert_eq!(eligible[0].1.login, "10042");
    }

    #[tokio::test]
    async fn credentials_for_incomplete_config_fail_typed() {
        let registry = registry().await;
        let slave = registry.create_account(new_account("slave", false)).await.unwrap();

        let err = registry.credentials(slave.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::ConfigIncomplete(_)));
    }
}
