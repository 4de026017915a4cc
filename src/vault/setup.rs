//! First-run bootstrap. While no connection or no administrator exists, an
//! operator can issue a short-lived setup token; presenting it once creates the
//! first connection and the first administrator.

use crate::vault::admin_account::{AdminAccount, AdminAccountConfig, AdminReset};
use crate::vault::catalog::Catalog;
use crate::vault::checksum::sha256_str;
use crate::vault::driver::DriverOpener;
use crate::vault::model::connection::{ConnectionConfig, NewConnection};
use crate::vault::model::setup_token::SetupToken;
use crate::vault::redacted::RedactedString;
use crate::vault::registry::ConnectionRegistry;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithMsg;
use base64::Engine as _;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

static TOKEN_BYTES: usize = 32;

/// Token handed to the operator. The clear value exists only here.
#[derive(Clone, Debug)]
pub struct IssuedToken {
    pub token: RedactedString,
    pub expires_at: chrono::DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct BootstrapOutcome {
    pub connection: ConnectionConfig,
    pub admin: AdminReset,
}

pub struct SetupService {
    catalog: Arc<Catalog>,
    registry: Arc<ConnectionRegistry>,
    ttl: std::time::Duration,
    admin: AdminAccountConfig,
    bcrypt_cost: u32,
}

impl SetupService {
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<ConnectionRegistry>,
        ttl: std::time::Duration,
        admin: AdminAccountConfig,
        bcrypt_cost: u32,
    ) -> Self {
        Self {
            catalog,
            registry,
            ttl,
            admin,
            bcrypt_cost,
        }
    }

    /// No connection yet, or the active database has no administrator.
    pub fn bootstrap_needed(&self) -> Result<bool> {
        let Some(active) = self.registry.active()? else {
            return Ok(true);
        };
        let mut driver = self.registry.open_driver(&active)?;
        let account = AdminAccount::new(&self.admin, self.bcrypt_cost);
        if !driver.table_exists(&account.table)? {
            return Ok(true);
        }
        Ok(driver.count_rows(&account.table)? == 0)
    }

    pub fn issue_setup_token(&self) -> Result<IssuedToken> {
        if !self.bootstrap_needed()? {
            return Err(Error::invalid_state(
                "the system is already set up, no setup token is needed",
            ));
        }
        let now = Utc::now();
        let removed = self.catalog.delete_stale_tokens(now)?;
        if removed > 0 {
            info!("Removed {removed} used or expired setup token(s)");
        }

        let bytes: [u8; TOKEN_BYTES] = rand::random();
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        let ttl = Duration::from_std(self.ttl)
            .map_err(|e| Error::invalid_state(format!("setup_token_ttl: {e}")))?;
        let record = SetupToken {
            id: Uuid::new_v4(),
            token_hash: sha256_str(&token),
            is_used: false,
            expires_at: now + ttl,
            created_at: now,
        };
        self.catalog.insert_token(&record)?;
        info!("Issued setup token {} valid until {}", record.id, record.expires_at);
        Ok(IssuedToken {
            token: RedactedString::new(token),
            expires_at: record.expires_at,
        })
    }

    pub fn token_is_valid(&self, token: &str) -> Result<bool> {
        Ok(self
            .catalog
            .find_token(&sha256_str(token))?
            .map(|t| t.is_valid(Utc::now()))
            .unwrap_or(false))
    }

    /// Consumes `token` and sets the system up. `connection` is required while
    /// the registry is empty and refused afterwards.
    pub fn bootstrap(
        &self,
        token: &str,
        connection: Option<NewConnection>,
        username: &str,
        password: RedactedString,
    ) -> Result<BootstrapOutcome> {
        let mut admin_config = self.admin.clone();
        admin_config.username = username.to_owned();
        admin_config.password = password.clone();
        admin_config.validate()?;
        let empty = self.registry.is_empty()?;
        match (&connection, empty) {
            (None, true) => {
                return Err(Error::invalid_state(
                    "the first connection is required to set the system up",
                ))
            }
            (Some(_), false) => {
                return Err(Error::invalid_state(
                    "a connection is already configured; manage it through the registry",
                ))
            }
            (Some(c), true) => c.validate()?,
            (None, false) => {}
        }

        if !self.catalog.consume_token(&sha256_str(token), Utc::now())? {
            warn!("Rejected an invalid, used or expired setup token");
            return Err(Error::invalid_state("setup token is invalid, used or expired"));
        }

        let connection = match connection {
            Some(c) => self.registry.add(c)?,
            None => self.registry.require_active()?,
        };
        let account = AdminAccount::new(&admin_config, self.bcrypt_cost);
        let mut driver = self
            .registry
            .open_driver(&connection)
            .with_msg(format!("Opening {} failed", connection.label()))?;
        if !driver.table_exists(&account.table)? {
            account.create_table(driver.as_mut())?;
        }
        let admin = account.reset(driver.as_mut())?;
        info!(
            "Bootstrap finished: connection {}, administrator {}",
            connection.label(),
            account.username
        );
        Ok(BootstrapOutcome { connection, admin })
    }
}
