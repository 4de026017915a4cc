//! The administrative account of the managed database. It is created by the
//! bootstrap wizard and put back into a known-good state after every restore
//! or import, in case the artifact replaced or disabled it.

use crate::vault::driver::SqlDriver;
use crate::vault::redacted::RedactedString;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::Result;
use crate::vault::result_error::WithMsg;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::info;
use validator::{Validate, ValidationError};

fn default_table() -> String {
    "users".to_owned()
}

fn default_username_column() -> String {
    "username".to_owned()
}

fn default_password_column() -> String {
    "password_hash".to_owned()
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct AdminAccountConfig {
    #[serde(default = "default_table")]
    #[validate(length(min = 1))]
    pub table: String,
    #[serde(default = "default_username_column")]
    #[validate(length(min = 1))]
    pub username_column: String,
    #[serde(default = "default_password_column")]
    #[validate(length(min = 1))]
    pub password_column: String,
    #[validate(length(min = 1, max = 150))]
    pub username: String,
    #[validate(custom(function = validate_password))]
    pub password: RedactedString,
    /// Other column values of a healthy account, e.g. `role: admin`, `is_active: true`
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// Account shape without credentials, filled in by the bootstrap wizard.
impl Default for AdminAccountConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            username_column: default_username_column(),
            password_column: default_password_column(),
            username: String::new(),
            password: RedactedString::default(),
            attributes: BTreeMap::new(),
        }
    }
}

fn validate_password(password: &RedactedString) -> std::result::Result<(), ValidationError> {
    if password.inner().chars().count() < 8 {
        return Err(ValidationError::new("WeakPassword")
            .with_message("administrator password needs at least 8 characters".into()));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminReset {
    Created,
    Reset,
    /// The target has no account table; nothing to reset.
    NoAccountTable,
}

/// One administrator definition plus the bcrypt cost its password is hashed with.
#[derive(Clone, Debug)]
pub struct AdminAccount {
    pub table: String,
    pub username_column: String,
    pub password_column: String,
    pub username: String,
    password: RedactedString,
    pub attributes: BTreeMap<String, Value>,
    bcrypt_cost: u32,
}

impl AdminAccount {
    pub fn new(config: &AdminAccountConfig, bcrypt_cost: u32) -> Self {
        Self {
            table: config.table.clone(),
            username_column: config.username_column.clone(),
            password_column: config.password_column.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            attributes: config.attributes.clone(),
            bcrypt_cost,
        }
    }

    /// Same account shape under another name and password, as entered in the
    /// bootstrap wizard.
    pub fn with_credentials<S: Into<String>>(mut self, username: S, password: RedactedString) -> Self {
        self.username = username.into();
        self.password = password;
        self
    }

    fn key(&self) -> Vec<String> {
        vec![self.username_column.clone()]
    }

    fn key_row(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert(self.username_column.clone(), Value::String(self.username.clone()));
        row
    }

    pub fn exists(&self, driver: &mut dyn SqlDriver) -> Result<bool> {
        if !driver.table_exists(&self.table)? {
            return Ok(false);
        }
        driver.row_exists(&self.table, &self.key(), &self.key_row())
    }

    /// Creates a minimal account table: the username as key, the password hash
    /// and one column per attribute, typed after the attribute value.
    pub fn create_table(&self, driver: &mut dyn SqlDriver) -> Result<()> {
        let mut columns = vec![
            format!("{} VARCHAR(150) PRIMARY KEY", driver.quote_ident(&self.username_column)),
            format!("{} VARCHAR(255) NOT NULL", driver.quote_ident(&self.password_column)),
        ];
        for (name, value) in &self.attributes {
            let data_type = match value {
                Value::Bool(_) => "BOOLEAN",
                Value::Number(n) if n.is_f64() => "REAL",
                Value::Number(_) => "INTEGER",
                _ => "VARCHAR(255)",
            };
            columns.push(format!("{} {}", driver.quote_ident(name), data_type));
        }
        let sql = format!(
            "CREATE TABLE {} ({})",
            driver.quote_ident(&self.table),
            columns.join(", ")
        );
        driver
            .execute(&sql)
            .map(|_| ())
            .with_msg(format!("Creating account table {} failed", self.table))
    }

    /// Writes the account with a fresh password hash, creating it when
    /// missing. Attributes the table has no column for are left out.
    pub fn reset(&self, driver: &mut dyn SqlDriver) -> Result<AdminReset> {
        if !driver.table_exists(&self.table)? {
            return Ok(AdminReset::NoAccountTable);
        }
        let columns: Vec<String> = driver
            .columns(&self.table)?
            .into_iter()
            .map(|c| c.name)
            .collect();
        if !columns.contains(&self.username_column) || !columns.contains(&self.password_column) {
            return Err(Error::invalid_state(format!(
                "table {} has no {} / {} columns for the administrator account",
                self.table, self.username_column, self.password_column
            )));
        }

        let hash = bcrypt::hash(self.password.inner(), self.bcrypt_cost)?;
        let mut row = self.key_row();
        row.insert(self.password_column.clone(), Value::String(hash));
        self.attributes
            .iter()
            .filter(|(k, _)| columns.contains(k))
            .for_each(|(k, v)| {
                row.insert(k.clone(), v.clone());
            });

        let outcome = if driver.row_exists(&self.table, &self.key(), &row)? {
            driver.update_row(&self.table, &self.key(), &row)?;
            AdminReset::Reset
        } else {
            driver.insert_row(&self.table, &row)?;
            AdminReset::Created
        };
        info!("Administrator account {} {:?}", self.username, outcome);
        Ok(outcome)
    }

    /// Checks a clear password against the stored hash.
    pub fn verify(&self, driver: &mut dyn SqlDriver, password: &str) -> Result<bool> {
        let columns = driver.columns(&self.table)?;
        let Some(pos) = columns.iter().position(|c| c.name == self.password_column) else {
            return Ok(false);
        };
        let mut offset = 0;
        loop {
            let page = driver.fetch_rows(&self.table, &columns, offset, 500)?;
            let n = page.len() as u64;
            for row in page {
                let name_matches = columns
                    .iter()
                    .zip(row.iter())
                    .any(|(c, v)| c.name == self.username_column && v.as_str() == Some(self.username.as_str()));
                if name_matches {
                    let Some(hash) = row.get(pos).and_then(Value::as_str) else {
                        return Ok(false);
                    };
                    return bcrypt::verify(password, hash)
                        .map_err(Error::from)
                        .with_msg("Checking administrator password failed");
                }
            }
            if n < 500 {
                return Ok(false);
            }
            offset += n;
        }
    }
}
