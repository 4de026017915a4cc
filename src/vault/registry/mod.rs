//! The catalog of database connections and the single active/default pointers.
//!
//! Every write goes to the settings file first and then to the catalog rows,
//! so a process that crashes in between still boots from the file. Pooled
//! driver connections live here too: switching the active connection drains
//! the old pool before the switch is visible.

pub mod locks;
pub mod settings_file;

use crate::vault::catalog::Catalog;
use crate::vault::driver::mysql::MySqlDriver;
use crate::vault::driver::postgres::PostgresDriver;
use crate::vault::driver::sqlite::SqliteDriver;
use crate::vault::driver::{DriverOpener, SqlDriver};
use crate::vault::model::connection::{ConnectionConfig, ConnectionUpdate, Engine, NewConnection};
use crate::vault::redacted::RedactedString;
use crate::vault::registry::locks::{TargetGuard, TargetLocks};
use crate::vault::registry::settings_file::SettingsFile;
use crate::vault::result_error::error::Error;
use crate::vault::result_error::result::{unpoison, Result};
use crate::vault::result_error::WithMsg;
use chrono::Utc;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{MySqlPool, PgPool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

static POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
static DEFAULT_POOL_SIZE: u32 = 4;
static DISCOVERED_NAME: &str = "default";

/// Called after the active connection changed, with the previous and the new
/// active config. Used to drop caches that assumed the old database.
pub type SwitchListener = Box<dyn Fn(Option<&ConnectionConfig>, &ConnectionConfig) + Send + Sync>;

#[derive(Clone, Debug)]
enum Pool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

pub struct ConnectionRegistry {
    configs: Mutex<Vec<ConnectionConfig>>,
    settings: SettingsFile,
    catalog: Arc<Catalog>,
    runtime: Runtime,
    pools: Mutex<HashMap<Uuid, Pool>>,
    pool_size: u32,
    locks: TargetLocks,
    listeners: Mutex<Vec<SwitchListener>>,
}

impl ConnectionRegistry {
    /// Loads the settings file, repairs the active/default flags if needed and
    /// mirrors the result into the catalog.
    pub fn new(settings: SettingsFile, catalog: Arc<Catalog>) -> Result<Self> {
        let mut configs = settings.load()?.connections;
        let repaired = normalize(&mut configs);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("k_dbvault-db")
            .enable_all()
            .build()?;

        let registry = Self {
            configs: Mutex::new(configs),
            settings,
            catalog,
            runtime,
            pools: Mutex::new(HashMap::new()),
            pool_size: DEFAULT_POOL_SIZE,
            locks: TargetLocks::default(),
            listeners: Mutex::new(vec![]),
        };
        if repaired {
            warn!(
                "Repaired active/default flags in {:?}",
                registry.settings.path()
            );
            let configs = registry.list()?;
            registry.settings.store(&configs)?;
        }
        registry.reconcile()?;
        Ok(registry)
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Rewrites the catalog rows from the settings file content.
    pub fn reconcile(&self) -> Result<()> {
        let configs = self.list()?;
        self.catalog
            .replace_connections(&configs)
            .with_msg("Mirror connection settings into the catalog failed")
    }

    pub fn list(&self) -> Result<Vec<ConnectionConfig>> {
        Ok(unpoison(self.configs.lock(), "connection registry")?.clone())
    }

    pub fn get(&self, id: Uuid) -> Result<ConnectionConfig> {
        unpoison(self.configs.lock(), "connection registry")?
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("connection", id.to_string()))
    }

    pub fn active(&self) -> Result<Option<ConnectionConfig>> {
        Ok(unpoison(self.configs.lock(), "connection registry")?
            .iter()
            .find(|c| c.is_active)
            .cloned())
    }

    pub fn require_active(&self) -> Result<ConnectionConfig> {
        self.active()?
            .ok_or_else(|| Error::not_found("connection", "active"))
    }

    pub fn default_connection(&self) -> Result<Option<ConnectionConfig>> {
        Ok(unpoison(self.configs.lock(), "connection registry")?
            .iter()
            .find(|c| c.is_default)
            .cloned())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(unpoison(self.configs.lock(), "connection registry")?.is_empty())
    }

    /// The first connection added becomes both active and default.
    pub fn add(&self, new: NewConnection) -> Result<ConnectionConfig> {
        new.validate()?;
        let mut configs = unpoison(self.configs.lock(), "connection registry")?;
        if configs.iter().any(|c| c.name == new.name) {
            return Err(Error::invalid_state(format!(
                "a connection named {:?} already exists",
                new.name
            )));
        }
        let now = Utc::now();
        let first = configs.is_empty();
        let config = ConnectionConfig {
            id: Uuid::new_v4(),
            name: new.name,
            engine: new.engine,
            host: new.host,
            port: new.port,
            username: new.username,
            password: new.password,
            database: new.database,
            is_active: first,
            is_default: first,
            created_at: now,
            updated_at: now,
        };
        let mut next = configs.clone();
        next.push(config.clone());
        self.persist(&next)?;
        *configs = next;
        info!("Added connection {}", config.label());
        Ok(config)
    }

    /// Changing a connection drops its pool, so it may not run under a job.
    pub fn update(&self, id: Uuid, changes: ConnectionUpdate) -> Result<ConnectionConfig> {
        let mut configs = unpoison(self.configs.lock(), "connection registry")?;
        let idx = position(&configs, id)?;
        let _guard = self.locks.try_lock(id, &configs[idx].name)?;

        let mut next = configs.clone();
        changes.apply(&mut next[idx]);
        let updated = next[idx].clone();
        self.persist(&next)?;
        *configs = next;
        self.close_pool(id)?;
        info!("Updated connection {}", updated.label());
        Ok(updated)
    }

    /// The active connection cannot be deleted. A deleted default moves the
    /// default flag to the active connection.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let mut configs = unpoison(self.configs.lock(), "connection registry")?;
        let idx = position(&configs, id)?;
        if configs[idx].is_active {
            return Err(Error::invalid_state(format!(
                "connection {} is active, switch to another one before deleting it",
                configs[idx].name
            )));
        }
        let _guard = self.locks.try_lock(id, &configs[idx].name)?;

        let mut next = configs.clone();
        let removed = next.remove(idx);
        if removed.is_default {
            next.iter_mut()
                .filter(|c| c.is_active)
                .for_each(|c| c.is_default = true);
        }
        normalize(&mut next);
        self.persist(&next)?;
        *configs = next;
        self.close_pool(id)?;
        info!("Deleted connection {}", removed.label());
        Ok(())
    }

    /// Makes `id` the active connection. Both the old and the new target must
    /// be idle; the old target's pool is drained before the switch is stored.
    pub fn switch_active(&self, id: Uuid) -> Result<ConnectionConfig> {
        let (previous, current) = {
            let mut configs = unpoison(self.configs.lock(), "connection registry")?;
            let idx = position(&configs, id)?;
            if configs[idx].is_active {
                return Ok(configs[idx].clone());
            }
            let previous = configs.iter().find(|c| c.is_active).cloned();

            let _guard = {
                let mut targets = vec![(id, configs[idx].name.as_str())];
                if let Some(p) = &previous {
                    targets.push((p.id, p.name.as_str()));
                }
                self.locks.try_lock_all(&targets)?
            };

            if let Some(p) = &previous {
                self.close_pool(p.id)?;
            }
            let mut next = configs.clone();
            let now = Utc::now();
            next.iter_mut().for_each(|c| {
                let active = c.id == id;
                if c.is_active != active {
                    c.is_active = active;
                    c.updated_at = now;
                }
            });
            self.persist(&next)?;
            *configs = next;
            (previous, configs[idx].clone())
        };

        info!(
            "Switched active connection from {} to {}",
            previous
                .as_ref()
                .map(ConnectionConfig::label)
                .unwrap_or_else(|| "<none>".to_owned()),
            current.label()
        );
        for listener in unpoison(self.listeners.lock(), "switch listeners")?.iter() {
            listener(previous.as_ref(), &current);
        }
        Ok(current)
    }

    pub fn set_default(&self, id: Uuid) -> Result<ConnectionConfig> {
        let mut configs = unpoison(self.configs.lock(), "connection registry")?;
        let idx = position(&configs, id)?;
        let mut next = configs.clone();
        let now = Utc::now();
        next.iter_mut().for_each(|c| {
            let default = c.id == id;
            if c.is_default != default {
                c.is_default = default;
                c.updated_at = now;
            }
        });
        self.persist(&next)?;
        *configs = next;
        info!("Default connection is now {}", configs[idx].label());
        Ok(configs[idx].clone())
    }

    pub fn on_switch(&self, listener: SwitchListener) -> Result<()> {
        unpoison(self.listeners.lock(), "switch listeners")?.push(listener);
        Ok(())
    }

    /// Creates the first connection from the process environment when the
    /// registry is still empty.
    pub fn discover_from_env(&self) -> Result<Option<ConnectionConfig>> {
        self.discover_from(|key| std::env::var(key).ok())
    }

    /// Reads `DATABASE_URL`, or `DB_ENGINE` / `DB_HOST` / `DB_PORT` / `DB_NAME` /
    /// `DB_USER` / `DB_PASSWORD`, through `lookup`.
    pub fn discover_from<F: Fn(&str) -> Option<String>>(
        &self,
        lookup: F,
    ) -> Result<Option<ConnectionConfig>> {
        if !self.is_empty()? {
            return Ok(None);
        }
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let new = if let Some(url) = var("DATABASE_URL") {
            NewConnection::from_url(DISCOVERED_NAME, &url)
                .with_msg("DATABASE_URL is not a usable database url")?
        } else if let (Some(engine), Some(database)) = (var("DB_ENGINE"), var("DB_NAME")) {
            let engine: Engine = engine.to_ascii_lowercase().parse()?;
            let port = var("DB_PORT")
                .map(|p| {
                    p.parse::<u16>()
                        .map_err(|e| Error::invalid_state(format!("DB_PORT {p:?}: {e}")))
                })
                .transpose()?;
            NewConnection {
                name: DISCOVERED_NAME.to_owned(),
                engine,
                host: var("DB_HOST"),
                port,
                username: var("DB_USER"),
                password: var("DB_PASSWORD").map(RedactedString::new),
                database,
            }
        } else {
            return Ok(None);
        };

        let config = self.add(new)?;
        info!("Discovered connection {} from the environment", config.label());
        Ok(Some(config))
    }

    pub fn locks(&self) -> &TargetLocks {
        &self.locks
    }

    /// Reserves `config` for one destructive job.
    pub fn lock_target(&self, config: &ConnectionConfig) -> Result<TargetGuard> {
        self.locks.try_lock(config.id, &config.name)
    }

    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    fn persist(&self, configs: &[ConnectionConfig]) -> Result<()> {
        self.settings.store(configs)?;
        self.catalog
            .replace_connections(configs)
            .with_msg("Mirror connection settings into the catalog failed")
    }

    fn pool(&self, config: &ConnectionConfig) -> Result<Pool> {
        let mut pools = unpoison(self.pools.lock(), "connection pools")?;
        if let Some(pool) = pools.get(&config.id) {
            return Ok(pool.clone());
        }

        let _enter = self.runtime.enter();
        let host = config.host.as_deref().unwrap_or("localhost");
        let pool = match config.engine {
            Engine::Postgres => {
                let mut options = PgConnectOptions::new().host(host).database(&config.database);
                if let Some(port) = config.port_or_default() {
                    options = options.port(port);
                }
                if let Some(username) = &config.username {
                    options = options.username(username);
                }
                if let Some(password) = config.password_str() {
                    options = options.password(password);
                }
                Pool::Postgres(
                    PgPoolOptions::new()
                        .max_connections(self.pool_size)
                        .idle_timeout(POOL_IDLE_TIMEOUT)
                        .connect_lazy_with(options),
                )
            }
            Engine::MySql => {
                let mut options = MySqlConnectOptions::new().host(host).database(&config.database);
                if let Some(port) = config.port_or_default() {
                    options = options.port(port);
                }
                if let Some(username) = &config.username {
                    options = options.username(username);
                }
                if let Some(password) = config.password_str() {
                    options = options.password(password);
                }
                Pool::MySql(
                    MySqlPoolOptions::new()
                        .max_connections(self.pool_size)
                        .idle_timeout(POOL_IDLE_TIMEOUT)
                        .connect_lazy_with(options),
                )
            }
            Engine::Sqlite => {
                return Err(Error::invalid_state(
                    "sqlite connections are opened directly, not pooled",
                ))
            }
        };
        pools.insert(config.id, pool.clone());
        Ok(pool)
    }

    fn close_pool(&self, id: Uuid) -> Result<()> {
        let pool = unpoison(self.pools.lock(), "connection pools")?.remove(&id);
        match pool {
            Some(Pool::Postgres(pool)) => self.runtime.block_on(pool.close()),
            Some(Pool::MySql(pool)) => self.runtime.block_on(pool.close()),
            None => return Ok(()),
        }
        info!("Closed pooled connections of {id}");
        Ok(())
    }
}

impl DriverOpener for ConnectionRegistry {
    fn open_driver(&self, config: &ConnectionConfig) -> Result<Box<dyn SqlDriver>> {
        if config.engine == Engine::Sqlite {
            return Ok(Box::new(SqliteDriver::open_or_create(Path::new(
                &config.database,
            ))?));
        }
        match self.pool(config)? {
            Pool::Postgres(pool) => Ok(Box::new(PostgresDriver::connect(
                self.handle(),
                &pool,
                &config.label(),
            )?)),
            Pool::MySql(pool) => Ok(Box::new(MySqlDriver::connect(
                self.handle(),
                &pool,
                &config.label(),
            )?)),
        }
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        let pools: Vec<Uuid> = match self.pools.lock() {
            Ok(pools) => pools.keys().copied().collect(),
            Err(_) => return,
        };
        for id in pools {
            if let Err(e) = self.close_pool(id) {
                warn!("Closing pool {id} failed: {e}");
            }
        }
    }
}

fn position(configs: &[ConnectionConfig], id: Uuid) -> Result<usize> {
    configs
        .iter()
        .position(|c| c.id == id)
        .ok_or_else(|| Error::not_found("connection", id.to_string()))
}

/// Leaves exactly one active and one default config in a non-empty list.
/// Returns whether anything changed.
fn normalize(configs: &mut [ConnectionConfig]) -> bool {
    if configs.is_empty() {
        return false;
    }
    let before: Vec<(bool, bool)> = configs.iter().map(|c| (c.is_active, c.is_default)).collect();

    let active = configs
        .iter()
        .position(|c| c.is_active)
        .or_else(|| configs.iter().position(|c| c.is_default))
        .unwrap_or(0);
    configs
        .iter_mut()
        .enumerate()
        .for_each(|(i, c)| c.is_active = i == active);

    let default = configs.iter().position(|c| c.is_default).unwrap_or(active);
    configs
        .iter_mut()
        .enumerate()
        .for_each(|(i, c)| c.is_default = i == default);

    configs
        .iter()
        .map(|c| (c.is_active, c.is_default))
        .ne(before.into_iter())
}
