//! # k_dbvault
//!
//! Backup, restore and import engine for Postgres, MySQL and SQLite databases.
//!
//! ## Features
//!
//! - **Backups**: full, schema-only or data-only artifacts in the engine's native
//!   format, SQL text or a portable JSON Lines interchange format
//! - **Compression and encryption**: XZ (LZMA) and age passphrase layers
//! - **Restore fallback chain**: native tool, then statement replay through the
//!   driver, then the generic record loader
//! - **Selective imports**: table groups, merge/update modes and a conflict policy
//! - **Background jobs**: bounded worker pool with pollable, persisted progress
//! - **Maintenance**: scheduled backups, retention sweeps and bookkeeping pruning
//!
//! ## Quick Start
//!
//! ```no_run
//! use k_dbvault::vault::admin::Vault;
//! use k_dbvault::vault::backup_service::BackupRequest;
//! use k_dbvault::vault::config::VaultConfig;
//!
//! let vault = Vault::open(VaultConfig::load("vault.yml")?)?;
//! let record = vault
//!     .backups()
//!     .create_backup(&BackupRequest::builder().compress(true).build())?;
//! let _job = vault.jobs().submit_restore(record.id, None, true)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod vault;
