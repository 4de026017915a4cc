use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use k_dbvault::vault::admin::Vault;
use k_dbvault::vault::artifact::ArtifactFormat;
use k_dbvault::vault::backup_service::BackupRequest;
use k_dbvault::vault::config::VaultConfig;
use k_dbvault::vault::import::ImportRequest;
use k_dbvault::vault::maintenance::MaintenanceTask;
use k_dbvault::vault::model::backup_record::{BackupStatus, BackupType};
use k_dbvault::vault::model::connection::{ConnectionConfig, ConnectionUpdate, Engine, NewConnection};
use k_dbvault::vault::model::import_job::{ConflictResolution, ImportMode, JobStatus};
use k_dbvault::vault::redacted::RedactedString;
use k_dbvault::vault::result_error::error::Error;
use k_dbvault::vault::result_error::result::Result;
use k_dbvault::vault::result_error::WithMsg;
use serde::Serialize;
use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::sync::mpsc::sync_channel;
use std::time::Duration;
use tracing::error;
use uuid::Uuid;

static POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Backup, restore and import of Postgres, MySQL and SQLite databases
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the maintenance scheduler until killed
    Daemon,
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Restore a backup record or a dump file into a connection
    Restore {
        /// Backup record to restore
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        backup: Option<Uuid>,
        /// Dump file to restore instead of a backup record
        #[arg(long)]
        file: Option<PathBuf>,
        /// Target connection, the active one when unset
        #[arg(long)]
        target: Option<Uuid>,
        /// Empty the restored tables first
        #[arg(long)]
        clear_data: bool,
        #[command(flatten)]
        follow: Follow,
    },
    /// Import a dump file with a mode, table groups and a conflict policy
    Import {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = ImportMode::Merge)]
        mode: ImportMode,
        #[arg(long)]
        clear_data: bool,
        /// Table group for selective imports, repeatable
        #[arg(long = "group")]
        groups: Vec<String>,
        #[arg(long, value_enum, default_value_t = ConflictResolution::Skip)]
        conflict: ConflictResolution,
        #[arg(long)]
        target: Option<Uuid>,
        #[command(flatten)]
        follow: Follow,
    },
    #[command(subcommand)]
    Job(JobCommand),
    #[command(subcommand)]
    Connection(ConnectionCommand),
    #[command(subcommand)]
    Setup(SetupCommand),
    #[command(subcommand)]
    Maintenance(MaintenanceCommand),
}

#[derive(ClapArgs, Debug)]
struct Follow {
    /// Only print the job id, poll it with `job status` from another shell
    #[arg(long)]
    detach: bool,
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    Create {
        /// Connection to back up, the active one when unset
        #[arg(long)]
        connection: Option<Uuid>,
        #[arg(long = "type", value_enum, default_value_t = BackupType::Full)]
        backup_type: BackupType,
        #[arg(long, value_enum)]
        format: Option<ArtifactFormat>,
        #[arg(long)]
        compress: bool,
        #[arg(long)]
        encrypt: bool,
        #[arg(long, default_value = "cli")]
        actor: String,
        #[command(flatten)]
        follow: Follow,
    },
    List,
    Delete {
        id: Uuid,
    },
    /// Copy the artifact of a backup to `out`
    Download {
        id: Uuid,
        out: PathBuf,
    },
    /// Recompute and compare the artifact checksum
    Verify {
        id: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum JobCommand {
    Status { id: Uuid },
    Cancel { id: Uuid },
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(ClapArgs, Debug)]
struct ConnectionFields {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    database: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ConnectionCommand {
    Add {
        #[arg(long)]
        name: String,
        /// `postgres://`, `mysql://` or `sqlite://` url instead of separate fields
        #[arg(long, conflicts_with = "engine")]
        url: Option<String>,
        #[arg(long, value_enum, required_unless_present = "url")]
        engine: Option<Engine>,
        #[command(flatten)]
        fields: ConnectionFields,
    },
    List,
    Update {
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        fields: ConnectionFields,
    },
    Delete {
        id: Uuid,
    },
    /// Make a connection the active one
    Switch {
        id: Uuid,
    },
    Default {
        id: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum SetupCommand {
    /// Issue a one-time setup token while the system is not set up
    Token,
    /// Create the first connection and administrator
    Bootstrap {
        #[arg(long)]
        token: String,
        /// First connection, required while none exists
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value = "primary")]
        name: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
}

#[derive(Subcommand, Debug)]
enum MaintenanceCommand {
    /// Run due tasks, or one task right away
    Run {
        /// daily_backup, retention_sweep, prune_history or stale_temp_cleanup
        #[arg(long)]
        task: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_connection(c: &ConnectionConfig) {
    println!(
        "{}  {}{}{}",
        c.id,
        c.label(),
        if c.is_active { "  [active]" } else { "" },
        if c.is_default { "  [default]" } else { "" }
    );
}

fn follow_job(vault: &Vault, id: Uuid, follow: &Follow) -> Result<()> {
    println!("{id}");
    // Workers live in this process, it stays up until the job finished.
    let view = vault.jobs().wait(id, POLL_INTERVAL)?;
    if !follow.detach {
        print_json(&view)?;
    }
    match view.status {
        JobStatus::Completed => Ok(()),
        _ => Err(Error::invalid_state(format!(
            "job {id} failed: {}",
            view.error_details
                .map(|d| d.message)
                .unwrap_or_else(|| "no details".to_owned())
        ))),
    }
}

fn run_backup(vault: &Vault, command: BackupCommand) -> Result<()> {
    match command {
        BackupCommand::Create {
            connection,
            backup_type,
            format,
            compress,
            encrypt,
            actor,
            follow,
        } => {
            let request = BackupRequest::builder()
                .maybe_connection_id(connection)
                .backup_type(backup_type)
                .maybe_format(format)
                .compress(compress)
                .encrypt(encrypt)
                .actor(actor)
                .build();
            let record = if follow.detach {
                let id = vault.backups().request_backup(request)?;
                println!("{id}");
                loop {
                    let record = vault.backups().get(id)?;
                    if !matches!(record.status, BackupStatus::Pending | BackupStatus::InProgress) {
                        break record;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            } else {
                let record = vault.backups().create_backup(&request)?;
                print_json(&record)?;
                record
            };
            match record.status {
                BackupStatus::Completed => Ok(()),
                _ => Err(Error::invalid_state(format!(
                    "backup {} failed: {}",
                    record.id,
                    record.error_message.unwrap_or_default()
                ))),
            }
        }
        BackupCommand::List => print_json(&vault.backups().list()?),
        BackupCommand::Delete { id } => vault.backups().delete(id),
        BackupCommand::Download { id, out } => {
            let src = vault.backups().artifact_path(id)?;
            let mut dst = File::create_new(&out)
                .map_err(Error::from)
                .with_msg(format!("Creating {out:?} failed"))?;
            std::io::copy(&mut File::open(&src)?, &mut dst)?;
            println!("{}", out.display());
            Ok(())
        }
        BackupCommand::Verify { id } => print_json(&vault.backups().verify(id)?),
    }
}

fn run_connection(vault: &Vault, command: ConnectionCommand) -> Result<()> {
    let registry = vault.registry();
    match command {
        ConnectionCommand::Add {
            name,
            url,
            engine,
            fields,
        } => {
            let new = match (url, engine) {
                (Some(url), _) => NewConnection::from_url(name, &url)?,
                (None, Some(engine)) => NewConnection {
                    name,
                    engine,
                    host: fields.host,
                    port: fields.port,
                    username: fields.username,
                    password: fields.password.map(RedactedString::new),
                    database: fields.database.unwrap_or_default(),
                },
                (None, None) => return Err(Error::invalid_state("either --url or --engine is needed")),
            };
            print_connection(&registry.add(new)?);
            Ok(())
        }
        ConnectionCommand::List => {
            registry.list()?.iter().for_each(print_connection);
            Ok(())
        }
        ConnectionCommand::Update { id, name, fields } => {
            let changes = ConnectionUpdate {
                name,
                host: fields.host,
                port: fields.port,
                username: fields.username,
                password: fields.password.map(RedactedString::new),
                database: fields.database,
            };
            print_connection(&registry.update(id, changes)?);
            Ok(())
        }
        ConnectionCommand::Delete { id } => registry.delete(id),
        ConnectionCommand::Switch { id } => {
            print_connection(&registry.switch_active(id)?);
            Ok(())
        }
        ConnectionCommand::Default { id } => {
            print_connection(&registry.set_default(id)?);
            Ok(())
        }
    }
}

fn run_setup(vault: &Vault, command: SetupCommand) -> Result<()> {
    match command {
        SetupCommand::Token => {
            let issued = vault.setup().issue_setup_token()?;
            println!("{}", issued.token.inner());
            println!("valid until {}", issued.expires_at);
            Ok(())
        }
        SetupCommand::Bootstrap {
            token,
            url,
            name,
            username,
            password,
        } => {
            let connection = url
                .map(|url| NewConnection::from_url(name, &url))
                .transpose()?;
            let outcome = vault.setup().bootstrap(
                &token,
                connection,
                &username,
                RedactedString::new(password),
            )?;
            println!(
                "Connection {} ready, administrator {}: {:?}",
                outcome.connection.label(),
                username,
                outcome.admin
            );
            Ok(())
        }
    }
}

fn run(vault: &Vault, command: Command) -> Result<()> {
    match command {
        Command::Daemon => {
            let (_shutdown, rx) = sync_channel(1);
            vault.maintenance().run_forever(rx)
        }
        Command::Backup(command) => run_backup(vault, command),
        Command::Restore {
            backup,
            file,
            target,
            clear_data,
            follow,
        } => {
            let id = match (backup, file) {
                (Some(backup), _) => vault.jobs().submit_restore(backup, target, clear_data)?,
                (None, Some(file)) => vault.jobs().submit_import(
                    ImportRequest {
                        file,
                        mode: ImportMode::Full,
                        clear_data,
                        table_groups: vec![],
                        conflict_resolution: ConflictResolution::Overwrite,
                    },
                    target,
                )?,
                (None, None) => return Err(Error::invalid_state("a backup id or --file is needed")),
            };
            follow_job(vault, id, &follow)
        }
        Command::Import {
            file,
            mode,
            clear_data,
            groups,
            conflict,
            target,
            follow,
        } => {
            let request = ImportRequest {
                file,
                mode,
                clear_data,
                table_groups: groups,
                conflict_resolution: conflict,
            };
            let id = vault.jobs().submit_import(request, target)?;
            follow_job(vault, id, &follow)
        }
        Command::Job(JobCommand::Status { id }) => print_json(&vault.jobs().status(id)?),
        Command::Job(JobCommand::Cancel { id }) => vault.jobs().cancel(id),
        Command::Job(JobCommand::List { limit }) => print_json(&vault.jobs().list(limit)?),
        Command::Connection(command) => run_connection(vault, command),
        Command::Setup(command) => run_setup(vault, command),
        Command::Maintenance(MaintenanceCommand::Run { task }) => {
            let executions = match task {
                Some(task) => vec![vault
                    .maintenance()
                    .run_task(task.parse::<MaintenanceTask>()?, Utc::now())],
                None => vault.maintenance().run_pending(Utc::now()),
            };
            for e in &executions {
                println!(
                    "{} {} {}",
                    e.task,
                    if e.success { "ok" } else { "failed" },
                    e.message.as_deref().unwrap_or_default()
                );
            }
            if executions.iter().all(|e| e.success) {
                Ok(())
            } else {
                Err(Error::invalid_state("a maintenance task failed"))
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let res = VaultConfig::load(&args.config)
        .and_then(Vault::open)
        .and_then(|vault| run(&vault, args.command));

    match res {
        Ok(()) => exit(0),
        Err(e) => {
            error!("{e}");
            eprintln!("{}", e.summary());
            for suggestion in e.kind().suggestions() {
                eprintln!("  - {suggestion}");
            }
            exit(1);
        }
    }
}
