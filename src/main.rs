use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use headlog_lib::backup::error::category;
use headlog_lib::backup::{
    BackupCoordinator, BackupDeps, BackupKind, BackupMetadata, ErrorCategory, NonFatal,
    WeeklyBackupStatus,
};
use headlog_lib::config::BackupConfig;
use headlog_lib::db::LiveDatabase;
use headlog_lib::error_log::{ErrorLog, JsonlErrorLog};
use headlog_lib::kv_store::StoreHandle;
use headlog_lib::migrate::SchemaMigrator;
use headlog_lib::platform::{DirectoryShare, PathPicker, RecordingShare, ShareTarget};
use headlog_lib::time::to_date;
use headlog_lib::{AppError, AppResult};

#[derive(Debug, Parser)]
#[command(name = "headlog", about = "Headlog backup and database maintenance", version)]
struct Cli {
    /// Data directory holding the database, backups and logs.
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create, list, restore and maintain backups.
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Database schema commands.
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    /// Create a snapshot backup of the live database.
    Create {
        /// Write a legacy full-data JSON backup instead of a snapshot.
        #[arg(long)]
        legacy: bool,
        /// Tag the backup as automatic so retention may remove it.
        #[arg(long)]
        automatic: bool,
        /// Emit the backup metadata as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List backups, newest first.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Replace the live database with a backup.
    Restore { id: String },
    /// Delete a backup and its metadata.
    Delete { id: String },
    /// Report broken backup files.
    Validate {
        /// Delete what was found.
        #[arg(long)]
        cleanup: bool,
    },
    /// Apply the automatic-backup retention limit.
    Prune,
    /// Create the weekly automatic backup if one is due.
    Weekly,
    /// Copy a backup file into a directory.
    Export {
        id: String,
        #[arg(long, value_name = "DIR")]
        to: PathBuf,
    },
    /// Add a database or JSON backup file to the backup list.
    Import { path: PathBuf },
    /// Write all diary data as JSON into a directory.
    ExportData {
        #[arg(long, value_name = "DIR")]
        to: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply pending schema migrations.
    Migrate,
    /// Show the database and app schema versions.
    Status,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DbStatus {
    path: PathBuf,
    schema_version: i64,
    app_schema_version: i64,
    backups: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match &cli.data_dir {
        Some(dir) => BackupConfig::load_from(dir),
        None => match BackupConfig::load() {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Error: {} ({})", err.message(), err.code());
                process::exit(1);
            }
        },
    };
    if let Err(err) = headlog_lib::init_logging(Some(&config.log_dir)) {
        eprintln!("Warning: file logging disabled: {err:#}");
    }

    let code = match run(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            print_error(&err);
            exit_code(category(&err))
        }
    };
    headlog_lib::flush_file_logs();
    process::exit(code);
}

fn exit_code(category: ErrorCategory) -> i32 {
    match category {
        ErrorCategory::NotFound => 3,
        ErrorCategory::Incompatible => 4,
        ErrorCategory::Corrupt => 5,
        ErrorCategory::Io | ErrorCategory::Other => 1,
    }
}

fn print_error(err: &AppError) {
    eprintln!("Error: {} ({})", err.message(), err.code());
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {} ({})", cause.message(), cause.code());
    }
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::from(err).with_context("operation", "print_json"))?;
    println!("{text}");
    Ok(())
}

async fn open_live(config: &BackupConfig, migrate: bool) -> AppResult<Arc<LiveDatabase>> {
    let db = LiveDatabase::open(&config.db_path).await?;
    if migrate {
        let pool = db.pool().await?;
        SchemaMigrator::new().run_pending_migrations(&pool).await?;
    }
    Ok(Arc::new(db))
}

async fn coordinator(
    config: BackupConfig,
    share: Arc<dyn ShareTarget>,
) -> AppResult<BackupCoordinator> {
    let db = open_live(&config, true).await?;
    let store = StoreHandle::json_file(&config.settings_path).map_err(|err| {
        AppError::new("SETTINGS/READ", err.to_string())
            .with_context("path", config.settings_path.display().to_string())
    })?;
    let error_log: Arc<dyn ErrorLog> = Arc::new(JsonlErrorLog::new(&config.error_log_path));
    let coordinator = BackupCoordinator::new(BackupDeps::new(config, db, error_log), store, share);
    coordinator.initialize()?;
    Ok(coordinator)
}

fn no_share() -> Arc<dyn ShareTarget> {
    Arc::new(RecordingShare::default())
}

fn print_backup_line(meta: &BackupMetadata) {
    println!(
        "{:<34} {:<8} v{:<3} {:<25} {:>10}",
        meta.id,
        format!("{:?}", meta.backup_type).to_lowercase(),
        meta.schema_version,
        to_date(meta.timestamp).to_rfc3339(),
        meta.file_size
    );
}

async fn run(command: Commands, config: BackupConfig) -> AppResult<i32> {
    match command {
        Commands::Backup(cmd) => run_backup(cmd, config).await,
        Commands::Db(cmd) => run_db(cmd, config).await,
    }
}

async fn run_backup(command: BackupCommand, config: BackupConfig) -> AppResult<i32> {
    match command {
        BackupCommand::Create {
            legacy,
            automatic,
            json,
        } => {
            let coordinator = coordinator(config, no_share()).await?;
            let kind = BackupKind::from_automatic(automatic);
            let meta = if legacy {
                coordinator.create_backup(kind).await?
            } else {
                coordinator.create_snapshot_backup(kind).await?
            };
            if json {
                print_json(&meta)?;
            } else {
                println!("Backup {} created ({} bytes)", meta.id, meta.file_size);
            }
            Ok(0)
        }
        BackupCommand::List { json } => {
            let coordinator = coordinator(config, no_share()).await?;
            let backups = coordinator.list_backups()?;
            if json {
                print_json(&backups)?;
            } else if backups.is_empty() {
                println!("No backups.");
            } else {
                backups.iter().for_each(print_backup_line);
            }
            Ok(0)
        }
        BackupCommand::Restore { id } => {
            let coordinator = coordinator(config, no_share()).await?;
            let report = coordinator.restore_backup(&id).await?;
            println!(
                "Restored {} (schema v{} -> v{})",
                report.backup_id, report.backup_schema_version, report.schema_version
            );
            if let Some(path) = &report.safety_backup {
                println!("Previous database kept at {}", path.display());
            }
            Ok(0)
        }
        BackupCommand::Delete { id } => {
            let coordinator = coordinator(config, no_share()).await?;
            coordinator.delete_backup(&id)?;
            println!("Deleted {id}");
            Ok(0)
        }
        BackupCommand::Validate { cleanup } => {
            let coordinator = coordinator(config, no_share()).await?;
            let broken = coordinator.validator().scan()?;
            for artifact in &broken {
                println!("{:?}\t{}", artifact.reason, artifact.path.display());
            }
            if cleanup {
                let removed = coordinator.cleanup_broken_backups()?;
                println!("Removed {removed} broken backup file(s).");
                Ok(0)
            } else {
                println!("{} broken backup file(s).", broken.len());
                Ok(if broken.is_empty() { 0 } else { 2 })
            }
        }
        BackupCommand::Prune => {
            let coordinator = coordinator(config, no_share()).await?;
            match coordinator.cleanup_old_auto_backups() {
                NonFatal::Completed(report) => {
                    for id in &report.deleted {
                        println!("Deleted {id}");
                    }
                    println!(
                        "Kept {} automatic backup(s); {} could not be deleted.",
                        report.kept, report.failures
                    );
                    Ok(0)
                }
                NonFatal::Failed(err) => {
                    print_error(&err);
                    Ok(1)
                }
            }
        }
        BackupCommand::Weekly => {
            let coordinator = coordinator(config, no_share()).await?;
            match coordinator.check_and_create_weekly_backup().await {
                NonFatal::Completed(WeeklyBackupStatus::Created(meta)) => {
                    println!("Weekly backup {} created", meta.id);
                    Ok(0)
                }
                NonFatal::Completed(WeeklyBackupStatus::NotDue { next_due_at }) => {
                    println!("Weekly backup not due until {}", to_date(next_due_at).to_rfc3339());
                    Ok(0)
                }
                NonFatal::Failed(err) => {
                    print_error(&err);
                    Ok(1)
                }
            }
        }
        BackupCommand::Export { id, to } => {
            let coordinator = coordinator(config, Arc::new(DirectoryShare::new(&to))).await?;
            let request = coordinator.export_backup(&id).await?;
            println!("Exported {} to {}", request.path.display(), to.display());
            Ok(0)
        }
        BackupCommand::Import { path } => {
            let coordinator = coordinator(config, no_share()).await?;
            match coordinator.import_backup(&PathPicker::new(&path)).await? {
                Some(meta) => println!("Imported {} as {}", path.display(), meta.id),
                None => println!("Import cancelled."),
            }
            Ok(0)
        }
        BackupCommand::ExportData { to } => {
            let coordinator = coordinator(config, Arc::new(DirectoryShare::new(&to))).await?;
            let path = coordinator.export_data_as_json().await?;
            println!("Data exported to {}", path.display());
            Ok(0)
        }
    }
}

async fn run_db(command: DbCommand, config: BackupConfig) -> AppResult<i32> {
    match command {
        DbCommand::Migrate => {
            let db = open_live(&config, false).await?;
            let pool = db.pool().await?;
            let report = SchemaMigrator::new().run_pending_migrations(&pool).await?;
            db.close().await;
            if report.applied.is_empty() {
                println!("Database is at schema v{}; nothing to apply.", report.to_version);
            } else {
                println!(
                    "Migrated v{} -> v{} ({} migration(s))",
                    report.from_version,
                    report.to_version,
                    report.applied.len()
                );
            }
            Ok(0)
        }
        DbCommand::Status => {
            let db = open_live(&config, false).await?;
            let pool = db.pool().await?;
            let migrator = SchemaMigrator::new();
            let schema_version = migrator.schema_version(&pool).await?;
            db.close().await;
            let backups = headlog_lib::backup::BackupInventory::new(
                headlog_lib::backup::BackupPaths::from_config(&config),
            )
            .list_backups()?
            .len();
            print_json(&DbStatus {
                path: config.db_path.clone(),
                schema_version,
                app_schema_version: migrator.current_version(),
                backups,
            })?;
            Ok(0)
        }
    }
}
