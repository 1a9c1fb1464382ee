//! Backup and restore of the diary database.
//!
//! Every service is a plain struct built from [`BackupDeps`]; none of them
//! keeps state between calls beyond what lives on disk.

use std::sync::Arc;

use crate::config::BackupConfig;
use crate::db::LiveDatabase;
use crate::error_log::ErrorLog;
use crate::migrate::SchemaMigrator;

pub mod coordinator;
pub mod creator;
pub mod error;
pub mod exporter;
pub mod inventory;
pub mod metadata;
pub mod paths;
pub mod restorer;
pub mod validator;

pub use coordinator::{BackupCoordinator, NonFatal, RetentionReport, WeeklyBackupStatus};
pub use creator::BackupCreator;
pub use error::ErrorCategory;
pub use exporter::BackupExporter;
pub use inventory::BackupInventory;
pub use metadata::{BackupData, BackupKind, BackupMetadata, BackupType};
pub use paths::BackupPaths;
pub use restorer::{BackupRestorer, RestoreReport};
pub use validator::{BackupValidator, BrokenArtifact, BrokenReason};

/// Collaborators shared by the backup services.
#[derive(Clone)]
pub struct BackupDeps {
    pub config: Arc<BackupConfig>,
    pub paths: BackupPaths,
    pub db: Arc<LiveDatabase>,
    pub migrator: SchemaMigrator,
    pub error_log: Arc<dyn ErrorLog>,
}

impl BackupDeps {
    pub fn new(config: BackupConfig, db: Arc<LiveDatabase>, error_log: Arc<dyn ErrorLog>) -> Self {
        Self {
            paths: BackupPaths::from_config(&config),
            config: Arc::new(config),
            db,
            migrator: SchemaMigrator::new(),
            error_log,
        }
    }

    pub fn with_migrator(mut self, migrator: SchemaMigrator) -> Self {
        self.migrator = migrator;
        self
    }

    pub fn inventory(&self) -> BackupInventory {
        BackupInventory::new(self.paths.clone())
    }
}
