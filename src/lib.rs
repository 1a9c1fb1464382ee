//! Backup, restore and schema maintenance for the Headlog migraine diary.

pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod error_log;
pub mod kv_store;
pub mod logging;
pub mod migrate;
pub mod platform;
pub mod repo;
pub mod time;

pub use error::{AppError, AppResult};
pub use logging::{flush_file_logs, init_logging};
