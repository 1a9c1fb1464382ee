#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use headlog_lib::backup::error::{category, LOW_DISK, SNAPSHOT_FAILED};
use headlog_lib::backup::{BackupKind, ErrorCategory};
use util::fixture;

// Runs alone in its own binary: the override is process-wide.
#[tokio::test]
async fn snapshot_refuses_when_free_space_is_short() {
    let fx = fixture().await;
    std::env::set_var("HEADLOG_FAKE_FREE_BYTES", "10");

    let err = fx
        .coordinator
        .create_snapshot_backup(BackupKind::Manual)
        .await
        .expect_err("not enough space");
    std::env::remove_var("HEADLOG_FAKE_FREE_BYTES");

    assert_eq!(err.code(), SNAPSHOT_FAILED);
    assert!(err.chain_contains(LOW_DISK));
    assert_eq!(category(&err), ErrorCategory::Io);

    let leftovers: Vec<_> = std::fs::read_dir(&fx.config.backup_dir)
        .unwrap()
        .filter_map(Result::ok)
        .collect();
    assert!(leftovers.is_empty());
}
