use headlog_lib::db::write_atomic;
use std::fs;
use tempfile::tempdir;

#[test]
fn sidecar_write_creates_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("backup_1_a.meta.json");
    write_atomic(&path, br#"{"id":"backup_1_a"}"#).unwrap();
    assert_eq!(fs::read(&path).unwrap(), br#"{"id":"backup_1_a"}"#);
}

#[test]
fn rewrite_replaces_whole_settings_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("settings.json");
    fs::write(&path, br#"{"lastWeeklyBackupTimestamp":"1","padding":"xxxxxxxxxxxx"}"#).unwrap();
    write_atomic(&path, br#"{"lastWeeklyBackupTimestamp":"2"}"#).unwrap();
    assert_eq!(
        fs::read(&path).unwrap(),
        br#"{"lastWeeklyBackupTimestamp":"2"}"#
    );
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path() != path)
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn missing_directory_fails_without_creating_it() {
    let dir = tempdir().unwrap();
    let existing = dir.path().join("backup_1_a.meta.json");
    fs::write(&existing, b"old").unwrap();
    let bad_path = dir.path().join("missing").join("backup_2_b.meta.json");
    assert!(write_atomic(&bad_path, b"data").is_err());
    assert_eq!(fs::read(&existing).unwrap(), b"old");
    assert!(!bad_path.parent().unwrap().exists());
}
