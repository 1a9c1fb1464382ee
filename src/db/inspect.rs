//! Read-only inspection of database files that are not the live connection:
//! snapshot artifacts, imported files and the live file while it is closed.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use sha2::{Digest, Sha256};

use super::SQLITE_HEADER;
use crate::migrate::SCHEMA_VERSION_TABLE;
use crate::{AppError, AppResult};

pub fn file_sha256(path: &Path) -> AppResult<String> {
    let mut file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_for_hash")
            .with_context("path", path.display().to_string())
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_for_hash")
                .with_context("path", path.display().to_string())
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn bytes_sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn has_sqlite_header(bytes: &[u8]) -> bool {
    bytes.len() >= SQLITE_HEADER.len() && &bytes[..SQLITE_HEADER.len()] == SQLITE_HEADER
}

/// Reads the first 16 bytes of `path` and checks the SQLite magic string.
pub fn file_has_sqlite_header(path: &Path) -> AppResult<bool> {
    let mut file = File::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_for_header")
            .with_context("path", path.display().to_string())
    })?;
    let mut header = [0_u8; 16];
    match file.read_exact(&mut header) {
        Ok(()) => Ok(has_sqlite_header(&header)),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(AppError::from(err)
            .with_context("operation", "read_header")
            .with_context("path", path.display().to_string())),
    }
}

/// `file:` URI that opens `path` as immutable, so WAL-mode copies can be read
/// without creating `-wal`/`-shm` files next to them.
fn immutable_uri(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut uri = String::with_capacity(raw.len() + 20);
    uri.push_str("file:");
    for ch in raw.chars() {
        match ch {
            '%' => uri.push_str("%25"),
            '?' => uri.push_str("%3f"),
            '#' => uri.push_str("%23"),
            _ => uri.push(ch),
        }
    }
    uri.push_str("?immutable=1");
    uri
}

/// Schema version stamped into the database file at `path`; `0` when the
/// version table has never been created. The file must not be open elsewhere.
pub fn read_schema_version(path: &Path) -> AppResult<i64> {
    let conn = Connection::open_with_flags(
        immutable_uri(path),
        OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_read_only")
            .with_context("path", path.display().to_string())
    })?;

    let has_table: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [SCHEMA_VERSION_TABLE],
            |row| row.get(0),
        )
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_schema_version")
                .with_context("path", path.display().to_string())
        })?;
    if !has_table {
        return Ok(0);
    }

    let version: Option<i64> = conn
        .query_row(
            &format!("SELECT version FROM {SCHEMA_VERSION_TABLE} WHERE id = 1"),
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_schema_version")
                .with_context("path", path.display().to_string())
        })?;
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn file_sha256_matches_manual_digest() {
        let mut tmp = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, b"hello world").unwrap();
        assert_eq!(file_sha256(tmp.path()).unwrap(), bytes_sha256(b"hello world"));
    }

    #[test]
    fn header_check_rejects_text_files() {
        let dir = tempdir().unwrap();
        let text = dir.path().join("notes.db");
        std::fs::write(&text, b"not a database").unwrap();
        assert!(!file_has_sqlite_header(&text).unwrap());

        let short = dir.path().join("short.db");
        std::fs::write(&short, b"SQL").unwrap();
        assert!(!file_has_sqlite_header(&short).unwrap());
    }

    #[test]
    fn immutable_uri_escapes_query_characters() {
        assert_eq!(
            immutable_uri(Path::new("/tmp/a?b#c%d.db")),
            "file:/tmp/a%3fb%23c%25d.db?immutable=1"
        );
    }

    #[test]
    fn schema_version_reads_stamp_or_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("versions.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE episodes (id TEXT PRIMARY KEY);")
                .unwrap();
        }
        assert!(file_has_sqlite_header(&path).unwrap());
        assert_eq!(read_schema_version(&path).unwrap(), 0);

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_version (id INTEGER PRIMARY KEY CHECK (id = 1), version INTEGER NOT NULL, updated_at INTEGER NOT NULL);
                 INSERT INTO schema_version (id, version, updated_at) VALUES (1, 4, 0);",
            )
            .unwrap();
        }
        assert_eq!(read_schema_version(&path).unwrap(), 4);
    }
}
