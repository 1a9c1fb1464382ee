//! Seams to the host platform's share sheet and document picker. The CLI
//! drives them with plain paths; a mobile host supplies its own impls.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRequest {
    pub path: PathBuf,
    pub mime_type: String,
    pub title: String,
}

pub trait ShareTarget: Send + Sync {
    fn share(&self, request: &ShareRequest) -> AppResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedDocument {
    pub path: PathBuf,
    pub name: String,
}

pub trait DocumentPicker: Send + Sync {
    /// `None` when the user cancelled.
    fn pick(&self) -> AppResult<Option<PickedDocument>>;
}

/// "Shares" by copying the file into a destination directory.
#[derive(Debug, Clone)]
pub struct DirectoryShare {
    dest: PathBuf,
}

impl DirectoryShare {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self { dest: dest.into() }
    }
}

impl ShareTarget for DirectoryShare {
    fn share(&self, request: &ShareRequest) -> AppResult<()> {
        std::fs::create_dir_all(&self.dest).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_share_dir")
                .with_context("path", self.dest.display().to_string())
        })?;
        let name = request.path.file_name().ok_or_else(|| {
            AppError::new("SHARE/NO_FILE_NAME", "Shared path has no file name")
                .with_context("path", request.path.display().to_string())
        })?;
        let target = self.dest.join(name);
        if target != request.path {
            std::fs::copy(&request.path, &target).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "share_copy")
                    .with_context("from", request.path.display().to_string())
                    .with_context("to", target.display().to_string())
            })?;
        }
        info!(
            target: "headlog",
            event = "file_shared",
            path = %target.display(),
            mime_type = %request.mime_type
        );
        Ok(())
    }
}

/// Records share requests without touching the filesystem.
#[derive(Debug, Default)]
pub struct RecordingShare {
    requests: Mutex<Vec<ShareRequest>>,
}

impl RecordingShare {
    pub fn requests(&self) -> Vec<ShareRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl ShareTarget for RecordingShare {
    fn share(&self, request: &ShareRequest) -> AppResult<()> {
        self.requests
            .lock()
            .map_err(|_| AppError::new("SHARE/POISONED", "Share recorder lock poisoned"))?
            .push(request.clone());
        Ok(())
    }
}

/// A picker that already knows its answer.
#[derive(Debug, Clone, Default)]
pub struct PathPicker {
    picked: Option<PathBuf>,
}

impl PathPicker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            picked: Some(path.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self { picked: None }
    }
}

impl DocumentPicker for PathPicker {
    fn pick(&self) -> AppResult<Option<PickedDocument>> {
        Ok(self.picked.as_deref().map(|path: &Path| PickedDocument {
            path: path.to_path_buf(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }))
    }
}
