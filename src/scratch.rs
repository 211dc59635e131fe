//! # Scratch Files
//!
//! Uploaded audio is written to a uniquely named temporary file so the model
//! runtime can read it by path. The file is removed when the [`ScratchFile`]
//! is dropped, whether transcription succeeded or not.
//!
//! Removal failures never reach the client. They are logged and, when a
//! [`CleanupObserver`] is installed, reported to it.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;

/// Suffix used when the upload's filename has no usable extension.
pub const DEFAULT_SUFFIX: &str = ".wav";

/// Called with the path and error when a scratch file cannot be removed.
pub type CleanupObserver = Arc<dyn Fn(&Path, &io::Error) + Send + Sync>;

/// Suffix for the scratch file of an upload named `filename`: the name's
/// extension with a leading dot, or [`DEFAULT_SUFFIX`].
pub fn suffix_for(filename: Option<&str>) -> String {
    filename
        .map(Path::new)
        .and_then(Path::extension)
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| DEFAULT_SUFFIX.to_string())
}

/// A temporary file holding one upload, deleted on drop.
pub struct ScratchFile {
    path: Option<TempPath>,
    observer: Option<CleanupObserver>,
}

impl ScratchFile {
    /// Write `bytes` to a new file in `dir` (or the OS temp directory) whose
    /// name ends in `suffix`.
    pub fn create(
        dir: Option<&Path>,
        suffix: &str,
        bytes: &[u8],
        observer: Option<CleanupObserver>,
    ) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("asr-upload-").suffix(suffix);
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(bytes)?;
        file.flush()?;

        tracing::debug!("Staged {} bytes at {:?}", bytes.len(), file.path());

        Ok(Self {
            path: Some(file.into_temp_path()),
            observer,
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        let location: PathBuf = path.to_path_buf();
        if let Err(e) = path.close() {
            tracing::warn!("Failed to remove scratch file {:?}: {}", location, e);
            if let Some(observer) = &self.observer {
                observer(&location, &e);
            }
        }
    }
}
