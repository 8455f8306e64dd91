//! Collision-safe destination naming
//!
//! `report.pdf` → `report_(1).pdf` → `report_(2).pdf` … The first name that
//! can be created exclusively wins. Probing is serialized per destination
//! directory so concurrent transfers to one recipient never pick the same
//! name.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::fs::{self, File, OpenOptions};

use crate::error::FileTransferError;

/// Strip any directory components from a client-supplied name
pub fn sanitize_filename(raw: &str) -> Result<String, FileTransferError> {
    let last = raw.rsplit(&['/', '\\'][..]).next().unwrap_or("").trim();
    if last.is_empty() || last == "." || last == ".." || last.chars().any(char::is_control) {
        return Err(FileTransferError::InvalidFilename(raw.to_string()));
    }
    Ok(last.to_string())
}

/// The `attempt`-th candidate for `filename` (0 is the name itself)
///
/// A leading dot does not start an extension: `.env` → `.env_(1)`.
pub fn candidate_name(filename: &str, attempt: u32) -> String {
    if attempt == 0 {
        return filename.to_string();
    }
    match filename.rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = filename.split_at(dot);
            format!("{stem}_({attempt}){ext}")
        }
        _ => format!("{filename}_({attempt})"),
    }
}

/// One async lock per destination directory
#[derive(Debug, Default)]
pub struct DestinationLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl DestinationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(dir.to_path_buf()).or_default().clone()
    }

    /// Create `dir` if needed and exclusively create the first free name
    pub async fn create_unique(
        &self,
        dir: &Path,
        filename: &str,
    ) -> Result<(PathBuf, File), FileTransferError> {
        let name = sanitize_filename(filename)?;
        let lock = self.lock_for(dir);
        let _guard = lock.lock().await;

        fs::create_dir_all(dir).await?;
        let mut attempt = 0u32;
        loop {
            let path = dir.join(candidate_name(&name, attempt));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    attempt = attempt
                        .checked_add(1)
                        .ok_or_else(|| FileTransferError::InvalidFilename(name.clone()))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_names() {
        assert_eq!(candidate_name("report.pdf", 0), "report.pdf");
        assert_eq!(candidate_name("report.pdf", 1), "report_(1).pdf");
        assert_eq!(candidate_name("archive.tar.gz", 2), "archive.tar_(2).gz");
        assert_eq!(candidate_name("README", 3), "README_(3)");
        assert_eq!(candidate_name(".env", 1), ".env_(1)");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\a.txt").unwrap(), "a.txt");
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("dir/").is_err());
        assert!(sanitize_filename("..").is_err());
    }

    #[tokio::test]
    async fn test_second_file_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let locks = DestinationLocks::new();

        let (first, _) = locks.create_unique(dir.path(), "report.pdf").await.unwrap();
        let (second, _) = locks.create_unique(dir.path(), "report.pdf").await.unwrap();
        assert_eq!(first.file_name().unwrap(), "report.pdf");
        assert_eq!(second.file_name().unwrap(), "report_(1).pdf");
    }

    #[tokio::test]
    async fn test_concurrent_names_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(DestinationLocks::new());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let path = dir.path().to_path_buf();
            tasks.push(tokio::spawn(async move {
                locks.create_unique(&path, "same.txt").await.unwrap().0
            }));
        }
        let mut names = Vec::new();
        for task in tasks {
            names.push(task.await.unwrap());
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }
}
