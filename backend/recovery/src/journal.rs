//! Append-only binary journal.
//!
//! Each append writes one bincode frame and fsyncs before returning, so a
//! record that was acknowledged survives a crash. A torn trailing frame from
//! a crash mid-append is dropped on read; earlier frames stay valid.

use std::io::Cursor;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use usbcage_core::CageError;

/// Frame format version.
pub const JOURNAL_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Frame<T> {
    version: u8,
    written_at: i64,
    payload: T,
}

#[derive(Debug, Clone)]
pub struct Journal<T> {
    path: PathBuf,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Journal<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), _payload: PhantomData }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Durably append one record.
    pub async fn append(&self, payload: T) -> Result<(), CageError> {
        let frame = Frame {
            version: JOURNAL_FORMAT_VERSION,
            written_at: chrono::Utc::now().timestamp(),
            payload,
        };
        let bytes = bincode::serialize(&frame)
            .map_err(|e| CageError::RecoveryLog(format!("encode {}: {e}", self.path.display())))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CageError::RecoveryLog(format!("open {}: {e}", self.path.display())))?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all()
            .await
            .map_err(|e| CageError::RecoveryLog(format!("fsync {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Journal record appended");
        Ok(())
    }

    /// All intact records in append order, or `None` if the file is absent.
    pub async fn read_all(&self) -> Result<Option<Vec<T>>, CageError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CageError::RecoveryLog(format!("read {}: {e}", self.path.display()))),
        };

        let mut cursor = Cursor::new(raw.as_slice());
        let mut records = Vec::new();
        while (cursor.position() as usize) < raw.len() {
            let offset = cursor.position();
            match bincode::deserialize_from::<_, Frame<T>>(&mut cursor) {
                Ok(frame) if frame.version == JOURNAL_FORMAT_VERSION => records.push(frame.payload),
                Ok(frame) => {
                    return Err(CageError::RecoveryLog(format!(
                        "{}: unsupported frame version {} at offset {offset}",
                        self.path.display(),
                        frame.version
                    )));
                }
                Err(e) => {
                    warn!(path = %self.path.display(), offset, error = %e, "Dropping torn journal tail");
                    break;
                }
            }
        }
        Ok(Some(records))
    }

    /// Delete the journal. Missing is fine.
    pub async fn remove(&self) -> Result<(), CageError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CageError::RecoveryLog(format!("remove {}: {e}", self.path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interfaces.bin");

        let journal: Journal<String> = Journal::new(&path);
        journal.append("eth0".into()).await.unwrap();
        journal.append("wlan0".into()).await.unwrap();

        let reopened: Journal<String> = Journal::new(&path);
        assert_eq!(
            reopened.read_all().await.unwrap(),
            Some(vec!["eth0".to_string(), "wlan0".to_string()])
        );
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let journal: Journal<String> = Journal::new(dir.path().join("absent.bin"));
        assert!(journal.read_all().await.unwrap().is_none());
        journal.remove().await.unwrap();
    }

    #[tokio::test]
    async fn torn_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("interfaces.bin");
        let journal: Journal<String> = Journal::new(&path);
        journal.append("eth0".into()).await.unwrap();
        journal.append("wlan0".into()).await.unwrap();

        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 3]).unwrap();

        assert_eq!(journal.read_all().await.unwrap(), Some(vec!["eth0".to_string()]));
    }
}
