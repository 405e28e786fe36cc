use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use geobridge_shared::session_format::{
    decode_snapshot, encode_snapshot, AnnotationSnapshot, SnapshotDecodeError, SnapshotEncodeError,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] SnapshotDecodeError),
    #[error(transparent)]
    Encode(#[from] SnapshotEncodeError),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// `Ok(None)` when nothing was saved for the session yet.
    async fn load_session(&self, session_id: &str)
        -> Result<Option<AnnotationSnapshot>, StorageError>;
    async fn save_session(
        &self,
        session_id: &str,
        snapshot: &AnnotationSnapshot,
    ) -> Result<(), StorageError>;
}

pub struct FileStorage {
    session_dir: PathBuf,
}

impl FileStorage {
    pub fn new(session_dir: PathBuf) -> Self {
        Self { session_dir }
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.session_dir.join(format!("{session_id}.bin"))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn load_session(
        &self,
        session_id: &str,
    ) -> Result<Option<AnnotationSnapshot>, StorageError> {
        let payload = match tokio::fs::read(self.path(session_id)).await {
            Ok(payload) => payload,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        Ok(Some(decode_snapshot(&payload)?))
    }

    async fn save_session(
        &self,
        session_id: &str,
        snapshot: &AnnotationSnapshot,
    ) -> Result<(), StorageError> {
        let payload = encode_snapshot(snapshot)?;
        tokio::fs::write(self.path(session_id), payload).await?;
        Ok(())
    }
}
