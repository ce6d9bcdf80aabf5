use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("object read failed: {0}")]
    Io(#[from] io::Error),
}

/// Get-bytes-by-key view of the document image store.
pub trait ObjectStore: Send + Sync {
    fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

/// Image store backed by the inbox directory; keys are paths relative to
/// the inbox root.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf) -> Self {
        LocalObjectStore { root }
    }
}

impl ObjectStore for LocalObjectStore {
    fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.root.join(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                Err(ObjectStoreError::AccessDenied(key.to_string()))
            }
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }
}
