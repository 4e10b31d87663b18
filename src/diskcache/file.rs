//! Shared cache file handle
//!
//! Every caller that joined the same `open` gets a clone of one
//! [`CacheFile`]. The underlying descriptor is closed once; later `close`
//! calls return the first result.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

enum FileState {
    Open(File),
    Closed(std::result::Result<(), Arc<std::io::Error>>),
}

struct Inner {
    path: PathBuf,
    state: Mutex<FileState>,
}

/// Cloneable handle to an open cache file
#[derive(Clone)]
pub struct CacheFile {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFile")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl CacheFile {
    pub(crate) fn new(path: PathBuf, file: File) -> Self {
        Self {
            inner: Arc::new(Inner {
                path,
                state: Mutex::new(FileState::Open(file)),
            }),
        }
    }

    /// Path the file was opened from
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// True if two handles share one descriptor
    pub fn same_handle(&self, other: &CacheFile) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock().await, FileState::Closed(_))
    }

    /// Read the whole file from the start
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut state = self.inner.state.lock().await;
        let file = match &mut *state {
            FileState::Open(file) => file,
            FileState::Closed(_) => return Err(Error::Closed),
        };

        file.seek(SeekFrom::Start(0)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub async fn metadata(&self) -> Result<std::fs::Metadata> {
        match &*self.inner.state.lock().await {
            FileState::Open(file) => Ok(file.metadata().await?),
            FileState::Closed(_) => Err(Error::Closed),
        }
    }

    /// Close the descriptor. Safe to call from any clone, any number of
    /// times; every call returns the outcome of the first.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let outcome = match std::mem::replace(&mut *state, FileState::Closed(Ok(()))) {
            FileState::Open(mut file) => {
                let outcome = file.flush().await.map_err(Arc::new);
                drop(file);
                *state = FileState::Closed(outcome.clone());
                outcome
            }
            FileState::Closed(outcome) => {
                *state = FileState::Closed(outcome.clone());
                outcome
            }
        };

        outcome.map_err(|e| Error::Io(std::io::Error::new(e.kind(), e.to_string())))
    }
}
