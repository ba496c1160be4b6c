use super::{LockGuard, SyncError};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    ffi::OsString,
    fs::{self, File},
    io::{ErrorKind, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// A serialized document on disk that is only ever accessed while holding its lock file.
///
/// Every access loads the full document and, for mutations, writes the full document back.
/// Saving goes through a temporary sibling file and `rename(2)`, so readers never see a
/// partially written document even if the writer dies midway.
#[derive(Debug, Clone)]
pub struct SharedDocument<T> {
    path: PathBuf,
    lock: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SharedDocument<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: PathBuf, lock: PathBuf) -> Self {
        Self {
            path,
            lock,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document under lock without writing it back
    pub fn read(&self) -> Result<T, SyncError> {
        let _guard = LockGuard::acquire(&self.lock)?;

        self.load()
    }

    /// Mutate an existing document under lock.
    ///
    /// A missing document is reported as [`SyncError::DocumentNotFound`]. If `mutate` fails the
    /// document is left untouched on disk. The lock is released on every path.
    pub fn update<R, E>(&self, mutate: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E>
    where
        E: From<SyncError>,
    {
        let _guard = LockGuard::acquire(&self.lock)?;
        let mut document = self.load()?;

        let result = mutate(&mut document)?;
        self.save(&document)?;

        Ok(result)
    }

    /// Like [`SharedDocument::update`] but starts from `init()` if the document does not exist yet
    pub fn update_or_init<R, E>(
        &self,
        init: impl FnOnce() -> T,
        mutate: impl FnOnce(&mut T) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<SyncError>,
    {
        let _guard = LockGuard::acquire(&self.lock)?;
        let mut document = match self.load() {
            Ok(document) => document,
            Err(SyncError::DocumentNotFound(path)) => {
                info!(path = ?path, "Document not found, creating a new one");

                init()
            }
            Err(error) => return Err(error.into()),
        };

        let result = mutate(&mut document)?;
        self.save(&document)?;

        Ok(result)
    }

    fn load(&self) -> Result<T, SyncError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(SyncError::DocumentNotFound(self.path.clone()))
            }
            Err(source) => {
                return Err(SyncError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_yaml::from_str(&content).map_err(|source| SyncError::Serialization {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, document: &T) -> Result<(), SyncError> {
        let content =
            serde_yaml::to_string(document).map_err(|source| SyncError::Serialization {
                path: self.path.clone(),
                source,
            })?;

        let temporary = self.temporary_path();
        let io_error = |source: std::io::Error| SyncError::Io {
            path: temporary.clone(),
            source,
        };

        let mut file = File::create(&temporary).map_err(io_error)?;
        file.write_all(content.as_bytes()).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        drop(file);

        // rename is atomic on a single file system, the old document stays intact until here
        fs::rename(&temporary, &self.path).map_err(|source| SyncError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = ?self.path, "Saved document");

        Ok(())
    }

    fn temporary_path(&self) -> PathBuf {
        let mut file_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| OsString::from("document"));
        file_name.push(".tmp");

        self.path.with_file_name(file_name)
    }
}
