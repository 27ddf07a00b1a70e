//! Object storage access.
//!
//! Paths are URLs: `s3://bucket/key` is served by [`S3Storage`], plain paths
//! and `file://` URLs by [`LocalStorage`]. [`StorageRouter`] picks the backend
//! from the scheme so a single engine can move bytes between both.
//!
//! # Listing
//!
//! A path ending in `/` (or an empty path) names a prefix and lists every
//! object below it, with paths relative to the prefix. Any other path lists
//! only the object stored at exactly that path, with an empty relative path.
//! Listing something that does not exist yields nothing.

use std::cell::OnceCell;
use std::io::{self, Read, Write};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::settings::Settings;

mod local;
mod s3;

pub use local::LocalStorage;
pub use s3::{S3Options, S3Storage};

const SCHEME_SEPARATOR: &str = "://";
const S3_SCHEME: &str = "s3";
const FILE_SCHEME: &str = "file";

/// An object found by [`Storage::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
  /// S3 ETag compatible hash of the content.
  pub md5: String,
  /// Path relative to the listed path.
  pub path: String,
}

pub trait Storage {
  /// Lists objects at or below `path`.
  fn list(&self, path: &str) -> Result<Vec<RemoteObject>, StorageError>;

  /// Streams the object at `path` into `writer`, returning the bytes copied.
  fn read_into(&self, path: &str, writer: &mut dyn Write) -> Result<u64, StorageError>;

  /// Stores everything `reader` yields at `path`, replacing any existing
  /// object.
  fn write(&self, reader: &mut dyn Read, path: &str) -> Result<(), StorageError>;

  fn read_to_string(&self, path: &str) -> Result<String, StorageError> {
    let mut buffer = Vec::new();
    self.read_into(path, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| StorageError::NotUtf8(path.to_string()))
  }
}

impl<S: Storage + ?Sized> Storage for &S {
  fn list(&self, path: &str) -> Result<Vec<RemoteObject>, StorageError> {
    (**self).list(path)
  }

  fn read_into(&self, path: &str, writer: &mut dyn Write) -> Result<u64, StorageError> {
    (**self).read_into(path, writer)
  }

  fn write(&self, reader: &mut dyn Read, path: &str) -> Result<(), StorageError> {
    (**self).write(reader, path)
  }
}

/// Dispatches each call to the backend serving the path's scheme. The S3
/// client is only built on first use.
pub struct StorageRouter {
  local: LocalStorage,
  s3_options: S3Options,
  s3: OnceCell<S3Storage>,
}

impl StorageRouter {
  pub fn new(s3_options: S3Options) -> Self {
    Self {
      local: LocalStorage,
      s3_options,
      s3: OnceCell::new(),
    }
  }

  pub fn from_settings(settings: &Settings) -> Self {
    Self::new(S3Options::from_settings(settings))
  }

  fn backend(&self, path: &str) -> Result<&dyn Storage, StorageError> {
    match scheme(path) {
      None | Some(FILE_SCHEME) => Ok(&self.local),
      Some(S3_SCHEME) => Ok(self.s3()?),
      Some(other) => Err(StorageError::UnsupportedScheme(other.to_string())),
    }
  }

  fn s3(&self) -> Result<&S3Storage, StorageError> {
    if let Some(client) = self.s3.get() {
      return Ok(client);
    }

    #[cfg(feature = "tracing")]
    debug!("Initializing S3 client");

    let client = S3Storage::new(self.s3_options.clone())?;
    Ok(self.s3.get_or_init(|| client))
  }
}

impl Storage for StorageRouter {
  fn list(&self, path: &str) -> Result<Vec<RemoteObject>, StorageError> {
    self.backend(path)?.list(path)
  }

  fn read_into(&self, path: &str, writer: &mut dyn Write) -> Result<u64, StorageError> {
    self.backend(path)?.read_into(path, writer)
  }

  fn write(&self, reader: &mut dyn Read, path: &str) -> Result<(), StorageError> {
    self.backend(path)?.write(reader, path)
  }
}

/// Returns the URL scheme of `path`, if any.
pub fn scheme(path: &str) -> Option<&str> {
  path
    .split_once(SCHEME_SEPARATOR)
    .map(|(scheme, _)| scheme)
}

/// Errors raised by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("Object not found: {0}")]
  NotFound(String),
  #[error("IO error on {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: io::Error,
  },
  #[error("Object {0} is not valid UTF-8")]
  NotUtf8(String),
  #[error("Unsupported storage scheme: {0}")]
  UnsupportedScheme(String),
  #[error("Invalid S3 URL: {0}")]
  InvalidUrl(String),
  #[error("S3 request for {path} failed: {message}")]
  S3 { path: String, message: String },
  #[error("Failed to start the S3 client runtime: {0}")]
  Runtime(io::Error),
}

impl StorageError {
  pub(crate) fn io(path: impl Into<String>, source: io::Error) -> Self {
    if source.kind() == io::ErrorKind::NotFound {
      StorageError::NotFound(path.into())
    } else {
      StorageError::Io {
        path: path.into(),
        source,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_scheme() {
    assert_eq!(scheme("s3://bucket/key"), Some("s3"));
    assert_eq!(scheme("file:///tmp/x"), Some("file"));
    assert_eq!(scheme("/tmp/x"), None);
    assert_eq!(scheme("relative/x"), None);
  }

  #[test]
  fn test_router_rejects_unknown_scheme() {
    let router = StorageRouter::new(S3Options::default());
    match router.list("gs://bucket/key") {
      Err(StorageError::UnsupportedScheme(scheme)) => assert_eq!(scheme, "gs"),
      other => panic!("Expected UnsupportedScheme, got {:?}", other),
    }
  }

  #[test]
  fn test_router_serves_local_paths() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.env");
    let url = format!("file://{}", path.display());

    let router = StorageRouter::new(S3Options::default());
    router.write(&mut "A=1\n".as_bytes(), &url).unwrap();

    assert_eq!(router.read_to_string(path.to_str().unwrap()).unwrap(), "A=1\n");
    assert_eq!(router.list(&url).unwrap().len(), 1);
  }
}
