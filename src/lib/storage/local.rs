use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{FILE_SCHEME, RemoteObject, SCHEME_SEPARATOR, Storage, StorageError};
use crate::hash::md5s3;
use crate::mapping::is_prefix;

/// Storage backed by the local filesystem, for plain paths and `file://`
/// URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStorage;

impl LocalStorage {
  fn resolve(path: &str) -> PathBuf {
    let stripped = path
      .strip_prefix(FILE_SCHEME)
      .and_then(|rest| rest.strip_prefix(SCHEME_SEPARATOR))
      .unwrap_or(path);

    if stripped.is_empty() {
      PathBuf::from(".")
    } else {
      PathBuf::from(stripped)
    }
  }

  fn hash(path: &Path) -> Result<String, StorageError> {
    let file = File::open(path).map_err(|e| StorageError::io(path.display().to_string(), e))?;
    md5s3(file).map_err(|e| StorageError::io(path.display().to_string(), e))
  }
}

impl Storage for LocalStorage {
  fn list(&self, path: &str) -> Result<Vec<RemoteObject>, StorageError> {
    let root = Self::resolve(path);

    if !is_prefix(path) {
      return if root.is_file() {
        Ok(vec![RemoteObject {
          md5: Self::hash(&root)?,
          path: String::new(),
        }])
      } else {
        Ok(Vec::new())
      };
    }

    if !root.is_dir() {
      return Ok(Vec::new());
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(&root).follow_links(true).sort_by_file_name() {
      let entry = entry.map_err(|e| {
        let path = e
          .path()
          .map(|p| p.display().to_string())
          .unwrap_or_else(|| root.display().to_string());
        StorageError::io(path, e.into())
      })?;

      if !entry.file_type().is_file() {
        continue;
      }

      let relative = entry
        .path()
        .strip_prefix(&root)
        .unwrap_or(entry.path())
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

      objects.push(RemoteObject {
        md5: Self::hash(entry.path())?,
        path: relative,
      });
    }

    Ok(objects)
  }

  fn read_into(&self, path: &str, writer: &mut dyn Write) -> Result<u64, StorageError> {
    let resolved = Self::resolve(path);
    let mut file = File::open(&resolved).map_err(|e| StorageError::io(path, e))?;
    io::copy(&mut file, writer).map_err(|e| StorageError::io(path, e))
  }

  fn write(&self, reader: &mut dyn Read, path: &str) -> Result<(), StorageError> {
    let resolved = Self::resolve(path);
    if let Some(parent) = resolved.parent().filter(|p| !p.as_os_str().is_empty()) {
      fs::create_dir_all(parent).map_err(|e| StorageError::io(path, e))?;
    }

    let mut file = File::create(&resolved).map_err(|e| StorageError::io(path, e))?;
    io::copy(reader, &mut file).map_err(|e| StorageError::io(path, e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn url(dir: &TempDir, relative: &str) -> String {
    format!("{}/{}", dir.path().display(), relative)
  }

  #[test]
  fn test_list_prefix_is_recursive_and_relative() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("files/nested")).unwrap();
    fs::write(dir.path().join("files/a.txt"), "a").unwrap();
    fs::write(dir.path().join("files/nested/b.txt"), "b").unwrap();

    let objects = LocalStorage.list(&url(&dir, "files/")).unwrap();
    let paths: Vec<_> = objects.iter().map(|o| o.path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "nested/b.txt"]);
    assert_eq!(objects[0].md5, "0cc175b9c0f1b6a831c399e269772661");
  }

  #[test]
  fn test_list_single_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("app.env"), "A=1").unwrap();

    let objects = LocalStorage.list(&url(&dir, "app.env")).unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].path, "");

    assert!(LocalStorage.list(&url(&dir, "missing.env")).unwrap().is_empty());
    assert!(LocalStorage.list(&url(&dir, "missing/")).unwrap().is_empty());
  }

  #[test]
  fn test_write_creates_parents_and_read_missing_is_not_found() {
    let dir = TempDir::new().unwrap();
    let target = format!("file://{}", url(&dir, "deep/dir/file.txt"));

    LocalStorage.write(&mut "content".as_bytes(), &target).unwrap();
    assert_eq!(LocalStorage.read_to_string(&target).unwrap(), "content");

    assert!(matches!(
      LocalStorage.read_to_string(&url(&dir, "nope.txt")),
      Err(StorageError::NotFound(_))
    ));
  }
}
