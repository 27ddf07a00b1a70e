//! File synchronization between local paths and remote storage.
//!
//! [`S3Conf`] moves files and the environment file between the local
//! filesystem and a [`Storage`] backend:
//!
//! - [`S3Conf::download`] / [`S3Conf::upload`] copy a single file or a whole
//!   prefix/directory. Downloads skip files whose local hash already matches
//!   the remote one.
//! - [`S3Conf::downsync`] / [`S3Conf::upsync`] apply a mapping list, usually
//!   the one stored under `S3CONF_MAP` (see [`S3Conf::map_files`]).
//! - [`S3Conf::get_envfile`], [`S3Conf::set`], [`S3Conf::unset`] and
//!   [`S3Conf::edit`] read and modify the remote environment file named by
//!   `S3CONF`.
//!
//! # Examples
//!
//! ```rust,no_run
//! use s3conf::settings::Settings;
//! use s3conf::sync::S3Conf;
//!
//! let settings = Settings::load(Some("dev"), None).unwrap();
//! let s3conf = S3Conf::from_settings(settings);
//!
//! s3conf.downsync(&s3conf.map_files(), None, false).unwrap();
//! for (key, value) in s3conf.environment().unwrap() {
//!     println!("{key}={value}");
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

#[cfg(feature = "tracing")]
use tracing::{debug, error, info, trace};

use crate::editor::{Editor, EditorError, render_diff};
use crate::hash::matches_etag;
use crate::mapping::{FileMapping, change_root_dir, join_remote, unpack_list};
use crate::parse::{EnvFile, ParseError};
use crate::settings::{ENV_FILE_KEY, FILE_MAP_KEY, Settings};
use crate::storage::{Storage, StorageError, StorageRouter};

/// Mode requested for newly downloaded files, before the umask applies.
#[cfg(unix)]
const NEW_FILE_MODE: u32 = 0o666;

/// Main synchronization service.
pub struct S3Conf<S = StorageRouter> {
  settings: Settings,
  storage: S,
}

impl S3Conf<StorageRouter> {
  /// Builds the service with the storage router configured from `settings`.
  pub fn from_settings(settings: Settings) -> Self {
    let storage = StorageRouter::from_settings(&settings);
    Self { settings, storage }
  }
}

impl<S: Storage> S3Conf<S> {
  pub fn new(settings: Settings, storage: S) -> Self {
    Self { settings, storage }
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Remote path of the environment file, from the `S3CONF` setting.
  pub fn environment_file_path(&self) -> Result<&str, S3ConfError> {
    match self.settings.get(ENV_FILE_KEY) {
      Some(path) if !path.trim().is_empty() => Ok(path),
      _ => {
        #[cfg(feature = "tracing")]
        error!("Environment file name is not defined or is empty");
        Err(S3ConfError::EnvfilePathNotDefined)
      }
    }
  }

  /// The mapping list stored under `S3CONF_MAP`, empty when unset.
  pub fn map_files(&self) -> Vec<FileMapping> {
    self
      .settings
      .get(FILE_MAP_KEY)
      .map(unpack_list)
      .unwrap_or_default()
  }

  /// Downloads `path` to `target`.
  ///
  /// When `path` is a prefix (ends with `/`), every object below it is
  /// written under the `target` directory; otherwise the single object is
  /// written to `target` itself. Unless `force` is set, files whose local
  /// hash matches the remote hash are left untouched.
  ///
  /// Returns the remote hash of every listed object, keyed by its path
  /// relative to `path`.
  pub fn download(
    &self,
    path: &str,
    target: &Path,
    force: bool,
  ) -> Result<BTreeMap<String, String>, S3ConfError> {
    #[cfg(feature = "tracing")]
    info!("Downloading {} to {}", path, target.display());

    let mut hashes = BTreeMap::new();

    for object in self.storage.list(path)? {
      let target_name = if object.path.is_empty() {
        target.to_path_buf()
      } else {
        target.join(&object.path)
      };

      if !force && is_up_to_date(&target_name, &object.md5)? {
        #[cfg(feature = "tracing")]
        debug!("{} is up to date", target_name.display());
      } else {
        let source_name = join_remote(path, &object.path);

        #[cfg(feature = "tracing")]
        debug!("Transferring file {} to {}", source_name, target_name.display());

        self.fetch(&source_name, &target_name)?;
      }

      hashes.insert(object.path, object.md5);
    }

    #[cfg(feature = "tracing")]
    if hashes.is_empty() {
      info!("Nothing found at {}", path);
    }

    Ok(hashes)
  }

  /// Uploads `path` to `target`. A directory is uploaded recursively, each
  /// file keyed by its path relative to the directory. Returns the number of
  /// files uploaded.
  pub fn upload(&self, path: &Path, target: &str) -> Result<usize, S3ConfError> {
    #[cfg(feature = "tracing")]
    info!("Uploading {} to {}", path.display(), target);

    if !path.is_dir() {
      self.push(path, target)?;
      return Ok(1);
    }

    let mut uploaded = 0;
    for entry in WalkDir::new(path).follow_links(true).sort_by_file_name() {
      let entry = entry.map_err(|e| S3ConfError::local(path, e.into()))?;
      if !entry.file_type().is_file() {
        continue;
      }

      let relative = entry
        .path()
        .strip_prefix(path)
        .unwrap_or(entry.path())
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

      self.push(entry.path(), &join_remote(target, &relative))?;
      uploaded += 1;
    }

    Ok(uploaded)
  }

  /// Downloads every `remote -> local` mapping, re-rooting local paths under
  /// `root_dir` when given.
  pub fn downsync(
    &self,
    files: &[FileMapping],
    root_dir: Option<&Path>,
    force: bool,
  ) -> Result<(), S3ConfError> {
    for FileMapping { remote, local } in files {
      self.download(remote, &change_root_dir(local, root_dir), force)?;
    }
    Ok(())
  }

  /// Uploads every `remote <- local` mapping, re-rooting local paths under
  /// `root_dir` when given.
  pub fn upsync(&self, files: &[FileMapping], root_dir: Option<&Path>) -> Result<(), S3ConfError> {
    for FileMapping { remote, local } in files {
      self.upload(&change_root_dir(local, root_dir), remote)?;
    }
    Ok(())
  }

  /// Reads and parses the remote environment file.
  pub fn get_envfile(&self) -> Result<EnvFile<'static>, S3ConfError> {
    let path = self.environment_file_path()?;

    #[cfg(feature = "tracing")]
    info!("Loading configs from {}", path);

    let text = self.storage.read_to_string(path)?;
    parse_envfile(path, &text).map(EnvFile::into_owned)
  }

  /// Decoded variables of the remote environment file.
  pub fn environment(&self) -> Result<BTreeMap<String, String>, S3ConfError> {
    Ok(self.get_envfile()?.as_map())
  }

  /// Assigns variables in the remote environment file, keeping every other
  /// line as it is. With `create`, a missing file is started from scratch.
  pub fn set(&self, assignments: &[(String, String)], create: bool) -> Result<(), S3ConfError> {
    self.modify(create, |env| {
      for (key, value) in assignments {
        let _previous = env.set(key, value);

        #[cfg(feature = "tracing")]
        trace!(key = %key, replaced = _previous.is_some(), "Set variable");
      }
      true
    })
  }

  /// Removes variables from the remote environment file. The file is only
  /// rewritten when something was removed.
  pub fn unset(&self, keys: &[String]) -> Result<bool, S3ConfError> {
    let mut removed = false;
    self.modify(false, |env| {
      for key in keys {
        removed |= env.unset(key);
      }
      removed
    })?;
    Ok(removed)
  }

  /// Opens the remote environment file in `editor` and uploads the result
  /// when it changed and still parses. Returns whether an upload happened.
  pub fn edit(&self, editor: &Editor, create: bool) -> Result<bool, S3ConfError> {
    let path = self.environment_file_path()?;
    let original = self.read_remote_text(path, create)?;

    let edited = editor.edit(&original)?;
    parse_envfile(path, &edited)?;

    if edited == original {
      #[cfg(feature = "tracing")]
      info!("No changes to {}", path);
      return Ok(false);
    }

    #[cfg(feature = "tracing")]
    info!("Updating {}\n{}", path, render_diff(&original, &edited, path, "edited"));

    self.storage.write(&mut edited.as_bytes(), path)?;
    Ok(true)
  }

  /// Unified diff between the remote environment file and a local file.
  pub fn diff(&self, local: &Path) -> Result<String, S3ConfError> {
    let path = self.environment_file_path()?;
    let remote = self.storage.read_to_string(path)?;
    let local_text = fs::read_to_string(local).map_err(|e| S3ConfError::local(local, e))?;
    Ok(render_diff(
      &remote,
      &local_text,
      path,
      &local.display().to_string(),
    ))
  }

  fn modify<F>(&self, create: bool, apply: F) -> Result<(), S3ConfError>
  where
    F: FnOnce(&mut EnvFile<'_>) -> bool,
  {
    let path = self.environment_file_path()?;
    let text = self.read_remote_text(path, create)?;
    let mut env = parse_envfile(path, &text)?;

    if !apply(&mut env) {
      #[cfg(feature = "tracing")]
      debug!("Nothing to update in {}", path);
      return Ok(());
    }

    let updated = env.to_string();
    self.storage.write(&mut updated.as_bytes(), path)?;

    #[cfg(feature = "tracing")]
    info!("Updated {}", path);

    Ok(())
  }

  fn read_remote_text(&self, path: &str, create: bool) -> Result<String, S3ConfError> {
    match self.storage.read_to_string(path) {
      Err(StorageError::NotFound(_)) if create => {
        #[cfg(feature = "tracing")]
        info!("{} does not exist yet, starting empty", path);
        Ok(String::new())
      }
      result => Ok(result?),
    }
  }

  /// Streams `source` into a temporary file next to `target` and moves it
  /// into place, so a failed transfer never leaves a truncated file behind.
  /// An existing target keeps its permissions.
  fn fetch(&self, source: &str, target: &Path) -> Result<(), S3ConfError> {
    let parent = match target.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent,
      _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| S3ConfError::local(parent, e))?;

    #[cfg_attr(not(unix), allow(unused_mut))]
    let mut builder = tempfile::Builder::new();
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      // Subject to the umask, like a plain create.
      builder.permissions(fs::Permissions::from_mode(NEW_FILE_MODE));
    }
    let mut staged = builder
      .tempfile_in(parent)
      .map_err(|e| S3ConfError::local(parent, e))?;
    self.storage.read_into(source, staged.as_file_mut())?;

    if let Ok(existing) = fs::metadata(target) {
      staged
        .as_file()
        .set_permissions(existing.permissions())
        .map_err(|e| S3ConfError::local(target, e))?;
    }

    staged
      .persist(target)
      .map_err(|e| S3ConfError::local(target, e.error))?;
    Ok(())
  }

  fn push(&self, source: &Path, target: &str) -> Result<(), S3ConfError> {
    #[cfg(feature = "tracing")]
    debug!("Transferring file {} to {}", source.display(), target);

    let mut file = File::open(source).map_err(|e| S3ConfError::local(source, e))?;
    self.storage.write(&mut file, target)?;
    Ok(())
  }
}

/// Splits a `KEY=VALUE` command line argument.
pub fn parse_assignment(assignment: &str) -> Result<(String, String), S3ConfError> {
  match assignment.split_once('=') {
    Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
    _ => Err(S3ConfError::InvalidAssignment(assignment.to_string())),
  }
}

fn parse_envfile<'a>(path: &str, text: &'a str) -> Result<EnvFile<'a>, S3ConfError> {
  EnvFile::try_from(text).map_err(|source| S3ConfError::Parse {
    path: path.to_string(),
    source,
  })
}

fn is_up_to_date(path: &Path, etag: &str) -> Result<bool, S3ConfError> {
  match File::open(path) {
    Ok(file) => matches_etag(file, etag).map_err(|e| S3ConfError::local(path, e)),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
    Err(e) => Err(S3ConfError::local(path, e)),
  }
}

/// Errors that can occur while synchronizing.
#[derive(Debug, thiserror::Error)]
pub enum S3ConfError {
  /// The `S3CONF` setting is missing or empty
  #[error("Environment file path is not defined: set S3CONF in the environment or the config section")]
  EnvfilePathNotDefined,
  /// Error reported by the storage backend
  #[error(transparent)]
  Storage(#[from] StorageError),
  /// Error accessing a local file
  #[error("Local file IO error on {path}: {source}")]
  LocalIo { path: PathBuf, source: io::Error },
  /// The environment file is not valid dotenv
  #[error("Failed to parse {path}: {source}")]
  Parse { path: String, source: ParseError },
  /// A command line assignment is not `KEY=VALUE`
  #[error("Invalid assignment {0:?}: expected KEY=VALUE")]
  InvalidAssignment(String),
  #[error(transparent)]
  Editor(#[from] EditorError),
}

impl S3ConfError {
  fn local(path: &Path, source: io::Error) -> Self {
    S3ConfError::LocalIo {
      path: path.to_path_buf(),
      source,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::hash::md5s3;
  use crate::storage::LocalStorage;
  use tempfile::TempDir;

  fn service(settings: &[(&str, &str)]) -> S3Conf<LocalStorage> {
    S3Conf::new(settings.iter().copied().collect(), LocalStorage)
  }

  #[test]
  fn test_envfile_path_not_defined() {
    assert!(matches!(
      service(&[]).environment_file_path(),
      Err(S3ConfError::EnvfilePathNotDefined)
    ));
    assert!(matches!(
      service(&[(ENV_FILE_KEY, "  ")]).get_envfile(),
      Err(S3ConfError::EnvfilePathNotDefined)
    ));
  }

  #[test]
  fn test_map_files() {
    let s3conf = service(&[(FILE_MAP_KEY, "s3://b/files/:cfg/;s3://b/one:/etc/one")]);
    assert_eq!(
      s3conf.map_files(),
      vec![
        FileMapping::new("s3://b/files/", "cfg/"),
        FileMapping::new("s3://b/one", "/etc/one"),
      ]
    );
    assert!(service(&[]).map_files().is_empty());
  }

  #[test]
  fn test_parse_assignment() {
    assert_eq!(
      parse_assignment("KEY=a=b").unwrap(),
      ("KEY".to_string(), "a=b".to_string())
    );
    assert!(matches!(
      parse_assignment("=x"),
      Err(S3ConfError::InvalidAssignment(_))
    ));
    assert!(parse_assignment("novalue").is_err());
  }

  #[test]
  fn test_download_skips_matching_hash() {
    let dir = TempDir::new().unwrap();
    let remote = dir.path().join("remote.txt");
    let local = dir.path().join("out/local.txt");
    fs::write(&remote, "same").unwrap();
    fs::create_dir_all(local.parent().unwrap()).unwrap();
    fs::write(&local, "same").unwrap();

    let s3conf = service(&[]);
    let before = fs::metadata(&local).unwrap().modified().unwrap();
    let hashes = s3conf
      .download(remote.to_str().unwrap(), &local, false)
      .unwrap();

    assert_eq!(hashes.len(), 1);
    assert_eq!(hashes.get(""), Some(&md5s3(&b"same"[..]).unwrap()));
    assert_eq!(fs::metadata(&local).unwrap().modified().unwrap(), before);
  }

  #[test]
  fn test_download_replaces_changed_file() {
    let dir = TempDir::new().unwrap();
    let remote = dir.path().join("remote.txt");
    let local = dir.path().join("local.txt");
    fs::write(&remote, "new").unwrap();
    fs::write(&local, "old").unwrap();

    service(&[])
      .download(remote.to_str().unwrap(), &local, false)
      .unwrap();

    assert_eq!(fs::read_to_string(&local).unwrap(), "new");
  }

  #[test]
  fn test_read_remote_text_create() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.env");
    let s3conf = service(&[]);

    assert_eq!(
      s3conf.read_remote_text(missing.to_str().unwrap(), true).unwrap(),
      ""
    );
    assert!(matches!(
      s3conf.read_remote_text(missing.to_str().unwrap(), false),
      Err(S3ConfError::Storage(StorageError::NotFound(_)))
    ));
  }
}
