//! Path mapping between remote keys and local files.
//!
//! A mapping list is a `;`-separated list of `remote:local` pairs, for example
//! `s3://bucket/dev/files/:config/;s3://bucket/dev/cert.pem:/etc/ssl/cert.pem`.
//! Each pair is split at its last `:` so that URL schemes stay with the
//! remote side.

use std::path::{Path, PathBuf};

const PAIR_SEPARATOR: char = ';';
const SIDE_SEPARATOR: char = ':';
const KEY_SEPARATOR: char = '/';

/// A single `remote -> local` pair of a mapping list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
  pub remote: String,
  pub local: String,
}

impl FileMapping {
  pub fn new(remote: impl Into<String>, local: impl Into<String>) -> Self {
    Self {
      remote: remote.into(),
      local: local.into(),
    }
  }
}

impl<R: Into<String>, L: Into<String>> From<(R, L)> for FileMapping {
  fn from((remote, local): (R, L)) -> Self {
    Self::new(remote, local)
  }
}

/// Parses a mapping list. Pairs missing either side are skipped.
pub fn unpack_list(files_list: &str) -> Vec<FileMapping> {
  files_list
    .split(PAIR_SEPARATOR)
    .filter_map(|pair| pair.rsplit_once(SIDE_SEPARATOR))
    .filter(|(remote, local)| !remote.is_empty() && !local.is_empty())
    .map(FileMapping::from)
    .collect()
}

/// Re-roots `file_path` under `root_dir`, treating absolute paths as relative
/// to the new root.
pub fn change_root_dir(file_path: &str, root_dir: Option<&Path>) -> PathBuf {
  match root_dir {
    Some(root) => root.join(file_path.trim_start_matches(KEY_SEPARATOR)),
    None => PathBuf::from(file_path),
  }
}

/// Joins a listed relative path onto the listed remote path. An object listed
/// as itself has an empty relative path and resolves to `base` without its
/// trailing separator.
pub fn join_remote(base: &str, relative: &str) -> String {
  let joined = if relative.is_empty() || base.is_empty() || base.ends_with(KEY_SEPARATOR) {
    format!("{}{}", base, relative)
  } else {
    format!("{}{}{}", base, KEY_SEPARATOR, relative)
  };
  joined.trim_end_matches(KEY_SEPARATOR).to_string()
}

/// Whether `path` names a prefix (directory-like) rather than a single object.
pub fn is_prefix(path: &str) -> bool {
  path.is_empty() || path.ends_with(KEY_SEPARATOR)
}

/// Strips `prefix` from `key`, returning the remainder without a leading
/// separator.
pub fn strip_prefix<'a>(key: &'a str, prefix: &str) -> &'a str {
  key
    .strip_prefix(prefix)
    .unwrap_or(key)
    .trim_start_matches(KEY_SEPARATOR)
}
