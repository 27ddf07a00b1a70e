//! Output formats for a resolved environment.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use shell_escape::unix::escape;

#[cfg(feature = "tracing")]
use tracing::{debug, info};

/// Writes one file per variable into `dir`, named after the key and holding
/// the value followed by a newline. This is the layout read by phusion's
/// `my_init` from `/etc/container_environment`.
pub fn phusion_dump(environment: &BTreeMap<String, String>, dir: &Path) -> Result<(), DumpError> {
  fs::create_dir_all(dir).map_err(|source| DumpError {
    path: dir.to_path_buf(),
    source,
  })?;

  for (key, value) in environment {
    let path = dir.join(key);

    #[cfg(feature = "tracing")]
    debug!("Dumping {} to {}", key, path.display());

    fs::write(&path, format!("{}\n", value)).map_err(|source| DumpError { path, source })?;
  }

  #[cfg(feature = "tracing")]
  info!("Dumped {} variables to {}", environment.len(), dir.display());

  Ok(())
}

/// Renders `KEY=value` lines that a POSIX shell can `eval` or `source`.
pub fn render_env(environment: &BTreeMap<String, String>, export: bool) -> String {
  let prefix = if export { "export " } else { "" };
  environment
    .iter()
    .map(|(key, value)| format!("{}{}={}\n", prefix, key, escape(value.as_str().into())))
    .collect()
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to write {path}: {source}")]
pub struct DumpError {
  pub path: PathBuf,
  pub source: io::Error,
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn environment() -> BTreeMap<String, String> {
    BTreeMap::from([
      ("PLAIN".to_string(), "value".to_string()),
      ("SPACED".to_string(), "two words".to_string()),
    ])
  }

  #[test]
  fn test_phusion_dump() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("container_environment");

    phusion_dump(&environment(), &target).unwrap();

    assert_eq!(fs::read_to_string(target.join("PLAIN")).unwrap(), "value\n");
    assert_eq!(fs::read_to_string(target.join("SPACED")).unwrap(), "two words\n");
  }

  #[test]
  fn test_render_env() {
    assert_eq!(
      render_env(&environment(), false),
      "PLAIN=value\nSPACED='two words'\n"
    );
    assert!(render_env(&environment(), true).starts_with("export PLAIN=value\n"));
  }
}
