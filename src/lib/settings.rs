//! Layered settings lookup.
//!
//! Values come from one section of a TOML config file, with the process
//! environment layered on top:
//!
//! ```toml
//! [dev]
//! S3CONF = "s3://my-bucket/dev/env"
//! S3CONF_MAP = "s3://my-bucket/dev/files/:config/"
//! AWS_S3_ENDPOINT_URL = "http://localhost:9000"
//! ```
//!
//! The config file is looked up as `.s3conf/config.toml` in the current
//! directory and then in each parent directory.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[cfg(feature = "tracing")]
use tracing::{debug, info, trace};

use toml::{Table, Value};

/// Remote path of the environment file.
pub const ENV_FILE_KEY: &str = "S3CONF";
/// Mapping list used by downsync/upsync.
pub const FILE_MAP_KEY: &str = "S3CONF_MAP";
/// Environment variable naming the config file explicitly.
pub const CONFIG_FILE_ENV_VAR: &str = "S3CONF_CONFIG_FILE";

const CONFIG_DIR: &str = ".s3conf";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
  values: BTreeMap<String, String>,
  section: Option<String>,
}

impl Settings {
  /// Loads `section` from `config_file` and overlays the process
  /// environment.
  pub fn load(section: Option<&str>, config_file: Option<&Path>) -> Result<Self, SettingsError> {
    Self::resolve(section, config_file, std::env::vars())
  }

  /// Same as [`Settings::load`] with an explicit environment.
  pub fn resolve<I, K, V>(
    section: Option<&str>,
    config_file: Option<&Path>,
    environment: I,
  ) -> Result<Self, SettingsError>
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    let mut values = match section {
      Some(section) => {
        let path = config_file
          .map(Path::to_path_buf)
          .ok_or_else(|| SettingsError::ConfigNotFound(default_config_file(Path::new("."))))?;
        read_section(&path, section)?
      }
      None => BTreeMap::new(),
    };

    #[cfg(feature = "tracing")]
    debug!(?section, file_keys = values.len(), "Loaded config section");

    values.extend(environment.into_iter().map(|(k, v)| (k.into(), v.into())));

    Ok(Self {
      values,
      section: section.map(str::to_string),
    })
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.values.get(key).map(String::as_str)
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.values.insert(key.into(), value.into());
  }

  pub fn section(&self) -> Option<&str> {
    self.section.as_deref()
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self {
      values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
      section: None,
    }
  }
}

/// `<dir>/.s3conf/config.toml`
pub fn default_config_file(dir: &Path) -> PathBuf {
  dir.join(CONFIG_DIR).join(CONFIG_FILE_NAME)
}

/// Finds the nearest config file in `start` or its ancestors.
pub fn discover_config_file(start: &Path) -> Option<PathBuf> {
  start.ancestors().map(default_config_file).find(|candidate| {
    #[cfg(feature = "tracing")]
    trace!(?candidate, "Checking config file candidate");
    candidate.is_file()
  })
}

/// Writes `S3CONF` (and optionally `S3CONF_MAP`) into `section`, creating the
/// file and its directory when needed. Other keys and sections are kept.
pub fn init_section(
  config_file: &Path,
  section: &str,
  env_file: &str,
  file_map: Option<&str>,
) -> Result<(), SettingsError> {
  let mut table = if config_file.exists() {
    parse_file(config_file)?
  } else {
    Table::new()
  };

  let entry = table
    .entry(section.to_string())
    .or_insert(Value::Table(Table::new()));
  let Value::Table(section_table) = entry else {
    return Err(SettingsError::NotATable(section.to_string()));
  };

  section_table.insert(ENV_FILE_KEY.to_string(), Value::String(env_file.to_string()));
  if let Some(map) = file_map {
    section_table.insert(FILE_MAP_KEY.to_string(), Value::String(map.to_string()));
  }

  let content = toml::to_string(&table).map_err(|source| SettingsError::Serialize {
    path: config_file.to_path_buf(),
    source,
  })?;

  if let Some(parent) = config_file.parent().filter(|p| !p.as_os_str().is_empty()) {
    fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
      path: config_file.to_path_buf(),
      source,
    })?;
  }
  fs::write(config_file, content).map_err(|source| SettingsError::Write {
    path: config_file.to_path_buf(),
    source,
  })?;

  #[cfg(feature = "tracing")]
  info!("Wrote section [{}] to {}", section, config_file.display());

  Ok(())
}

fn parse_file(path: &Path) -> Result<Table, SettingsError> {
  let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  content.parse::<Table>().map_err(|source| SettingsError::Parse {
    path: path.to_path_buf(),
    source,
  })
}

fn read_section(path: &Path, section: &str) -> Result<BTreeMap<String, String>, SettingsError> {
  if !path.is_file() {
    return Err(SettingsError::ConfigNotFound(path.to_path_buf()));
  }

  let table = parse_file(path)?;
  let Some(Value::Table(values)) = table.get(section) else {
    return Err(SettingsError::SectionNotFound {
      section: section.to_string(),
      path: path.to_path_buf(),
    });
  };

  values
    .iter()
    .map(|(key, value)| {
      let value = match value {
        Value::String(s) => s.clone(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        _ => {
          return Err(SettingsError::InvalidValue {
            section: section.to_string(),
            key: key.clone(),
          });
        }
      };
      Ok((key.clone(), value))
    })
    .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
  #[error("No config file found at {0}")]
  ConfigNotFound(PathBuf),
  #[error("Section [{section}] not found in {path}")]
  SectionNotFound { section: String, path: PathBuf },
  #[error("[{0}] is not a table")]
  NotATable(String),
  #[error("Invalid value for {key} in section [{section}]: expected a string")]
  InvalidValue { section: String, key: String },
  #[error("Failed to read config file {path}: {source}")]
  Read { path: PathBuf, source: io::Error },
  #[error("Failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    source: toml::de::Error,
  },
  #[error("Failed to serialize config file {path}: {source}")]
  Serialize {
    path: PathBuf,
    source: toml::ser::Error,
  },
  #[error("Failed to write config file {path}: {source}")]
  Write { path: PathBuf, source: io::Error },
}
