use clap::{Parser, Subcommand};
use s3conf::dump::{phusion_dump, render_env};
use s3conf::editor::Editor;
use s3conf::mapping::{FileMapping, unpack_list};
use s3conf::settings::{Settings, SettingsError, default_config_file, discover_config_file, init_section};
use s3conf::sync::{S3Conf, parse_assignment};
use std::path::{Path, PathBuf};
use std::process::Command as Process;

#[derive(Parser)]
#[command(
  name = "s3conf",
  about = "Sync and edit your env files stored in S3-compatible object storage",
  version,
  author
)]
struct Cli {
  /// Path to the config file (defaults to the nearest .s3conf/config.toml)
  #[arg(short, long, env = "S3CONF_CONFIG_FILE", global = true)]
  config: Option<PathBuf>,

  /// Verbose output (-v for verbose, -vv for very verbose)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Print the variables of the environment file
  Env {
    /// Config section; without it S3CONF is read from the environment
    section: Option<String>,
    /// Downsync the files listed in S3CONF_MAP first
    #[arg(short, long)]
    map_files: bool,
    /// Download mapped files even when they are up to date
    #[arg(short, long)]
    force: bool,
    /// Also write one file per variable into this directory
    #[arg(short, long, value_name = "DIR")]
    phusion_dump: Option<PathBuf>,
    /// Prefix each line with `export`
    #[arg(short, long)]
    export: bool,
    /// Do not print the variables
    #[arg(short, long)]
    quiet: bool,
  },
  /// Run a command with the variables of the environment file set
  Exec {
    section: String,
    /// Downsync the files listed in S3CONF_MAP first
    #[arg(short, long)]
    map_files: bool,
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
  },
  /// Download a file or a prefix (ending in /)
  Download {
    remote: String,
    local: PathBuf,
    /// Download even when the local file is up to date
    #[arg(short, long)]
    force: bool,
  },
  /// Upload a file or a directory
  Upload { local: PathBuf, remote: String },
  /// Download every mapped file
  Downsync {
    section: String,
    /// Re-root local paths under this directory
    #[arg(short, long)]
    root_dir: Option<PathBuf>,
    /// Mapping list to use instead of S3CONF_MAP
    #[arg(long)]
    map: Option<String>,
    /// Download even when local files are up to date
    #[arg(short, long)]
    force: bool,
  },
  /// Upload every mapped file
  Upsync {
    section: String,
    /// Re-root local paths under this directory
    #[arg(short, long)]
    root_dir: Option<PathBuf>,
    /// Mapping list to use instead of S3CONF_MAP
    #[arg(long)]
    map: Option<String>,
  },
  /// Set variables in the environment file
  Set {
    section: String,
    /// Assignments as KEY=VALUE
    #[arg(required = true)]
    assignments: Vec<String>,
    /// Create the environment file if it does not exist
    #[arg(long)]
    create: bool,
  },
  /// Remove variables from the environment file
  Unset {
    section: String,
    #[arg(required = true)]
    keys: Vec<String>,
  },
  /// Open the environment file in $VISUAL / $EDITOR
  Edit {
    section: String,
    /// Create the environment file if it does not exist
    #[arg(long)]
    create: bool,
  },
  /// Show the differences between the environment file and a local file
  Diff { section: String, local: PathBuf },
  /// Write a section to the config file
  Init {
    section: String,
    /// Remote path of the environment file
    remote: String,
    /// Mapping list stored as S3CONF_MAP
    #[arg(long)]
    map: Option<String>,
  },
}

fn setup_tracing(verbose: u8) {
  use tracing_subscriber::fmt;
  use tracing_subscriber::prelude::*;

  let log_level = match verbose {
    1 => "debug",
    2.. => "trace",
    _ => "info",
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(tracing_subscriber::EnvFilter::new(
      std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
    ))
    .init();
}

fn load_settings(config: Option<&Path>, section: Option<&str>) -> Result<Settings, SettingsError> {
  let discovered = match config {
    Some(_) => None,
    None => std::env::current_dir()
      .ok()
      .and_then(|dir| discover_config_file(&dir)),
  };
  Settings::load(section, config.or(discovered.as_deref()))
}

fn service(config: Option<&Path>, section: Option<&str>) -> Result<S3Conf, SettingsError> {
  load_settings(config, section).map(S3Conf::from_settings)
}

fn mappings(s3conf: &S3Conf, map: Option<&str>) -> Vec<FileMapping> {
  match map {
    Some(list) => unpack_list(list),
    None => s3conf.map_files(),
  }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
  let cli = Cli::parse();

  setup_tracing(cli.verbose);

  let config = cli.config.as_deref();

  match cli.command {
    Command::Env {
      section,
      map_files,
      force,
      phusion_dump: dump_dir,
      export,
      quiet,
    } => {
      let s3conf = service(config, section.as_deref())?;
      if map_files {
        s3conf.downsync(&s3conf.map_files(), None, force)?;
      }
      let environment = s3conf.environment()?;
      if let Some(dir) = dump_dir {
        phusion_dump(&environment, &dir)?;
      }
      if !quiet {
        print!("{}", render_env(&environment, export));
      }
    }
    Command::Exec {
      section,
      map_files,
      command,
    } => {
      let s3conf = service(config, Some(&section))?;
      if map_files {
        s3conf.downsync(&s3conf.map_files(), None, false)?;
      }
      let environment = s3conf.environment()?;

      let (program, args) = command
        .split_first()
        .ok_or("missing command to execute")?;
      let status = Process::new(program).args(args).envs(&environment).status()?;
      std::process::exit(status.code().unwrap_or(1));
    }
    Command::Download {
      remote,
      local,
      force,
    } => {
      service(config, None)?.download(&remote, &local, force)?;
    }
    Command::Upload { local, remote } => {
      service(config, None)?.upload(&local, &remote)?;
    }
    Command::Downsync {
      section,
      root_dir,
      map,
      force,
    } => {
      let s3conf = service(config, Some(&section))?;
      s3conf.downsync(&mappings(&s3conf, map.as_deref()), root_dir.as_deref(), force)?;
    }
    Command::Upsync {
      section,
      root_dir,
      map,
    } => {
      let s3conf = service(config, Some(&section))?;
      s3conf.upsync(&mappings(&s3conf, map.as_deref()), root_dir.as_deref())?;
    }
    Command::Set {
      section,
      assignments,
      create,
    } => {
      let assignments = assignments
        .iter()
        .map(|assignment| parse_assignment(assignment))
        .collect::<Result<Vec<_>, _>>()?;
      service(config, Some(&section))?.set(&assignments, create)?;
    }
    Command::Unset { section, keys } => {
      service(config, Some(&section))?.unset(&keys)?;
    }
    Command::Edit { section, create } => {
      service(config, Some(&section))?.edit(&Editor::from_env()?, create)?;
    }
    Command::Diff { section, local } => {
      print!("{}", service(config, Some(&section))?.diff(&local)?);
    }
    Command::Init {
      section,
      remote,
      map,
    } => {
      let config_file = match config {
        Some(path) => path.to_path_buf(),
        None => default_config_file(&std::env::current_dir()?),
      };
      init_section(&config_file, &section, &remote, map.as_deref())?;
    }
  }

  Ok(())
}
