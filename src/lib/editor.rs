//! Interactive editing of env file content through the user's editor.

use std::fs;
use std::io::{self, Write};
use std::process::{Command, ExitStatus};

use similar::TextDiff;

#[cfg(feature = "tracing")]
use tracing::{debug, trace};

const DEFAULT_EDITOR: &str = "vi";
const EDITOR_ENV_VARS: [&str; 2] = ["VISUAL", "EDITOR"];
const TEMP_PREFIX: &str = "s3conf-";
const TEMP_SUFFIX: &str = ".env";

/// An editor command line. The file to edit is appended as last argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Editor {
  program: String,
  args: Vec<String>,
}

impl Editor {
  /// Splits `command` with shell quoting rules into program and arguments,
  /// so values like `code --wait` or `"/opt/My Editor/ed" -w` work.
  pub fn new(command: &str) -> Result<Self, EditorError> {
    let mut parts = shell_words::split(command)
      .map_err(|source| EditorError::InvalidCommand {
        command: command.to_string(),
        source,
      })?
      .into_iter();
    let program = parts.next().unwrap_or_else(|| DEFAULT_EDITOR.to_string());
    Ok(Self {
      program,
      args: parts.collect(),
    })
  }

  /// `$VISUAL`, then `$EDITOR`, then `vi`.
  pub fn from_env() -> Result<Self, EditorError> {
    let command = EDITOR_ENV_VARS
      .iter()
      .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
      .unwrap_or_else(|| DEFAULT_EDITOR.to_string());
    Self::new(&command)
  }

  /// Opens `content` in the editor and returns the saved text. The editor
  /// must exit successfully.
  pub fn edit(&self, content: &str) -> Result<String, EditorError> {
    let mut file = tempfile::Builder::new()
      .prefix(TEMP_PREFIX)
      .suffix(TEMP_SUFFIX)
      .tempfile()
      .map_err(EditorError::TempFile)?;
    file
      .write_all(content.as_bytes())
      .and_then(|_| file.flush())
      .map_err(EditorError::TempFile)?;

    #[cfg(feature = "tracing")]
    debug!(program = %self.program, path = %file.path().display(), "Launching editor");

    let status = Command::new(&self.program)
      .args(&self.args)
      .arg(file.path())
      .status()
      .map_err(|source| EditorError::Launch {
        program: self.program.clone(),
        source,
      })?;

    if !status.success() {
      return Err(EditorError::Failed {
        program: self.program.clone(),
        status,
      });
    }

    // Editors commonly replace the file rather than writing in place, so
    // read it back by path.
    let edited = fs::read_to_string(file.path()).map_err(EditorError::TempFile)?;

    #[cfg(feature = "tracing")]
    trace!("Editor returned {} bytes", edited.len());

    Ok(edited)
  }
}

/// Unified diff of two texts, empty when they are equal.
pub fn render_diff(old: &str, new: &str, old_name: &str, new_name: &str) -> String {
  if old == new {
    return String::new();
  }
  TextDiff::from_lines(old, new)
    .unified_diff()
    .header(old_name, new_name)
    .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
  #[error("Invalid editor command {command:?}: {source}")]
  InvalidCommand {
    command: String,
    source: shell_words::ParseError,
  },
  #[error("Temporary file error: {0}")]
  TempFile(io::Error),
  #[error("Failed to launch editor {program}: {source}")]
  Launch { program: String, source: io::Error },
  #[error("Editor {program} exited with {status}")]
  Failed { program: String, status: ExitStatus },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_new_splits_arguments() {
    let editor = Editor::new("code --wait").unwrap();
    assert_eq!(editor.program, "code");
    assert_eq!(editor.args, vec!["--wait".to_string()]);

    assert_eq!(Editor::new("  ").unwrap().program, DEFAULT_EDITOR);
  }

  #[test]
  fn test_new_honours_quotes() {
    let editor = Editor::new(r#""/opt/My Editor/bin/ed" -w 'a b'"#).unwrap();
    assert_eq!(editor.program, "/opt/My Editor/bin/ed");
    assert_eq!(editor.args, vec!["-w".to_string(), "a b".to_string()]);

    assert!(matches!(
      Editor::new("\"unterminated"),
      Err(EditorError::InvalidCommand { .. })
    ));
  }

  #[test]
  fn test_render_diff() {
    assert_eq!(render_diff("A=1\n", "A=1\n", "a", "b"), "");

    let diff = render_diff("A=1\nB=2\n", "A=1\nB=3\n", "remote", "edited");
    assert!(diff.contains("--- remote"));
    assert!(diff.contains("+++ edited"));
    assert!(diff.contains("-B=2"));
    assert!(diff.contains("+B=3"));
  }

  #[cfg(unix)]
  #[test]
  fn test_edit_runs_command_on_temp_file() {
    let editor = Editor::new("sed -i -e s/1/2/").unwrap();
    assert_eq!(editor.edit("A=1\n").unwrap(), "A=2\n");
  }

  #[cfg(unix)]
  #[test]
  fn test_edit_fails_on_editor_error() {
    assert!(matches!(
      Editor::new("false").unwrap().edit("A=1\n"),
      Err(EditorError::Failed { .. })
    ));
    assert!(matches!(
      Editor::new("definitely-not-an-editor-binary").unwrap().edit(""),
      Err(EditorError::Launch { .. })
    ));
  }
}
