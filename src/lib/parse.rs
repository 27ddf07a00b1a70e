//! Lossless dotenv model.
//!
//! Parsing keeps comments, blank lines and unrecognized lines so that a file
//! can be modified with [`EnvFile::set`] / [`EnvFile::unset`] and written back
//! without disturbing the lines that were not touched.
//!
//! Only whole lines starting with `#` are comments. A value that starts and
//! ends with the same single or double quote has its escape sequences decoded
//! (`\n`, `\t`, `\xHH`, `\uXXXX`, ...); any other value is taken literally,
//! `#` included.

use std::{borrow::Cow, collections::BTreeMap, convert::TryFrom, fmt, iter::Peekable, str::Chars};

#[cfg(feature = "tracing")]
use tracing::{debug, trace, warn};

const COMMENT_PREFIX: &str = "#";
const ASSIGNMENT_OPERATOR: &str = "=";
const QUOTES: [char; 2] = ['"', '\''];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnvFile<'a> {
  pub entries: Vec<EnvEntry<'a>>,
}

impl<'a> fmt::Display for EnvFile<'a> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for entry in &self.entries {
      write!(f, "{}", entry)?;
    }
    Ok(())
  }
}

impl<'a> TryFrom<&'a str> for EnvFile<'a> {
  type Error = ParseError;

  fn try_from(s: &'a str) -> Result<Self, Self::Error> {
    #[cfg(feature = "tracing")]
    debug!("Parsing env file with {} lines", s.lines().count());

    let mut entries = Vec::new();
    let mut pending_comments = Vec::new();

    for line in s.lines() {
      #[cfg(feature = "tracing")]
      trace!("Parsing line: {:?}", line);

      let mut entry: EnvEntry = line.try_into()?;

      if let EnvEntry::Variable(ref mut var) = entry {
        #[cfg(feature = "tracing")]
        trace!(
          "Found variable: {} with {} pending comments",
          var.key,
          pending_comments.len()
        );

        var.preceding_comments = std::mem::take(&mut pending_comments);
      } else if let EnvEntry::OrphanComment(comment) = entry {
        pending_comments.push(comment);
        continue;
      } else if !pending_comments.is_empty() {
        #[cfg(feature = "tracing")]
        trace!(
          "Non-variable line with {} pending comments, flushing",
          pending_comments.len()
        );

        for comment in pending_comments.drain(..) {
          entries.push(EnvEntry::OrphanComment(comment));
        }
      }

      #[cfg(feature = "tracing")]
      if let EnvEntry::Unrecognized(ref raw) = entry {
        warn!("Ignoring line without assignment: {:?}", raw);
      }

      entries.push(entry);
    }

    for comment in pending_comments {
      entries.push(EnvEntry::OrphanComment(comment));
    }

    #[cfg(feature = "tracing")]
    debug!("Parsed {} entries", entries.len());

    Ok(Self { entries })
  }
}

impl<'a> EnvFile<'a> {
  /// Returns the effective definition of `key`. When a key is defined more
  /// than once the last definition wins.
  pub fn get(&self, key: &str) -> Option<&EnvVariable<'a>> {
    self.variables().filter(|var| var.key == key).last()
  }

  /// Iterates over the variables in file order.
  pub fn variables(&self) -> impl Iterator<Item = &EnvVariable<'a>> {
    self.entries.iter().filter_map(|entry| match entry {
      EnvEntry::Variable(var) => Some(var),
      _ => None,
    })
  }

  /// Decoded `key -> value` pairs.
  pub fn as_map(&self) -> BTreeMap<String, String> {
    self
      .variables()
      .map(|var| (var.key.to_string(), var.value.to_string()))
      .collect()
  }

  /// Sets `key` to `value`, updating the effective definition in place or
  /// appending a new line. Returns the previous decoded value.
  pub fn set(&mut self, key: &str, value: &str) -> Option<String> {
    let raw = encode_value(value);

    if let Some(var) = self
      .entries
      .iter_mut()
      .rev()
      .find_map(|entry| match entry {
        EnvEntry::Variable(var) if var.key == key => Some(var),
        _ => None,
      })
    {
      #[cfg(feature = "tracing")]
      trace!("Updating existing variable {}", key);

      let old_value = var.value.to_string();
      var.raw = Cow::Owned(raw.into_owned());
      var.value = Cow::Owned(value.to_string());
      return Some(old_value);
    }

    #[cfg(feature = "tracing")]
    trace!("Appending new variable {}", key);

    self.entries.push(EnvEntry::Variable(EnvVariable {
      key: Cow::Owned(key.to_string()),
      raw: Cow::Owned(raw.into_owned()),
      value: Cow::Owned(value.to_string()),
      preceding_comments: Vec::new(),
    }));

    None
  }

  /// Removes every definition of `key` together with its attached comments.
  /// Returns whether anything was removed.
  pub fn unset(&mut self, key: &str) -> bool {
    let before = self.entries.len();
    self
      .entries
      .retain(|entry| !matches!(entry, EnvEntry::Variable(var) if var.key == key));
    before != self.entries.len()
  }

  /// Detaches the file from the text it was parsed from.
  pub fn into_owned(self) -> EnvFile<'static> {
    EnvFile {
      entries: self.entries.into_iter().map(EnvEntry::into_owned).collect(),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvEntry<'a> {
  Variable(EnvVariable<'a>),
  OrphanComment(EnvComment<'a>),
  /// A non-empty line that is neither a comment nor an assignment. It is
  /// written back verbatim but contributes no variable.
  Unrecognized(Cow<'a, str>),
  EmptyLine,
}

impl<'a> EnvEntry<'a> {
  fn into_owned(self) -> EnvEntry<'static> {
    match self {
      EnvEntry::Variable(var) => EnvEntry::Variable(var.into_owned()),
      EnvEntry::OrphanComment(comment) => EnvEntry::OrphanComment(comment.into_owned()),
      EnvEntry::Unrecognized(raw) => EnvEntry::Unrecognized(Cow::Owned(raw.into_owned())),
      EnvEntry::EmptyLine => EnvEntry::EmptyLine,
    }
  }
}

impl<'a> fmt::Display for EnvEntry<'a> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EnvEntry::Variable(var) => {
        write!(f, "{}", var)?;
        writeln!(f)
      }
      EnvEntry::OrphanComment(comment) => {
        writeln!(f, "{}", comment)
      }
      EnvEntry::Unrecognized(raw) => {
        writeln!(f, "{}", raw)
      }
      EnvEntry::EmptyLine => {
        writeln!(f)
      }
    }
  }
}

impl<'a> TryFrom<&'a str> for EnvEntry<'a> {
  type Error = ParseError;

  fn try_from(s: &'a str) -> Result<Self, Self::Error> {
    let trimmed = s.trim();

    if trimmed.is_empty() {
      Ok(EnvEntry::EmptyLine)
    } else if trimmed.starts_with(COMMENT_PREFIX) {
      Ok(EnvEntry::OrphanComment(trimmed.try_into()?))
    } else if trimmed.contains(ASSIGNMENT_OPERATOR) {
      Ok(EnvEntry::Variable(trimmed.try_into()?))
    } else {
      Ok(EnvEntry::Unrecognized(Cow::Borrowed(trimmed)))
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvVariable<'a> {
  pub key: Cow<'a, str>,
  /// The value exactly as written in the file, quotes included.
  pub raw: Cow<'a, str>,
  /// The decoded value.
  pub value: Cow<'a, str>,
  pub preceding_comments: Vec<EnvComment<'a>>,
}

impl<'a> EnvVariable<'a> {
  fn into_owned(self) -> EnvVariable<'static> {
    EnvVariable {
      key: Cow::Owned(self.key.into_owned()),
      raw: Cow::Owned(self.raw.into_owned()),
      value: Cow::Owned(self.value.into_owned()),
      preceding_comments: self
        .preceding_comments
        .into_iter()
        .map(EnvComment::into_owned)
        .collect(),
    }
  }
}

impl<'a> fmt::Display for EnvVariable<'a> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for comment in &self.preceding_comments {
      writeln!(f, "{}", comment)?;
    }
    write!(f, "{}{}{}", self.key, ASSIGNMENT_OPERATOR, self.raw)
  }
}

impl<'a> TryFrom<&'a str> for EnvVariable<'a> {
  type Error = ParseError;

  fn try_from(s: &'a str) -> Result<Self, Self::Error> {
    #[cfg(feature = "tracing")]
    trace!("Parsing variable from: {:?}", s);

    let Some((key, value_part)) = s.split_once(ASSIGNMENT_OPERATOR) else {
      return Err(ParseError::InvalidLine(s.to_string()));
    };

    let key = key.trim();
    if key.is_empty() {
      return Err(ParseError::EmptyKey(s.to_string()));
    }

    let raw = value_part.trim();
    let value = match unquote(raw) {
      Some(inner) => decode_escapes(inner).map_err(|sequence| ParseError::InvalidEscape {
        sequence,
        line: s.to_string(),
      })?,
      None => Cow::Borrowed(raw),
    };

    #[cfg(feature = "tracing")]
    trace!("Parsed variable: key={}, decoded={}", key, value != raw);

    Ok(EnvVariable {
      key: Cow::Borrowed(key),
      raw: Cow::Borrowed(raw),
      value,
      preceding_comments: Vec::new(),
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvComment<'a>(Cow<'a, str>);

impl<'a> EnvComment<'a> {
  /// Comment text without the leading `#`.
  pub fn text(&self) -> &str {
    &self.0
  }

  fn into_owned(self) -> EnvComment<'static> {
    EnvComment(Cow::Owned(self.0.into_owned()))
  }
}

impl<'a> fmt::Display for EnvComment<'a> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}", COMMENT_PREFIX, self.0)
  }
}

impl<'a> TryFrom<&'a str> for EnvComment<'a> {
  type Error = ParseError;

  fn try_from(s: &'a str) -> Result<Self, Self::Error> {
    let trimmed = s.trim();
    if let Some(content) = trimmed.strip_prefix(COMMENT_PREFIX) {
      Ok(EnvComment(Cow::Borrowed(content)))
    } else {
      Err(ParseError::InvalidLine(s.to_string()))
    }
  }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
  #[error("Invalid line: {0}")]
  InvalidLine(String),
  #[error("Missing variable name in: {0}")]
  EmptyKey(String),
  #[error("Invalid escape sequence {sequence:?} in: {line}")]
  InvalidEscape { sequence: String, line: String },
}

/// Returns the text between the quotes when `raw` starts and ends with the
/// same quote character.
fn unquote(raw: &str) -> Option<&str> {
  let first = raw.chars().next().filter(|c| QUOTES.contains(c))?;
  if raw.len() >= 2 && raw.ends_with(first) {
    Some(&raw[1..raw.len() - 1])
  } else {
    None
  }
}

/// Decodes backslash escapes. Unknown escapes are kept verbatim; malformed
/// numeric escapes are returned as the error.
fn decode_escapes(s: &str) -> Result<Cow<'_, str>, String> {
  if !s.contains('\\') {
    return Ok(Cow::Borrowed(s));
  }

  let mut out = String::with_capacity(s.len());
  let mut chars = s.chars().peekable();

  while let Some(c) = chars.next() {
    if c != '\\' {
      out.push(c);
      continue;
    }

    match chars.next() {
      Some('\\') => out.push('\\'),
      Some('\'') => out.push('\''),
      Some('"') => out.push('"'),
      Some('a') => out.push('\x07'),
      Some('b') => out.push('\x08'),
      Some('f') => out.push('\x0c'),
      Some('n') => out.push('\n'),
      Some('r') => out.push('\r'),
      Some('t') => out.push('\t'),
      Some('v') => out.push('\x0b'),
      Some('x') => out.push(decode_hex(&mut chars, 'x', 2)?),
      Some('u') => out.push(decode_hex(&mut chars, 'u', 4)?),
      Some('U') => out.push(decode_hex(&mut chars, 'U', 8)?),
      Some(digit @ '0'..='7') => out.push(decode_octal(&mut chars, digit)),
      Some(other) => {
        out.push('\\');
        out.push(other);
      }
      None => return Err("\\".to_string()),
    }
  }

  Ok(Cow::Owned(out))
}

fn decode_hex(chars: &mut Peekable<Chars<'_>>, marker: char, len: usize) -> Result<char, String> {
  let digits: String = chars.by_ref().take(len).collect();
  let invalid = || format!("\\{}{}", marker, digits);

  if digits.len() != len || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
    return Err(invalid());
  }

  u32::from_str_radix(&digits, 16)
    .ok()
    .and_then(char::from_u32)
    .ok_or_else(invalid)
}

fn decode_octal(chars: &mut Peekable<Chars<'_>>, first: char) -> char {
  let mut code = first.to_digit(8).unwrap_or_default();
  for _ in 0..2 {
    match chars.peek().and_then(|c| c.to_digit(8)) {
      Some(digit) => {
        code = code * 8 + digit;
        chars.next();
      }
      None => break,
    }
  }
  // At most 0o777, always a valid scalar value.
  char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// Renders `value` so that parsing it back yields the same string.
fn encode_value(value: &str) -> Cow<'_, str> {
  let needs_quotes = value
    .chars()
    .any(|c| c.is_whitespace() || c.is_control() || QUOTES.contains(&c) || c == '\\');

  if !needs_quotes {
    return Cow::Borrowed(value);
  }

  let mut out = String::with_capacity(value.len() + 2);
  out.push('"');
  for c in value.chars() {
    match c {
      '\\' => out.push_str("\\\\"),
      '"' => out.push_str("\\\""),
      '\n' => out.push_str("\\n"),
      '\r' => out.push_str("\\r"),
      '\t' => out.push_str("\\t"),
      c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
      c => out.push(c),
    }
  }
  out.push('"');
  Cow::Owned(out)
}
