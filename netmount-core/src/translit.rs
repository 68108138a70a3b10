//! Unicode to ASCII transliteration for host file names.
//!
//! The map is loaded from a UTF-8 text file with one `KEY:VALUE` pair per
//! line. KEY is a single codepoint, VALUE its ASCII replacement (possibly
//! several characters). `#` starts a comment line and tokens may be wrapped
//! in double quotes to protect leading or trailing spaces.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

/// Failure to read a transliteration map file.
#[derive(Error, Debug)]
#[error("unable to open transliteration map file \"{}\": {source}", path.display())]
pub struct TranslitLoadError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Codepoint to ASCII replacement table.
#[derive(Debug, Default)]
pub struct TranslitMap {
    map: HashMap<char, String>,
}

impl TranslitMap {
    /// An empty map: every non-ASCII character falls back to `_`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a map file, warning about malformed lines instead of failing.
    pub fn load(path: &Path) -> Result<Self, TranslitLoadError> {
        let text = fs::read_to_string(path).map_err(|source| TranslitLoadError {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text, &path.display().to_string()))
    }

    /// Parses map file content; `origin` names the source in warnings.
    pub fn parse(text: &str, origin: &str) -> Self {
        let mut map = HashMap::new();

        for (idx, line) in text.lines().enumerate() {
            let line_number = idx + 1;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                warn!("Missing ':' in file \"{origin}\" on line {line_number}");
                continue;
            };
            let key = clean_token(key);
            let value = clean_token(value);

            let mut key_chars = key.chars();
            let Some(cp) = key_chars.next() else {
                warn!("Empty key in file \"{origin}\" on line {line_number}");
                continue;
            };
            if key_chars.next().is_some() {
                warn!("Key is not a single codepoint in file \"{origin}\" on line {line_number}");
                continue;
            }
            if !value.is_ascii() {
                warn!("Non-ASCII value in file \"{origin}\" on line {line_number}");
                continue;
            }

            match map.get(&cp) {
                Some(existing) if existing != value => {
                    warn!(
                        "The key '{cp}' in file \"{origin}\" on line {line_number} has already \
                         been inserted with a different value"
                    );
                }
                Some(_) => {}
                None => {
                    map.insert(cp, value.to_string());
                }
            }
        }

        TranslitMap { map }
    }

    /// The ASCII replacement for `cp`, if one is mapped.
    pub fn lookup(&self, cp: char) -> Option<&str> {
        self.map.get(&cp).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Trims surrounding whitespace and one pair of double quotes.
fn clean_token(token: &str) -> &str {
    let token = token.trim_matches([' ', '\t', '\r', '\n']);
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        &token[1..token.len() - 1]
    } else {
        token
    }
}

/// True for codepoints in the common combining-mark ranges; these are
/// dropped from file names instead of transliterated.
pub fn is_combining_mark(cp: char) -> bool {
    matches!(cp,
        '\u{0300}'..='\u{036F}'    // Combining Diacritical Marks
        | '\u{1AB0}'..='\u{1AFF}'  // Combining Diacritical Marks Extended
        | '\u{1DC0}'..='\u{1DFF}'  // Combining Diacritical Marks Supplement
        | '\u{20D0}'..='\u{20FF}'  // Combining Diacritical Marks for Symbols
        | '\u{FE20}'..='\u{FE2F}') // Combining Half Marks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let map = TranslitMap::parse("é:E\nü:UE\n# comment\n\nß:ss\n", "test");
        assert_eq!(map.len(), 3);
        assert_eq!(map.lookup('é'), Some("E"));
        assert_eq!(map.lookup('ü'), Some("UE"));
        assert_eq!(map.lookup('ß'), Some("ss"));
        assert_eq!(map.lookup('ž'), None);
    }

    #[test]
    fn test_parse_quoted_tokens() {
        let map = TranslitMap::parse("\"•\":\"-\"\n", "test");
        assert_eq!(map.lookup('•'), Some("-"));
    }

    #[test]
    fn test_parse_duplicate_keeps_first() {
        let map = TranslitMap::parse("é:E\né:X\n", "test");
        assert_eq!(map.lookup('é'), Some("E"));
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let map = TranslitMap::parse("no-colon-here\n:empty\nab:X\né:E\n", "test");
        assert_eq!(map.len(), 1);
        assert_eq!(map.lookup('é'), Some("E"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = TranslitMap::load(Path::new("/nonexistent/translit.map"));
        assert!(err.is_err());
    }

    #[test]
    fn test_combining_marks() {
        assert!(is_combining_mark('\u{0301}'));
        assert!(is_combining_mark('\u{20D7}'));
        assert!(is_combining_mark('\u{FE20}'));
        assert!(!is_combining_mark('é'));
        assert!(!is_combining_mark('a'));
    }
}
