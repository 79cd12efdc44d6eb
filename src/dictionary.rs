//! Parsing of AFL-style dictionaries of interesting byte tokens.
//!
//! Each non-blank line that does not start with `#` holds one entry:
//!
//! ```text
//! # comment
//! header_89a@35="89a"
//! marker_3b =  ";"
//! section_21f9="!\xf9\x04"
//! "unlabeled"
//! ```
//!
//! An optional label of ASCII letters, digits, and underscores may be followed
//! by `@` and a numeric level. The value is a double-quoted string of
//! printable ASCII; `\\`, `\"`, and `\xNN` are the only escapes.

use crate::{Error, Result};
use std::{fs, path::Path};

/// One dictionary entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Entry {
    /// The entry's label, if it has one.
    pub label: Option<String>,
    /// The entry's level, if it has one.
    pub level: Option<u32>,
    /// The token bytes. Never empty.
    pub value: Vec<u8>,
}

/// A parsed dictionary.
///
/// # Example
///
/// ```
/// # fn foo() -> covfuzz::Result<()> {
/// use covfuzz::dictionary::Dictionary;
///
/// let dict = Dictionary::parse(r#"
///     ## GIF markers
///     header_89a@35="89a"
///     section_21f9="!\xf9\x04"
/// "#)?;
///
/// assert_eq!(dict.entries().len(), 2);
/// assert_eq!(dict.entries()[0].label.as_deref(), Some("header_89a"));
/// assert_eq!(dict.entries()[0].level, Some(35));
/// assert_eq!(dict.entries()[1].value, b"!\xf9\x04");
/// # Ok(())
/// # }
/// # foo().unwrap();
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: Vec<Entry>,
}

impl Dictionary {
    /// Parse a dictionary from its text.
    ///
    /// Fails on the first malformed line, naming its 1-based line number.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            entries.push(parse_line(line).map_err(|msg| Error::malformed_dictionary(index + 1, msg))?);
        }
        log::debug!("parsed dictionary with {} entries", entries.len());
        Ok(Self { entries })
    }

    /// Read and parse the dictionary file at `path`.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// The entries, in file order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// The entries' token bytes, in file order.
    pub fn values(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|e| e.value.clone()).collect()
    }
}

fn parse_line(line: &str) -> std::result::Result<Entry, &'static str> {
    let bytes = line.as_bytes();
    if !line.ends_with('"') {
        return Err("line does not end with a quote");
    }

    let mut at = bytes
        .iter()
        .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
        .unwrap_or(bytes.len());
    let label = (at > 0).then(|| line[..at].to_string());

    let mut level = None;
    if label.is_some() && bytes.get(at) == Some(&b'@') {
        at += 1;
        let digits = bytes[at..].iter().take_while(|b| b.is_ascii_digit()).count();
        level = Some(
            line[at..at + digits]
                .parse::<u32>()
                .map_err(|_| "bad level")?,
        );
        at += digits;
    }

    while bytes
        .get(at)
        .map_or(false, |b| b.is_ascii_whitespace() || *b == b'=')
    {
        at += 1;
    }
    if bytes.get(at) != Some(&b'"') {
        return Err("missing opening quote");
    }
    at += 1;

    let mut value = Vec::new();
    loop {
        let Some(&b) = bytes.get(at) else {
            return Err("unexpected end of line");
        };
        at += 1;
        match b {
            b'"' => break,
            b'\\' => match bytes.get(at) {
                Some(&c @ (b'\\' | b'"')) => {
                    value.push(c);
                    at += 1;
                }
                Some(b'x') => {
                    let hex = bytes
                        .get(at + 1..at + 3)
                        .filter(|h| h.iter().all(u8::is_ascii_hexdigit))
                        .ok_or("invalid hex escape")?;
                    let digit = |h: u8| (h as char).to_digit(16).unwrap_or(0) as u8;
                    value.push(digit(hex[0]) << 4 | digit(hex[1]));
                    at += 3;
                }
                _ => return Err("unknown escape"),
            },
            0..=31 | 127 => return Err("control character in value"),
            128..=255 => return Err("non-ASCII character in value"),
            _ => value.push(b),
        }
    }

    if at != bytes.len() {
        return Err("text after closing quote");
    }
    if value.is_empty() {
        return Err("value is empty");
    }
    Ok(Entry {
        label,
        level,
        value,
    })
}
