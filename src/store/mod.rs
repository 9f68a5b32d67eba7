//! Record Store Module
//!
//! The storage capability the record service depends on: read every record
//! in id order, and append one record returning the id the store assigned.
//!
//! Implementations must accept calls from many request tasks at once: reads
//! run concurrently, writes are serialized. Callers never lock around them.

mod sqlite;

pub use sqlite::{read_only_dsn, SqliteStore};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::topology::NodeRole;

/// Store-assigned record identifier
pub type RecordId = i64;

/// A single persisted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    /// Identifier assigned on insert, ascending in insertion order
    pub id: RecordId,
    /// Value exactly as written, byte for byte
    pub value: Vec<u8>,
}

impl Record {
    /// Create a record from anything byte-like
    pub fn new(id: RecordId, value: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            value: value.into(),
        }
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Record #{}: {}", self.id, quote(&self.value))
    }
}

/// Render bytes as a double-quoted literal.
///
/// Printable characters pass through; quotes and backslashes are escaped,
/// the usual control characters use their short escapes (`\n`, `\t`, ...),
/// other control bytes and bytes that are not valid UTF-8 become `\xNN`, and
/// non-printable code points become `\uNNNN` or `\UNNNNNNNN`.
pub fn quote(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');

    let mut rest = value;
    while !rest.is_empty() {
        let (valid, invalid) = match std::str::from_utf8(rest) {
            Ok(text) => (text, &rest[rest.len()..]),
            Err(e) => {
                let (head, tail) = rest.split_at(e.valid_up_to());
                (std::str::from_utf8(head).unwrap_or_default(), tail)
            }
        };

        for c in valid.chars() {
            push_escaped(&mut out, c);
        }

        // Each undecodable byte is escaped on its own.
        match invalid.split_first() {
            Some((byte, tail)) => {
                out.push_str(&format!("\\x{:02x}", byte));
                rest = tail;
            }
            None => break,
        }
    }

    out.push('"');
    out
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '"' => out.push_str("\\\""),
        '\\' => out.push_str("\\\\"),
        c if is_printable(c) => out.push(c),
        '\u{07}' => out.push_str("\\a"),
        '\u{08}' => out.push_str("\\b"),
        '\u{0c}' => out.push_str("\\f"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        '\u{0b}' => out.push_str("\\v"),
        c if (c as u32) < 0x20 || c == '\u{7f}' => out.push_str(&format!("\\x{:02x}", c as u32)),
        c if (c as u32) < 0x10000 => out.push_str(&format!("\\u{:04x}", c as u32)),
        c => out.push_str(&format!("\\U{:08x}", c as u32)),
    }
}

/// Letters, marks, numbers, punctuation, symbols and the ASCII space
fn is_printable(c: char) -> bool {
    if c == ' ' {
        return true;
    }
    if c.is_control() || c.is_whitespace() {
        return false;
    }
    !matches!(
        c,
        '\u{ad}'
            | '\u{600}'..='\u{605}'
            | '\u{61c}'
            | '\u{6dd}'
            | '\u{70f}'
            | '\u{180e}'
            | '\u{200b}'..='\u{200f}'
            | '\u{202a}'..='\u{202e}'
            | '\u{2060}'..='\u{206f}'
            | '\u{e000}'..='\u{f8ff}'
            | '\u{feff}'
            | '\u{fff9}'..='\u{fffb}'
            | '\u{e0001}'..='\u{e007f}'
    )
}

/// Access mode the store is opened in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoreMode {
    ReadWrite,
    ReadOnly,
}

impl From<NodeRole> for StoreMode {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Primary => StoreMode::ReadWrite,
            NodeRole::Replica => StoreMode::ReadOnly,
        }
    }
}

impl std::fmt::Display for StoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreMode::ReadWrite => write!(f, "read-write"),
            StoreMode::ReadOnly => write!(f, "read-only"),
        }
    }
}

/// Append-only record storage
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All records, ascending by id
    async fn records(&self) -> Result<Vec<Record>>;

    /// Append a record and return its id
    async fn insert(&self, value: &[u8]) -> Result<RecordId>;
}
