//! The self-describing data items that cross the wire.
//!
//! Every item is one of four kinds: an unsigned number, a length-prefixed
//! byte string, a bare word, or a parenthesized list of items. String
//! payloads are owned copies, independent of any transport buffer.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Revision number. The "invalid / not present" sentinel of the original
/// protocol is expressed as `Option<Revnum>::None` in memory and an omitted
/// optional element on the wire.
pub type Revnum = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Number(u64),
    Str(Bytes),
    Word(String),
    List(Vec<Item>),
}

impl Item {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Item::Number(_) => "number",
            Item::Str(_) => "string",
            Item::Word(_) => "word",
            Item::List(_) => "list",
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            Item::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&Bytes> {
        match self {
            Item::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_word(&self) -> Option<&str> {
        match self {
            Item::Word(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Item::List(items) => Some(items),
            _ => None,
        }
    }

    /// Require a list, as when decoding a structured parameter.
    pub fn expect_list(&self) -> Result<&[Item]> {
        self.as_list()
            .ok_or_else(|| Error::malformed(format!("expected list, got {}", self.kind_name())))
    }

    /// Require a string interpreted as UTF-8, as for path components and
    /// property names.
    pub fn expect_utf8(&self) -> Result<String> {
        let bytes = self
            .as_str()
            .ok_or_else(|| Error::malformed(format!("expected string, got {}", self.kind_name())))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::malformed("string is not valid UTF-8"))
    }

    pub fn str(bytes: impl Into<Bytes>) -> Item {
        Item::Str(bytes.into())
    }

    pub fn word(w: impl Into<String>) -> Item {
        let w = w.into();
        debug_assert!(is_valid_word(&w), "invalid word {w:?}");
        Item::Word(w)
    }
}

/// Words start with a letter and continue with letters, digits or hyphens.
pub fn is_valid_word(w: &str) -> bool {
    let mut chars = w.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}
