//! Positional tuple encoding driven by format strings.
//!
//! Write formats accept the letters `n` (number), `r` (revision), `s`
//! (byte string), `c` (UTF-8 string), `w` (word), plus `[` `]` for optional
//! groups and `(` `)` for required groups. Inside an optional group an
//! absent value is silently omitted from the wire; outside one it is a
//! programming error. Parse formats accept the value letters plus `l`
//! (list); every position must match the item kind exactly.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::item::{Item, Revnum};

/// One argument slot for `write_tuple`, the rendering of the original's
/// varargs. `Omit` stands for an absent optional value.
#[derive(Debug, Clone, Copy)]
pub enum TupleArg<'a> {
    Number(u64),
    Rev(Revnum),
    Str(&'a [u8]),
    Cstr(&'a str),
    Word(&'a str),
    Omit,
}

impl<'a> TupleArg<'a> {
    /// Convenience for the `Option<Revnum>` shape used throughout the edit
    /// layer.
    pub fn opt_rev(rev: Option<Revnum>) -> TupleArg<'a> {
        match rev {
            Some(r) => TupleArg::Rev(r),
            None => TupleArg::Omit,
        }
    }
}

/// One value produced by `parse_tuple`, kind-checked against its format
/// letter.
#[derive(Debug, Clone)]
pub enum TupleValue {
    Number(u64),
    Str(Bytes),
    Cstr(String),
    Word(String),
    List(Vec<Item>),
}

impl TupleValue {
    // The parse already guaranteed the kind for each position, so these
    // accessors treat a mismatch as a caller bug.

    pub fn number(&self) -> u64 {
        match self {
            TupleValue::Number(n) => *n,
            other => panic!("tuple value is {other:?}, wanted number"),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        match self {
            TupleValue::Str(s) => s,
            other => panic!("tuple value is {other:?}, wanted string"),
        }
    }

    pub fn cstr(&self) -> &str {
        match self {
            TupleValue::Cstr(s) => s,
            other => panic!("tuple value is {other:?}, wanted cstring"),
        }
    }

    pub fn word(&self) -> &str {
        match self {
            TupleValue::Word(w) => w,
            other => panic!("tuple value is {other:?}, wanted word"),
        }
    }

    pub fn list(&self) -> &[Item] {
        match self {
            TupleValue::List(items) => items,
            other => panic!("tuple value is {other:?}, wanted list"),
        }
    }

    pub fn into_word(self) -> String {
        match self {
            TupleValue::Word(w) => w,
            other => panic!("tuple value is {other:?}, wanted word"),
        }
    }

    pub fn into_list(self) -> Vec<Item> {
        match self {
            TupleValue::List(items) => items,
            other => panic!("tuple value is {other:?}, wanted list"),
        }
    }
}

/// Interpret a parsed list against `fmt`. The list may carry extra trailing
/// items beyond the format; a missing or mismatched position is a framing
/// error.
pub fn parse_tuple(list: &[Item], fmt: &str) -> Result<Vec<TupleValue>> {
    if list.len() < fmt.len() {
        return Err(Error::malformed("malformed network data"));
    }
    let mut values = Vec::with_capacity(fmt.len());
    for (letter, item) in fmt.chars().zip(list) {
        let value = match (letter, item) {
            ('n', Item::Number(n)) | ('r', Item::Number(n)) => TupleValue::Number(*n),
            ('s', Item::Str(s)) => TupleValue::Str(s.clone()),
            ('c', Item::Str(s)) => TupleValue::Cstr(
                std::str::from_utf8(s)
                    .map_err(|_| Error::malformed("string is not valid UTF-8"))?
                    .to_string(),
            ),
            ('w', Item::Word(w)) => TupleValue::Word(w.clone()),
            ('l', Item::List(items)) => TupleValue::List(items.clone()),
            ('n' | 'r' | 's' | 'c' | 'w' | 'l', _) => {
                return Err(Error::malformed("malformed network data"));
            }
            _ => panic!("unknown tuple format letter {letter:?}"),
        };
        values.push(value);
    }
    Ok(values)
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Write one tuple: an outer list holding one wire item per value
    /// letter, with `[`/`]` and `(`/`)` opening and closing nested lists.
    pub async fn write_tuple(&mut self, fmt: &str, args: &[TupleArg<'_>]) -> Result<()> {
        let mut opt_depth = 0usize;
        let mut args = args.iter();
        let mut next = |letter: char| {
            *args
                .next()
                .unwrap_or_else(|| panic!("missing argument for format letter {letter:?}"))
        };

        self.start_list().await?;
        for letter in fmt.chars() {
            match letter {
                'n' => match next(letter) {
                    TupleArg::Number(n) => self.write_number(n).await?,
                    arg => panic!("format letter 'n' got {arg:?}"),
                },
                'r' => match next(letter) {
                    TupleArg::Rev(rev) => self.write_number(rev).await?,
                    TupleArg::Omit => {
                        assert!(opt_depth > 0, "omitted revision outside optional group");
                    }
                    arg => panic!("format letter 'r' got {arg:?}"),
                },
                's' => match next(letter) {
                    TupleArg::Str(s) => self.write_string(s).await?,
                    TupleArg::Omit => {
                        assert!(opt_depth > 0, "omitted string outside optional group");
                    }
                    arg => panic!("format letter 's' got {arg:?}"),
                },
                'c' => match next(letter) {
                    TupleArg::Cstr(s) => self.write_cstring(s).await?,
                    TupleArg::Omit => {
                        assert!(opt_depth > 0, "omitted cstring outside optional group");
                    }
                    arg => panic!("format letter 'c' got {arg:?}"),
                },
                'w' => match next(letter) {
                    TupleArg::Word(w) => self.write_word(w).await?,
                    TupleArg::Omit => {
                        assert!(opt_depth > 0, "omitted word outside optional group");
                    }
                    arg => panic!("format letter 'w' got {arg:?}"),
                },
                '[' => {
                    self.start_list().await?;
                    opt_depth += 1;
                }
                ']' => {
                    self.end_list().await?;
                    opt_depth = opt_depth
                        .checked_sub(1)
                        .expect("unbalanced ']' in tuple format");
                }
                '(' => self.start_list().await?,
                ')' => self.end_list().await?,
                _ => panic!("unknown tuple format letter {letter:?}"),
            }
        }
        self.end_list().await
    }

    /// Read one item, require it to be a list, and interpret it with `fmt`.
    pub async fn read_tuple(&mut self, fmt: &str) -> Result<Vec<TupleValue>> {
        let item = self.read_item().await?;
        let list = item.expect_list()?;
        parse_tuple(list, fmt)
    }
}
