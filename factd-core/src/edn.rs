//! Minimal EDN reader for query and pull text.
//!
//! Supports nil, booleans, integers, floats, strings, keywords, symbols,
//! vectors, lists, maps, sets, `#uuid` and `#inst` tags, comments and
//! commas-as-whitespace. Enough for `[:find ... :where ...]` forms and pull
//! selectors; not a general EDN implementation.

use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::value::{Float, Value};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EdnError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected character {ch:?} at {pos}")]
    Unexpected { ch: char, pos: usize },
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("unknown tag #{0}")]
    UnknownTag(String),
    #[error("invalid #{tag} literal: {reason}")]
    InvalidTagged { tag: String, reason: String },
    #[error("{0} cannot be converted to a value")]
    NotAValue(String),
    #[error("trailing input at {0}")]
    Trailing(usize),
    #[error("forms nested deeper than {0} at {1}")]
    TooDeep(usize, usize),
}

/// Deepest nesting of collections and tagged forms accepted.
pub const MAX_DEPTH: usize = 128;

/// A parsed EDN form.
#[derive(Debug, Clone, PartialEq)]
pub enum Edn {
    Nil,
    Bool(bool),
    Long(i64),
    Double(f64),
    Str(String),
    /// Keyword without the leading colon.
    Keyword(String),
    Symbol(String),
    Vector(Vec<Edn>),
    List(Vec<Edn>),
    Map(Vec<(Edn, Edn)>),
    Set(Vec<Edn>),
    Uuid(Uuid),
    Inst(i64),
}

impl Edn {
    pub fn as_keyword(&self) -> Option<&str> {
        match self {
            Edn::Keyword(k) => Some(k),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Edn::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a vector or list.
    pub fn as_seq(&self) -> Option<&[Edn]> {
        match self {
            Edn::Vector(items) | Edn::List(items) => Some(items),
            _ => None,
        }
    }

    /// Logic variable name, including the leading `?`.
    pub fn as_variable(&self) -> Option<&str> {
        self.as_symbol().filter(|s| s.starts_with('?'))
    }

    pub fn is_blank(&self) -> bool {
        self.as_symbol() == Some("_")
    }

    /// Convert a constant form to a [`Value`]. Symbols are rejected.
    pub fn to_value(&self) -> Result<Value, EdnError> {
        Ok(match self {
            Edn::Nil => Value::Nil,
            Edn::Bool(b) => Value::Bool(*b),
            Edn::Long(n) => Value::Long(*n),
            Edn::Double(x) => Value::Double(Float(*x)),
            Edn::Str(s) => Value::Str(s.clone()),
            Edn::Keyword(k) => Value::Keyword(k.clone()),
            Edn::Uuid(u) => Value::Uuid(*u),
            Edn::Inst(ms) => Value::Instant(*ms),
            Edn::Vector(items) | Edn::List(items) | Edn::Set(items) => {
                Value::Vec(items.iter().map(Edn::to_value).collect::<Result<_, _>>()?)
            }
            Edn::Map(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    let key = match k {
                        Edn::Keyword(s) | Edn::Str(s) => s.clone(),
                        other => return Err(EdnError::NotAValue(format!("map key {other:?}"))),
                    };
                    map.insert(key, v.to_value()?);
                }
                Value::Map(map)
            }
            Edn::Symbol(s) => return Err(EdnError::NotAValue(format!("symbol {s}"))),
        })
    }
}

/// Parse exactly one form from `input`.
pub fn parse(input: &str) -> Result<Edn, EdnError> {
    let mut reader = Reader {
        chars: input.chars().collect(),
        pos: 0,
        depth: 0,
    };
    let form = reader.read()?;
    reader.skip_ws();
    if reader.pos < reader.chars.len() {
        return Err(EdnError::Trailing(reader.pos));
    }
    Ok(form)
}

struct Reader {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | '(' | ')' | '[' | ']' | '{' | '}' | '"' | ';')
}

impl Reader {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == ',' {
                self.pos += 1;
            } else if c == ';' {
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn read(&mut self) -> Result<Edn, EdnError> {
        if self.depth >= MAX_DEPTH {
            return Err(EdnError::TooDeep(MAX_DEPTH, self.pos));
        }
        self.depth += 1;
        let form = self.read_form();
        self.depth -= 1;
        form
    }

    fn read_form(&mut self) -> Result<Edn, EdnError> {
        self.skip_ws();
        let c = self.peek().ok_or(EdnError::UnexpectedEof)?;
        match c {
            '[' => {
                self.pos += 1;
                Ok(Edn::Vector(self.read_until(']')?))
            }
            '(' => {
                self.pos += 1;
                Ok(Edn::List(self.read_until(')')?))
            }
            '{' => {
                self.pos += 1;
                let items = self.read_until('}')?;
                if items.len() % 2 != 0 {
                    return Err(EdnError::Unexpected {
                        ch: '}',
                        pos: self.pos - 1,
                    });
                }
                let mut entries = Vec::with_capacity(items.len() / 2);
                let mut it = items.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    entries.push((k, v));
                }
                Ok(Edn::Map(entries))
            }
            '"' => {
                self.pos += 1;
                self.read_string()
            }
            '#' => {
                self.pos += 1;
                if self.peek() == Some('{') {
                    self.pos += 1;
                    return Ok(Edn::Set(self.read_until('}')?));
                }
                let tag = self.read_token();
                let form = self.read()?;
                tagged(&tag, form)
            }
            ':' => {
                self.pos += 1;
                let name = self.read_token();
                if name.is_empty() {
                    return Err(EdnError::Unexpected { ch: ':', pos: self.pos });
                }
                Ok(Edn::Keyword(name))
            }
            ')' | ']' | '}' => Err(EdnError::Unexpected { ch: c, pos: self.pos }),
            _ => {
                let token = self.read_token();
                if token.is_empty() {
                    return Err(EdnError::Unexpected { ch: c, pos: self.pos });
                }
                Ok(atom(token)?)
            }
        }
    }

    fn read_until(&mut self, close: char) -> Result<Vec<Edn>, EdnError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Err(EdnError::UnexpectedEof),
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(_) => items.push(self.read()?),
            }
        }
    }

    fn read_string(&mut self) -> Result<Edn, EdnError> {
        let mut out = String::new();
        loop {
            let c = self.peek().ok_or(EdnError::UnexpectedEof)?;
            self.pos += 1;
            match c {
                '"' => return Ok(Edn::Str(out)),
                '\\' => {
                    let esc = self.peek().ok_or(EdnError::UnexpectedEof)?;
                    self.pos += 1;
                    out.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                }
                other => out.push(other),
            }
        }
    }

    fn read_token(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_delimiter(c) {
                break;
            }
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}

fn atom(token: String) -> Result<Edn, EdnError> {
    match token.as_str() {
        "nil" => return Ok(Edn::Nil),
        "true" => return Ok(Edn::Bool(true)),
        "false" => return Ok(Edn::Bool(false)),
        _ => {}
    }
    let first = token.chars().next().unwrap_or(' ');
    let numeric = first.is_ascii_digit()
        || ((first == '-' || first == '+') && token.chars().nth(1).is_some_and(|c| c.is_ascii_digit()));
    if !numeric {
        return Ok(Edn::Symbol(token));
    }
    if let Ok(n) = token.parse::<i64>() {
        return Ok(Edn::Long(n));
    }
    token
        .parse::<f64>()
        .map(Edn::Double)
        .map_err(|_| EdnError::InvalidNumber(token))
}

fn tagged(tag: &str, form: Edn) -> Result<Edn, EdnError> {
    let invalid = |reason: String| EdnError::InvalidTagged {
        tag: tag.to_string(),
        reason,
    };
    match (tag, form) {
        ("uuid", Edn::Str(s)) => Uuid::parse_str(&s)
            .map(Edn::Uuid)
            .map_err(|e| invalid(e.to_string())),
        ("inst", Edn::Long(ms)) => Ok(Edn::Inst(ms)),
        ("uuid", _) | ("inst", _) => Err(invalid("unexpected literal".into())),
        (other, _) => Err(EdnError::UnknownTag(other.to_string())),
    }
}
