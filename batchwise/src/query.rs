//! Typed listing queries.
//!
//! The service accepts filters, ordering and cursors as short textual calls
//! such as `equal("status", "active")` or `limit(25)`. [`Query`] renders to
//! that syntax through `Display` and parses it back through `FromStr`, and
//! serializes as the same string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single listing query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Query {
    /// `attribute == value`
    Equal {
        /// Attribute name.
        attribute: String,
        /// Value, compared as text.
        value: String,
    },
    /// `attribute != value`
    NotEqual {
        /// Attribute name.
        attribute: String,
        /// Value, compared as text.
        value: String,
    },
    /// `attribute < value`
    LessThan {
        /// Attribute name.
        attribute: String,
        /// Bound.
        value: String,
    },
    /// `attribute <= value`
    LessThanEqual {
        /// Attribute name.
        attribute: String,
        /// Bound.
        value: String,
    },
    /// `attribute > value`
    GreaterThan {
        /// Attribute name.
        attribute: String,
        /// Bound.
        value: String,
    },
    /// `attribute >= value`
    GreaterThanEqual {
        /// Attribute name.
        attribute: String,
        /// Bound.
        value: String,
    },
    /// Full-text search on `attribute`.
    Search {
        /// Attribute name.
        attribute: String,
        /// Search terms.
        value: String,
    },
    /// Ascending order by attribute.
    OrderAsc(String),
    /// Descending order by attribute.
    OrderDesc(String),
    /// Start after the entity with this id.
    CursorAfter(String),
    /// End before the entity with this id.
    CursorBefore(String),
    /// Maximum entities returned.
    Limit(u32),
    /// Entities skipped.
    Offset(u32),
}

macro_rules! comparison {
    ($(#[$doc:meta] $fn_name:ident => $variant:ident),* $(,)?) => {
        $(
            #[$doc]
            pub fn $fn_name(attribute: impl Into<String>, value: impl ToString) -> Self {
                Self::$variant {
                    attribute: attribute.into(),
                    value: value.to_string(),
                }
            }
        )*
    };
}

impl Query {
    comparison! {
        /// `equal("attribute", "value")`
        equal => Equal,
        /// `notEqual("attribute", "value")`
        not_equal => NotEqual,
        /// `lessThan("attribute", "value")`
        less_than => LessThan,
        /// `lessThanEqual("attribute", "value")`
        less_than_equal => LessThanEqual,
        /// `greaterThan("attribute", "value")`
        greater_than => GreaterThan,
        /// `greaterThanEqual("attribute", "value")`
        greater_than_equal => GreaterThanEqual,
        /// `search("attribute", "terms")`
        search => Search,
    }

    /// `orderAsc("attribute")`
    pub fn order_asc(attribute: impl Into<String>) -> Self {
        Self::OrderAsc(attribute.into())
    }

    /// `orderDesc("attribute")`
    pub fn order_desc(attribute: impl Into<String>) -> Self {
        Self::OrderDesc(attribute.into())
    }

    /// `cursorAfter("id")`
    pub fn cursor_after(id: impl Into<String>) -> Self {
        Self::CursorAfter(id.into())
    }

    /// `cursorBefore("id")`
    pub fn cursor_before(id: impl Into<String>) -> Self {
        Self::CursorBefore(id.into())
    }

    /// `limit(n)`
    pub const fn limit(n: u32) -> Self {
        Self::Limit(n)
    }

    /// `offset(n)`
    pub const fn offset(n: u32) -> Self {
        Self::Offset(n)
    }

    /// Name of the call in the textual syntax.
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Equal { .. } => "equal",
            Self::NotEqual { .. } => "notEqual",
            Self::LessThan { .. } => "lessThan",
            Self::LessThanEqual { .. } => "lessThanEqual",
            Self::GreaterThan { .. } => "greaterThan",
            Self::GreaterThanEqual { .. } => "greaterThanEqual",
            Self::Search { .. } => "search",
            Self::OrderAsc(_) => "orderAsc",
            Self::OrderDesc(_) => "orderDesc",
            Self::CursorAfter(_) => "cursorAfter",
            Self::CursorBefore(_) => "cursorBefore",
            Self::Limit(_) => "limit",
            Self::Offset(_) => "offset",
        }
    }

    /// True for queries that narrow the result set by attribute value.
    pub const fn is_filter(&self) -> bool {
        matches!(
            self,
            Self::Equal { .. }
                | Self::NotEqual { .. }
                | Self::LessThan { .. }
                | Self::LessThanEqual { .. }
                | Self::GreaterThan { .. }
                | Self::GreaterThanEqual { .. }
                | Self::Search { .. }
        )
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in text.chars() {
        if matches!(c, '"' | '\\') {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.method())?;
        match self {
            Self::Equal { attribute, value }
            | Self::NotEqual { attribute, value }
            | Self::LessThan { attribute, value }
            | Self::LessThanEqual { attribute, value }
            | Self::GreaterThan { attribute, value }
            | Self::GreaterThanEqual { attribute, value }
            | Self::Search { attribute, value } => {
                write_quoted(f, attribute)?;
                f.write_str(", ")?;
                write_quoted(f, value)?;
            }
            Self::OrderAsc(text)
            | Self::OrderDesc(text)
            | Self::CursorAfter(text)
            | Self::CursorBefore(text) => write_quoted(f, text)?,
            Self::Limit(n) | Self::Offset(n) => write!(f, "{n}")?,
        }
        f.write_str(")")
    }
}

impl From<Query> for String {
    fn from(query: Query) -> Self {
        query.to_string()
    }
}

/// Why a query string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryParseError {
    /// Not of the form `name(args)`.
    #[error("malformed query `{0}`")]
    Malformed(String),

    /// Unrecognised call name.
    #[error("unknown query method `{0}`")]
    UnknownMethod(String),

    /// Wrong number or kind of arguments.
    #[error("`{method}` expects {expected}")]
    Arguments {
        /// Call name.
        method: String,
        /// What was expected.
        expected: &'static str,
    },
}

enum Arg {
    Text(String),
    Number(u32),
}

fn parse_args(input: &str, whole: &str) -> Result<Vec<Arg>, QueryParseError> {
    let malformed = || QueryParseError::Malformed(whole.to_string());
    let mut args = Vec::new();
    let mut chars = input.trim().chars().peekable();

    while let Some(&c) = chars.peek() {
        if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next().ok_or_else(malformed)? {
                    '\\' => text.push(chars.next().ok_or_else(malformed)?),
                    '"' => break,
                    other => text.push(other),
                }
            }
            args.push(Arg::Text(text));
        } else {
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if d == ',' || d.is_whitespace() {
                    break;
                }
                digits.push(d);
                chars.next();
            }
            args.push(Arg::Number(digits.parse().map_err(|_| malformed())?));
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            None => break,
            Some(',') => {
                while chars.peek().is_some_and(|c| c.is_whitespace()) {
                    chars.next();
                }
                if chars.peek().is_none() {
                    return Err(malformed());
                }
            }
            Some(_) => return Err(malformed()),
        }
    }

    Ok(args)
}

impl FromStr for Query {
    type Err = QueryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (method, rest) = trimmed
            .split_once('(')
            .ok_or_else(|| QueryParseError::Malformed(s.to_string()))?;
        let inner = rest
            .strip_suffix(')')
            .ok_or_else(|| QueryParseError::Malformed(s.to_string()))?;
        let args = parse_args(inner, s)?;

        let arguments = |expected| QueryParseError::Arguments {
            method: method.to_string(),
            expected,
        };
        let pair = || match args.as_slice() {
            [Arg::Text(attribute), Arg::Text(value)] => Ok((attribute.clone(), value.clone())),
            _ => Err(arguments("an attribute and a value")),
        };
        let single = || match args.as_slice() {
            [Arg::Text(text)] => Ok(text.clone()),
            _ => Err(arguments("one quoted argument")),
        };
        let number = || match args.as_slice() {
            [Arg::Number(n)] => Ok(*n),
            _ => Err(arguments("one unsigned integer")),
        };

        Ok(match method {
            "equal" => pair().map(|(attribute, value)| Self::Equal { attribute, value })?,
            "notEqual" => pair().map(|(attribute, value)| Self::NotEqual { attribute, value })?,
            "lessThan" => pair().map(|(attribute, value)| Self::LessThan { attribute, value })?,
            "lessThanEqual" => {
                pair().map(|(attribute, value)| Self::LessThanEqual { attribute, value })?
            }
            "greaterThan" => {
                pair().map(|(attribute, value)| Self::GreaterThan { attribute, value })?
            }
            "greaterThanEqual" => {
                pair().map(|(attribute, value)| Self::GreaterThanEqual { attribute, value })?
            }
            "search" => pair().map(|(attribute, value)| Self::Search { attribute, value })?,
            "orderAsc" => Self::OrderAsc(single()?),
            "orderDesc" => Self::OrderDesc(single()?),
            "cursorAfter" => Self::CursorAfter(single()?),
            "cursorBefore" => Self::CursorBefore(single()?),
            "limit" => Self::Limit(number()?),
            "offset" => Self::Offset(number()?),
            other => return Err(QueryParseError::UnknownMethod(other.to_string())),
        })
    }
}

impl TryFrom<String> for Query {
    type Error = QueryParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
