//! Query keys.
//!
//! A [`QueryKey`] is an ordered sequence of [`KeyPart`]s that identifies exactly
//! one cached read, e.g. `["user-settings"]` or `["saved-words", "es"]`.
//! Two keys are equal iff their parts are equal element by element.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single element of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    /// A string segment, usually the resource name or a language code.
    Str(String),
    /// An integer segment, e.g. a page number or a numeric id.
    Int(i64),
    /// A boolean segment.
    Bool(bool),
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Identifies one cached read.
///
/// # Example
///
/// ```
/// use query_sync::{QueryKey, query_key};
///
/// let language = "es";
/// let key = query_key!["saved-words", language];
/// assert!(key.starts_with(&query_key!["saved-words"]));
/// assert_eq!(key, QueryKey::new(["saved-words", "es"]));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    /// Creates a key from anything convertible into key parts.
    pub fn new<P: Into<KeyPart>>(parts: impl IntoIterator<Item = P>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Creates a key from already-built parts.
    #[must_use]
    pub const fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Returns the parts of this key.
    #[must_use]
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// Returns the number of parts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the key has no parts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if `prefix` equals this key or is a leading slice of it.
    ///
    /// An empty prefix matches every key.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Returns a new key with `part` appended.
    #[must_use]
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match part {
                KeyPart::Str(s) => write!(f, "{s:?}")?,
                KeyPart::Int(n) => write!(f, "{n}")?,
                KeyPart::Bool(b) => write!(f, "{b}")?,
            }
        }
        f.write_str("]")
    }
}

impl<P: Into<KeyPart>> FromIterator<P> for QueryKey {
    fn from_iter<T: IntoIterator<Item = P>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// Builds a [`QueryKey`] from a list of values convertible into [`KeyPart`].
#[macro_export]
macro_rules! query_key {
    ($($part:expr),* $(,)?) => {
        $crate::QueryKey::from_parts(vec![$($crate::KeyPart::from($part)),*])
    };
}
