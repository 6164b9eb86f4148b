//! Resource URI - addressable identity for tables and rows
//!
//! Format: `content://<authority>/<table>[/<id>]`
//!
//! Examples:
//! - `content://com.example.notes/notes`
//! - `content://com.example.notes/notes/42`

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SCHEME: &str = "content://";

/// A table, or a single row of it, under a content authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceUri {
    pub authority: String,
    /// Table name, always lower case
    pub table: String,
    /// Row id for item URIs
    pub id: Option<i64>,
}

impl ResourceUri {
    /// URI addressing a whole table
    pub fn table(authority: impl Into<String>, table: impl AsRef<str>) -> Self {
        Self {
            authority: authority.into(),
            table: table.as_ref().to_lowercase(),
            id: None,
        }
    }

    /// URI addressing one row
    pub fn row(authority: impl Into<String>, table: impl AsRef<str>, id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::table(authority, table)
        }
    }

    /// Parse a URI string into a ResourceUri
    ///
    /// Expected format: `content://<authority>/<table>[/<id>]`
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::InvalidUri(format!("{} (must start with {})", uri, SCHEME)))?;

        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::InvalidUri(format!("{} (missing table)", uri)))?;
        if authority.is_empty() {
            return Err(Error::InvalidUri(format!("{} (empty authority)", uri)));
        }

        let mut segments = path.split('/');
        let table = segments.next().filter(|t| !t.is_empty()).ok_or_else(|| {
            Error::InvalidUri(format!("{} (missing table)", uri))
        })?;

        let id = match segments.next() {
            None => None,
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| Error::InvalidUri(format!("{} (invalid row id: {})", uri, raw)))?,
            ),
        };
        if segments.next().is_some() {
            return Err(Error::InvalidUri(format!("{} (too many path segments)", uri)));
        }

        Ok(Self {
            authority: authority.to_string(),
            table: table.to_lowercase(),
            id,
        })
    }

    /// Convert to URI string
    pub fn to_uri_string(&self) -> String {
        match self.id {
            Some(id) => format!("{}{}/{}/{}", SCHEME, self.authority, self.table, id),
            None => format!("{}{}/{}", SCHEME, self.authority, self.table),
        }
    }

    pub fn is_item(&self) -> bool {
        self.id.is_some()
    }

    /// The table URI this one belongs to
    pub fn without_id(&self) -> Self {
        Self {
            id: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri_string())
    }
}

impl FromStr for ResourceUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ResourceUri {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_uri_string())
    }
}

impl<'de> Deserialize<'de> for ResourceUri {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ResourceUri::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_format() {
        let uri = ResourceUri::row("com.example.notes", "Notes", 42);
        assert_eq!(uri.to_uri_string(), "content://com.example.notes/notes/42");
        assert_eq!(
            ResourceUri::table("com.example.notes", "notes").to_string(),
            "content://com.example.notes/notes"
        );
    }

    #[test]
    fn test_uri_parse() {
        let uri = ResourceUri::parse("content://auth/note_tags/7").unwrap();
        assert_eq!(uri.authority, "auth");
        assert_eq!(uri.table, "note_tags");
        assert_eq!(uri.id, Some(7));
        assert!(uri.is_item());
        assert!(!uri.without_id().is_item());
    }

    #[test]
    fn test_invalid_uri() {
        assert!(ResourceUri::parse("invalid").is_err());
        assert!(ResourceUri::parse("http://auth/notes").is_err());
        assert!(ResourceUri::parse("content://auth").is_err());
        assert!(ResourceUri::parse("content://auth/").is_err());
        assert!(ResourceUri::parse("content://auth/notes/abc").is_err());
        assert!(ResourceUri::parse("content://auth/notes/1/2").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let uri = ResourceUri::row("auth", "notes", 1);
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"content://auth/notes/1\"");
        let back: ResourceUri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
    }
}
