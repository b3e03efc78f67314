//! Human-chosen, DNS-safe names for hosts and agents.
//!
//! Names are unique only among currently-live resources; ids are the durable key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::HostId;

const MAX_NAME_LEN: usize = 63;

/// Errors that can occur when validating a name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The name is empty.
    #[error("name must not be empty")]
    Empty,

    /// The name exceeds the DNS label limit.
    #[error("name {0:?} is longer than 63 characters")]
    TooLong(String),

    /// The name contains a character other than letters, digits, or hyphens.
    #[error("name {name:?} contains invalid character {ch:?}")]
    InvalidCharacter {
        /// The offending name.
        name: String,
        /// The first invalid character.
        ch: char,
    },

    /// The name starts or ends with a hyphen.
    #[error("name {0:?} must not start or end with a hyphen")]
    EdgeHyphen(String),
}

fn validate(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong(name.to_string()));
    }
    if let Some(ch) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
        return Err(NameError::InvalidCharacter {
            name: name.to_string(),
            ch,
        });
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(NameError::EdgeHyphen(name.to_string()));
    }
    Ok(())
}

/// A validated host name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostName(String);

impl HostName {
    /// Validate and wrap a host name.
    ///
    /// # Errors
    ///
    /// Returns a `NameError` if the name is not DNS-safe.
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    /// Return the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for HostName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for HostName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<HostName> for String {
    fn from(name: HostName) -> Self {
        name.0
    }
}

/// A validated agent name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentName(String);

impl AgentName {
    /// Validate and wrap an agent name.
    ///
    /// # Errors
    ///
    /// Returns a `NameError` if the name is not DNS-safe.
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    /// Return the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AgentName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AgentName> for String {
    fn from(name: AgentName) -> Self {
        name.0
    }
}

/// A reference to a host, either by id or by (currently-live) name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostRef {
    /// Look up by the immutable id.
    Id(HostId),
    /// Look up by the human name.
    Name(HostName),
}

impl HostRef {
    /// Returns true if the given id/name pair is what this reference points at.
    #[must_use]
    pub fn matches(&self, id: &HostId, name: &HostName) -> bool {
        match self {
            Self::Id(want) => want == id,
            Self::Name(want) => want == name,
        }
    }
}

impl FromStr for HostRef {
    type Err = NameError;

    /// Ids win: anything that parses as a `HostId` is treated as one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(id) = s.parse::<HostId>() {
            return Ok(Self::Id(id));
        }
        s.parse().map(Self::Name)
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

impl From<HostId> for HostRef {
    fn from(id: HostId) -> Self {
        Self::Id(id)
    }
}

impl From<HostName> for HostRef {
    fn from(name: HostName) -> Self {
        Self::Name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_safe_names() {
        assert!(HostName::new("dev-box-1").is_ok());
        assert!(AgentName::new("A1").is_ok());
    }

    #[test]
    fn rejects_bad_names() {
        assert_eq!(HostName::new(""), Err(NameError::Empty));
        assert!(matches!(
            HostName::new("under_score"),
            Err(NameError::InvalidCharacter { ch: '_', .. })
        ));
        assert!(matches!(
            AgentName::new("-leading"),
            Err(NameError::EdgeHyphen(_))
        ));
        assert!(matches!(
            HostName::new("a".repeat(64)),
            Err(NameError::TooLong(_))
        ));
    }

    #[test]
    fn host_ref_prefers_id() {
        let id = HostId::generate();
        let parsed: HostRef = id.to_string().parse().unwrap();
        assert_eq!(parsed, HostRef::Id(id));

        let parsed: HostRef = "my-host".parse().unwrap();
        assert!(matches!(parsed, HostRef::Name(_)));
    }

    #[test]
    fn host_ref_matches() {
        let id = HostId::generate();
        let name = HostName::new("box").unwrap();
        assert!(HostRef::Id(id).matches(&id, &name));
        assert!(HostRef::Name(name.clone()).matches(&HostId::generate(), &name));
        assert!(!HostRef::Id(HostId::generate()).matches(&id, &name));
    }

    #[test]
    fn serde_rejects_invalid_name() {
        let result: Result<HostName, _> = serde_json::from_str("\"bad name\"");
        assert!(result.is_err());
    }
}
