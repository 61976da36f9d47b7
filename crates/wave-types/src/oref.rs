use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;

/// The closed set of stored object kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OType {
    Client,
    Window,
    Workspace,
    Tab,
    Block,
    #[serde(rename = "layout")]
    Layout,
}

impl OType {
    pub const ALL: [OType; 6] = [
        OType::Client,
        OType::Window,
        OType::Workspace,
        OType::Tab,
        OType::Block,
        OType::Layout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Window => "window",
            Self::Workspace => "workspace",
            Self::Tab => "tab",
            Self::Block => "block",
            Self::Layout => "layout",
        }
    }

    /// Singleton types have at most one stored instance.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Self::Client)
    }
}

impl fmt::Display for OType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TypeError::UnknownOType(s.to_string()))
    }
}

/// Reference to one stored object: `otype:oid`.
///
/// The canonical string form is used as the address in RPC payloads, as the
/// scope of published events, and as the storage key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ORef {
    pub otype: OType,
    pub oid: String,
}

impl ORef {
    pub fn new(otype: OType, oid: impl Into<String>) -> Self {
        Self {
            otype,
            oid: oid.into(),
        }
    }

    pub fn client(oid: impl Into<String>) -> Self {
        Self::new(OType::Client, oid)
    }

    pub fn window(oid: impl Into<String>) -> Self {
        Self::new(OType::Window, oid)
    }

    pub fn workspace(oid: impl Into<String>) -> Self {
        Self::new(OType::Workspace, oid)
    }

    pub fn tab(oid: impl Into<String>) -> Self {
        Self::new(OType::Tab, oid)
    }

    pub fn block(oid: impl Into<String>) -> Self {
        Self::new(OType::Block, oid)
    }

    pub fn layout(oid: impl Into<String>) -> Self {
        Self::new(OType::Layout, oid)
    }

    /// Parse `otype:oid`. The oid must be non-empty and limited to
    /// `[A-Za-z0-9_.-]`.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let (otype, oid) = s
            .split_once(':')
            .ok_or_else(|| TypeError::InvalidORef(s.to_string()))?;
        let otype: OType = otype.parse()?;
        if !is_valid_oid(oid) {
            return Err(TypeError::InvalidORef(s.to_string()));
        }
        Ok(Self::new(otype, oid))
    }
}

/// Oids are non-empty and limited to `[A-Za-z0-9_.-]`.
pub fn is_valid_oid(oid: &str) -> bool {
    !oid.is_empty()
        && oid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl fmt::Display for ORef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.otype, self.oid)
    }
}

impl FromStr for ORef {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ORef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ORef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ORef::parse(&s).map_err(serde::de::Error::custom)
    }
}
