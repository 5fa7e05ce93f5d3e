use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{StrataError, StrataResult, VersionGroupId};

/// Event kind of a version. Stored by name in `update_type.name`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateKind {
    Insert,
    Update,
    Delete,
}

impl UpdateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateKind::Insert => "INSERT",
            UpdateKind::Update => "UPDATE",
            UpdateKind::Delete => "DELETE",
        }
    }
}

impl FromStr for UpdateKind {
    type Err = StrataError;

    fn from_str(value: &str) -> StrataResult<Self> {
        match value {
            "INSERT" => Ok(UpdateKind::Insert),
            "UPDATE" => Ok(UpdateKind::Update),
            "DELETE" => Ok(UpdateKind::Delete),
            other => Err(StrataError::invalid_enum("update type", other)),
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage kind of a property payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PropertyKind {
    Text,
    Blob,
}

impl PropertyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyKind::Text => "TEXT",
            PropertyKind::Blob => "BLOB",
        }
    }
}

impl FromStr for PropertyKind {
    type Err = StrataError;

    fn from_str(value: &str) -> StrataResult<Self> {
        match value {
            "TEXT" => Ok(PropertyKind::Text),
            "BLOB" => Ok(PropertyKind::Blob),
            other => Err(StrataError::invalid_enum("property type", other)),
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical commit. Timestamps are epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionGroup {
    pub id: VersionGroupId,
    pub timestamp: i64,
    pub actor_id: Option<String>,
}
