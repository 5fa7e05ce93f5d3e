use std::fmt;

use serde::{Deserialize, Serialize};

/// Host primary key as logged in `entity_record.logged_entity_id`.
///
/// Integer and string keys share one text column, so the text form is also the
/// identity hash used by the reader's identity map.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<i32> for RecordId {
    fn from(value: i32) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Id of a version group; the time axis every as-of read is cut against.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionGroupId(pub i64);

impl VersionGroupId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for VersionGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-side object identity of a tracked record (the host's "same object" notion,
/// independent of its primary key).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u64);

#[cfg(test)]
mod tests {
    use super::{RecordId, VersionGroupId};

    #[test]
    fn record_ids_normalize_to_text() {
        assert_eq!(RecordId::from(42i64), RecordId::from("42"));
        assert_eq!(RecordId::from(7i32).as_i64(), Some(7));
        assert_eq!(RecordId::from("abc").as_i64(), None);
    }

    #[test]
    fn version_groups_order_by_id() {
        assert!(VersionGroupId(2) > VersionGroupId(1));
        assert_eq!(VersionGroupId(3).to_string(), "3");
    }
}
