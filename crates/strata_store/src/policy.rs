use std::collections::BTreeSet;

use crate::config::AuditConfig;

/// Type names under this namespace belong to the audit schema itself and are never logged.
pub const INTERNAL_NAMESPACE: &str = "strata::";

#[derive(Clone, Debug, Default)]
pub struct AuditPolicy {
    audited: BTreeSet<String>,
    ignored: BTreeSet<String>,
}

impl AuditPolicy {
    pub fn new(
        audited: impl IntoIterator<Item = String>,
        ignored: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            audited: audited.into_iter().collect(),
            ignored: ignored.into_iter().collect(),
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(
            config.audited_types.iter().cloned(),
            config.ignored_types.iter().cloned(),
        )
    }

    /// A non-empty allow-list is authoritative; otherwise everything but ignored and
    /// internal types is audited.
    pub fn is_audited(&self, type_name: &str) -> bool {
        if !self.audited.is_empty() {
            return self.audited.contains(type_name);
        }
        !self.ignored.contains(type_name) && !type_name.starts_with(INTERNAL_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::AuditPolicy;

    #[test]
    fn allow_list_wins_over_deny_list() {
        let policy = AuditPolicy::new(["Post".to_string()], ["Post".to_string()]);
        assert!(policy.is_audited("Post"));
        assert!(!policy.is_audited("Comment"));
    }

    #[test]
    fn default_allows_all_but_ignored_and_internal() {
        let policy = AuditPolicy::new([], ["Session".to_string()]);
        assert!(policy.is_audited("Post"));
        assert!(!policy.is_audited("Session"));
        assert!(!policy.is_audited("strata::VersionGroup"));
    }
}
