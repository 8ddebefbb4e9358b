//! Policy resolution: named preset or caller-supplied custom policy.

use super::error::PolicyResult;
use super::security::{SecurityLevel, SecurityPolicy};

/// How a request selects its policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySelector {
    /// A preset by name, case-insensitive.
    Level(String),
    /// A custom policy; bypasses preset resolution but must validate.
    Custom(SecurityPolicy),
}

impl From<SecurityLevel> for PolicySelector {
    fn from(level: SecurityLevel) -> Self {
        PolicySelector::Level(level.to_string())
    }
}

/// Resolve a selector to a concrete policy.
pub fn resolve(selector: &PolicySelector) -> PolicyResult<SecurityPolicy> {
    match selector {
        PolicySelector::Level(name) => {
            let level: SecurityLevel = name.parse()?;
            Ok(SecurityPolicy::preset(level))
        }
        PolicySelector::Custom(policy) => {
            policy.validate()?;
            Ok(policy.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyError;

    #[test]
    fn test_resolve_named_levels() {
        let policy = resolve(&PolicySelector::Level("elevated".into())).unwrap();
        assert_eq!(policy, SecurityPolicy::elevated());
        assert_eq!(
            resolve(&SecurityLevel::Minimal.into()).unwrap().level,
            SecurityLevel::Minimal
        );
    }

    #[test]
    fn test_resolve_unknown_level() {
        assert_eq!(
            resolve(&PolicySelector::Level("Admin".into())),
            Err(PolicyError::UnknownLevel("Admin".into()))
        );
    }

    #[test]
    fn test_custom_policy_is_validated() {
        let mut custom = SecurityPolicy::standard();
        custom.name = "ci-runner".into();
        custom.max_execution_secs = 5;
        assert_eq!(
            resolve(&PolicySelector::Custom(custom.clone())).unwrap(),
            custom
        );

        custom.restricted_commands.clear();
        assert!(matches!(
            resolve(&PolicySelector::Custom(custom)),
            Err(PolicyError::InvalidCustom(_))
        ));
    }
}
