//! Policy enforcement at command dispatch.

use std::sync::Arc;

use crate::interp::{CommandGuard, Denial};

use super::capability::Capability;
use super::security::SecurityPolicy;

/// [`CommandGuard`] backed by a [`SecurityPolicy`].
///
/// A command is refused when it is in the restricted set, or when it
/// exercises a capability the policy does not grant.
#[derive(Debug, Clone)]
pub struct PolicyGuard {
    policy: Arc<SecurityPolicy>,
}

impl PolicyGuard {
    pub fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// The capability `command` would need and the policy withholds.
    pub fn withheld_capability(&self, command: &str) -> Option<Capability> {
        Capability::for_command(command).filter(|cap| !self.policy.allows(*cap))
    }
}

impl CommandGuard for PolicyGuard {
    fn check(&self, command: &str) -> Result<(), Denial> {
        if self.policy.is_restricted(command) {
            return Err(Denial {
                command: command.to_string(),
                reason: format!("command is restricted by the {} policy", self.policy.name),
            });
        }
        if let Some(cap) = self.withheld_capability(command) {
            return Err(Denial {
                command: command.to_string(),
                reason: format!(
                    "{cap} access is not permitted by the {} policy",
                    self.policy.name
                ),
            });
        }
        Ok(())
    }
}
